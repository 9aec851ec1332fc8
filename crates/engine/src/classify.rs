//! Quality classification for discovered media.
//!
//! Classification runs in two passes. The quick pass decides from the file
//! name and extension alone and handles the bulk of a library; anything it
//! cannot place goes to the deep pass, which reads the file. Scoring itself
//! is an opaque collaborator behind [`QualityClassifier`].

use crate::media::{extension_of, MediaRecord, MediaType, QualityTier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// Leading bytes read for signature checks.
const SNIFF_BYTES: u64 = 64;

/// Image byte sizes below which quality is assumed to be poor.
const IMAGE_VERY_LOW_BYTES: u64 = 10 * 1024;
const IMAGE_LOW_BYTES: u64 = 50 * 1024;
const IMAGE_MEDIUM_LOW_BYTES: u64 = 200 * 1024;

/// Video byte size below which quality is assumed to be poor.
const VIDEO_VERY_LOW_BYTES: u64 = 100 * 1024;

/// Name keywords that indicate screen captures (lossless-friendly).
const SCREENSHOT_KEYWORDS: &[&str] = &["screenshot", "screen shot", "screencap", "屏幕截图"];

/// Name keywords that indicate stickers and emoji (small lossy output).
const STICKER_KEYWORDS: &[&str] = &["emoji", "sticker", "meme"];

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Kind of damage detected in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    /// Signature does not match the extension.
    FileHeader,
    /// Payload is unreadable.
    DataCorrupt,
    /// File is empty or truncated.
    Incomplete,
    /// Unknown container.
    Format,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CorruptionKind::FileHeader => "file_header",
            CorruptionKind::DataCorrupt => "data_corrupt",
            CorruptionKind::Incomplete => "incomplete",
            CorruptionKind::Format => "format",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corruption {
    pub kind: CorruptionKind,
    pub reason: String,
    /// An encoder pass may salvage the file.
    pub recoverable: bool,
}

/// Result of classifying one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub tier: QualityTier,
    /// 0-10 quality score.
    pub score: f64,
    /// Human-readable factors behind the tier.
    pub factors: Vec<String>,
    pub corruption: Option<Corruption>,
}

impl Assessment {
    pub fn tier(tier: QualityTier, factor: impl Into<String>) -> Self {
        Self {
            tier,
            score: tier.score(),
            factors: vec![factor.into()],
            corruption: None,
        }
    }

    pub fn corrupted(kind: CorruptionKind, reason: impl Into<String>, recoverable: bool) -> Self {
        let reason = reason.into();
        Self {
            tier: QualityTier::Corrupted,
            score: 0.0,
            factors: vec![reason.clone()],
            corruption: Some(Corruption {
                kind,
                reason,
                recoverable,
            }),
        }
    }

    pub fn is_low_quality(&self) -> bool {
        self.tier == QualityTier::VeryLow
    }
}

/// Which pass produced an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationPass {
    Quick,
    Deep,
}

/// Opaque quality scoring.
pub trait QualityClassifier: Send + Sync {
    /// Cheap decision from the record alone; `None` sends the file to [`deep`](Self::deep).
    fn quick(&self, record: &MediaRecord) -> Option<Assessment>;

    /// Full inspection of the file contents.
    fn deep(&self, record: &MediaRecord) -> Result<Assessment, ClassifyError>;
}

/// Run the quick pass, falling back to the deep pass.
///
/// A deep pass that errors yields a conservative medium-high assessment so
/// the file is still routed.
pub fn classify(
    classifier: &dyn QualityClassifier,
    record: &MediaRecord,
) -> (Assessment, ClassificationPass) {
    if let Some(assessment) = classifier.quick(record) {
        return (assessment, ClassificationPass::Quick);
    }
    let assessment = classifier.deep(record).unwrap_or_else(|e| {
        tracing::warn!(path = %record.path.display(), error = %e, "deep analysis failed");
        Assessment::tier(QualityTier::MediumHigh, "default_routing")
    });
    (assessment, ClassificationPass::Deep)
}

/// Identify a container from its leading bytes.
pub fn sniff_format(header: &[u8]) -> Option<&'static str> {
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("jpeg");
    }
    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("png");
    }
    if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        return Some("gif");
    }
    if header.starts_with(b"BM") {
        return Some("bmp");
    }
    if header.starts_with(b"II*\0") || header.starts_with(b"MM\0*") {
        return Some("tiff");
    }
    if header.starts_with(&[0xFF, 0x0A])
        || header.starts_with(b"\x00\x00\x00\x0cJXL \r\n\x87\n")
    {
        return Some("jxl");
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("mkv");
    }
    if header.len() >= 12 && &header[0..4] == b"RIFF" {
        return match &header[8..12] {
            b"WEBP" => Some("webp"),
            b"AVI " => Some("avi"),
            _ => None,
        };
    }
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        return Some(match &header[8..12] {
            b"avif" | b"avis" => "avif",
            b"heic" | b"heix" | b"mif1" | b"msf1" | b"hevc" => "heif",
            b"qt  " => "mov",
            _ => "mp4",
        });
    }
    None
}

/// Whether a sniffed container is acceptable for a file extension.
pub fn signature_matches_extension(ext: &str, sniffed: &str) -> bool {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" | "jpe" | "jfif" => sniffed == "jpeg",
        "png" | "apng" => sniffed == "png",
        "tif" | "tiff" => sniffed == "tiff",
        "heic" | "heif" => matches!(sniffed, "heif" | "avif"),
        "mov" | "mp4" | "m4v" => matches!(sniffed, "mov" | "mp4"),
        "webm" | "mkv" => sniffed == "mkv",
        other => other == sniffed,
    }
}

/// Read up to `SNIFF_BYTES` from the start of a file.
pub fn read_signature(path: &Path) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)?.take(SNIFF_BYTES).read_to_end(&mut buf)?;
    Ok(buf)
}

fn jpeg_has_end_marker(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 2 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-2))?;
    let mut tail = [0u8; 2];
    file.read_exact(&mut tail)?;
    Ok(tail == [0xFF, 0xD9])
}

fn contains_any_keyword(name: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| name.contains(kw))
}

/// Built-in classifier using names, extensions, signatures and size.
#[derive(Debug, Clone, Default)]
pub struct HeuristicClassifier;

impl QualityClassifier for HeuristicClassifier {
    fn quick(&self, record: &MediaRecord) -> Option<Assessment> {
        // Empty files always get a real look.
        if record.size_bytes == 0 {
            return None;
        }

        let ext = record.extension()?;
        let by_ext = match ext.as_str() {
            "jpg" | "jpeg" | "jpe" | "jfif" => Some(QualityTier::MediumHigh),
            "png" | "webp" | "heic" | "heif" => Some(QualityTier::High),
            "gif" => Some(QualityTier::MediumHigh),
            "bmp" | "tiff" | "tif" => Some(QualityTier::VeryHigh),
            "mp4" | "mov" | "webm" => Some(QualityTier::High),
            "jxl" | "avif" => Some(QualityTier::High),
            _ => None,
        };
        if let Some(tier) = by_ext {
            return Some(Assessment::tier(tier, "fast_routing"));
        }

        let name = record
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if contains_any_keyword(&name, SCREENSHOT_KEYWORDS) {
            return Some(Assessment::tier(QualityTier::High, "screenshot_name"));
        }
        if contains_any_keyword(&name, STICKER_KEYWORDS) {
            return Some(Assessment::tier(QualityTier::MediumHigh, "sticker_name"));
        }

        None
    }

    fn deep(&self, record: &MediaRecord) -> Result<Assessment, ClassifyError> {
        let size = std::fs::metadata(&record.path)?.len();
        if size == 0 {
            return Ok(Assessment::corrupted(
                CorruptionKind::Incomplete,
                "file is empty",
                false,
            ));
        }

        let header = read_signature(&record.path)?;
        let ext = extension_of(&record.path).unwrap_or_default();
        match sniff_format(&header) {
            None => {
                return Ok(Assessment::corrupted(
                    CorruptionKind::Format,
                    "unrecognised container signature",
                    false,
                ))
            }
            Some(sniffed) if !signature_matches_extension(&ext, sniffed) => {
                return Ok(Assessment::corrupted(
                    CorruptionKind::FileHeader,
                    format!("extension .{} but contents look like {}", ext, sniffed),
                    true,
                ))
            }
            Some("jpeg") if !jpeg_has_end_marker(&record.path)? => {
                return Ok(Assessment::corrupted(
                    CorruptionKind::Incomplete,
                    "jpeg is truncated (no end-of-image marker)",
                    true,
                ))
            }
            Some(_) => {}
        }

        let assessment = match record.media_type {
            MediaType::Video => {
                if size < VIDEO_VERY_LOW_BYTES {
                    Assessment::tier(QualityTier::VeryLow, "video under 100 KiB")
                } else {
                    Assessment::tier(QualityTier::MediumHigh, "deep_analysis")
                }
            }
            MediaType::Image | MediaType::Animated => {
                if size < IMAGE_VERY_LOW_BYTES {
                    Assessment::tier(QualityTier::VeryLow, "image under 10 KiB")
                } else if size < IMAGE_LOW_BYTES {
                    Assessment::tier(QualityTier::Low, "image under 50 KiB")
                } else if size < IMAGE_MEDIUM_LOW_BYTES {
                    Assessment::tier(QualityTier::MediumLow, "image under 200 KiB")
                } else {
                    Assessment::tier(QualityTier::MediumHigh, "deep_analysis")
                }
            }
        };
        Ok(assessment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn record_for(path: PathBuf, media_type: MediaType) -> MediaRecord {
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(1);
        MediaRecord::new(path, media_type, size)
    }

    #[test]
    fn test_quick_routes_common_extensions() {
        let c = HeuristicClassifier;
        let r = MediaRecord::new(PathBuf::from("/m/photo.JPG"), MediaType::Image, 10);
        assert_eq!(c.quick(&r).unwrap().tier, QualityTier::MediumHigh);

        let r = MediaRecord::new(PathBuf::from("/m/scan.tiff"), MediaType::Image, 10);
        assert_eq!(c.quick(&r).unwrap().tier, QualityTier::VeryHigh);

        let r = MediaRecord::new(PathBuf::from("/m/clip.mkv"), MediaType::Video, 10);
        assert!(c.quick(&r).is_none());
    }

    #[test]
    fn test_quick_uses_name_keywords() {
        let c = HeuristicClassifier;
        let r = MediaRecord::new(PathBuf::from("/m/party_emoji.apng"), MediaType::Animated, 10);
        let a = c.quick(&r).unwrap();
        assert_eq!(a.tier, QualityTier::MediumHigh);
        assert_eq!(a.factors, vec!["sticker_name".to_string()]);
    }

    #[test]
    fn test_quick_defers_empty_files() {
        let c = HeuristicClassifier;
        let r = MediaRecord::new(PathBuf::from("/m/photo.png"), MediaType::Image, 0);
        assert!(c.quick(&r).is_none());
    }

    #[test]
    fn test_sniff_format() {
        assert_eq!(sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("jpeg"));
        assert_eq!(sniff_format(&[0xFF, 0x0A, 0x00]), Some("jxl"));
        assert_eq!(sniff_format(b"\x00\x00\x00\x1cftypavif"), Some("avif"));
        assert_eq!(sniff_format(b"\x00\x00\x00\x14ftypqt  "), Some("mov"));
        assert_eq!(sniff_format(b"\x00\x00\x00\x18ftypisom"), Some("mp4"));
        assert_eq!(sniff_format(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_format(b"hello world!"), None);
    }

    #[test]
    fn test_deep_flags_empty_and_mismatched_files() {
        let dir = TempDir::new().unwrap();
        let c = HeuristicClassifier;

        let empty = dir.path().join("empty.png");
        fs::write(&empty, b"").unwrap();
        let a = c.deep(&record_for(empty, MediaType::Image)).unwrap();
        assert_eq!(a.tier, QualityTier::Corrupted);
        let corruption = a.corruption.unwrap();
        assert_eq!(corruption.kind, CorruptionKind::Incomplete);
        assert!(!corruption.recoverable);

        let liar = dir.path().join("liar.mkv");
        fs::write(&liar, [0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 0xFF, 0xD9]).unwrap();
        let a = c.deep(&record_for(liar, MediaType::Video)).unwrap();
        assert_eq!(a.corruption.unwrap().kind, CorruptionKind::FileHeader);

        let truncated = dir.path().join("cut.jpe");
        fs::write(&truncated, [0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]).unwrap();
        let a = c.deep(&record_for(truncated, MediaType::Image)).unwrap();
        let corruption = a.corruption.unwrap();
        assert_eq!(corruption.kind, CorruptionKind::Incomplete);
        assert!(corruption.recoverable);
    }

    #[test]
    fn test_deep_scores_by_size() {
        let dir = TempDir::new().unwrap();
        let c = HeuristicClassifier;

        let mut tiny = vec![0xFF, 0xD8, 0xFF, 0xE0];
        tiny.extend(std::iter::repeat(7u8).take(1000));
        tiny.extend([0xFF, 0xD9]);
        let path = dir.path().join("tiny.jfif");
        fs::write(&path, &tiny).unwrap();
        let a = c.deep(&record_for(path, MediaType::Image)).unwrap();
        assert_eq!(a.tier, QualityTier::VeryLow);
        assert!(a.is_low_quality());

        let mut big = vec![0x1A, 0x45, 0xDF, 0xA3];
        big.extend(std::iter::repeat(1u8).take(200 * 1024));
        let path = dir.path().join("movie.mkv");
        fs::write(&path, &big).unwrap();
        let a = c.deep(&record_for(path, MediaType::Video)).unwrap();
        assert_eq!(a.tier, QualityTier::MediumHigh);
    }

    struct AlwaysDeepFails;

    impl QualityClassifier for AlwaysDeepFails {
        fn quick(&self, _record: &MediaRecord) -> Option<Assessment> {
            None
        }

        fn deep(&self, _record: &MediaRecord) -> Result<Assessment, ClassifyError> {
            Err(ClassifyError::Io(io::Error::new(io::ErrorKind::Other, "gone")))
        }
    }

    #[test]
    fn test_classify_falls_back_on_deep_error() {
        let r = MediaRecord::new(PathBuf::from("/m/x.png"), MediaType::Image, 10);
        let (a, pass) = classify(&AlwaysDeepFails, &r);
        assert_eq!(pass, ClassificationPass::Deep);
        assert_eq!(a.tier, QualityTier::MediumHigh);
        assert_eq!(a.factors, vec!["default_routing".to_string()]);
    }
}
