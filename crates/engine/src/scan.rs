//! Scanner module for discovering media files under a processing directory.
//!
//! Walks the tree, skips hidden entries (which also hides our own staging
//! files), and sorts what it finds into images, animated images and video.

use crate::media::{extension_of, MediaRecord, MediaType};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

/// Still image extensions (case-insensitive).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "jpe", "jfif", "png", "bmp", "tiff", "tif", "heic", "heif", "webp", "jxl",
    "avif",
];

/// Extensions that are always animated.
pub const ANIMATED_EXTENSIONS: &[&str] = &["gif", "apng"];

/// Video container extensions.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv", "avi", "m4v"];

/// How many leading bytes are inspected to spot animation.
const HEADER_PROBE_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Processing directory does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("Processing path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A media file discovered during scanning.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    /// Absolute path to the file.
    pub path: PathBuf,
    pub media_type: MediaType,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

impl ScanCandidate {
    pub fn into_record(self) -> MediaRecord {
        MediaRecord::new(self.path, self.media_type, self.size_bytes)
    }
}

/// Media type implied by the extension alone.
pub fn media_type_for_extension(ext: &str) -> Option<MediaType> {
    let ext = ext.to_lowercase();
    if ANIMATED_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Animated)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Video)
    } else {
        None
    }
}

pub fn is_media_file(path: &Path) -> bool {
    extension_of(path)
        .and_then(|ext| media_type_for_extension(&ext))
        .is_some()
}

/// True when a PNG or WebP header announces animation.
///
/// APNG carries an `acTL` chunk ahead of the first `IDAT`; animated WebP sets
/// the animation bit in its `VP8X` header.
pub fn has_animation_header(header: &[u8]) -> bool {
    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        return header.windows(4).any(|w| w == b"acTL");
    }
    if header.len() >= 21 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return &header[12..16] == b"VP8X" && header[20] & 0x02 != 0;
    }
    false
}

fn read_header(path: &Path) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_PROBE_BYTES);
    File::open(path)?
        .take(HEADER_PROBE_BYTES as u64)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// Classify a file by extension, upgrading PNG/WebP to animated when the
/// header says so.
pub fn detect_media_type(path: &Path) -> Option<MediaType> {
    let ext = extension_of(path)?;
    let media_type = media_type_for_extension(&ext)?;
    if media_type == MediaType::Image && matches!(ext.as_str(), "png" | "webp") {
        match read_header(path) {
            Ok(header) if has_animation_header(&header) => return Some(MediaType::Animated),
            Ok(_) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "header read failed"),
        }
    }
    Some(media_type)
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Recursively scans `root` for media files.
///
/// - Hidden directories and files (names starting with `.`) are skipped
/// - Extensions match case-insensitively
/// - Paths are returned absolute and sorted
pub fn scan_directory(root: &Path) -> Result<Vec<ScanCandidate>, ScanError> {
    use walkdir::WalkDir;

    if !root.exists() {
        return Err(ScanError::MissingRoot(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    let root = root.canonicalize()?;

    let mut candidates = Vec::new();
    let walker = WalkDir::new(&root)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(media_type) = detect_media_type(path) else {
            continue;
        };

        if let Ok(metadata) = entry.metadata() {
            candidates.push(ScanCandidate {
                path: path.to_path_buf(),
                media_type,
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), found = candidates.len(), "scan finished");
    Ok(candidates)
}
