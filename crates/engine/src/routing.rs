//! Routing decisions: which format and encoding strategy each file gets.
//!
//! The decision table is a pure function of mode, media type and quality
//! tier. [`ProcessingMode`] wraps it for one mode and hands convertible
//! files to the [`FileProcessor`].

use crate::config::AppMode;
use crate::convert::{FileOutcome, FileProcessor, ProcessError};
use crate::media::{extension_of, MediaRecord, MediaType, QualityTier, TargetFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How hard the encoder squeezes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeStrategy {
    Lossless,
    Balanced,
    Compressed,
    /// Container change only.
    Remux,
    Skip,
}

impl fmt::Display for EncodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EncodeStrategy::Lossless => "lossless",
            EncodeStrategy::Balanced => "balanced",
            EncodeStrategy::Compressed => "compressed",
            EncodeStrategy::Remux => "remux",
            EncodeStrategy::Skip => "skip",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub strategy: EncodeStrategy,
    pub target_format: TargetFormat,
    pub quality_tier: QualityTier,
    pub reason: String,
    pub confidence: f64,
}

impl RoutingDecision {
    fn new(
        strategy: EncodeStrategy,
        target_format: TargetFormat,
        quality_tier: QualityTier,
        reason: &str,
        confidence: f64,
    ) -> Self {
        Self {
            strategy,
            target_format,
            quality_tier,
            reason: reason.to_string(),
            confidence,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.target_format == TargetFormat::Skip
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RoutingError {
    #[error("{0} has no target for this format")]
    NoTarget(PathBuf),

    #[error("target path {0} would overwrite its source")]
    Collision(PathBuf),
}

/// The decision table.
pub fn decide(mode: AppMode, media_type: MediaType, tier: QualityTier) -> RoutingDecision {
    use MediaType::*;
    use EncodeStrategy::*;
    use TargetFormat::{Avif, Jxl, Mov};

    if tier == QualityTier::Corrupted {
        return RoutingDecision::new(Skip, TargetFormat::Skip, tier, "corrupted", 1.0);
    }
    let confidence = if tier == QualityTier::Unknown { 0.5 } else { 0.8 };

    match mode {
        AppMode::AutoPlus => match media_type {
            Image if tier.is_high() => {
                RoutingDecision::new(Lossless, Jxl, tier, "high_quality_lossless", confidence)
            }
            Image => RoutingDecision::new(Balanced, Avif, tier, "low_quality_balanced", confidence),
            Animated => RoutingDecision::new(Balanced, Avif, tier, "animated_avif", confidence),
            Video => RoutingDecision::new(Remux, Mov, tier, "video_remux", confidence),
        },
        AppMode::Quality => match media_type {
            Image => RoutingDecision::new(Lossless, Jxl, tier, "quality_lossless", 0.95),
            Animated => RoutingDecision::new(Lossless, Avif, tier, "quality_lossless_animated", 0.95),
            Video => RoutingDecision::new(Remux, Mov, tier, "video_remux", 0.95),
        },
        AppMode::Sticker => match media_type {
            Image | Animated => RoutingDecision::new(Compressed, Avif, tier, "sticker_compressed", 0.9),
            Video => RoutingDecision::new(Skip, TargetFormat::Skip, tier, "sticker_skips_video", 1.0),
        },
    }
}

/// Formats `mode` can produce for `media_type`.
pub fn target_formats(mode: AppMode, media_type: MediaType) -> &'static [TargetFormat] {
    match (mode, media_type) {
        (AppMode::AutoPlus, MediaType::Image) => &[TargetFormat::Jxl, TargetFormat::Avif],
        (AppMode::Quality, MediaType::Image) => &[TargetFormat::Jxl],
        (AppMode::AutoPlus | AppMode::Quality, MediaType::Animated) => &[TargetFormat::Avif],
        (AppMode::AutoPlus | AppMode::Quality, MediaType::Video) => &[TargetFormat::Mov],
        (AppMode::Sticker, MediaType::Image | MediaType::Animated) => &[TargetFormat::Avif],
        (AppMode::Sticker, MediaType::Video) => &[],
    }
}

/// Output path for converting `source` to `format`.
///
/// The extension is replaced. A remux whose result would equal the source
/// (case-insensitively) is written as `.mp4` instead; any other collision
/// is an error.
pub fn target_path(source: &Path, format: TargetFormat) -> Result<PathBuf, RoutingError> {
    let ext = format
        .extension()
        .ok_or_else(|| RoutingError::NoTarget(source.to_path_buf()))?;
    let candidate = source.with_extension(ext);
    let collides = candidate.to_string_lossy().to_lowercase() == source.to_string_lossy().to_lowercase();
    if !collides {
        return Ok(candidate);
    }
    match format {
        TargetFormat::Mov => Ok(source.with_extension("mp4")),
        _ => Err(RoutingError::Collision(candidate)),
    }
}

/// What happened to one file handed to [`ProcessingMode::process_file`].
#[derive(Debug)]
pub enum ModeOutcome {
    Skipped(String),
    Converted(FileOutcome),
}

/// One mode's view of the pipeline.
#[derive(Clone)]
pub struct ProcessingMode {
    mode: AppMode,
    processor: Arc<FileProcessor>,
}

/// Build the [`ProcessingMode`] for `mode`.
pub fn get_mode(mode: AppMode, processor: Arc<FileProcessor>) -> ProcessingMode {
    ProcessingMode { mode, processor }
}

impl ProcessingMode {
    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// Reason to leave `record` alone, if any.
    pub fn should_skip_file(&self, record: &MediaRecord) -> Option<String> {
        if record.size_bytes == 0 {
            return Some("empty file".to_string());
        }
        let ext = extension_of(&record.path)?;
        target_formats(self.mode, record.media_type)
            .iter()
            .find(|f| f.extension() == Some(ext.as_str()))
            .map(|f| format!("already {}", f))
    }

    pub fn get_strategy(&self, record: &MediaRecord) -> RoutingDecision {
        decide(self.mode, record.media_type, record.quality_tier)
    }

    pub async fn process_file(
        &self,
        cancel: &CancellationToken,
        record: &MediaRecord,
    ) -> Result<ModeOutcome, ProcessError> {
        if let Some(reason) = self.should_skip_file(record) {
            return Ok(ModeOutcome::Skipped(reason));
        }
        let decision = self.get_strategy(record);
        if decision.is_skip() {
            return Ok(ModeOutcome::Skipped(decision.reason));
        }
        let outcome = self.processor.process(record, &decision, cancel).await?;
        Ok(ModeOutcome::Converted(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tier_strategy() -> impl Strategy<Value = QualityTier> {
        prop_oneof![
            Just(QualityTier::Corrupted),
            Just(QualityTier::Unknown),
            Just(QualityTier::VeryLow),
            Just(QualityTier::Low),
            Just(QualityTier::MediumLow),
            Just(QualityTier::MediumHigh),
            Just(QualityTier::High),
            Just(QualityTier::VeryHigh),
        ]
    }

    fn mode_strategy() -> impl Strategy<Value = AppMode> {
        prop_oneof![
            Just(AppMode::AutoPlus),
            Just(AppMode::Quality),
            Just(AppMode::Sticker),
        ]
    }

    fn media_strategy() -> impl Strategy<Value = MediaType> {
        prop_oneof![
            Just(MediaType::Image),
            Just(MediaType::Animated),
            Just(MediaType::Video),
        ]
    }

    #[test]
    fn test_auto_plus_splits_images_by_tier() {
        let d = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::MediumHigh);
        assert_eq!(d.target_format, TargetFormat::Jxl);
        assert_eq!(d.strategy, EncodeStrategy::Lossless);

        let d = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::MediumLow);
        assert_eq!(d.target_format, TargetFormat::Avif);
        assert_eq!(d.strategy, EncodeStrategy::Balanced);

        let d = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::Unknown);
        assert_eq!(d.target_format, TargetFormat::Avif);

        let d = decide(AppMode::AutoPlus, MediaType::Video, QualityTier::High);
        assert_eq!(d.target_format, TargetFormat::Mov);
    }

    #[test]
    fn test_quality_and_sticker_tables() {
        let d = decide(AppMode::Quality, MediaType::Image, QualityTier::VeryLow);
        assert_eq!(d.target_format, TargetFormat::Jxl);
        let d = decide(AppMode::Quality, MediaType::Animated, QualityTier::High);
        assert_eq!((d.target_format, d.strategy), (TargetFormat::Avif, EncodeStrategy::Lossless));

        assert_eq!(
            decide(AppMode::Sticker, MediaType::Video, QualityTier::High).target_format,
            TargetFormat::Skip
        );
        assert_eq!(
            decide(AppMode::Sticker, MediaType::Animated, QualityTier::Low).target_format,
            TargetFormat::Avif
        );
        assert_eq!(
            decide(AppMode::Sticker, MediaType::Image, QualityTier::VeryHigh).target_format,
            TargetFormat::Avif
        );
    }

    #[test]
    fn test_target_path() {
        assert_eq!(
            target_path(Path::new("/m/a.png"), TargetFormat::Jxl).unwrap(),
            PathBuf::from("/m/a.jxl")
        );
        assert_eq!(
            target_path(Path::new("/m/clip.MOV"), TargetFormat::Mov).unwrap(),
            PathBuf::from("/m/clip.mp4")
        );
        assert_eq!(
            target_path(Path::new("/m/a.JXL"), TargetFormat::Jxl),
            Err(RoutingError::Collision(PathBuf::from("/m/a.jxl")))
        );
        assert!(matches!(
            target_path(Path::new("/m/a.png"), TargetFormat::Skip),
            Err(RoutingError::NoTarget(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_decision_is_total_and_consistent(
            mode in mode_strategy(),
            media in media_strategy(),
            tier in tier_strategy(),
        ) {
            let d = decide(mode, media, tier);
            prop_assert_eq!(d.quality_tier, tier);
            prop_assert!(d.confidence > 0.0 && d.confidence <= 1.0);
            if tier == QualityTier::Corrupted {
                prop_assert_eq!(d.target_format, TargetFormat::Skip);
                prop_assert_eq!(d.reason.as_str(), "corrupted");
            } else if d.target_format == TargetFormat::Skip {
                prop_assert_eq!((mode, media), (AppMode::Sticker, MediaType::Video));
            } else {
                prop_assert!(target_formats(mode, media).contains(&d.target_format));
            }
            prop_assert_eq!(d.strategy == EncodeStrategy::Skip, d.target_format == TargetFormat::Skip);
        }
    }
}
