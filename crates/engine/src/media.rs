//! Media records and the value types that flow through a conversion run.
//!
//! Records are persisted as JSON inside the state store, so every type here
//! derives serde with snake_case variant names.

use crate::config::AppMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Broad kind of a media file, decided from its extension and header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// Still image.
    Image,
    /// Animated image sequence (GIF, APNG, animated WebP).
    Animated,
    /// Video container.
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Animated => "animated",
            MediaType::Video => "video",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a media record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Discovered, waiting to be processed.
    #[default]
    Pending,
    /// Discovered, classification not finished yet.
    Scanning,
    /// Admitted to a worker.
    Processing,
    /// Converted and committed.
    Done,
    /// Gave up on this file.
    Failed,
    /// Left untouched on purpose.
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Scanning => "scanning",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Done => "done",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }

    /// Statuses that mark a session as resumable.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProcessingStatus::Pending | ProcessingStatus::Scanning)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Done | ProcessingStatus::Failed | ProcessingStatus::Skipped
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered perceptual quality classification.
///
/// Variant order is the quality order, so tiers compare with `<`/`>`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Corrupted,
    #[default]
    Unknown,
    VeryLow,
    Low,
    MediumLow,
    MediumHigh,
    High,
    VeryHigh,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Corrupted => "corrupted",
            QualityTier::Unknown => "unknown",
            QualityTier::VeryLow => "very_low",
            QualityTier::Low => "low",
            QualityTier::MediumLow => "medium_low",
            QualityTier::MediumHigh => "medium_high",
            QualityTier::High => "high",
            QualityTier::VeryHigh => "very_high",
        }
    }

    /// High, very-high and medium-high sources.
    pub fn is_high(&self) -> bool {
        matches!(
            self,
            QualityTier::MediumHigh | QualityTier::High | QualityTier::VeryHigh
        )
    }

    /// Rough 0-10 score used when reporting low-quality files.
    pub fn score(&self) -> f64 {
        match self {
            QualityTier::Corrupted => 0.0,
            QualityTier::Unknown => 5.0,
            QualityTier::VeryLow => 1.5,
            QualityTier::Low => 3.5,
            QualityTier::MediumLow => 5.0,
            QualityTier::MediumHigh => 6.5,
            QualityTier::High => 8.0,
            QualityTier::VeryHigh => 9.5,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format chosen by routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFormat {
    /// JPEG XL still image.
    Jxl,
    /// AVIF still or animated image.
    Avif,
    /// QuickTime container (remux).
    Mov,
    /// Leave the file alone.
    Skip,
}

impl TargetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFormat::Jxl => "jxl",
            TargetFormat::Avif => "avif",
            TargetFormat::Mov => "mov",
            TargetFormat::Skip => "skip",
        }
    }

    /// File extension written for this format, `None` for `Skip`.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            TargetFormat::Jxl => Some("jxl"),
            TargetFormat::Avif => Some("avif"),
            TargetFormat::Mov => Some("mov"),
            TargetFormat::Skip => None,
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercased extension of a path without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// A discovered media file and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRecord {
    /// Absolute path; also the store key.
    pub path: PathBuf,
    pub media_type: MediaType,
    pub size_bytes: u64,
    pub status: ProcessingStatus,
    #[serde(default)]
    pub quality_tier: QualityTier,
    #[serde(default)]
    pub last_processed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl MediaRecord {
    pub fn new(path: PathBuf, media_type: MediaType, size_bytes: u64) -> Self {
        Self {
            path,
            media_type,
            size_bytes,
            status: ProcessingStatus::Pending,
            quality_tier: QualityTier::Unknown,
            last_processed: None,
            error_message: None,
        }
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.path)
    }

    pub fn set_status(&mut self, status: ProcessingStatus) {
        self.status = status;
        if status.is_terminal() {
            self.last_processed = Some(Utc::now());
        }
    }

    /// Mark the record as failed with a reason.
    pub fn fail(&mut self, reason: &str) {
        self.error_message = Some(reason.to_string());
        self.set_status(ProcessingStatus::Failed);
    }

    /// Mark the record as skipped with a reason.
    pub fn skip(&mut self, reason: &str) {
        self.error_message = Some(reason.to_string());
        self.set_status(ProcessingStatus::Skipped);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A file admitted to a worker. Persisted while in flight so a restart can see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionTask {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub target_format: TargetFormat,
    pub mode: AppMode,
    pub status: ProcessingStatus,
}

/// Outcome of processing one file. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingResult {
    pub original_path: PathBuf,
    #[serde(default)]
    pub new_path: Option<PathBuf>,
    pub success: bool,
    pub original_size: u64,
    pub new_size: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub mode: AppMode,
    pub finished_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn succeeded(
        original_path: PathBuf,
        new_path: PathBuf,
        original_size: u64,
        new_size: u64,
        duration: Duration,
        mode: AppMode,
    ) -> Self {
        Self {
            original_path,
            new_path: Some(new_path),
            success: true,
            original_size,
            new_size,
            error: None,
            duration_ms: duration.as_millis() as u64,
            mode,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        original_path: PathBuf,
        original_size: u64,
        error: impl Into<String>,
        duration: Duration,
        mode: AppMode,
    ) -> Self {
        Self {
            original_path,
            new_path: None,
            success: false,
            original_size,
            new_size: 0,
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
            mode,
            finished_at: Utc::now(),
        }
    }

    /// Bytes saved; negative when the output grew.
    pub fn space_saved(&self) -> i64 {
        if self.success {
            self.original_size as i64 - self.new_size as i64
        } else {
            0
        }
    }
}

/// Aggregate counters for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Statistics {
    pub total_files: usize,
    pub processed_files: usize,
    pub success_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    pub pending_files: usize,
    pub corrupted_files: usize,
    pub total_space_saved: i64,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub quality_stats: BTreeMap<String, usize>,
    #[serde(default)]
    pub format_stats: BTreeMap<String, usize>,
}

impl Statistics {
    /// Rebuild the counters from the store's records and results.
    pub fn from_records(records: &[MediaRecord], results: &[ProcessingResult]) -> Self {
        let mut stats = Statistics {
            total_files: records.len(),
            ..Default::default()
        };

        for record in records {
            match record.status {
                ProcessingStatus::Done => stats.success_files += 1,
                ProcessingStatus::Failed => stats.failed_files += 1,
                ProcessingStatus::Skipped => stats.skipped_files += 1,
                _ => stats.pending_files += 1,
            }
            if record.quality_tier == QualityTier::Corrupted {
                stats.corrupted_files += 1;
            }
            *stats
                .quality_stats
                .entry(record.quality_tier.as_str().to_string())
                .or_default() += 1;
        }
        stats.processed_files = stats.success_files + stats.failed_files;

        for result in results {
            stats.total_space_saved += result.space_saved();
            stats.processing_time_ms += result.duration_ms;
            if let Some(ext) = result.new_path.as_deref().and_then(extension_of) {
                *stats.format_stats.entry(ext).or_default() += 1;
            }
        }

        stats
    }
}
