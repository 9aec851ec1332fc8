//! Per-file conversion pipeline.
//!
//! Runs one routed file through the stages below, retrying failed encodes:
//! 1. Plan the encode and stage output as a hidden file beside the source
//! 2. Try each planned encoder through the version router
//! 3. Copy tags onto the staged output (best effort)
//! 4. Commit through the replacement manager
//! 5. Give the result the source's modification time

use crate::config::EngineConfig;
use crate::encode::{metadata_copy_args, plan_encode};
use crate::media::{MediaRecord, MediaType};
use crate::replace::{ReplaceError, ReplaceManager};
use crate::routing::{target_path, RoutingDecision, RoutingError};
use crate::tools::{RouterError, ToolKind, ToolRouter};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of staged outputs. Dot-prefixed so scans never pick them up.
pub const STAGED_PREFIX: &str = ".pixmill-";

/// Error type for per-file processing.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// No installed encoder can handle the conversion
    #[error("No encoder available: {0}")]
    ToolUnavailable(String),

    /// Every encoder attempt failed
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    /// The source vanished between scan and processing
    #[error("Source file missing: {0}")]
    SourceMissing(PathBuf),

    #[error("Corrupted input: {0}")]
    CorruptedInput(String),

    #[error("Low quality input: {0}")]
    LowQuality(String),

    /// The output could not be swapped in; the source was restored
    #[error("Replacement failed: {0}")]
    AtomicReplaceFailed(#[from] ReplaceError),

    #[error("Invalid target: {0}")]
    InvalidTarget(#[from] RoutingError),

    #[error("Cancelled")]
    Cancelled,
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::ConversionFailed(_))
    }

    /// Errors that flag the file for the batch decision instead of failing it.
    pub fn is_flagged(&self) -> bool {
        matches!(
            self,
            ProcessError::CorruptedInput(_) | ProcessError::LowQuality(_)
        )
    }
}

/// A successful conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub new_path: PathBuf,
    pub new_size: u64,
    /// Encode attempts used, including the successful one.
    pub attempts: u32,
    pub encoder: ToolKind,
    pub metadata_copied: bool,
}

/// `<dir>/.pixmill-<id>.<ext>`
pub fn staged_output_path(dir: &Path, ext: &str) -> PathBuf {
    dir.join(format!(
        "{}{}.{}",
        STAGED_PREFIX,
        Uuid::new_v4().simple(),
        ext
    ))
}

pub struct FileProcessor {
    router: Arc<ToolRouter>,
    replace: Arc<ReplaceManager>,
    config: EngineConfig,
}

impl FileProcessor {
    pub fn new(router: Arc<ToolRouter>, replace: Arc<ReplaceManager>, config: EngineConfig) -> Self {
        Self {
            router,
            replace,
            config,
        }
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    pub fn replace_manager(&self) -> &Arc<ReplaceManager> {
        &self.replace
    }

    /// Encoder timeout for one attempt on `media_type`.
    pub fn timeout_for(&self, media_type: MediaType) -> Duration {
        let secs = match media_type {
            MediaType::Image => self.config.image_timeout_secs,
            MediaType::Animated => self.config.animated_timeout_secs,
            MediaType::Video => self.config.video_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    /// Convert `record` per `decision` and commit the result in place.
    pub async fn process(
        &self,
        record: &MediaRecord,
        decision: &RoutingDecision,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome, ProcessError> {
        let source = record.path.as_path();
        let source_mtime = fs::metadata(source)
            .and_then(|m| m.modified())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProcessError::SourceMissing(source.to_path_buf()),
                _ => ProcessError::CorruptedInput(format!("{} is unreadable: {}", source.display(), e)),
            })?;

        let destination = target_path(source, decision.target_format)?;
        let target_ext = decision
            .target_format
            .extension()
            .ok_or_else(|| RoutingError::NoTarget(source.to_path_buf()))?;
        let dir = source.parent().unwrap_or_else(|| Path::new("."));
        let timeout = self.timeout_for(record.media_type);

        let mut attempts = 0;
        let (staged, encoder) = loop {
            if cancel.is_cancelled() {
                return Err(ProcessError::Cancelled);
            }
            attempts += 1;
            let staged = staged_output_path(dir, target_ext);
            match self.encode(record, decision, &staged, timeout, cancel).await {
                Ok(encoder) => break (staged, encoder),
                Err(e) => {
                    let _ = fs::remove_file(&staged);
                    if e.is_retryable() && attempts <= self.config.max_retries {
                        warn!(
                            path = %source.display(),
                            attempt = attempts,
                            error = %e,
                            "conversion attempt failed, retrying"
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        };

        let metadata_copied = self
            .copy_metadata(source, &staged, record.extension().as_deref(), target_ext, timeout, cancel)
            .await;
        if cancel.is_cancelled() {
            let _ = fs::remove_file(&staged);
            return Err(ProcessError::Cancelled);
        }

        let replace = Arc::clone(&self.replace);
        let (src, stg, dst) = (source.to_path_buf(), staged.clone(), destination.clone());
        let expected = target_ext.to_string();
        let committed = tokio::task::spawn_blocking(move || {
            replace.commit(&src, &stg, &dst, Some(&expected))
        })
        .await;
        match committed {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(ProcessError::AtomicReplaceFailed(e)),
            Err(join) => {
                let _ = fs::remove_file(&staged);
                return Err(ProcessError::AtomicReplaceFailed(ReplaceError::CommitFailed(
                    io::Error::other(join.to_string()),
                )));
            }
        }

        if let Err(e) = set_modified(&destination, source_mtime) {
            warn!(path = %destination.display(), error = %e, "failed to preserve modification time");
        }
        let new_size = fs::metadata(&destination).map(|m| m.len()).unwrap_or(0);

        info!(
            path = %source.display(),
            new_path = %destination.display(),
            encoder = %encoder,
            attempts,
            original_size = record.size_bytes,
            new_size,
            "converted"
        );
        Ok(FileOutcome {
            new_path: destination,
            new_size,
            attempts,
            encoder,
            metadata_copied,
        })
    }

    /// Try each planned encoder in order; returns the one that produced `staged`.
    async fn encode(
        &self,
        record: &MediaRecord,
        decision: &RoutingDecision,
        staged: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolKind, ProcessError> {
        let ext = record.extension().unwrap_or_default();
        let plan = plan_encode(&record.path, &ext, record.media_type, decision, staged);
        if plan.is_empty() {
            return Err(ProcessError::ToolUnavailable(format!(
                "no encoder plan for {} -> {}",
                ext, decision.target_format
            )));
        }

        let mut unsuitable = Vec::new();
        let mut last_failure = None;
        for step in &plan {
            let result = self
                .router
                .execute_command(
                    step.tool,
                    &step.input_format,
                    &step.output_format,
                    &step.args,
                    timeout,
                    cancel,
                )
                .await;
            match result {
                Ok(output) => {
                    debug!(tool = %step.tool, elapsed_ms = output.duration.as_millis() as u64, "encoder finished");
                    if fs::metadata(staged).map(|m| m.len() > 0).unwrap_or(false) {
                        return Ok(step.tool);
                    }
                    last_failure = Some(format!("{} produced no output", step.tool));
                }
                Err(e) if e.is_cancelled() => return Err(ProcessError::Cancelled),
                Err(e @ RouterError::NoSuitableVersion { .. }) => unsuitable.push(e.to_string()),
                Err(e) => last_failure = Some(e.to_string()),
            }
            let _ = fs::remove_file(staged);
        }

        match last_failure {
            Some(reason) => Err(ProcessError::ConversionFailed(reason)),
            None => Err(ProcessError::ToolUnavailable(unsuitable.join("; "))),
        }
    }

    /// Copy tags from `source` onto `staged`. Never fails the conversion.
    async fn copy_metadata(
        &self,
        source: &Path,
        staged: &Path,
        source_ext: Option<&str>,
        target_ext: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        if !self.config.copy_metadata || !self.router.has_tool(ToolKind::Exiftool) {
            return false;
        }
        let args = metadata_copy_args(source, staged);
        match self
            .router
            .execute_command(
                ToolKind::Exiftool,
                source_ext.unwrap_or_default(),
                target_ext,
                &args,
                timeout,
                cancel,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(path = %source.display(), error = %e, "metadata copy skipped");
                false
            }
        }
    }
}

fn set_modified(path: &Path, mtime: SystemTime) -> io::Result<()> {
    File::options().write(true).open(path)?.set_modified(mtime)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AppMode, RouterConfig};
    use crate::media::{QualityTier, TargetFormat};
    use crate::routing::decide;
    use crate::tools::{ExternalTool, ToolCapabilities, ToolError, ToolOutput, VersionKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    pub(crate) const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR pixels pixels pixels";

    /// Encoder that writes a valid container into whichever argument is the staged path.
    pub(crate) struct WritingTool {
        formats: Vec<&'static str>,
        /// Invocations that fail before one succeeds.
        pub(crate) failures_left: AtomicUsize,
        pub(crate) calls: AtomicUsize,
    }

    impl WritingTool {
        pub(crate) fn new(formats: &[&'static str]) -> Self {
            Self {
                formats: formats.to_vec(),
                failures_left: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn flaky(formats: &[&'static str], failures: usize) -> Self {
            let tool = Self::new(formats);
            tool.failures_left.store(failures, Ordering::SeqCst);
            tool
        }
    }

    fn payload_for(path: &str) -> Vec<u8> {
        if path.ends_with(".jxl") {
            vec![0xFF, 0x0A, 0, 1, 2, 3]
        } else if path.ends_with(".avif") {
            b"\x00\x00\x00\x1cftypavif\x00\x00\x00\x00".to_vec()
        } else {
            b"\x00\x00\x00\x14ftypqt  \x00\x00\x00\x00".to_vec()
        }
    }

    #[async_trait]
    impl ExternalTool for WritingTool {
        async fn probe(&self) -> Result<ToolCapabilities, ToolError> {
            Ok(ToolCapabilities {
                version: "1.0.0".into(),
                formats: self.formats.iter().map(|s| s.to_string()).collect(),
            })
        }

        async fn invoke(
            &self,
            args: &[String],
            _timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<ToolOutput, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let pending = self.failures_left.load(Ordering::SeqCst);
            if pending > 0 {
                self.failures_left.store(pending - 1, Ordering::SeqCst);
                return Err(ToolError::Exit {
                    code: Some(1),
                    stderr: "encoder crashed".into(),
                });
            }
            if let Some(out) = args.iter().find(|a| a.contains(STAGED_PREFIX)) {
                fs::write(out, payload_for(out)).map_err(ToolError::Io)?;
            }
            Ok(ToolOutput {
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            })
        }
    }

    pub(crate) async fn router_with(tools: Vec<(ToolKind, Arc<dyn ExternalTool>)>) -> Arc<ToolRouter> {
        let router = ToolRouter::new(RouterConfig {
            search_paths: Vec::new(),
            ..RouterConfig::default()
        });
        for (kind, tool) in tools {
            router
                .register(kind, VersionKind::System, PathBuf::from(kind.binary()), tool)
                .await;
        }
        Arc::new(router)
    }

    fn build(router: Arc<ToolRouter>) -> FileProcessor {
        FileProcessor::new(
            router,
            Arc::new(ReplaceManager::new(None, false)),
            EngineConfig::default(),
        )
    }

    fn png_record(dir: &TempDir) -> MediaRecord {
        let path = dir.path().join("photo.png");
        fs::write(&path, PNG).unwrap();
        let mut record = MediaRecord::new(path, MediaType::Image, PNG.len() as u64);
        record.quality_tier = QualityTier::High;
        record
    }

    #[tokio::test]
    async fn test_converts_and_preserves_mtime() {
        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        File::options()
            .write(true)
            .open(&record.path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let cjxl: Arc<dyn ExternalTool> = Arc::new(WritingTool::new(&["png", "jpeg", "jxl"]));
        let processor = build(router_with(vec![(ToolKind::Jxl, cjxl)]).await);
        let decision = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::High);

        let outcome = processor
            .process(&record, &decision, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.new_path, dir.path().join("photo.jxl"));
        assert_eq!(outcome.encoder, ToolKind::Jxl);
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.metadata_copied);
        assert!(!record.path.exists());
        assert_eq!(fs::metadata(&outcome.new_path).unwrap().modified().unwrap(), old);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy() != "photo.jxl")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_source_is_reported_missing() {
        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        fs::remove_file(&record.path).unwrap();

        let cjxl = Arc::new(WritingTool::new(&["png", "jxl"]));
        let tool: Arc<dyn ExternalTool> = cjxl.clone();
        let processor = build(router_with(vec![(ToolKind::Jxl, tool)]).await);
        let decision = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::High);

        let err = processor
            .process(&record, &decision, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SourceMissing(ref p) if p == &record.path));
        assert!(!err.is_flagged());
        assert_eq!(cjxl.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_ffmpeg_when_cjxl_missing() {
        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        let ffmpeg: Arc<dyn ExternalTool> = Arc::new(WritingTool::new(&["png", "jxl", "avif"]));
        let processor = build(router_with(vec![(ToolKind::Ffmpeg, ffmpeg)]).await);
        let decision = decide(AppMode::Quality, MediaType::Image, QualityTier::Low);

        let outcome = processor
            .process(&record, &decision, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.encoder, ToolKind::Ffmpeg);
    }

    #[tokio::test]
    async fn test_retries_then_gives_up() {
        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        let flaky = Arc::new(WritingTool::flaky(&["png", "jxl"], 2));
        let processor = build(router_with(vec![(ToolKind::Jxl, flaky.clone() as Arc<dyn ExternalTool>)]).await);
        let decision = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::High);

        let outcome = processor
            .process(&record, &decision, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);

        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        let broken = Arc::new(WritingTool::flaky(&["png", "jxl"], 100));
        let processor = build(router_with(vec![(ToolKind::Jxl, broken.clone() as Arc<dyn ExternalTool>)]).await);
        let err = processor
            .process(&record, &decision, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::ConversionFailed(_)));
        assert_eq!(fs::read(&record.path).unwrap(), PNG);
    }

    #[tokio::test]
    async fn test_missing_encoder_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        let processor = build(router_with(Vec::new()).await);
        let decision = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::High);

        let err = processor
            .process(&record, &decision, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::ToolUnavailable(_)));
        assert!(!err.is_retryable());
        assert!(record.path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        let cjxl: Arc<dyn ExternalTool> = Arc::new(WritingTool::new(&["png", "jxl"]));
        let processor = build(router_with(vec![(ToolKind::Jxl, cjxl)]).await);
        let decision = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::High);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = processor.process(&record, &decision, &cancel).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
        assert_eq!(fs::read(&record.path).unwrap(), PNG);
    }

    #[tokio::test]
    async fn test_metadata_copy_runs_when_exiftool_present() {
        let dir = TempDir::new().unwrap();
        let record = png_record(&dir);
        let cjxl: Arc<dyn ExternalTool> = Arc::new(WritingTool::new(&["png", "jxl"]));
        let exif = Arc::new(WritingTool::new(&["png", "jxl"]));
        let processor = build(
            router_with(vec![
                (ToolKind::Jxl, cjxl),
                (ToolKind::Exiftool, exif.clone() as Arc<dyn ExternalTool>),
            ])
            .await,
        );
        let decision = decide(AppMode::AutoPlus, MediaType::Image, QualityTier::High);
        assert_eq!(decision.target_format, TargetFormat::Jxl);

        let outcome = processor
            .process(&record, &decision, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.metadata_copied);
        assert_eq!(exif.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_staged_path_is_hidden() {
        let p = staged_output_path(Path::new("/m"), "jxl");
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(STAGED_PREFIX));
        assert!(name.ends_with(".jxl"));
    }
}
