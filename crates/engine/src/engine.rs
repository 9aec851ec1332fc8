//! Run orchestration.
//!
//! [`Engine::execute`] drives one run over a directory:
//! 1. Resume the stored session for this directory, or scan it afresh
//! 2. Classify pending files, flagging corrupted and low-quality ones
//! 3. Settle flagged files with one batch decision
//! 4. Admit files to a worker pool sized by the concurrency optimizer
//! 5. Commit each outcome to the state store and report totals
//!
//! Telemetry sampling, optimizer evaluation and tool health checks run as
//! background tasks for the duration of the run.

use crate::batch::{
    BatchDecisionManager, CorruptedFile, DecisionInput, DecisionRecord, LowQualityFile, StdinInput,
};
use crate::classify::{classify, Assessment, ClassificationPass, HeuristicClassifier, QualityClassifier};
use crate::config::{AppMode, Config, ConfigError};
use crate::convert::{FileProcessor, ProcessError, STAGED_PREFIX};
use crate::media::{
    ConversionTask, MediaRecord, ProcessingResult, ProcessingStatus, QualityTier, Statistics,
};
use crate::optimizer::{ConcurrencyOptimizer, OptimizerStats};
use crate::replace::{validate_output, ReplaceManager};
use crate::routing::{get_mode, target_path, ModeOutcome, ProcessingMode};
use crate::scan::{scan_directory, ScanError};
use crate::store::{StateManager, StoreError};
use crate::telemetry::TelemetryCollector;
use crate::tools::{RouterStats, ToolRouter};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error type for run-level failures. Per-file errors never surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The state store failed; the run cannot continue safely
    #[error("State store error: {0}")]
    State(#[from] StoreError),

    #[error("Run aborted by operator")]
    Aborted,

    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Totals for one run, reconciled against the store.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub session_id: String,
    pub root: PathBuf,
    pub mode: AppMode,
    pub resumed: bool,
    pub total_files: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub bytes_saved: i64,
    /// Files placed by the quick classification pass.
    pub fast_routed: usize,
    /// Files that needed deep analysis.
    pub deep_analyzed: usize,
    pub batch_decision: Option<DecisionRecord>,
    pub optimizer: OptimizerStats,
    pub final_workers: usize,
    pub router: RouterStats,
    pub elapsed_ms: u64,
}

/// Replaceable collaborators, for tests and embedding.
pub struct EngineComponents {
    pub store: Arc<StateManager>,
    pub router: Arc<ToolRouter>,
    pub telemetry: Arc<TelemetryCollector>,
    pub classifier: Arc<dyn QualityClassifier>,
    pub decision_input: Box<dyn DecisionInput>,
}

#[derive(Default)]
struct ClassificationCounts {
    fast: usize,
    deep: usize,
}

/// What a worker hands back to the admission loop.
struct WorkerReport {
    record: MediaRecord,
    outcome: Result<ModeOutcome, ProcessError>,
    elapsed: Duration,
}

pub struct Engine {
    config: Config,
    root: PathBuf,
    store: Arc<StateManager>,
    router: Arc<ToolRouter>,
    telemetry: Arc<TelemetryCollector>,
    optimizer: Arc<ConcurrencyOptimizer>,
    classifier: Arc<dyn QualityClassifier>,
    replace: Arc<ReplaceManager>,
    batch: Mutex<BatchDecisionManager>,
    mode: ProcessingMode,
}

impl Engine {
    /// Build an engine over `root` with host tools, host telemetry and the
    /// configured state file.
    pub async fn new(config: Config, root: &Path) -> Result<Self, EngineError> {
        config.validate()?;
        let root = resolve_root(root)?;
        let store = Arc::new(StateManager::open(&config.state.path, false)?);
        let router = Arc::new(ToolRouter::discover(config.router.clone()).await);
        let telemetry = Arc::new(TelemetryCollector::for_host(&root, &config.telemetry));
        Self::with_components(
            config,
            &root,
            EngineComponents {
                store,
                router,
                telemetry,
                classifier: Arc::new(HeuristicClassifier),
                decision_input: Box::new(StdinInput),
            },
        )
    }

    pub fn with_components(
        config: Config,
        root: &Path,
        components: EngineComponents,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let root = resolve_root(root)?;
        let replace = Arc::new(ReplaceManager::new(
            config.engine.backup_dir.clone(),
            config.engine.keep_backups,
        ));
        let processor = Arc::new(FileProcessor::new(
            Arc::clone(&components.router),
            Arc::clone(&replace),
            config.engine.clone(),
        ));
        let mode = get_mode(config.engine.mode, processor);
        let optimizer = Arc::new(ConcurrencyOptimizer::new(config.optimizer.clone()));
        let batch = BatchDecisionManager::with_input(&config.batch, components.decision_input);

        Ok(Self {
            config,
            root,
            store: components.store,
            router: components.router,
            telemetry: components.telemetry,
            optimizer,
            classifier: components.classifier,
            replace,
            batch: Mutex::new(batch),
            mode,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<StateManager> {
        &self.store
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    pub fn optimizer(&self) -> &Arc<ConcurrencyOptimizer> {
        &self.optimizer
    }

    pub fn mode(&self) -> &ProcessingMode {
        &self.mode
    }

    /// Run to completion or cancellation.
    pub async fn execute(&self, cancel: CancellationToken) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let loops = cancel.child_token();
        let _stop_loops = loops.clone().drop_guard();
        let background = self.spawn_background(&loops);

        let (session_id, resumed, pending) = self.prepare_session()?;
        info!(
            session = %session_id,
            root = %self.root.display(),
            mode = %self.config.engine.mode,
            resumed,
            pending = pending.len(),
            "run started"
        );

        let mut batch = self.batch.lock().await;
        let (queue, counts) = self.classify_pending(pending, &mut batch)?;
        let (queue, batch_decision) = self.settle_flagged(queue, &mut batch, &cancel).await?;
        drop(batch);
        self.run_workers(queue, &cancel).await?;

        loops.cancel();
        for handle in background {
            let _ = handle.await;
        }

        let records = self.store.load_media_files()?;
        let results = self.store.load_results()?;
        let mut stats = Statistics::from_records(&records, &results);
        stats.processing_time_ms = started.elapsed().as_millis() as u64;
        self.store.save_statistics(&stats)?;

        let summary = RunSummary {
            session_id,
            root: self.root.clone(),
            mode: self.config.engine.mode,
            resumed,
            total_files: stats.total_files,
            done: stats.success_files,
            failed: stats.failed_files,
            skipped: stats.skipped_files,
            pending: stats.pending_files,
            bytes_saved: stats.total_space_saved,
            fast_routed: counts.fast,
            deep_analyzed: counts.deep,
            batch_decision,
            optimizer: self.optimizer.stats(),
            final_workers: self.optimizer.current_workers(),
            router: self.router.stats(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            total = summary.total_files,
            done = summary.done,
            failed = summary.failed,
            skipped = summary.skipped,
            pending = summary.pending,
            bytes_saved = summary.bytes_saved,
            fast_routed = summary.fast_routed,
            deep_analyzed = summary.deep_analyzed,
            adjustments = summary.optimizer.total_adjustments,
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        Ok(summary)
    }

    fn spawn_background(&self, token: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let telemetry = Arc::clone(&self.telemetry);
        let optimizer = Arc::clone(&self.optimizer);
        let router = Arc::clone(&self.router);
        let snapshots = self.telemetry.subscribe();
        let (t1, t2, t3) = (token.clone(), token.clone(), token.clone());
        vec![
            tokio::spawn(async move { telemetry.run(t1).await }),
            tokio::spawn(async move { optimizer.run(snapshots, t2).await }),
            tokio::spawn(async move { router.run_health_checks(t3).await }),
        ]
    }

    /// Resume when the store holds unfinished work for this root, otherwise scan.
    fn prepare_session(&self) -> Result<(String, bool, Vec<MediaRecord>), EngineError> {
        if let Some(session) = self.store.load_session()? {
            if session.processing_dir == self.root {
                let recovered = self.recover_committed()?;
                self.store.requeue_interrupted()?;
                if recovered > 0 || self.store.has_incomplete_session(&self.root)? {
                    self.replace.sweep_leftovers(&self.root, STAGED_PREFIX);
                    let stale = self.store.load_tasks()?;
                    if !stale.is_empty() {
                        debug!(tasks = stale.len(), "dropping task snapshot from interrupted run");
                        self.store.save_tasks(&[])?;
                    }
                    let pending = self.store.get_pending_files()?;
                    self.store.save_session(&session.session_id, &self.root)?;
                    info!(session = %session.session_id, pending = pending.len(), "resuming session");
                    return Ok((session.session_id, true, pending));
                }
            }
        }

        self.store.clear_session()?;
        let session_id = Uuid::new_v4().to_string();
        self.store.save_session(&session_id, &self.root)?;
        let records: Vec<MediaRecord> = scan_directory(&self.root)?
            .into_iter()
            .map(|c| c.into_record())
            .collect();
        self.store.save_media_files(&records)?;
        info!(files = records.len(), "scan stored");
        Ok((session_id, false, records))
    }

    /// Mark interrupted files Done when their replacement already landed.
    ///
    /// A crash between the on-disk commit and the store update leaves the
    /// record Processing with its source gone and a valid output at the
    /// task's target path.
    fn recover_committed(&self) -> Result<usize, EngineError> {
        let records: HashMap<PathBuf, MediaRecord> = self
            .store
            .load_media_files()?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let mut recovered = 0;
        for task in self.store.load_tasks()? {
            let Some(record) = records.get(&task.source_path) else {
                continue;
            };
            if record.status != ProcessingStatus::Processing || record.path.exists() {
                continue;
            }
            let Some(ext) = task.target_format.extension() else {
                continue;
            };
            if validate_output(&task.target_path, Some(ext)).is_err() {
                continue;
            }
            let new_size = fs::metadata(&task.target_path).map(|m| m.len()).unwrap_or(0);
            let result = ProcessingResult::succeeded(
                record.path.clone(),
                task.target_path.clone(),
                record.size_bytes,
                new_size,
                Duration::ZERO,
                task.mode,
            );
            self.store
                .commit_outcome(&record.path, ProcessingStatus::Done, None, Some(&result))?;
            info!(
                path = %record.path.display(),
                output = %task.target_path.display(),
                "recorded conversion committed before interruption"
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Assign tiers; flagged files go to the batch manager, the rest are returned.
    fn classify_pending(
        &self,
        pending: Vec<MediaRecord>,
        batch: &mut BatchDecisionManager,
    ) -> Result<(Vec<MediaRecord>, ClassificationCounts), EngineError> {
        let mut counts = ClassificationCounts::default();
        let mut queue = Vec::with_capacity(pending.len());
        let mut flagged = Vec::new();

        for mut record in pending {
            let (assessment, pass) = classify(self.classifier.as_ref(), &record);
            match pass {
                ClassificationPass::Quick => counts.fast += 1,
                ClassificationPass::Deep => counts.deep += 1,
            }
            record.quality_tier = assessment.tier;

            match triage(&record, &assessment) {
                Ok(()) => queue.push(record),
                Err(e) => {
                    debug!(path = %record.path.display(), reason = %e, "file flagged");
                    flag(batch, &record, &assessment);
                    flagged.push(record);
                }
            }
        }

        self.store.upsert_media_files(&queue)?;
        self.store.upsert_media_files(&flagged)?;
        info!(
            fast_routed = counts.fast,
            deep_analyzed = counts.deep,
            flagged = flagged.len(),
            "classification finished"
        );
        queue.extend(flagged);
        Ok((queue, counts))
    }

    /// Resolve flagged files. Returns the processing queue with flagged files
    /// either readmitted or removed.
    async fn settle_flagged(
        &self,
        queue: Vec<MediaRecord>,
        batch: &mut BatchDecisionManager,
        cancel: &CancellationToken,
    ) -> Result<(Vec<MediaRecord>, Option<DecisionRecord>), EngineError> {
        if batch.is_empty() {
            return Ok((queue, None));
        }
        let record = batch.resolve(cancel).await;
        let applied = batch.apply_outcome(record.outcome);

        if applied.aborted {
            warn!(decision = %record.id, "operator aborted the run");
            return Err(EngineError::Aborted);
        }

        let mut queue = queue;
        for (path, reason) in &applied.skipped {
            self.store
                .commit_outcome(path, ProcessingStatus::Skipped, Some(reason.as_str()), None)?;
        }
        queue.retain(|r| !applied.skipped.iter().any(|(p, _)| p == &r.path));
        for r in queue.iter_mut() {
            if applied.readmit.contains(&r.path) && r.quality_tier == QualityTier::Corrupted {
                // route as an unassessed file
                r.quality_tier = QualityTier::Unknown;
            }
        }
        Ok((queue, Some(record)))
    }

    async fn run_workers(
        &self,
        queue: Vec<MediaRecord>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let (_, max_workers) = self.optimizer.bounds();
        let slots = Arc::new(Semaphore::new(max_workers));
        let mut workers: JoinSet<WorkerReport> = JoinSet::new();

        'admission: for record in queue {
            if cancel.is_cancelled() {
                // not admitted, still Pending
                break;
            }
            while workers.len() >= self.optimizer.current_workers() {
                match workers.join_next().await {
                    Some(joined) => self.collect(joined)?,
                    None => break,
                }
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => break 'admission,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'admission,
                },
            };

            self.admit(&record)?;
            let mode = self.mode.clone();
            let token = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let outcome = mode.process_file(&token, &record).await;
                WorkerReport {
                    record,
                    outcome,
                    elapsed: started.elapsed(),
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            self.collect(joined)?;
        }
        Ok(())
    }

    /// Persist the task snapshot and mark `record` in flight.
    fn admit(&self, record: &MediaRecord) -> Result<(), EngineError> {
        let decision = self.mode.get_strategy(record);
        let task = ConversionTask {
            source_path: record.path.clone(),
            target_path: target_path(&record.path, decision.target_format)
                .unwrap_or_else(|_| record.path.clone()),
            target_format: decision.target_format,
            mode: self.mode.mode(),
            status: ProcessingStatus::Processing,
        };
        self.store.save_task(&task)?;
        self.store
            .update_media_file_status(&record.path, ProcessingStatus::Processing, None)?;
        Ok(())
    }

    fn collect(
        &self,
        joined: Result<WorkerReport, tokio::task::JoinError>,
    ) -> Result<(), EngineError> {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                // the record stays Processing and is re-queued on resume
                error!(error = %e, "worker task failed");
                return Ok(());
            }
        };
        let WorkerReport {
            record,
            outcome,
            elapsed,
        } = report;
        let mode = self.mode.mode();

        match outcome {
            Ok(ModeOutcome::Skipped(reason)) => {
                debug!(path = %record.path.display(), reason = %reason, "skipped");
                self.store.commit_outcome(
                    &record.path,
                    ProcessingStatus::Skipped,
                    Some(reason.as_str()),
                    None,
                )?;
            }
            Ok(ModeOutcome::Converted(outcome)) => {
                let result = ProcessingResult::succeeded(
                    record.path.clone(),
                    outcome.new_path,
                    record.size_bytes,
                    outcome.new_size,
                    elapsed,
                    mode,
                );
                self.store
                    .commit_outcome(&record.path, ProcessingStatus::Done, None, Some(&result))?;
            }
            Err(ProcessError::Cancelled) => {
                self.store
                    .update_media_file_status(&record.path, ProcessingStatus::Pending, None)?;
                self.store.remove_task(&record.path)?;
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(path = %record.path.display(), error = %reason, "file failed");
                let result = ProcessingResult::failed(
                    record.path.clone(),
                    record.size_bytes,
                    reason.clone(),
                    elapsed,
                    mode,
                );
                self.store.commit_outcome(
                    &record.path,
                    ProcessingStatus::Failed,
                    Some(reason.as_str()),
                    Some(&result),
                )?;
            }
        }
        Ok(())
    }
}

fn resolve_root(root: &Path) -> Result<PathBuf, EngineError> {
    if !root.exists() {
        return Err(ScanError::MissingRoot(root.to_path_buf()).into());
    }
    if !root.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()).into());
    }
    Ok(root.canonicalize().map_err(ScanError::from)?)
}

/// Whether a classified file goes straight to processing.
fn triage(record: &MediaRecord, assessment: &Assessment) -> Result<(), ProcessError> {
    if let Some(corruption) = &assessment.corruption {
        return Err(ProcessError::CorruptedInput(format!(
            "{}: {}",
            record.path.display(),
            corruption.reason
        )));
    }
    if assessment.is_low_quality() {
        return Err(ProcessError::LowQuality(format!(
            "{} scored {:.2}",
            record.path.display(),
            assessment.score
        )));
    }
    Ok(())
}

fn flag(batch: &mut BatchDecisionManager, record: &MediaRecord, assessment: &Assessment) {
    match &assessment.corruption {
        Some(corruption) => batch.add_corrupted(CorruptedFile {
            path: record.path.clone(),
            kind: corruption.kind,
            reason: corruption.reason.clone(),
            recoverable: corruption.recoverable,
            size: record.size_bytes,
        }),
        None => batch.add_low_quality(LowQualityFile {
            path: record.path.clone(),
            score: assessment.score,
            factors: assessment.factors.clone(),
            size: record.size_bytes,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ScriptedInput;
    use crate::classify::{ClassifyError, CorruptionKind};
    use crate::convert::tests::{router_with, WritingTool, PNG};
    use crate::media::MediaType;
    use crate::telemetry::tests::ScriptedSource;
    use crate::media::TargetFormat;
    use crate::tools::{ExternalTool, ToolCapabilities, ToolError, ToolKind, ToolOutput};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Quick pass for everything except `deep_*`; names containing `bad`
    /// are corrupted and `tiny` are very low quality.
    struct NameClassifier;

    impl QualityClassifier for NameClassifier {
        fn quick(&self, record: &MediaRecord) -> Option<Assessment> {
            let name = record.path.file_name()?.to_string_lossy().into_owned();
            if name.starts_with("deep_") {
                return None;
            }
            if name.contains("bad") {
                return Some(Assessment::corrupted(CorruptionKind::Incomplete, "truncated", true));
            }
            if name.contains("tiny") {
                return Some(Assessment::tier(QualityTier::VeryLow, "small_file"));
            }
            Some(Assessment::tier(QualityTier::High, "png_family"))
        }

        fn deep(&self, _record: &MediaRecord) -> Result<Assessment, ClassifyError> {
            Ok(Assessment::tier(QualityTier::MediumHigh, "deep"))
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        store: Arc<StateManager>,
        tool: Arc<WritingTool>,
    }

    impl Fixture {
        fn new(names: &[String]) -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().canonicalize().unwrap();
            for name in names {
                fs::write(root.join(name), PNG).unwrap();
            }
            Self {
                _dir: dir,
                root,
                store: Arc::new(StateManager::in_memory().unwrap()),
                tool: Arc::new(WritingTool::new(&["png", "jxl", "avif"])),
            }
        }

        async fn engine(&self, config: Config, answers: ScriptedInput) -> Engine {
            self.engine_with_tool(config, answers, self.tool.clone()).await
        }

        async fn engine_with_tool(
            &self,
            config: Config,
            answers: ScriptedInput,
            tool: Arc<dyn ExternalTool>,
        ) -> Engine {
            let router = router_with(vec![
                (ToolKind::Jxl, Arc::clone(&tool)),
                (ToolKind::Avif, Arc::clone(&tool)),
                (ToolKind::Ffmpeg, tool),
            ])
            .await;
            let telemetry = Arc::new(TelemetryCollector::new(
                Box::new(ScriptedSource::idle()),
                &config.telemetry,
            ));
            Engine::with_components(
                config,
                &self.root,
                EngineComponents {
                    store: Arc::clone(&self.store),
                    router,
                    telemetry,
                    classifier: Arc::new(NameClassifier),
                    decision_input: Box::new(answers),
                },
            )
            .unwrap()
        }
    }

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{:03}.png", prefix, i)).collect()
    }

    /// Encoder that never finishes on its own; it returns only once cancelled.
    #[derive(Default)]
    struct StallingTool {
        started: AtomicUsize,
        cancelled: AtomicUsize,
    }

    #[async_trait]
    impl ExternalTool for StallingTool {
        async fn probe(&self) -> Result<ToolCapabilities, ToolError> {
            Ok(ToolCapabilities {
                version: "1.0.0".into(),
                formats: ["png", "jxl", "avif"].iter().map(|s| s.to_string()).collect(),
            })
        }

        async fn invoke(
            &self,
            _args: &[String],
            _timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<ToolOutput, ToolError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::Cancelled)
        }
    }

    fn staged_leftovers(root: &Path) -> Vec<String> {
        fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(STAGED_PREFIX))
            .collect()
    }

    #[tokio::test]
    async fn test_quick_and_deep_routing_cover_every_file() {
        let mut files = names("img_", 95);
        files.extend(names("deep_", 5));
        let fx = Fixture::new(&files);
        let engine = fx.engine(Config::default(), ScriptedInput::silent()).await;

        let summary = engine.execute(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.fast_routed, 95);
        assert_eq!(summary.deep_analyzed, 5);
        assert_eq!(summary.total_files, 100);
        assert_eq!(summary.done, 100);
        assert_eq!(summary.failed + summary.skipped + summary.pending, 0);
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 100);

        assert_eq!(fx.store.load_results().unwrap().len(), 100);
        assert!(fx.store.load_tasks().unwrap().is_empty());
        assert!(fx.root.join("deep_004.jxl").exists());
        assert!(!fx.root.join("deep_004.png").exists());
    }

    #[tokio::test]
    async fn test_resume_reprocesses_only_pending() {
        let fx = Fixture::new(&["a.png".to_string(), "b.png".to_string(), "c.png".to_string()]);
        let mut a = MediaRecord::new(fx.root.join("a.png"), MediaType::Image, PNG.len() as u64);
        a.set_status(ProcessingStatus::Done);
        let b = MediaRecord::new(fx.root.join("b.png"), MediaType::Image, PNG.len() as u64);
        let mut c = MediaRecord::new(fx.root.join("c.png"), MediaType::Image, PNG.len() as u64);
        c.set_status(ProcessingStatus::Processing);
        fx.store.save_session("earlier", &fx.root).unwrap();
        fx.store.save_media_files(&[a, b, c]).unwrap();

        let engine = fx.engine(Config::default(), ScriptedInput::silent()).await;
        let summary = engine.execute(CancellationToken::new()).await.unwrap();

        assert!(summary.resumed);
        assert_eq!(summary.session_id, "earlier");
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 2);
        assert!(fx.root.join("a.png").exists());
        assert!(fx.root.join("b.jxl").exists());
        assert!(fx.root.join("c.jxl").exists());
        assert_eq!(summary.done, 3);
    }

    #[tokio::test]
    async fn test_other_directory_triggers_fresh_scan() {
        let fx = Fixture::new(&["a.png".to_string()]);
        let stale = MediaRecord::new(PathBuf::from("/elsewhere/x.png"), MediaType::Image, 10);
        fx.store.save_session("old", Path::new("/elsewhere")).unwrap();
        fx.store.save_media_files(&[stale]).unwrap();

        let engine = fx.engine(Config::default(), ScriptedInput::silent()).await;
        let summary = engine.execute(CancellationToken::new()).await.unwrap();

        assert!(!summary.resumed);
        assert_ne!(summary.session_id, "old");
        assert_eq!(summary.total_files, 1);
        assert_eq!(summary.done, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flagged_files_default_to_ignore() {
        let fx = Fixture::new(&[
            "good.png".to_string(),
            "bad.png".to_string(),
            "tiny.png".to_string(),
        ]);
        let mut config = Config::default();
        config.batch.interactive = true;
        let engine = fx.engine(config, ScriptedInput::silent()).await;

        let summary = engine.execute(CancellationToken::new()).await.unwrap();
        let decision = summary.batch_decision.unwrap();
        assert!(decision.defaulted);
        assert_eq!(decision.corrupted_count, 1);
        assert_eq!(decision.low_quality_count, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.done, 1);
        assert!(fx.root.join("bad.png").exists());
        assert!(fx.root.join("tiny.png").exists());
    }

    #[tokio::test]
    async fn test_repair_readmits_flagged_files() {
        let fx = Fixture::new(&["bad.png".to_string(), "tiny.png".to_string()]);
        let mut config = Config::default();
        config.batch.interactive = true;
        let engine = fx.engine(config, ScriptedInput::new(["repair"])).await;

        let summary = engine.execute(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.done, 2);
        assert!(fx.root.join("bad.avif").exists());
        assert!(fx.root.join("tiny.avif").exists());
    }

    #[tokio::test]
    async fn test_abort_leaves_files_pending() {
        let fx = Fixture::new(&["good.png".to_string(), "bad.png".to_string()]);
        let mut config = Config::default();
        config.batch.interactive = true;
        let engine = fx.engine(config, ScriptedInput::new(["3"])).await;

        let err = engine.execute(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.store.get_pending_files().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_store_consistent() {
        let fx = Fixture::new(&names("img_", 10));
        let engine = fx.engine(Config::default(), ScriptedInput::silent()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = engine.execute(cancel).await.unwrap();
        assert_eq!(summary.pending, 10);
        assert_eq!(summary.done + summary.failed, 0);
        assert!(fx.store.load_tasks().unwrap().is_empty());
        assert!(fx.store.has_incomplete_session(&fx.root).unwrap());
    }

    #[tokio::test]
    async fn test_cancel_during_encoding_returns_files_to_pending() {
        let files = names("img_", 4);
        let fx = Fixture::new(&files);
        let stalling = Arc::new(StallingTool::default());
        let engine = fx
            .engine_with_tool(Config::default(), ScriptedInput::silent(), stalling.clone())
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = Arc::clone(&stalling);
        tokio::spawn(async move {
            while watched.started.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(10), engine.execute(cancel))
            .await
            .expect("run did not stop after cancellation")
            .unwrap();

        assert_eq!(stalling.cancelled.load(Ordering::SeqCst), 4);
        assert_eq!(summary.pending, 4);
        assert_eq!(summary.done + summary.failed + summary.skipped, 0);
        assert!(fx.store.load_tasks().unwrap().is_empty());
        assert!(fx.store.load_results().unwrap().is_empty());
        assert!(fx
            .store
            .load_media_files()
            .unwrap()
            .iter()
            .all(|r| r.status == ProcessingStatus::Pending));
        for name in &files {
            assert_eq!(fs::read(fx.root.join(name)).unwrap(), PNG);
        }
        assert!(staged_leftovers(&fx.root).is_empty());
    }

    #[tokio::test]
    async fn test_resume_records_replacement_that_landed_before_crash() {
        let fx = Fixture::new(&[]);
        let source = fx.root.join("a.png");
        let output = fx.root.join("a.jxl");
        fs::write(&output, [0xFF, 0x0A, 0, 1, 2, 3]).unwrap();
        fs::write(fx.root.join(".pixmill-0123.jxl"), b"partial").unwrap();

        let mut record = MediaRecord::new(source.clone(), MediaType::Image, PNG.len() as u64);
        record.quality_tier = QualityTier::High;
        record.set_status(ProcessingStatus::Processing);
        fx.store.save_session("crashed", &fx.root).unwrap();
        fx.store.save_media_files(&[record]).unwrap();
        fx.store
            .save_task(&ConversionTask {
                source_path: source.clone(),
                target_path: output.clone(),
                target_format: TargetFormat::Jxl,
                mode: AppMode::AutoPlus,
                status: ProcessingStatus::Processing,
            })
            .unwrap();

        let engine = fx.engine(Config::default(), ScriptedInput::silent()).await;
        let summary = engine.execute(CancellationToken::new()).await.unwrap();

        assert!(summary.resumed);
        assert_eq!(summary.session_id, "crashed");
        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 0);

        let results = fx.store.load_results().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].new_path.as_deref(), Some(output.as_path()));
        assert!(fx.store.load_tasks().unwrap().is_empty());
        assert!(output.exists());
        assert!(staged_leftovers(&fx.root).is_empty());
    }

    #[tokio::test]
    async fn test_vanished_source_fails_as_missing() {
        let fx = Fixture::new(&[]);
        let ghost = MediaRecord::new(fx.root.join("ghost.png"), MediaType::Image, 10);
        fx.store.save_session("earlier", &fx.root).unwrap();
        fx.store.save_media_files(&[ghost]).unwrap();

        let engine = fx.engine(Config::default(), ScriptedInput::silent()).await;
        let summary = engine.execute(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.failed, 1);
        let records = fx.store.load_media_files().unwrap();
        let error = records[0].error_message.as_deref().unwrap();
        assert!(error.contains("missing"), "{}", error);
        assert!(!error.contains("Corrupted"), "{}", error);
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_are_attributed_per_file() {
        let fx = Fixture::new(&names("img_", 3));
        fx.tool.failures_left.store(usize::MAX / 2, Ordering::SeqCst);
        let engine = fx.engine(Config::default(), ScriptedInput::silent()).await;

        let summary = engine.execute(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed, 3);
        let results = fx.store.load_results().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.success && r.error.is_some()));
        for name in names("img_", 3) {
            assert_eq!(fs::read(fx.root.join(name)).unwrap(), PNG);
        }
    }

    #[test]
    fn test_triage() {
        let record = MediaRecord::new(PathBuf::from("/m/a.png"), MediaType::Image, 1);
        assert!(triage(&record, &Assessment::tier(QualityTier::Low, "x")).is_ok());
        assert!(matches!(
            triage(&record, &Assessment::tier(QualityTier::VeryLow, "x")),
            Err(ProcessError::LowQuality(_))
        ));
        assert!(matches!(
            triage(&record, &Assessment::corrupted(CorruptionKind::Format, "x", false)),
            Err(ProcessError::CorruptedInput(_))
        ));
    }
}
