//! One consolidated decision for every file the scan flagged.
//!
//! Corrupted and low-quality files are collected while classifying, then a
//! single question is put to the operator. Anything other than a clear
//! answer within the timeout resolves to [`DecisionOutcome::Ignore`].

use crate::classify::CorruptionKind;
use crate::config::BatchConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Retry recoverable corrupted files and convert low-quality ones anyway.
    Repair,
    DeleteAll,
    Abort,
    Ignore,
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionOutcome::Repair => "repair",
            DecisionOutcome::DeleteAll => "delete_all",
            DecisionOutcome::Abort => "abort",
            DecisionOutcome::Ignore => "ignore",
        })
    }
}

/// Parse an operator answer. `None` for anything unrecognised.
pub fn parse_decision(input: &str) -> Option<DecisionOutcome> {
    match input.trim().to_lowercase().as_str() {
        "1" | "repair" | "r" => Some(DecisionOutcome::Repair),
        "2" | "delete" | "d" => Some(DecisionOutcome::DeleteAll),
        "3" | "terminate" | "abort" | "t" => Some(DecisionOutcome::Abort),
        "4" | "ignore" | "i" | "" => Some(DecisionOutcome::Ignore),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorruptedFile {
    pub path: PathBuf,
    pub kind: CorruptionKind,
    pub reason: String,
    pub recoverable: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LowQualityFile {
    pub path: PathBuf,
    pub score: f64,
    pub factors: Vec<String>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub id: String,
    pub outcome: DecisionOutcome,
    /// True when no usable answer was given.
    pub defaulted: bool,
    pub corrupted_count: usize,
    pub low_quality_count: usize,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionStats {
    pub total_decisions: usize,
    pub defaulted: usize,
    pub files_decided: usize,
    pub by_outcome: BTreeMap<String, usize>,
}

/// Where operator answers come from.
#[async_trait]
pub trait DecisionInput: Send {
    /// Show `summary` and wait for one line. `None` once input is exhausted.
    async fn prompt(&mut self, summary: &str) -> Option<String>;
}

/// Prompt on stderr, answer on stdin.
pub struct StdinInput;

#[async_trait]
impl DecisionInput for StdinInput {
    async fn prompt(&mut self, summary: &str) -> Option<String> {
        let mut stderr = tokio::io::stderr();
        let _ = stderr.write_all(summary.as_bytes()).await;
        let _ = stderr.flush().await;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        lines.next_line().await.ok().flatten()
    }
}

/// Canned answers, optionally delayed. Never answers once the script runs out.
pub struct ScriptedInput {
    answers: VecDeque<String>,
    delay: Duration,
}

impl ScriptedInput {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// An operator who never answers.
    pub fn silent() -> Self {
        Self::new(Vec::<String>::new())
    }
}

#[async_trait]
impl DecisionInput for ScriptedInput {
    async fn prompt(&mut self, _summary: &str) -> Option<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.answers.pop_front() {
            Some(answer) => Some(answer),
            None => std::future::pending().await,
        }
    }
}

/// What the engine must do with flagged files after a decision.
#[derive(Debug, Default, PartialEq)]
pub struct AppliedDecision {
    /// Files to hand to the worker pool.
    pub readmit: Vec<PathBuf>,
    /// Files to mark Skipped, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    pub deleted: Vec<PathBuf>,
    pub aborted: bool,
}

pub struct BatchDecisionManager {
    interactive: bool,
    timeout: Duration,
    input: Box<dyn DecisionInput>,
    corrupted: Vec<CorruptedFile>,
    low_quality: Vec<LowQualityFile>,
    history: Vec<DecisionRecord>,
    stats: DecisionStats,
}

impl BatchDecisionManager {
    pub fn new(config: &BatchConfig) -> Self {
        Self::with_input(config, Box::new(StdinInput))
    }

    pub fn with_input(config: &BatchConfig, input: Box<dyn DecisionInput>) -> Self {
        Self {
            interactive: config.interactive,
            timeout: config.decision_timeout(),
            input,
            corrupted: Vec::new(),
            low_quality: Vec::new(),
            history: Vec::new(),
            stats: DecisionStats::default(),
        }
    }

    pub fn add_corrupted(&mut self, file: CorruptedFile) {
        self.corrupted.push(file);
    }

    pub fn add_low_quality(&mut self, file: LowQualityFile) {
        self.low_quality.push(file);
    }

    pub fn corrupted(&self) -> &[CorruptedFile] {
        &self.corrupted
    }

    pub fn low_quality(&self) -> &[LowQualityFile] {
        &self.low_quality
    }

    pub fn flagged_count(&self) -> usize {
        self.corrupted.len() + self.low_quality.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flagged_count() == 0
    }

    fn summary(&self) -> String {
        let recoverable = self.corrupted.iter().filter(|c| c.recoverable).count();
        let mut out = format!(
            "\n{} corrupted ({} recoverable) and {} low-quality files found.\n",
            self.corrupted.len(),
            recoverable,
            self.low_quality.len()
        );
        for file in self.corrupted.iter().take(10) {
            out.push_str(&format!("  [{}] {}: {}\n", file.kind, file.path.display(), file.reason));
        }
        for file in self.low_quality.iter().take(10) {
            out.push_str(&format!("  [low {:.2}] {}\n", file.score, file.path.display()));
        }
        out.push_str(&format!(
            "[1] repair  [2] delete  [3] abort  [4] ignore (default in {}s): ",
            self.timeout.as_secs()
        ));
        out
    }

    /// Ask once for all flagged files.
    pub async fn resolve(&mut self, cancel: &CancellationToken) -> DecisionRecord {
        let answer = if !self.interactive {
            None
        } else {
            let summary = self.summary();
            let timeout = self.timeout;
            let input = &mut self.input;
            tokio::select! {
                _ = cancel.cancelled() => None,
                reply = tokio::time::timeout(timeout, input.prompt(&summary)) => match reply {
                    Ok(line) => line,
                    Err(_) => {
                        info!(timeout_secs = timeout.as_secs(), "no decision before timeout");
                        None
                    }
                },
            }
        };

        let parsed = answer.as_deref().and_then(|line| {
            let parsed = parse_decision(line);
            if parsed.is_none() {
                warn!(input = line, "unrecognised decision input");
            }
            parsed
        });
        let defaulted = parsed.is_none();
        let outcome = parsed.unwrap_or(DecisionOutcome::Ignore);

        let record = DecisionRecord {
            id: Uuid::new_v4().to_string(),
            outcome,
            defaulted,
            corrupted_count: self.corrupted.len(),
            low_quality_count: self.low_quality.len(),
            decided_at: Utc::now(),
        };
        self.stats.total_decisions += 1;
        if defaulted {
            self.stats.defaulted += 1;
        }
        self.stats.files_decided += self.flagged_count();
        *self.stats.by_outcome.entry(outcome.to_string()).or_default() += 1;
        self.history.push(record.clone());

        info!(
            id = %record.id,
            outcome = %outcome,
            defaulted,
            corrupted = record.corrupted_count,
            low_quality = record.low_quality_count,
            "batch decision made"
        );
        record
    }

    /// Carry out `outcome` on the flagged files and clear them.
    pub fn apply_outcome(&mut self, outcome: DecisionOutcome) -> AppliedDecision {
        let corrupted = std::mem::take(&mut self.corrupted);
        let low_quality = std::mem::take(&mut self.low_quality);
        let mut applied = AppliedDecision::default();

        match outcome {
            DecisionOutcome::Abort => {
                applied.aborted = true;
            }
            DecisionOutcome::Ignore => {
                for file in corrupted {
                    applied.skipped.push((file.path, format!("corrupted: {}", file.reason)));
                }
                for file in low_quality {
                    applied.skipped.push((file.path, "low quality".to_string()));
                }
            }
            DecisionOutcome::Repair => {
                for file in corrupted {
                    if file.recoverable {
                        applied.readmit.push(file.path);
                    } else {
                        applied
                            .skipped
                            .push((file.path, format!("unrecoverable: {}", file.reason)));
                    }
                }
                applied.readmit.extend(low_quality.into_iter().map(|f| f.path));
            }
            DecisionOutcome::DeleteAll => {
                let paths = corrupted
                    .into_iter()
                    .map(|f| f.path)
                    .chain(low_quality.into_iter().map(|f| f.path));
                for path in paths {
                    match fs::remove_file(&path) {
                        Ok(()) => {
                            applied.skipped.push((path.clone(), "deleted".to_string()));
                            applied.deleted.push(path);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to delete flagged file");
                            applied.skipped.push((path, format!("delete failed: {}", e)));
                        }
                    }
                }
            }
        }
        applied
    }

    pub fn history(&self) -> &[DecisionRecord] {
        &self.history
    }

    pub fn stats(&self) -> &DecisionStats {
        &self.stats
    }
}
