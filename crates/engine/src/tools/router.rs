//! Version routing for the encoder suite.
//!
//! The router discovers every installed copy of each tool, keeps a health
//! score per copy, and hands each invocation to the best candidate, falling
//! back down the ranking when a candidate fails.

use super::{
    BinaryTool, ExternalTool, ToolError, ToolKind, ToolOutput, ToolVersion, VersionKind,
    VersionStatus,
};
use crate::config::RouterConfig;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FAILURE_PENALTY: u32 = 10;
const SUCCESS_RECOVERY: u32 = 5;
const MAX_HEALTH: u32 = 100;

/// Why a routed tool call produced no output.
#[derive(Debug, Error)]
pub enum RouterError {
    /// No selectable version reads `input` and writes `output`.
    #[error("no suitable {tool} version for {input} -> {output}")]
    NoSuitableVersion {
        tool: ToolKind,
        input: String,
        output: String,
    },

    /// Every candidate failed; carries the last version's error.
    #[error("{version} failed: {source}")]
    Tool {
        version: String,
        #[source]
        source: ToolError,
    },
}

impl RouterError {
    /// True when the call stopped because the run was cancelled, not because
    /// the tool failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RouterError::Tool {
                source: ToolError::Cancelled,
                ..
            }
        )
    }
}

/// Counters over every `execute_command` call since the router was built.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Requests where no version produced output.
    pub failed_requests: u64,
    /// Times a request moved past its first-choice version.
    pub fallbacks: u64,
    /// Invocations per version id, fallbacks included.
    pub version_usage: BTreeMap<String, u64>,
}

struct Entry {
    info: ToolVersion,
    tool: Arc<dyn ExternalTool>,
    consecutive_failures: u32,
}

/// Registry of discovered encoder versions.
///
/// Picks the best healthy version for each call, falls back down the
/// ranking when one fails and takes versions out of rotation after
/// `max_failure_count` consecutive failures.
pub struct ToolRouter {
    config: RouterConfig,
    entries: RwLock<Vec<Entry>>,
    stats: Mutex<RouterStats>,
}

/// Paths to try for `tool`, in discovery order, without duplicates.
fn candidate_paths(config: &RouterConfig, tool: ToolKind) -> Vec<(VersionKind, PathBuf)> {
    let file_name = tool.file_name();
    let os = std::env::consts::OS;
    let mut found = Vec::new();

    for dir in &config.search_paths {
        let path = dir.join(&file_name);
        if path.is_file() {
            found.push((VersionKind::System, path));
        }
    }
    if let Ok(path) = which::which(tool.binary()) {
        found.push((VersionKind::System, path));
    }
    if let Some(base) = &config.embedded_base {
        let embedded = base.join(os).join(&file_name);
        if embedded.is_file() {
            found.push((VersionKind::Embedded, embedded));
        }
        let dev = base.join("dev").join(os).join(&file_name);
        if dev.is_file() {
            found.push((VersionKind::Development, dev));
        }
    }

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|(_, path)| seen.insert(path.canonicalize().unwrap_or_else(|_| path.clone())))
        .collect()
}

impl ToolRouter {
    /// Router with no versions registered.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(Vec::new()),
            stats: Mutex::new(RouterStats::default()),
        }
    }

    /// Build a router from every tool found on this host.
    pub async fn discover(config: RouterConfig) -> Self {
        let router = Self::new(config);
        for tool in ToolKind::ALL {
            for (kind, path) in candidate_paths(&router.config, tool) {
                let handle = Arc::new(BinaryTool::new(
                    tool,
                    path.clone(),
                    router.config.probe_timeout(),
                ));
                router.register(tool, kind, path, handle).await;
            }
        }
        info!(versions = router.versions().len(), "tool discovery finished");
        router
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Probe `handle` and add it to the registry.
    ///
    /// A failed probe still registers the version, as Unavailable, so a later
    /// health check can bring it back.
    pub async fn register(
        &self,
        tool: ToolKind,
        kind: VersionKind,
        path: PathBuf,
        handle: Arc<dyn ExternalTool>,
    ) -> ToolVersion {
        let (status, version_string, supported_formats) = match handle.probe().await {
            Ok(caps) => (VersionStatus::Available, caps.version, caps.formats),
            Err(e) => {
                warn!(%tool, path = %path.display(), error = %e, "probe failed");
                (VersionStatus::Unavailable, String::new(), BTreeSet::new())
            }
        };

        let mut entries = self.write();
        let ordinal = entries
            .iter()
            .filter(|e| e.info.tool == tool && e.info.kind == kind)
            .count();
        let info = ToolVersion {
            id: format!("{}-{}-{}", tool.binary(), kind, ordinal),
            tool,
            path,
            version_string,
            kind,
            status,
            health_score: MAX_HEALTH,
            supported_formats,
            success_count: 0,
            failure_count: 0,
            last_checked: Utc::now(),
        };
        debug!(id = %info.id, version = %info.version_string, status = %info.status, "registered tool version");
        entries.push(Entry {
            info: info.clone(),
            tool: handle,
            consecutive_failures: 0,
        });
        info
    }

    /// Snapshot of every registered version, whatever its status.
    pub fn versions(&self) -> Vec<ToolVersion> {
        self.read().iter().map(|e| e.info.clone()).collect()
    }

    /// Whether any selectable version of `tool` exists.
    pub fn has_tool(&self, tool: ToolKind) -> bool {
        self.read()
            .iter()
            .any(|e| e.info.tool == tool && e.info.is_selectable())
    }

    fn ranked(
        &self,
        tool: ToolKind,
        input_format: &str,
        output_format: &str,
    ) -> Vec<(String, Arc<dyn ExternalTool>)> {
        let entries = self.read();
        let mut candidates: Vec<&Entry> = entries
            .iter()
            .filter(|e| {
                e.info.tool == tool
                    && e.info.is_selectable()
                    && e.info.supports(input_format, output_format)
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.info
                .kind
                .cmp(&b.info.kind)
                .then_with(|| b.info.health_score.cmp(&a.info.health_score))
        });
        candidates
            .into_iter()
            .map(|e| (e.info.id.clone(), Arc::clone(&e.tool)))
            .collect()
    }

    /// Best version of `tool` able to read `input_format` and write `output_format`.
    ///
    /// System builds rank ahead of embedded, then development; ties go to the
    /// higher health score.
    ///
    /// # Returns
    ///
    /// A copy of the chosen version, or [`RouterError::NoSuitableVersion`].
    pub fn get_best_version(
        &self,
        tool: ToolKind,
        input_format: &str,
        output_format: &str,
    ) -> Result<ToolVersion, RouterError> {
        let best = self
            .ranked(tool, input_format, output_format)
            .into_iter()
            .next()
            .and_then(|(id, _)| self.read().iter().find(|e| e.info.id == id).map(|e| e.info.clone()));
        best.ok_or_else(|| RouterError::NoSuitableVersion {
            tool,
            input: input_format.to_string(),
            output: output_format.to_string(),
        })
    }

    /// Run `tool` on the best version, falling back down the ranking on failure.
    ///
    /// # Arguments
    ///
    /// * `tool` - Encoder family to run
    /// * `input_format` / `output_format` - Formats the chosen version must support
    /// * `args` - Command line passed unchanged to each attempt
    /// * `timeout` - Per-attempt limit
    /// * `cancel` - Stops the current attempt; no further versions are tried
    ///
    /// # Returns
    ///
    /// The first successful output. On failure, the error from the last version
    /// tried, or `NoSuitableVersion` when nothing matched.
    pub async fn execute_command(
        &self,
        tool: ToolKind,
        input_format: &str,
        output_format: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, RouterError> {
        let candidates = self.ranked(tool, input_format, output_format);
        self.with_stats(|s| s.total_requests += 1);
        if candidates.is_empty() {
            self.with_stats(|s| s.failed_requests += 1);
            return Err(RouterError::NoSuitableVersion {
                tool,
                input: input_format.to_string(),
                output: output_format.to_string(),
            });
        }

        let mut last_error = None;
        for (attempt, (id, handle)) in candidates.into_iter().enumerate() {
            if attempt > 0 {
                self.with_stats(|s| s.fallbacks += 1);
                info!(%tool, version = %id, "falling back to next tool version");
            }
            self.with_stats(|s| *s.version_usage.entry(id.clone()).or_default() += 1);

            match handle.invoke(args, timeout, cancel).await {
                Ok(output) => {
                    self.record_success(&id);
                    self.with_stats(|s| s.successful_requests += 1);
                    return Ok(output);
                }
                Err(ToolError::Cancelled) => {
                    self.with_stats(|s| s.failed_requests += 1);
                    return Err(RouterError::Tool {
                        version: id,
                        source: ToolError::Cancelled,
                    });
                }
                Err(e) => {
                    warn!(%tool, version = %id, error = %e, "tool invocation failed");
                    self.record_failure(&id);
                    last_error = Some(RouterError::Tool {
                        version: id,
                        source: e,
                    });
                }
            }
        }

        self.with_stats(|s| s.failed_requests += 1);
        Err(last_error.unwrap_or(RouterError::NoSuitableVersion {
            tool,
            input: input_format.to_string(),
            output: output_format.to_string(),
        }))
    }

    fn with_stats(&self, update: impl FnOnce(&mut RouterStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut stats);
    }

    /// Reset the failure streak of `id` and recover some of its health.
    pub fn record_success(&self, id: &str) {
        let mut entries = self.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.info.id == id) {
            entry.consecutive_failures = 0;
            entry.info.success_count += 1;
            entry.info.health_score = (entry.info.health_score + SUCCESS_RECOVERY).min(MAX_HEALTH);
            entry.info.status = VersionStatus::Available;
        }
    }

    /// Penalise `id`; it becomes Unavailable once the streak reaches
    /// `max_failure_count`, Degraded before that.
    pub fn record_failure(&self, id: &str) {
        let max_failures = self.config.max_failure_count.max(1);
        let mut entries = self.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.info.id == id) {
            entry.consecutive_failures += 1;
            entry.info.failure_count += 1;
            entry.info.health_score = entry.info.health_score.saturating_sub(FAILURE_PENALTY);
            entry.info.status = if entry.consecutive_failures >= max_failures {
                warn!(version = %id, failures = entry.consecutive_failures, "tool version taken out of rotation");
                VersionStatus::Unavailable
            } else {
                VersionStatus::Degraded
            };
        }
    }

    /// Re-probe Unavailable versions and restore the ones that answer.
    ///
    /// Returns how many versions were restored.
    pub async fn health_check(&self) -> usize {
        let targets: Vec<(String, Arc<dyn ExternalTool>)> = self
            .read()
            .iter()
            .filter(|e| e.info.status == VersionStatus::Unavailable)
            .map(|e| (e.info.id.clone(), Arc::clone(&e.tool)))
            .collect();

        let mut restored = 0;
        for (id, handle) in targets {
            let probe = handle.probe().await;
            let mut entries = self.write();
            let Some(entry) = entries.iter_mut().find(|e| e.info.id == id) else {
                continue;
            };
            entry.info.last_checked = Utc::now();
            match probe {
                Ok(caps) => {
                    entry.info.status = VersionStatus::Available;
                    entry.info.version_string = caps.version;
                    entry.info.supported_formats = caps.formats;
                    entry.consecutive_failures = 0;
                    restored += 1;
                    info!(version = %id, "tool version restored");
                }
                Err(e) => debug!(version = %id, error = %e, "tool version still unavailable"),
            }
        }
        restored
    }

    /// Run [`health_check`](Self::health_check) on the configured interval until cancelled.
    pub async fn run_health_checks(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval());
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.health_check().await;
                }
            }
        }
    }

    /// Copy of the request counters.
    pub fn stats(&self) -> RouterStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}
