//! Adaptive worker-count control.
//!
//! The optimizer turns telemetry snapshots into a permitted worker count.
//! The count itself is an atomic so the engine can read it on every
//! admission without locking; adjustments and their audit trail sit behind
//! a mutex.

use crate::config::OptimizerConfig;
use crate::telemetry::PerformanceSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Direction of a worker-count change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentAction {
    Increase,
    Decrease,
    Maintain,
}

impl fmt::Display for AdjustmentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdjustmentAction::Increase => "increase",
            AdjustmentAction::Decrease => "decrease",
            AdjustmentAction::Maintain => "maintain",
        })
    }
}

/// One applied change to the worker count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAdjustment {
    pub timestamp: DateTime<Utc>,
    pub action: AdjustmentAction,
    /// `memory_pressure`, `cpu_pressure`, `disk_pressure`,
    /// `resources_available` or `manual_override`.
    pub reason: String,
    pub old_workers: usize,
    pub new_workers: usize,
    /// The snapshot that triggered the change; `None` for manual overrides.
    pub snapshot: Option<PerformanceSnapshot>,
}

/// Counters over the applied adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OptimizerStats {
    pub increases: u64,
    pub decreases: u64,
    pub total_adjustments: u64,
}

/// Proposed worker count for a snapshot, not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub action: AdjustmentAction,
    pub workers: usize,
    pub reason: &'static str,
}

struct OptimizerState {
    last_adjustment: Option<Instant>,
    history: Vec<WorkerAdjustment>,
    stats: OptimizerStats,
}

/// Owns the permitted worker count for one engine.
///
/// Created once per engine and shared with the telemetry loop through an
/// `Arc`; there is no process-wide counter.
pub struct ConcurrencyOptimizer {
    config: OptimizerConfig,
    min_workers: usize,
    max_workers: usize,
    current: AtomicUsize,
    state: Mutex<OptimizerState>,
}

/// Resolve the configured ceiling; 0 means one worker per logical CPU.
fn effective_max(config: &OptimizerConfig) -> usize {
    let max = if config.max_workers == 0 {
        num_cpus::get()
    } else {
        config.max_workers
    };
    max.max(config.min_workers.max(1))
}

impl ConcurrencyOptimizer {
    /// Creates an optimizer starting at `initial_workers`.
    ///
    /// # Arguments
    ///
    /// * `config` - Thresholds, bounds, factor and cooldown. A `max_workers`
    ///   of 0 resolves to the logical CPU count; the initial count is
    ///   clamped into the resolved bounds.
    pub fn new(config: OptimizerConfig) -> Self {
        let min_workers = config.min_workers.max(1);
        let max_workers = effective_max(&config);
        let initial = config.initial_workers.clamp(min_workers, max_workers);
        Self {
            config,
            min_workers,
            max_workers,
            current: AtomicUsize::new(initial),
            state: Mutex::new(OptimizerState {
                last_adjustment: None,
                history: Vec::new(),
                stats: OptimizerStats::default(),
            }),
        }
    }

    /// Permitted worker count. Lock-free; read on every admission.
    pub fn current_workers(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Resolved `(min, max)` worker bounds.
    pub fn bounds(&self) -> (usize, usize) {
        (self.min_workers, self.max_workers)
    }

    /// Whether any pressure rule fires for `snapshot`.
    pub fn should_throttle(&self, snapshot: &PerformanceSnapshot) -> bool {
        self.pressure_reason(snapshot).is_some()
    }

    /// First pressure rule that fires, in priority order memory, cpu, disk.
    fn pressure_reason(&self, snapshot: &PerformanceSnapshot) -> Option<&'static str> {
        if snapshot.memory_usage > self.config.memory_threshold {
            Some("memory_pressure")
        } else if snapshot.cpu_usage > self.config.cpu_threshold {
            Some("cpu_pressure")
        } else if snapshot.disk_usage > self.config.disk_threshold {
            Some("disk_pressure")
        } else {
            None
        }
    }

    fn recommend_from(&self, current: usize, snapshot: &PerformanceSnapshot) -> Recommendation {
        let factor = self.config.adjustment_factor;
        if let Some(reason) = self.pressure_reason(snapshot) {
            let workers = ((current as f64 / factor).floor() as usize).max(self.min_workers);
            return Recommendation {
                action: AdjustmentAction::Decrease,
                workers,
                reason,
            };
        }
        if snapshot.memory_usage < self.config.relief_memory_threshold
            && snapshot.cpu_usage < self.config.relief_cpu_threshold
            && current < self.max_workers
        {
            let workers = ((current as f64 * factor).floor() as usize).min(self.max_workers);
            return Recommendation {
                action: AdjustmentAction::Increase,
                workers,
                reason: "resources_available",
            };
        }
        Recommendation {
            action: AdjustmentAction::Maintain,
            workers: current,
            reason: "stable",
        }
    }

    /// Worker count the rules would pick for `snapshot`, without applying it.
    pub fn recommended_workers(&self, snapshot: &PerformanceSnapshot) -> usize {
        self.recommend_from(self.current_workers(), snapshot).workers
    }

    /// Feed a snapshot observed now.
    pub fn observe(&self, snapshot: &PerformanceSnapshot) -> Option<WorkerAdjustment> {
        self.evaluate(snapshot, Instant::now())
    }

    /// Applies the rules to `snapshot` as of `now`.
    ///
    /// # Arguments
    ///
    /// * `snapshot` - Latest telemetry reading
    /// * `now` - Time of the reading, compared against the cooldown
    ///
    /// # Returns
    ///
    /// * `Some(WorkerAdjustment)` when the count changed
    /// * `None` when the candidate equals the current count or the cooldown
    ///   has not passed; nothing is recorded in that case
    pub fn evaluate(&self, snapshot: &PerformanceSnapshot, now: Instant) -> Option<WorkerAdjustment> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = self.current_workers();
        let rec = self.recommend_from(current, snapshot);
        if rec.workers == current {
            return None;
        }
        if let Some(last) = state.last_adjustment {
            if now.saturating_duration_since(last) < self.config.cooldown() {
                debug!(
                    candidate = rec.workers,
                    current, "adjustment dropped during cooldown"
                );
                return None;
            }
        }

        self.current.store(rec.workers, Ordering::Release);
        let adjustment = WorkerAdjustment {
            timestamp: Utc::now(),
            action: rec.action,
            reason: rec.reason.to_string(),
            old_workers: current,
            new_workers: rec.workers,
            snapshot: Some(snapshot.clone()),
        };
        Self::record(&mut state, adjustment.clone(), now);
        info!(
            action = %adjustment.action,
            reason = %adjustment.reason,
            old = adjustment.old_workers,
            new = adjustment.new_workers,
            "worker count adjusted"
        );
        Some(adjustment)
    }

    /// Manual override, clamped to the bounds and recorded.
    ///
    /// Ignores the cooldown but starts a new one. Returns the count in effect.
    pub fn set_workers(&self, n: usize) -> usize {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let target = n.clamp(self.min_workers, self.max_workers);
        let old = self.current.swap(target, Ordering::AcqRel);
        if old != target {
            let action = if target > old {
                AdjustmentAction::Increase
            } else {
                AdjustmentAction::Decrease
            };
            Self::record(
                &mut state,
                WorkerAdjustment {
                    timestamp: Utc::now(),
                    action,
                    reason: "manual_override".to_string(),
                    old_workers: old,
                    new_workers: target,
                    snapshot: None,
                },
                Instant::now(),
            );
        }
        target
    }

    fn record(state: &mut OptimizerState, adjustment: WorkerAdjustment, now: Instant) {
        match adjustment.action {
            AdjustmentAction::Increase => state.stats.increases += 1,
            AdjustmentAction::Decrease => state.stats.decreases += 1,
            AdjustmentAction::Maintain => {}
        }
        state.stats.total_adjustments += 1;
        state.last_adjustment = Some(now);
        state.history.push(adjustment);
    }

    /// Applied adjustments, oldest first.
    pub fn adjustment_history(&self) -> Vec<WorkerAdjustment> {
        self.state
            .lock()
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> OptimizerStats {
        self.state.lock().map(|s| s.stats).unwrap_or_default()
    }

    pub fn cooldown(&self) -> Duration {
        self.config.cooldown()
    }

    /// Evaluate every snapshot published on `snapshots` until cancelled.
    pub async fn run(
        &self,
        mut snapshots: watch::Receiver<Option<PerformanceSnapshot>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    if let Some(snapshot) = snapshot {
                        self.observe(&snapshot);
                    }
                }
            }
        }
        debug!("optimizer loop stopped");
    }
}
