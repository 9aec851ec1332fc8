//! Telemetry collection for the adaptive worker pool.
//!
//! A collector samples host resource usage through a [`TelemetrySource`]
//! (sysinfo in production), adds runtime counters, and publishes immutable
//! [`PerformanceSnapshot`]s on a watch channel for the optimizer.

use crate::config::TelemetryConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One point-in-time reading. Usage values are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub disk_read_bytes_per_sec: f64,
    pub disk_write_bytes_per_sec: f64,
    /// Live tasks on the async runtime.
    pub task_count: usize,
    /// Mean lateness of the sampling tick.
    pub pause_avg: Duration,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceSnapshot {
    /// Snapshot with only the usage fractions set.
    pub fn with_usage(cpu_usage: f64, memory_usage: f64, disk_usage: f64) -> Self {
        Self {
            cpu_usage,
            memory_usage,
            disk_usage,
            disk_read_bytes_per_sec: 0.0,
            disk_write_bytes_per_sec: 0.0,
            task_count: 0,
            pause_avg: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }
}

/// Cumulative disk byte counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub written_bytes: u64,
}

/// Raw host readings. `None` means the read failed this time.
pub trait TelemetrySource: Send {
    fn cpu_usage(&mut self) -> Option<f64>;
    fn memory_usage(&mut self) -> Option<f64>;
    fn disk_usage(&mut self) -> Option<f64>;
    fn io_counters(&mut self) -> Option<IoCounters>;
}

/// [`TelemetrySource`] backed by `sysinfo`.
///
/// Disk usage is reported for the mount that holds `watch_path`; IO counters
/// are this process's cumulative reads and writes.
pub struct SysinfoSource {
    system: sysinfo::System,
    pid: Option<sysinfo::Pid>,
    watch_path: PathBuf,
}

impl SysinfoSource {
    pub fn new(watch_path: impl Into<PathBuf>) -> Self {
        Self {
            system: sysinfo::System::new(),
            pid: sysinfo::get_current_pid().ok(),
            watch_path: watch_path.into(),
        }
    }
}

impl TelemetrySource for SysinfoSource {
    fn cpu_usage(&mut self) -> Option<f64> {
        self.system.refresh_cpu_usage();
        let usage = self.system.global_cpu_usage();
        usage
            .is_finite()
            .then(|| (usage as f64 / 100.0).clamp(0.0, 1.0))
    }

    fn memory_usage(&mut self) -> Option<f64> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        Some((self.system.used_memory() as f64 / total as f64).clamp(0.0, 1.0))
    }

    fn disk_usage(&mut self) -> Option<f64> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.watch_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(disk.available_space());
        Some((used as f64 / total as f64).clamp(0.0, 1.0))
    }

    fn io_counters(&mut self) -> Option<IoCounters> {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate};

        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_disk_usage(),
        );
        let usage = self.system.process(pid)?.disk_usage();
        Some(IoCounters {
            read_bytes: usage.total_read_bytes,
            written_bytes: usage.total_written_bytes,
        })
    }
}

/// Running aggregates over every sample taken.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub samples: u64,
    pub cpu_peak: f64,
    pub cpu_mean: f64,
    pub memory_peak: f64,
    pub memory_mean: f64,
}

impl TelemetryStats {
    fn record(&mut self, cpu: f64, memory: f64) {
        self.samples += 1;
        let n = self.samples as f64;
        self.cpu_peak = self.cpu_peak.max(cpu);
        self.memory_peak = self.memory_peak.max(memory);
        self.cpu_mean += (cpu - self.cpu_mean) / n;
        self.memory_mean += (memory - self.memory_mean) / n;
    }
}

struct CollectorState {
    last: Option<PerformanceSnapshot>,
    last_io: Option<(IoCounters, Instant)>,
    history: VecDeque<PerformanceSnapshot>,
    stats: TelemetryStats,
    lateness_total: Duration,
    ticks: u32,
}

/// Samples a [`TelemetrySource`] and keeps a bounded history.
pub struct TelemetryCollector {
    source: Mutex<Box<dyn TelemetrySource>>,
    state: Mutex<CollectorState>,
    capacity: usize,
    interval: Duration,
    publisher: watch::Sender<Option<PerformanceSnapshot>>,
}

impl TelemetryCollector {
    pub fn new(source: Box<dyn TelemetrySource>, config: &TelemetryConfig) -> Self {
        let capacity = config.history_size.max(1);
        let (publisher, _) = watch::channel(None);
        Self {
            source: Mutex::new(source),
            state: Mutex::new(CollectorState {
                last: None,
                last_io: None,
                history: VecDeque::with_capacity(capacity),
                stats: TelemetryStats::default(),
                lateness_total: Duration::ZERO,
                ticks: 0,
            }),
            capacity,
            interval: config.sample_interval(),
            publisher,
        }
    }

    /// Collector over the host, watching the disk that holds `path`.
    pub fn for_host(path: &Path, config: &TelemetryConfig) -> Self {
        Self::new(Box::new(SysinfoSource::new(path)), config)
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<PerformanceSnapshot>> {
        self.publisher.subscribe()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take one sample now.
    pub fn sample(&self) -> PerformanceSnapshot {
        self.sample_at(Instant::now())
    }

    fn sample_at(&self, now: Instant) -> PerformanceSnapshot {
        let (cpu, memory, disk, io) = match self.source.lock() {
            Ok(mut source) => (
                source.cpu_usage(),
                source.memory_usage(),
                source.disk_usage(),
                source.io_counters(),
            ),
            Err(_) => (None, None, None, None),
        };
        let task_count = tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks())
            .unwrap_or(0);

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let prior = state.last.clone();
        let keep = |value: Option<f64>, pick: fn(&PerformanceSnapshot) -> f64| {
            value
                .or_else(|| prior.as_ref().map(pick))
                .unwrap_or(0.0)
        };

        let (read_rate, write_rate) = match (io, state.last_io) {
            (Some(current), Some((previous, at))) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    (
                        current.read_bytes.saturating_sub(previous.read_bytes) as f64 / elapsed,
                        current.written_bytes.saturating_sub(previous.written_bytes) as f64
                            / elapsed,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            (Some(_), None) => (0.0, 0.0),
            (None, _) => (
                prior.as_ref().map(|p| p.disk_read_bytes_per_sec).unwrap_or(0.0),
                prior.as_ref().map(|p| p.disk_write_bytes_per_sec).unwrap_or(0.0),
            ),
        };
        if let Some(current) = io {
            state.last_io = Some((current, now));
        }

        let pause_avg = if state.ticks == 0 {
            Duration::ZERO
        } else {
            state.lateness_total / state.ticks
        };

        let snapshot = PerformanceSnapshot {
            cpu_usage: keep(cpu, |p| p.cpu_usage),
            memory_usage: keep(memory, |p| p.memory_usage),
            disk_usage: keep(disk, |p| p.disk_usage),
            disk_read_bytes_per_sec: read_rate,
            disk_write_bytes_per_sec: write_rate,
            task_count,
            pause_avg,
            timestamp: Utc::now(),
        };

        state.stats.record(snapshot.cpu_usage, snapshot.memory_usage);
        if state.history.len() == self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(snapshot.clone());
        state.last = Some(snapshot.clone());
        drop(state);

        trace!(
            cpu = snapshot.cpu_usage,
            memory = snapshot.memory_usage,
            disk = snapshot.disk_usage,
            tasks = snapshot.task_count,
            "telemetry sample"
        );
        self.publisher.send_replace(Some(snapshot.clone()));
        snapshot
    }

    fn record_lateness(&self, lateness: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.lateness_total += lateness;
            state.ticks = state.ticks.saturating_add(1);
        }
    }

    pub fn latest(&self) -> Option<PerformanceSnapshot> {
        self.state.lock().ok().and_then(|s| s.last.clone())
    }

    /// Up to `n` most recent snapshots, oldest first.
    pub fn recent(&self, n: usize) -> Vec<PerformanceSnapshot> {
        match self.state.lock() {
            Ok(state) => {
                let skip = state.history.len().saturating_sub(n);
                state.history.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Mean CPU usage over the last `n` snapshots (0 when empty).
    pub fn average_cpu_over(&self, n: usize) -> f64 {
        let recent = self.recent(n);
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().map(|s| s.cpu_usage).sum::<f64>() / recent.len() as f64
    }

    pub fn stats(&self) -> TelemetryStats {
        self.state.lock().map(|s| s.stats).unwrap_or_default()
    }

    /// Sample every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(interval_ms = self.interval.as_millis() as u64, "telemetry loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                scheduled = ticker.tick() => {
                    let lateness = tokio::time::Instant::now().saturating_duration_since(scheduled);
                    self.record_lateness(lateness);
                    self.sample();
                }
            }
        }
        debug!("telemetry loop stopped");
    }
}
