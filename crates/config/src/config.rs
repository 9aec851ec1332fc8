//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are inconsistent with each other
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Processing profile selecting the conversion policy for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AppMode {
    /// Quality-aware routing: lossless for good sources, lossy for weak ones
    #[default]
    #[serde(rename = "auto+", alias = "auto_plus", alias = "auto")]
    AutoPlus,
    /// Lossless everywhere
    #[serde(rename = "quality")]
    Quality,
    /// Small lossy output for stickers and emoji; video is never touched
    #[serde(rename = "sticker", alias = "emoji")]
    Sticker,
}

impl AppMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMode::AutoPlus => "auto+",
            AppMode::Quality => "quality",
            AppMode::Sticker => "sticker",
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto+" | "auto_plus" | "autoplus" | "auto" => Ok(AppMode::AutoPlus),
            "quality" => Ok(AppMode::Quality),
            "sticker" | "emoji" => Ok(AppMode::Sticker),
            other => Err(ConfigError::Invalid(format!("unknown mode '{}'", other))),
        }
    }
}

/// Telemetry sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// Seconds between samples (default 3)
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Capacity of the rolling snapshot window (default 100)
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_sample_interval_secs() -> u64 {
    3
}

fn default_history_size() -> usize {
    100
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            history_size: default_history_size(),
        }
    }
}

impl TelemetryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

/// Worker pool tuning thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound on workers (0 = number of logical CPUs)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,
    /// Memory usage below which workers may be added
    #[serde(default = "default_relief_memory_threshold")]
    pub relief_memory_threshold: f64,
    /// CPU usage below which workers may be added
    #[serde(default = "default_relief_cpu_threshold")]
    pub relief_cpu_threshold: f64,
    #[serde(default = "default_adjustment_factor")]
    pub adjustment_factor: f64,
    /// Minimum seconds between two applied adjustments
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    16
}

fn default_initial_workers() -> usize {
    8
}

fn default_memory_threshold() -> f64 {
    0.75
}

fn default_cpu_threshold() -> f64 {
    0.80
}

fn default_disk_threshold() -> f64 {
    0.85
}

fn default_relief_memory_threshold() -> f64 {
    0.50
}

fn default_relief_cpu_threshold() -> f64 {
    0.60
}

fn default_adjustment_factor() -> f64 {
    1.2
}

fn default_cooldown_secs() -> u64 {
    10
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            initial_workers: default_initial_workers(),
            memory_threshold: default_memory_threshold(),
            cpu_threshold: default_cpu_threshold(),
            disk_threshold: default_disk_threshold(),
            relief_memory_threshold: default_relief_memory_threshold(),
            relief_cpu_threshold: default_relief_cpu_threshold(),
            adjustment_factor: default_adjustment_factor(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl OptimizerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// External tool discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Directories searched before PATH
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,
    /// Root of bundled binaries (`<base>/<os>/<bin>` and `<base>/dev/<os>/<bin>`)
    #[serde(default)]
    pub embedded_base: Option<PathBuf>,
    /// Consecutive failures before a version is taken out of rotation
    #[serde(default = "default_max_failure_count")]
    pub max_failure_count: u32,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Timeout for version and capability queries
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_search_paths() -> Vec<PathBuf> {
    let dirs: &[&str] = if cfg!(target_os = "macos") {
        &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"]
    } else if cfg!(target_os = "windows") {
        &["C:\\ffmpeg\\bin", "C:\\Program Files\\ffmpeg\\bin"]
    } else {
        &["/usr/bin", "/usr/local/bin", "/snap/bin"]
    };
    dirs.iter().map(PathBuf::from).collect()
}

fn default_max_failure_count() -> u32 {
    3
}

fn default_health_check_interval_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
            embedded_base: None,
            max_failure_count: default_max_failure_count(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl RouterConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

/// Persistent state store location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("pixmill_state.db")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

/// Conversion pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: AppMode,
    /// Extra attempts after a failed conversion (default 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_image_timeout_secs")]
    pub image_timeout_secs: u64,
    #[serde(default = "default_animated_timeout_secs")]
    pub animated_timeout_secs: u64,
    #[serde(default = "default_video_timeout_secs")]
    pub video_timeout_secs: u64,
    /// Keep `.bak` copies of replaced originals
    #[serde(default)]
    pub keep_backups: bool,
    /// Where backups go (next to the source when unset)
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Copy tags from the source with the metadata tool
    #[serde(default = "default_copy_metadata")]
    pub copy_metadata: bool,
}

fn default_max_retries() -> u32 {
    2
}

fn default_image_timeout_secs() -> u64 {
    30
}

fn default_animated_timeout_secs() -> u64 {
    60
}

fn default_video_timeout_secs() -> u64 {
    90
}

fn default_copy_metadata() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: AppMode::default(),
            max_retries: default_max_retries(),
            image_timeout_secs: default_image_timeout_secs(),
            animated_timeout_secs: default_animated_timeout_secs(),
            video_timeout_secs: default_video_timeout_secs(),
            keep_backups: false,
            backup_dir: None,
            copy_metadata: default_copy_metadata(),
        }
    }
}

/// Batch decision prompt settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Ask on stdin; otherwise the default outcome is taken immediately
    #[serde(default)]
    pub interactive: bool,
    #[serde(default = "default_decision_timeout_secs")]
    pub decision_timeout_secs: u64,
}

fn default_decision_timeout_secs() -> u64 {
    10
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interactive: false,
            decision_timeout_secs: default_decision_timeout_secs(),
        }
    }
}

impl BatchConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match env::var(key).ok()?.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Recognised variables:
    /// - PIXMILL_MODE -> engine.mode
    /// - PIXMILL_MIN_WORKERS / PIXMILL_MAX_WORKERS / PIXMILL_INITIAL_WORKERS -> optimizer bounds
    /// - PIXMILL_COOLDOWN_SECS -> optimizer.cooldown_secs
    /// - PIXMILL_SAMPLE_INTERVAL_SECS -> telemetry.sample_interval_secs
    /// - PIXMILL_STATE_PATH -> state.path
    /// - PIXMILL_MAX_RETRIES -> engine.max_retries
    /// - PIXMILL_KEEP_BACKUPS -> engine.keep_backups
    /// - PIXMILL_EMBEDDED_TOOLS_DIR -> router.embedded_base
    /// - PIXMILL_INTERACTIVE -> batch.interactive
    /// - PIXMILL_DECISION_TIMEOUT_SECS -> batch.decision_timeout_secs
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(mode) = env_parse::<AppMode>("PIXMILL_MODE") {
            self.engine.mode = mode;
        }
        if let Some(n) = env_parse("PIXMILL_MIN_WORKERS") {
            self.optimizer.min_workers = n;
        }
        if let Some(n) = env_parse("PIXMILL_MAX_WORKERS") {
            self.optimizer.max_workers = n;
        }
        if let Some(n) = env_parse("PIXMILL_INITIAL_WORKERS") {
            self.optimizer.initial_workers = n;
        }
        if let Some(secs) = env_parse("PIXMILL_COOLDOWN_SECS") {
            self.optimizer.cooldown_secs = secs;
        }
        if let Some(secs) = env_parse("PIXMILL_SAMPLE_INTERVAL_SECS") {
            self.telemetry.sample_interval_secs = secs;
        }
        if let Ok(path) = env::var("PIXMILL_STATE_PATH") {
            if !path.trim().is_empty() {
                self.state.path = PathBuf::from(path);
            }
        }
        if let Some(n) = env_parse("PIXMILL_MAX_RETRIES") {
            self.engine.max_retries = n;
        }
        if let Some(keep) = env_bool("PIXMILL_KEEP_BACKUPS") {
            self.engine.keep_backups = keep;
        }
        if let Ok(dir) = env::var("PIXMILL_EMBEDDED_TOOLS_DIR") {
            if !dir.trim().is_empty() {
                self.router.embedded_base = Some(PathBuf::from(dir));
            }
        }
        if let Some(interactive) = env_bool("PIXMILL_INTERACTIVE") {
            self.batch.interactive = interactive;
        }
        if let Some(secs) = env_parse("PIXMILL_DECISION_TIMEOUT_SECS") {
            self.batch.decision_timeout_secs = secs;
        }
    }

    /// Check that the parsed values are usable together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let opt = &self.optimizer;
        if opt.min_workers == 0 {
            return Err(ConfigError::Invalid("optimizer.min_workers must be at least 1".into()));
        }
        if opt.max_workers != 0 && opt.min_workers > opt.max_workers {
            return Err(ConfigError::Invalid(format!(
                "optimizer.min_workers ({}) exceeds optimizer.max_workers ({})",
                opt.min_workers, opt.max_workers
            )));
        }
        if !(opt.adjustment_factor > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "optimizer.adjustment_factor must be greater than 1.0, got {}",
                opt.adjustment_factor
            )));
        }
        let thresholds = [
            ("memory_threshold", opt.memory_threshold),
            ("cpu_threshold", opt.cpu_threshold),
            ("disk_threshold", opt.disk_threshold),
            ("relief_memory_threshold", opt.relief_memory_threshold),
            ("relief_cpu_threshold", opt.relief_cpu_threshold),
        ];
        for (name, value) in thresholds {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "optimizer.{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.telemetry.history_size == 0 {
            return Err(ConfigError::Invalid("telemetry.history_size must be at least 1".into()));
        }
        if self.router.max_failure_count == 0 {
            return Err(ConfigError::Invalid("router.max_failure_count must be at least 1".into()));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields defaults plus env overrides
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
