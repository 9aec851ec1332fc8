//! External encoder suite.
//!
//! Every binary the engine shells out to sits behind [`ExternalTool`]. The
//! [`router::ToolRouter`] owns the discovered versions and picks one per
//! invocation; nothing else in the crate knows a binary path.

pub mod probe;
pub mod router;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use probe::BinaryTool;
pub use router::{RouterError, RouterStats, ToolRouter};

/// The encoder suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// JPEG XL encoder (`cjxl`).
    Jxl,
    /// AVIF still encoder (`avifenc`).
    Avif,
    /// Transcoder and remuxer.
    Ffmpeg,
    /// Metadata copier.
    Exiftool,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Jxl,
        ToolKind::Avif,
        ToolKind::Ffmpeg,
        ToolKind::Exiftool,
    ];

    pub fn binary(&self) -> &'static str {
        match self {
            ToolKind::Jxl => "cjxl",
            ToolKind::Avif => "avifenc",
            ToolKind::Ffmpeg => "ffmpeg",
            ToolKind::Exiftool => "exiftool",
        }
    }

    /// Binary file name on this platform.
    pub fn file_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.binary())
        } else {
            self.binary().to_string()
        }
    }

    /// Argument that prints the supported formats.
    pub fn capability_arg(&self) -> &'static str {
        match self {
            ToolKind::Ffmpeg => "-encoders",
            ToolKind::Exiftool => "-listwf",
            ToolKind::Jxl | ToolKind::Avif => "--help",
        }
    }

    /// Argument that prints the version.
    pub fn version_arg(&self) -> &'static str {
        match self {
            ToolKind::Ffmpeg => "-version",
            ToolKind::Exiftool => "-ver",
            ToolKind::Jxl | ToolKind::Avif => "--version",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Where a version was found. Order is selection priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    System,
    Embedded,
    Development,
}

impl VersionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionKind::System => "system",
            VersionKind::Embedded => "embedded",
            VersionKind::Development => "development",
        }
    }
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Available,
    /// Failed recently but still selectable.
    Degraded,
    /// Out of rotation until a health check restores it.
    Unavailable,
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VersionStatus::Available => "available",
            VersionStatus::Degraded => "degraded",
            VersionStatus::Unavailable => "unavailable",
        })
    }
}

/// Router-side view of one discovered binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub id: String,
    pub tool: ToolKind,
    pub path: PathBuf,
    pub version_string: String,
    pub kind: VersionKind,
    pub status: VersionStatus,
    /// 0-100.
    pub health_score: u32,
    pub supported_formats: BTreeSet<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_checked: DateTime<Utc>,
}

impl ToolVersion {
    pub fn supports(&self, input_format: &str, output_format: &str) -> bool {
        let input = canonical_format(input_format);
        let output = canonical_format(output_format);
        self.supported_formats.contains(input) && self.supported_formats.contains(output)
    }

    pub fn is_selectable(&self) -> bool {
        matches!(
            self.status,
            VersionStatus::Available | VersionStatus::Degraded
        )
    }
}

/// What a probe learned about a binary.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCapabilities {
    pub version: String,
    pub formats: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One external binary.
#[async_trait]
pub trait ExternalTool: Send + Sync {
    /// Query version and supported formats.
    async fn probe(&self) -> Result<ToolCapabilities, ToolError>;

    /// Run with `args`, killing the process on timeout or cancellation.
    async fn invoke(
        &self,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}

/// Normalise an extension or format name to the key used in format sets.
pub fn canonical_format(name: &str) -> &str {
    match name {
        "jpg" | "jpe" | "jfif" => "jpeg",
        "tif" => "tiff",
        "heic" => "heif",
        "m4v" => "mp4",
        other => other,
    }
}
