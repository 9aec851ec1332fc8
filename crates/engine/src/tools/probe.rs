//! Process-backed [`ExternalTool`] and capability parsing.

use super::{ExternalTool, ToolCapabilities, ToolError, ToolKind, ToolOutput};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Formats ffmpeg can always read and mux without a special encoder.
const FFMPEG_BASE_FORMATS: &[&str] = &[
    "jpeg", "png", "apng", "gif", "webp", "bmp", "tiff", "heif", "mov", "mp4", "webm", "mkv",
    "avi",
];

const CJXL_FORMATS: &[&str] = &["jpeg", "png", "apng", "gif", "ppm", "pgm", "pfm", "exr", "jxl"];

const AVIFENC_FORMATS: &[&str] = &["jpeg", "png", "y4m", "avif"];

const EXIFTOOL_FORMATS: &[&str] = &[
    "jpeg", "png", "gif", "webp", "tiff", "heif", "jxl", "avif", "mov", "mp4",
];

/// Extract a version string from a tool's version output.
///
/// Takes the first token on the first non-empty line that starts with a
/// digit once a leading `v` or `n` is stripped. Handles `ffmpeg version
/// n8.0-12-gabc`, `cjxl v0.10.2 [AVX2]`, `Version: 1.0.4 (dav1d ...)` and a
/// bare `12.76`.
pub fn parse_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    line.split_whitespace().find_map(|token| {
        let stripped = token
            .trim_start_matches(|c| c == 'v' || c == 'n' || c == 'V')
            .trim_end_matches(|c: char| c == ',' || c == ')' || c == ';');
        stripped
            .chars()
            .next()
            .filter(|c| c.is_ascii_digit())
            .map(|_| stripped.to_string())
    })
}

/// Output formats implied by ffmpeg's `-encoders` listing.
pub fn formats_from_encoders(listing: &str) -> BTreeSet<String> {
    let mut formats: BTreeSet<String> = FFMPEG_BASE_FORMATS.iter().map(|s| s.to_string()).collect();
    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        let (Some(flags), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        // capability column is six flag characters, e.g. "V....D"
        if flags.len() != 6 || !flags.starts_with('V') {
            continue;
        }
        match name {
            "libjxl" => {
                formats.insert("jxl".to_string());
            }
            "libaom-av1" | "libsvtav1" | "librav1e" => {
                formats.insert("avif".to_string());
            }
            _ => {}
        }
    }
    formats
}

/// Known capabilities per tool, used when its listing names none of them.
pub fn static_formats(kind: ToolKind) -> BTreeSet<String> {
    vocabulary(kind).iter().map(|s| s.to_string()).collect()
}

fn vocabulary(kind: ToolKind) -> &'static [&'static str] {
    match kind {
        ToolKind::Jxl => CJXL_FORMATS,
        ToolKind::Avif => AVIFENC_FORMATS,
        ToolKind::Exiftool => EXIFTOOL_FORMATS,
        ToolKind::Ffmpeg => FFMPEG_BASE_FORMATS,
    }
}

/// The format a tool always produces, if it is an encoder.
fn native_output(kind: ToolKind) -> Option<&'static str> {
    match kind {
        ToolKind::Jxl => Some("jxl"),
        ToolKind::Avif => Some("avif"),
        ToolKind::Ffmpeg | ToolKind::Exiftool => None,
    }
}

/// Map a listing token such as `JPG`, `Tif` or `HEIC` to a format name.
fn normalize_format(token: &str) -> Option<&'static str> {
    let name = match token.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "jpeg",
        "tif" | "tiff" => "tiff",
        "heic" | "heif" => "heif",
        "png" => "png",
        "apng" => "apng",
        "gif" => "gif",
        "webp" => "webp",
        "ppm" => "ppm",
        "pgm" => "pgm",
        "pfm" => "pfm",
        "exr" => "exr",
        "y4m" => "y4m",
        "jxl" => "jxl",
        "avif" => "avif",
        "mov" => "mov",
        "mp4" => "mp4",
        _ => return None,
    };
    Some(name)
}

/// Formats named in a tool's capability listing.
///
/// cjxl and avifenc list their input formats in `--help`; exiftool prints its
/// writable file types with `-listwf`; ffmpeg goes through
/// [`formats_from_encoders`]. Only names in the tool's known vocabulary count.
/// A listing that names none of them yields the known table, since help
/// layouts change between releases.
pub fn formats_from_listing(kind: ToolKind, listing: &str) -> BTreeSet<String> {
    if kind == ToolKind::Ffmpeg {
        return formats_from_encoders(listing);
    }
    let known = vocabulary(kind);
    let mut formats: BTreeSet<String> = listing
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(normalize_format)
        .filter(|f| known.contains(f))
        .map(str::to_string)
        .collect();
    if let Some(native) = native_output(kind) {
        formats.remove(native);
    }
    if formats.is_empty() {
        return static_formats(kind);
    }
    if let Some(native) = native_output(kind) {
        formats.insert(native.to_string());
    }
    formats
}

/// An encoder binary run through `tokio::process`.
#[derive(Debug, Clone)]
pub struct BinaryTool {
    kind: ToolKind,
    path: PathBuf,
    probe_timeout: Duration,
}

impl BinaryTool {
    pub fn new(kind: ToolKind, path: impl Into<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            kind,
            path: path.into(),
            probe_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run_probe(&self, arg: &str) -> Result<ToolOutput, ToolError> {
        self.invoke(&[arg.to_string()], self.probe_timeout, &CancellationToken::new())
            .await
    }
}

#[async_trait]
impl ExternalTool for BinaryTool {
    async fn probe(&self) -> Result<ToolCapabilities, ToolError> {
        let output = self.run_probe(self.kind.version_arg()).await?;
        let version = parse_version(&output.stdout)
            .or_else(|| parse_version(&output.stderr))
            .ok_or_else(|| {
                ToolError::Probe(format!(
                    "no version in output of {} {}",
                    self.path.display(),
                    self.kind.version_arg()
                ))
            })?;

        let formats = match self.run_probe(self.kind.capability_arg()).await {
            Ok(listing) if !listing.stdout.trim().is_empty() => {
                formats_from_listing(self.kind, &listing.stdout)
            }
            Ok(listing) => formats_from_listing(self.kind, &listing.stderr),
            Err(e) if self.kind == ToolKind::Ffmpeg => return Err(e),
            Err(e) => {
                debug!(tool = %self.kind, error = %e, "capability listing unavailable");
                static_formats(self.kind)
            }
        };
        debug!(tool = %self.kind, path = %self.path.display(), %version, "probed tool");
        Ok(ToolCapabilities { version, formats })
    }

    async fn invoke(
        &self,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                path: self.path.clone(),
                source,
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
                Ok(result) => result?,
                Err(_) => return Err(ToolError::Timeout(timeout)),
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let lines: Vec<&str> = stderr.lines().collect();
            return Err(ToolError::Exit {
                code: output.status.code(),
                stderr: lines[lines.len().saturating_sub(5)..].join(" | "),
            });
        }
        Ok(ToolOutput {
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }
}
