//! Atomic replacement of originals with converted output.
//!
//! Every replacement runs the same sequence regardless of backup retention:
//! back up the source, validate the staged output, stage a temp copy next to
//! the destination, rename it into place, then drop the source if the
//! destination differs. A failure at any point after the backup restores the
//! source from it.

use crate::classify::{read_signature, signature_matches_extension, sniff_format};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// The source could not be copied to its backup location.
    #[error("Failed to create backup of {path}: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The staged output is missing, empty or not the expected container.
    #[error("Output failed validation: {0}")]
    ValidationFailed(String),

    /// A different file already occupies the destination.
    #[error("Destination {0} already exists")]
    DestinationExists(PathBuf),

    /// Copying or renaming the output into place failed.
    #[error("Failed to commit output: {0}")]
    CommitFailed(#[source] io::Error),

    /// The source could not be restored; the backup is left in place.
    #[error("Rollback of {path} failed, backup kept at {backup}: {source}")]
    RollbackFailed {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of one replacement.
///
/// `Started → BackedUp → Validated → Committed`, or `RolledBack` from any step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Started,
    BackedUp,
    Validated,
    Committed,
    RolledBack,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupStatus::Started => "started",
            BackupStatus::BackedUp => "backed_up",
            BackupStatus::Validated => "validated",
            BackupStatus::Committed => "committed",
            BackupStatus::RolledBack => "rolled_back",
        })
    }
}

/// Record of one replacement, kept in the manager's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupOperation {
    /// Hyphen-free UUID, also used in the backup and temp file names.
    pub id: String,
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub destination_path: PathBuf,
    pub status: BackupStatus,
    pub started_at: DateTime<Utc>,
    /// Why the operation was rolled back.
    pub error: Option<String>,
}

/// Generates the backup path for `source` under operation `id`.
///
/// The backup path follows the format `<dir>/<name>.bak.<id>`.
///
/// # Arguments
///
/// * `source` - Path to the file being replaced
/// * `backup_dir` - Directory for backups; `None` keeps them beside the source
/// * `id` - Operation id
///
/// # Example
///
/// ```
/// use std::path::{Path, PathBuf};
/// use pixmill::replace::backup_path;
///
/// let backup = backup_path(Path::new("/media/photo.png"), None, "1f2e");
/// assert_eq!(backup, PathBuf::from("/media/photo.png.bak.1f2e"));
/// ```
pub fn backup_path(source: &Path, backup_dir: Option<&Path>, id: &str) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = backup_dir
        .map(Path::to_path_buf)
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(format!("{}.bak.{}", name, id))
}

/// `<destination>.tmp.<id>`
pub(crate) fn temp_path(destination: &Path, id: &str) -> PathBuf {
    let mut tmp = destination.as_os_str().to_owned();
    tmp.push(format!(".tmp.{}", id));
    PathBuf::from(tmp)
}

/// Checks that `output` is usable as a replacement.
///
/// # Arguments
///
/// * `output` - The staged file
/// * `expected_ext` - Target extension whose container signature must match,
///   or `None` to skip the signature check
///
/// # Returns
///
/// * `Ok(())` if the file exists, is non-empty and carries the signature
/// * `Err(ReplaceError::ValidationFailed)` otherwise
pub fn validate_output(output: &Path, expected_ext: Option<&str>) -> Result<(), ReplaceError> {
    let metadata = fs::metadata(output)
        .map_err(|e| ReplaceError::ValidationFailed(format!("{}: {}", output.display(), e)))?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(ReplaceError::ValidationFailed(format!(
            "{} is empty",
            output.display()
        )));
    }
    if let Some(ext) = expected_ext {
        let header = read_signature(output)
            .map_err(|e| ReplaceError::ValidationFailed(format!("{}: {}", output.display(), e)))?;
        match sniff_format(&header) {
            Some(sniffed) if signature_matches_extension(ext, sniffed) => {}
            Some(sniffed) => {
                return Err(ReplaceError::ValidationFailed(format!(
                    "expected {} output, found {}",
                    ext, sniffed
                )))
            }
            None => {
                return Err(ReplaceError::ValidationFailed(format!(
                    "{} has no recognisable {} signature",
                    output.display(),
                    ext
                )))
            }
        }
    }
    Ok(())
}

/// Name of `path` with an operation suffix `.<tag>.<id>` removed.
///
/// Returns `None` unless the suffix is present and `id` looks like an
/// operation id (32 hex digits).
fn strip_operation_suffix<'a>(name: &'a str, tag: &str) -> Option<&'a str> {
    let (rest, id) = name.rsplit_once('.')?;
    if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let stem = rest.strip_suffix(tag)?.strip_suffix('.')?;
    (!stem.is_empty()).then_some(stem)
}

/// Restores `source` from `backup` by way of a sibling temp file, so the
/// source is either the old bytes or the backup's, never a partial copy.
fn restore_from_backup(backup: &Path, source: &Path, id: &str) -> io::Result<()> {
    let mut tmp = source.as_os_str().to_owned();
    tmp.push(format!(".restore.{}", id));
    let tmp = PathBuf::from(tmp);
    let restored = fs::copy(backup, &tmp).and_then(|_| fs::rename(&tmp, source));
    if restored.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    restored
}

/// Files removed by [`ReplaceManager::sweep_leftovers`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub staged: usize,
    pub temps: usize,
    pub backups: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.staged + self.temps + self.backups
    }
}

/// What the commit step had changed on disk before it failed.
#[derive(Default)]
struct CommitProgress {
    temp: Option<PathBuf>,
    destination_written: bool,
    source_removed: bool,
}

/// Runs replacements and remembers every operation it started.
///
/// Backups go to `backup_dir` when set, otherwise beside each source. With
/// `keep_backups` off they are deleted once an operation commits or rolls
/// back; every step still runs.
pub struct ReplaceManager {
    backup_dir: Option<PathBuf>,
    keep_backups: bool,
    operations: Mutex<Vec<BackupOperation>>,
}

impl ReplaceManager {
    pub fn new(backup_dir: Option<PathBuf>, keep_backups: bool) -> Self {
        Self {
            backup_dir,
            keep_backups,
            operations: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, op: &BackupOperation) {
        let mut ops = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        match ops.iter_mut().find(|o| o.id == op.id) {
            Some(existing) => *existing = op.clone(),
            None => ops.push(op.clone()),
        }
    }

    /// Replaces `source` with the staged output, landing it at `destination`.
    ///
    /// `destination` may equal `source` (same-format rewrite) or differ (format
    /// change, in which case `source` is removed after the commit). The
    /// staged file is consumed either way.
    ///
    /// # Arguments
    ///
    /// * `source` - The file being replaced
    /// * `staged` - Converted output written by the encoder
    /// * `destination` - Final path of the converted file
    /// * `expected_ext` - Extension whose signature the output must carry
    ///
    /// # Returns
    ///
    /// * `Ok(BackupOperation)` in status `Committed`
    /// * `Err(ReplaceError)` after rolling back; the source holds its
    ///   original bytes unless the error is `RollbackFailed`
    pub fn commit(
        &self,
        source: &Path,
        staged: &Path,
        destination: &Path,
        expected_ext: Option<&str>,
    ) -> Result<BackupOperation, ReplaceError> {
        let id = Uuid::new_v4().simple().to_string();
        let mut op = BackupOperation {
            id: id.clone(),
            source_path: source.to_path_buf(),
            backup_path: backup_path(source, self.backup_dir.as_deref(), &id),
            destination_path: destination.to_path_buf(),
            status: BackupStatus::Started,
            started_at: Utc::now(),
            error: None,
        };
        self.push(&op);

        if destination != source && destination.exists() {
            let err = ReplaceError::DestinationExists(destination.to_path_buf());
            self.abandon(&mut op, staged, &err);
            return Err(err);
        }

        if let Some(dir) = op.backup_path.parent() {
            if let Err(source_err) = fs::create_dir_all(dir) {
                let err = ReplaceError::BackupFailed {
                    path: source.to_path_buf(),
                    source: source_err,
                };
                self.abandon(&mut op, staged, &err);
                return Err(err);
            }
        }
        if let Err(source_err) = fs::copy(source, &op.backup_path) {
            let _ = fs::remove_file(&op.backup_path);
            let err = ReplaceError::BackupFailed {
                path: source.to_path_buf(),
                source: source_err,
            };
            self.abandon(&mut op, staged, &err);
            return Err(err);
        }
        op.status = BackupStatus::BackedUp;
        self.push(&op);

        if let Err(err) = validate_output(staged, expected_ext) {
            return Err(self.roll_back(&mut op, staged, CommitProgress::default(), err));
        }
        op.status = BackupStatus::Validated;
        self.push(&op);

        let mut progress = CommitProgress::default();
        if let Err(io_err) = self.swap_in(&op, staged, &mut progress) {
            return Err(self.roll_back(&mut op, staged, progress, ReplaceError::CommitFailed(io_err)));
        }
        let _ = fs::remove_file(staged);

        op.status = BackupStatus::Committed;
        self.push(&op);
        if !self.keep_backups {
            if let Err(e) = fs::remove_file(&op.backup_path) {
                warn!(backup = %op.backup_path.display(), error = %e, "failed to remove backup");
            }
        }
        debug!(source = %source.display(), destination = %destination.display(), "replacement committed");
        Ok(op)
    }

    fn swap_in(
        &self,
        op: &BackupOperation,
        staged: &Path,
        progress: &mut CommitProgress,
    ) -> io::Result<()> {
        let tmp = temp_path(&op.destination_path, &op.id);
        progress.temp = Some(tmp.clone());
        fs::copy(staged, &tmp)?;
        fs::rename(&tmp, &op.destination_path)?;
        progress.temp = None;
        progress.destination_written = true;
        if op.destination_path != op.source_path {
            fs::remove_file(&op.source_path)?;
            progress.source_removed = true;
        }
        Ok(())
    }

    /// Failure before anything was backed up: drop the staged output.
    fn abandon(&self, op: &mut BackupOperation, staged: &Path, err: &ReplaceError) {
        let _ = fs::remove_file(staged);
        op.status = BackupStatus::RolledBack;
        op.error = Some(err.to_string());
        self.push(op);
        warn!(source = %op.source_path.display(), error = %err, "replacement abandoned");
    }

    fn roll_back(
        &self,
        op: &mut BackupOperation,
        staged: &Path,
        progress: CommitProgress,
        cause: ReplaceError,
    ) -> ReplaceError {
        if let Some(tmp) = &progress.temp {
            let _ = fs::remove_file(tmp);
        }
        if progress.destination_written && op.destination_path != op.source_path {
            let _ = fs::remove_file(&op.destination_path);
        }
        let _ = fs::remove_file(staged);

        let needs_restore = progress.source_removed
            || (progress.destination_written && op.destination_path == op.source_path);
        if needs_restore {
            if let Err(e) = restore_from_backup(&op.backup_path, &op.source_path, &op.id) {
                op.status = BackupStatus::RolledBack;
                op.error = Some(cause.to_string());
                self.push(op);
                return ReplaceError::RollbackFailed {
                    path: op.source_path.clone(),
                    backup: op.backup_path.clone(),
                    source: e,
                };
            }
        }
        if !self.keep_backups {
            let _ = fs::remove_file(&op.backup_path);
        }

        op.status = BackupStatus::RolledBack;
        op.error = Some(cause.to_string());
        self.push(op);
        warn!(source = %op.source_path.display(), error = %cause, "replacement rolled back");
        cause
    }

    /// Every operation started by this manager, oldest first.
    pub fn history(&self) -> Vec<BackupOperation> {
        self.operations
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    /// Deletes retained backups older than `max_age`.
    ///
    /// Only operations from this manager's history are considered; files left
    /// by an earlier process are handled by [`sweep_leftovers`](Self::sweep_leftovers).
    ///
    /// # Returns
    ///
    /// How many backup files were removed.
    pub fn prune_backups(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let ops = self.history();
        let mut removed = 0;
        for op in ops.iter().filter(|o| o.started_at <= cutoff) {
            if op.backup_path.exists() && fs::remove_file(&op.backup_path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "pruned backups");
        }
        removed
    }

    /// Removes files an interrupted run left under `root`.
    ///
    /// * staged encoder outputs (names starting with `staged_prefix`)
    /// * `.tmp.<id>` commit copies
    /// * `.bak.<id>` backups whose source still sits beside them, unless
    ///   backups are retained
    ///
    /// A backup whose source is gone may be the only copy left and is kept.
    pub fn sweep_leftovers(&self, root: &Path, staged_prefix: &str) -> SweepReport {
        let mut report = SweepReport::default();
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();

            let counter = if name.starts_with(staged_prefix) {
                &mut report.staged
            } else if strip_operation_suffix(&name, "tmp").is_some() {
                &mut report.temps
            } else if let Some(stem) = strip_operation_suffix(&name, "bak") {
                if self.keep_backups {
                    continue;
                }
                let original = path.with_file_name(stem);
                if !original.exists() {
                    warn!(backup = %path.display(), "keeping backup, its source is missing");
                    continue;
                }
                &mut report.backups
            } else {
                continue;
            };

            match fs::remove_file(path) {
                Ok(()) => *counter += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove leftover"),
            }
        }
        if report.total() > 0 {
            info!(
                staged = report.staged,
                temps = report.temps,
                backups = report.backups,
                "removed leftovers from an interrupted run"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR original-pixels";
    const JXL: &[u8] = &[0xFF, 0x0A, 1, 2, 3, 4, 5, 6];

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("photo.png");
        fs::write(&source, PNG).unwrap();
        let staged = dir.path().join(".pixmill-1.jxl");
        (dir, source, staged)
    }

    #[test]
    fn test_backup_path_format() {
        let p = backup_path(Path::new("/m/photo.png"), None, "abc");
        assert_eq!(p, PathBuf::from("/m/photo.png.bak.abc"));
        let p = backup_path(Path::new("/m/photo.png"), Some(Path::new("/b")), "abc");
        assert_eq!(p, PathBuf::from("/b/photo.png.bak.abc"));
    }

    #[test]
    fn test_commit_with_format_change() {
        let (dir, source, staged) = setup();
        fs::write(&staged, JXL).unwrap();
        let destination = dir.path().join("photo.jxl");

        let manager = ReplaceManager::new(None, false);
        let op = manager.commit(&source, &staged, &destination, Some("jxl")).unwrap();

        assert_eq!(op.status, BackupStatus::Committed);
        assert_eq!(fs::read(&destination).unwrap(), JXL);
        assert!(!source.exists());
        assert!(!staged.exists());
        assert!(!op.backup_path.exists());
        assert!(!temp_path(&destination, &op.id).exists());
    }

    #[test]
    fn test_same_path_commit_keeps_backup_when_retained() {
        let (dir, source, staged) = setup();
        let new_png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR smaller";
        fs::write(&staged, new_png).unwrap();
        let backups = dir.path().join("backups");

        let manager = ReplaceManager::new(Some(backups.clone()), true);
        let op = manager.commit(&source, &staged, &source, Some("png")).unwrap();

        assert_eq!(fs::read(&source).unwrap(), new_png);
        assert!(op.backup_path.starts_with(&backups));
        assert_eq!(fs::read(&op.backup_path).unwrap(), PNG);

        assert_eq!(manager.prune_backups(Duration::ZERO), 1);
        assert!(!op.backup_path.exists());
    }

    #[test]
    fn test_validation_failure_rolls_back() {
        let (dir, source, staged) = setup();
        fs::write(&staged, b"not a jxl at all").unwrap();
        let destination = dir.path().join("photo.jxl");

        let manager = ReplaceManager::new(None, false);
        let err = manager
            .commit(&source, &staged, &destination, Some("jxl"))
            .unwrap_err();
        assert!(matches!(err, ReplaceError::ValidationFailed(_)));
        assert_eq!(fs::read(&source).unwrap(), PNG);
        assert!(!destination.exists());
        assert!(!staged.exists());

        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BackupStatus::RolledBack);
        assert!(!history[0].backup_path.exists());
    }

    #[test]
    fn test_commit_failure_restores_source() {
        let (dir, source, staged) = setup();
        fs::write(&staged, JXL).unwrap();
        let destination = dir.path().join("missing-dir").join("photo.jxl");

        let manager = ReplaceManager::new(None, false);
        let err = manager
            .commit(&source, &staged, &destination, Some("jxl"))
            .unwrap_err();
        assert!(matches!(err, ReplaceError::CommitFailed(_)));
        assert_eq!(fs::read(&source).unwrap(), PNG);
        assert!(!staged.exists());
    }

    #[test]
    fn test_existing_destination_is_never_overwritten() {
        let (dir, source, staged) = setup();
        fs::write(&staged, JXL).unwrap();
        let destination = dir.path().join("photo.jxl");
        fs::write(&destination, b"someone else's file").unwrap();

        let manager = ReplaceManager::new(None, false);
        let err = manager
            .commit(&source, &staged, &destination, Some("jxl"))
            .unwrap_err();
        assert!(matches!(err, ReplaceError::DestinationExists(_)));
        assert_eq!(fs::read(&destination).unwrap(), b"someone else's file");
        assert_eq!(fs::read(&source).unwrap(), PNG);
    }

    #[test]
    fn test_restore_replaces_whole_file() {
        let (dir, source, _) = setup();
        let backup = dir.path().join("photo.png.bak.1");
        fs::write(&backup, PNG).unwrap();
        fs::write(&source, b"half-written").unwrap();

        restore_from_backup(&backup, &source, "1").unwrap();
        assert_eq!(fs::read(&source).unwrap(), PNG);
        assert!(backup.exists());
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.contains(".restore.")), "{:?}", names);
    }

    #[test]
    fn test_failed_restore_leaves_source_untouched() {
        let (dir, source, _) = setup();
        let backup = dir.path().join("gone.bak");

        assert!(restore_from_backup(&backup, &source, "2").is_err());
        assert_eq!(fs::read(&source).unwrap(), PNG);
        assert!(!dir.path().join("photo.png.restore.2").exists());
    }

    #[test]
    fn test_operation_suffix() {
        let id = "0123456789abcdef0123456789abcdef";
        assert_eq!(strip_operation_suffix(&format!("a.png.bak.{}", id), "bak"), Some("a.png"));
        assert_eq!(strip_operation_suffix(&format!("a.jxl.tmp.{}", id), "tmp"), Some("a.jxl"));
        assert_eq!(strip_operation_suffix(&format!("a.png.bak.{}", id), "tmp"), None);
        assert_eq!(strip_operation_suffix("a.png.bak.1", "bak"), None);
        assert_eq!(strip_operation_suffix("notes.bak.txt", "bak"), None);
    }

    #[test]
    fn test_sweep_removes_interrupted_leftovers() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let sub = root.join("album");
        fs::create_dir(&sub).unwrap();
        let id = Uuid::new_v4().simple().to_string();

        fs::write(root.join(".pixmill-aaaa.jxl"), JXL).unwrap();
        fs::write(sub.join(format!("b.jxl.tmp.{}", id)), JXL).unwrap();
        fs::write(root.join("a.png"), PNG).unwrap();
        fs::write(root.join(format!("a.png.bak.{}", id)), PNG).unwrap();
        // source already replaced: the backup is the last copy
        fs::write(sub.join(format!("c.png.bak.{}", id)), PNG).unwrap();
        fs::write(root.join("notes.bak.txt"), b"keep").unwrap();

        let manager = ReplaceManager::new(None, false);
        let report = manager.sweep_leftovers(root, ".pixmill-");
        assert_eq!(
            report,
            SweepReport {
                staged: 1,
                temps: 1,
                backups: 1
            }
        );
        assert!(!root.join(".pixmill-aaaa.jxl").exists());
        assert!(!root.join(format!("a.png.bak.{}", id)).exists());
        assert!(sub.join(format!("c.png.bak.{}", id)).exists());
        assert!(root.join("a.png").exists());
        assert!(root.join("notes.bak.txt").exists());
    }

    #[test]
    fn test_sweep_keeps_retained_backups() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4().simple().to_string();
        fs::write(dir.path().join("a.png"), PNG).unwrap();
        let backup = dir.path().join(format!("a.png.bak.{}", id));
        fs::write(&backup, PNG).unwrap();

        let report = ReplaceManager::new(None, true).sweep_leftovers(dir.path(), ".pixmill-");
        assert_eq!(report.total(), 0);
        assert!(backup.exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_source_is_new_or_untouched(
            original in proptest::collection::vec(any::<u8>(), 1..256),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            valid in any::<bool>(),
            same_path in any::<bool>(),
        ) {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("clip.jxl");
            fs::write(&source, &original).unwrap();
            let staged = dir.path().join(".pixmill-x.jxl");
            let output: Vec<u8> = if valid {
                [&[0xFFu8, 0x0A][..], &payload[..]].concat()
            } else {
                payload.iter().map(|b| b & 0x7F).collect()
            };
            fs::write(&staged, &output).unwrap();
            let destination = if same_path { source.clone() } else { dir.path().join("clip.out.jxl") };

            let manager = ReplaceManager::new(None, false);
            let result = manager.commit(&source, &staged, &destination, Some("jxl"));

            match result {
                Ok(_) => {
                    prop_assert_eq!(fs::read(&destination).unwrap(), output);
                    prop_assert_eq!(source.exists(), same_path);
                }
                Err(_) => {
                    prop_assert_eq!(fs::read(&source).unwrap(), original);
                    if !same_path {
                        prop_assert!(!destination.exists());
                    }
                }
            }
            prop_assert!(!staged.exists());
        }
    }
}
