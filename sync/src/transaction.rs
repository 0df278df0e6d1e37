//! Per-file copy transaction: backup, streamed copy, commit and rollback
//!
//! Each plan item runs through a small state machine. A pre-existing
//! destination file is renamed aside before the new content streams into an
//! exclusively created target; any failure or cancellation before commit
//! deletes the partial target and renames the backup back. The journal is
//! updated at every transition so an interrupted run can be recovered.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::control::Checkpoints;
use crate::error::{Result, SyncError};
use crate::journal::Journal;
use crate::planner::PlanItem;
use crate::preservation;
use crate::progress::ProgressReporter;

/// Fixed streaming buffer size.
pub const COPY_CHUNK_SIZE: usize = 256 * 1024;
/// Marker embedded in every temporary backup name.
pub const BACKUP_MARKER: &str = ".lempicka-tmp-";

/// Everything a transaction needs besides the plan item itself.
pub struct TransactionContext<'a> {
    pub journal: &'a Journal,
    pub checkpoints: &'a Checkpoints,
    pub reporter: &'a ProgressReporter,
    /// Position of the item within the run, for progress events
    pub index: usize,
    /// Re-hash the destination after the copy and fail on mismatch
    pub verify_integrity: bool,
}

impl TransactionContext<'_> {
    async fn checkpoint(&self, item: &PlanItem) -> Result<()> {
        self.checkpoints
            .checkpoint(|| self.reporter.paused(item, self.index))
            .await
    }
}

/// Generate a backup file name for `basename`:
/// `.<basename>.lempicka-tmp-<epoch_ms>-<pid>-<rand6>`.
pub fn backup_file_name(basename: &str) -> String {
    let rand6: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect();
    format!(
        ".{basename}{BACKUP_MARKER}{}-{}-{rand6}",
        Utc::now().timestamp_millis(),
        std::process::id()
    )
}

/// Run the copy transaction for one plan item. Returns the bytes written.
///
/// `attempt` is the 0-based try number recorded into the journal's active
/// entry. On success the item is committed in the journal; on failure the
/// rollback has already happened and the original error propagates, except
/// for `RESTORE_FAILED` which replaces it.
pub async fn run_copy_transaction(
    item: &PlanItem,
    attempt: u32,
    ctx: &TransactionContext<'_>,
) -> Result<u64> {
    // preflight: the source must still be a readable regular file
    let source_meta = fs::metadata(&item.source_path)
        .await
        .map_err(|e| SyncError::source_unavailable(&item.source_path, &e))?;
    if !source_meta.is_file() {
        return Err(SyncError::SourceUnavailable {
            path: item.source_path.clone(),
            message: "not a regular file".to_string(),
        });
    }

    ctx.journal.begin_entry(item, attempt).await?;
    debug!(
        target = %item.target_relative_path.display(),
        attempt = attempt + 1,
        "transaction started"
    );

    let mut backup: Option<PathBuf> = None;
    match stream_copy(item, ctx, &mut backup).await {
        Ok(bytes) => {
            if let Some(backup_path) = &backup {
                if let Err(e) = fs::remove_file(backup_path).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        // the new content is committed on disk; only the
                        // backup lingers, so no rollback happens here
                        ctx.journal.remove_active(&item.target_path).await?;
                        return Err(SyncError::BackupCleanupFailed {
                            backup_path: backup_path.clone(),
                            source: e,
                        });
                    }
                }
            }
            ctx.journal.commit_entry(&item.target_path, bytes).await?;
            debug!(
                target = %item.target_relative_path.display(),
                bytes,
                "transaction committed"
            );
            Ok(bytes)
        }
        Err(err) => {
            rollback(item, &backup).await?;
            ctx.journal.remove_active(&item.target_path).await?;
            Err(err)
        }
    }
}

/// Backup any existing destination, then stream the source into an
/// exclusively created target, checking pause/cancel between every read and
/// write.
async fn stream_copy(
    item: &PlanItem,
    ctx: &TransactionContext<'_>,
    backup: &mut Option<PathBuf>,
) -> Result<u64> {
    let target = &item.target_path;

    match fs::symlink_metadata(target).await {
        Ok(meta) if meta.is_file() => {
            let backup_path = allocate_backup_path(target).await?;
            fs::rename(target, &backup_path)
                .await
                .map_err(|e| SyncError::fs("renaming destination to backup", target.clone(), e))?;
            ctx.journal.set_backup(target, &backup_path).await?;
            *backup = Some(backup_path);
        }
        Ok(_) => {
            return Err(SyncError::DestinationPathConflict {
                path: target.clone(),
                expected: "regular file",
            });
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::fs("reading file metadata", target.clone(), e)),
    }

    ctx.checkpoint(item).await?;

    let mut reader = fs::File::open(&item.source_path)
        .await
        .map_err(|e| SyncError::source_unavailable(&item.source_path, &e))?;
    let mut writer = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .await
        .map_err(|e| SyncError::DestinationUnavailable {
            path: target.clone(),
            source: e,
        })?;

    let mut hasher = ctx.verify_integrity.then(blake3::Hasher::new);
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        ctx.checkpoint(item).await?;
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|e| copy_error(item, e))?;
        if read == 0 {
            break;
        }
        ctx.checkpoint(item).await?;
        // write_all loops internally, so short writes are retried in-segment
        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|e| copy_error(item, e))?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buffer[..read]);
        }
        written += read as u64;
        ctx.reporter.copying(item, ctx.index, written, read as u64);
    }

    // the size on disk must be authoritative before anything observes it
    writer.flush().await.map_err(|e| copy_error(item, e))?;
    writer.sync_all().await.map_err(|e| copy_error(item, e))?;
    drop(writer);

    if let Some(hasher) = hasher {
        verify_destination(item, hasher.finalize()).await?;
    }

    preservation::preserve_creation_date(&item.source_path, target);

    Ok(written)
}

/// Undo a failed attempt: delete the partial target and rename any backup
/// back into place. A restore failure is run-fatal and replaces the
/// original error.
async fn rollback(item: &PlanItem, backup: &Option<PathBuf>) -> Result<()> {
    match fs::remove_file(&item.target_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            target = %item.target_path.display(),
            error = %e,
            "could not remove partial destination during rollback"
        ),
    }

    if let Some(backup_path) = backup {
        match fs::rename(backup_path, &item.target_path).await {
            Ok(()) => {
                debug!(target = %item.target_path.display(), "backup restored");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SyncError::RestoreFailed {
                    backup_path: backup_path.clone(),
                    target_path: item.target_path.clone(),
                    source: e,
                });
            }
        }
    }
    Ok(())
}

async fn allocate_backup_path(target: &Path) -> Result<PathBuf> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let basename = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    loop {
        let candidate = dir.join(backup_file_name(&basename));
        match fs::symlink_metadata(&candidate).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(candidate),
            Ok(_) => continue,
            Err(e) => return Err(SyncError::fs("reading file metadata", candidate, e)),
        }
    }
}

async fn verify_destination(item: &PlanItem, expected: blake3::Hash) -> Result<()> {
    let mut file = fs::File::open(&item.target_path)
        .await
        .map_err(|e| copy_error(item, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await.map_err(|e| copy_error(item, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    if hasher.finalize() != expected {
        return Err(copy_error(
            item,
            io::Error::other("integrity verification failed: destination hash mismatch"),
        ));
    }
    Ok(())
}

fn copy_error(item: &PlanItem, source: io::Error) -> SyncError {
    SyncError::CopyFailed {
        source_path: item.source_path.clone(),
        target_path: item.target_path.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SyncControl;
    use crate::journal::JournalState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn plan_item(dir: &Path, source_rel: &str, target_rel: &str, size: u64) -> PlanItem {
        PlanItem {
            source_path: dir.join("left").join(source_rel),
            source_relative_path: PathBuf::from(source_rel),
            source_size: size,
            target_path: dir.join("right").join(target_rel),
            target_relative_path: PathBuf::from(target_rel),
            version: 1,
            destination_exists: false,
            destination_size: None,
        }
    }

    fn journal_for(dir: &Path, items: Vec<PlanItem>) -> Journal {
        let state = JournalState::new(dir.join("left"), dir.join("right"), items, Vec::new());
        Journal::new(None, state)
    }

    async fn setup(dir: &Path) {
        fs::create_dir_all(dir.join("left")).await.unwrap();
        fs::create_dir_all(dir.join("right")).await.unwrap();
    }

    fn backup_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(BACKUP_MARKER))
            .collect()
    }

    #[test]
    fn backup_name_shape() {
        let name = backup_file_name("clip.txt");
        assert!(name.starts_with(".clip.txt.lempicka-tmp-"));
        let suffix = name.strip_prefix(".clip.txt.lempicka-tmp-").unwrap();
        let fields: Vec<&str> = suffix.split('-').collect();
        assert_eq!(fields.len(), 3);
        assert!(fields[0].chars().all(|c| c.is_ascii_digit()));
        assert!(fields[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(fields[2].len(), 6);
        assert!(fields[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn copies_into_missing_destination() {
        let tmp = TempDir::new().unwrap();
        setup(tmp.path()).await;
        let item = plan_item(tmp.path(), "a_v1.txt", "a.txt", 5);
        std::fs::write(&item.source_path, b"hello").unwrap();

        let journal = journal_for(tmp.path(), vec![item.clone()]);
        let checkpoints = Checkpoints::never();
        let reporter = ProgressReporter::sink();
        let ctx = TransactionContext {
            journal: &journal,
            checkpoints: &checkpoints,
            reporter: &reporter,
            index: 0,
            verify_integrity: false,
        };

        let bytes = run_copy_transaction(&item, 0, &ctx).await.unwrap();
        assert_eq!(bytes, 5);
        assert_eq!(std::fs::read(&item.target_path).unwrap(), b"hello");

        let state = journal.snapshot().await;
        assert!(state.is_completed(&item.target_path));
        assert!(state.active_entries.is_empty());
        assert_eq!(state.bytes_transferred, 5);
        assert!(backup_names(&tmp.path().join("right")).is_empty());
    }

    #[tokio::test]
    async fn replaces_existing_destination_through_backup() {
        let tmp = TempDir::new().unwrap();
        setup(tmp.path()).await;
        let item = plan_item(tmp.path(), "a_v2.txt", "a.txt", 3);
        std::fs::write(&item.source_path, b"new").unwrap();
        std::fs::write(&item.target_path, b"old-content").unwrap();

        let journal = journal_for(tmp.path(), vec![item.clone()]);
        let checkpoints = Checkpoints::never();
        let reporter = ProgressReporter::sink();
        let ctx = TransactionContext {
            journal: &journal,
            checkpoints: &checkpoints,
            reporter: &reporter,
            index: 0,
            verify_integrity: true,
        };

        run_copy_transaction(&item, 0, &ctx).await.unwrap();
        assert_eq!(std::fs::read(&item.target_path).unwrap(), b"new");
        assert!(backup_names(&tmp.path().join("right")).is_empty());
    }

    #[tokio::test]
    async fn vanished_source_fails_preflight() {
        let tmp = TempDir::new().unwrap();
        setup(tmp.path()).await;
        let item = plan_item(tmp.path(), "gone_v1.txt", "gone.txt", 5);

        let journal = journal_for(tmp.path(), vec![item.clone()]);
        let checkpoints = Checkpoints::never();
        let reporter = ProgressReporter::sink();
        let ctx = TransactionContext {
            journal: &journal,
            checkpoints: &checkpoints,
            reporter: &reporter,
            index: 0,
            verify_integrity: false,
        };

        let err = run_copy_transaction(&item, 0, &ctx).await.unwrap_err();
        assert_eq!(err.code(), "SOURCE_UNAVAILABLE");
        assert!(journal.snapshot().await.active_entries.is_empty());
    }

    #[tokio::test]
    async fn non_regular_destination_is_a_conflict() {
        let tmp = TempDir::new().unwrap();
        setup(tmp.path()).await;
        let item = plan_item(tmp.path(), "a_v1.txt", "a.txt", 1);
        std::fs::write(&item.source_path, b"x").unwrap();
        std::fs::create_dir(&item.target_path).unwrap();

        let journal = journal_for(tmp.path(), vec![item.clone()]);
        let checkpoints = Checkpoints::never();
        let reporter = ProgressReporter::sink();
        let ctx = TransactionContext {
            journal: &journal,
            checkpoints: &checkpoints,
            reporter: &reporter,
            index: 0,
            verify_integrity: false,
        };

        let err = run_copy_transaction(&item, 0, &ctx).await.unwrap_err();
        assert_eq!(err.code(), "DESTINATION_PATH_CONFLICT");
        // the directory is untouched
        assert!(item.target_path.is_dir());
        assert!(journal.snapshot().await.active_entries.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_copy_restores_the_backup() {
        let tmp = TempDir::new().unwrap();
        setup(tmp.path()).await;
        let item = plan_item(tmp.path(), "clip_v2.txt", "clip.txt", 0);
        // several chunks worth of data so cancellation lands mid-stream
        let payload = vec![7u8; COPY_CHUNK_SIZE * 4];
        std::fs::write(&item.source_path, &payload).unwrap();
        std::fs::write(&item.target_path, b"old-destination-content").unwrap();

        let control = SyncControl::new();
        let cancelled_after_first_chunk = Arc::new(AtomicBool::new(false));
        let flag = cancelled_after_first_chunk.clone();
        let inner = control.cancel_token();
        let cancel: crate::control::FlagPredicate = Arc::new(move || {
            flag.load(Ordering::SeqCst) || inner()
        });
        let checkpoints = Checkpoints::new(cancel, control.pause_token());

        let journal = journal_for(tmp.path(), vec![item.clone()]);
        let (reporter, mut channel) = crate::progress::ProgressChannel::new();
        let ctx = TransactionContext {
            journal: &journal,
            checkpoints: &checkpoints,
            reporter: &reporter,
            index: 0,
            verify_integrity: false,
        };

        let watcher = tokio::spawn({
            let flag = cancelled_after_first_chunk.clone();
            async move {
                while let Some(update) = channel.recv().await {
                    if update.phase == crate::progress::SyncPhase::Copying {
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        let err = run_copy_transaction(&item, 0, &ctx).await.unwrap_err();
        assert_eq!(err.code(), "SYNC_CANCELLED");
        watcher.await.unwrap();

        assert_eq!(
            std::fs::read(&item.target_path).unwrap(),
            b"old-destination-content"
        );
        assert!(backup_names(&tmp.path().join("right")).is_empty());
        assert!(journal.snapshot().await.active_entries.is_empty());
    }
}
