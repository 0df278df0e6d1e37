//! Durable recovery journal: plan snapshot, progress counters, and
//! in-flight transaction records persisted as JSON

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::planner::PlanItem;

/// Schema version tag written into every journal file.
pub const JOURNAL_VERSION: u32 = 1;

/// In-flight transaction record for one target path.
///
/// While an entry exists, either a backup of the prior destination sits at
/// `backup_path`, or `backup_path` is empty and no prior destination
/// existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEntry {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub source_relative_path: PathBuf,
    pub target_relative_path: PathBuf,
    /// Empty string when no prior destination file existed
    pub backup_path: String,
    pub started_at: DateTime<Utc>,
    /// 1-based try number for this target within the run
    pub attempt: u32,
}

/// A recorded per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub target_path: PathBuf,
    pub target_relative_path: PathBuf,
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The full persisted journal document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalState {
    pub version: u32,
    pub left_root: PathBuf,
    pub right_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_bytes: u64,
    #[serde(default)]
    pub directories_to_create: Vec<PathBuf>,
    #[serde(default)]
    pub plan: Vec<PlanItem>,
    /// Absolute target paths whose transactions committed, stored sorted
    #[serde(default)]
    pub completed_target_paths: BTreeSet<String>,
    #[serde(default)]
    pub failed: Vec<FailedEntry>,
    /// In-flight transactions keyed by absolute target path
    #[serde(default)]
    pub active_entries: BTreeMap<String, ActiveEntry>,
    #[serde(default)]
    pub bytes_transferred: u64,
}

impl JournalState {
    /// Fresh state for a new run.
    pub fn new(
        left_root: PathBuf,
        right_root: PathBuf,
        plan: Vec<PlanItem>,
        directories_to_create: Vec<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        let total_bytes = plan.iter().map(|item| item.source_size).sum();
        Self {
            version: JOURNAL_VERSION,
            left_root,
            right_root,
            started_at: now,
            updated_at: now,
            total_bytes,
            directories_to_create,
            plan,
            completed_target_paths: BTreeSet::new(),
            failed: Vec::new(),
            active_entries: BTreeMap::new(),
            bytes_transferred: 0,
        }
    }

    /// Plan items not yet completed, in plan order.
    pub fn pending_items(&self) -> Vec<PlanItem> {
        self.plan
            .iter()
            .filter(|item| !self.is_completed(&item.target_path))
            .cloned()
            .collect()
    }

    pub fn is_completed(&self, target_path: &Path) -> bool {
        self.completed_target_paths
            .contains(target_path.to_string_lossy().as_ref())
    }
}

/// Derived display summary of a journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalSummary {
    pub left_root: PathBuf,
    pub right_root: PathBuf,
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    pub failed_count: usize,
    pub active_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Summarize a journal for display.
pub fn summary(state: &JournalState) -> JournalSummary {
    let total = state.plan.len();
    let pending = state
        .plan
        .iter()
        .filter(|item| !state.is_completed(&item.target_path))
        .count();
    JournalSummary {
        left_root: state.left_root.clone(),
        right_root: state.right_root.clone(),
        total,
        completed: state.completed_target_paths.len(),
        pending,
        failed_count: state.failed.len(),
        active_count: state.active_entries.len(),
        updated_at: state.updated_at,
    }
}

/// Read a journal from disk. Absent file is `None`; malformed JSON is an
/// error.
pub async fn read(path: &Path) -> Result<Option<JournalState>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SyncError::fs("reading recovery journal", path.to_path_buf(), e)),
    };
    let state: JournalState =
        serde_json::from_slice(&bytes).map_err(|e| SyncError::MalformedJournal {
            path: path.to_path_buf(),
            source: e,
        })?;
    if state.version != JOURNAL_VERSION {
        return Err(SyncError::InvalidPlan(format!(
            "unsupported recovery journal version {}",
            state.version
        )));
    }
    Ok(Some(state))
}

/// Persist a journal: parent directories created, content written to a
/// sibling temp file, fsynced, and renamed into place. Bumps `updated_at`
/// monotonically.
pub async fn write(path: &Path, state: &mut JournalState) -> Result<()> {
    state.updated_at = state.updated_at.max(Utc::now());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::fs("creating directory", parent.to_path_buf(), e))?;
        }
    }

    let json = serde_json::to_vec_pretty(state)?;
    let tmp = temp_sibling(path);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .await
        .map_err(|e| SyncError::fs("writing recovery journal", tmp.clone(), e))?;
    file.write_all(&json)
        .await
        .map_err(|e| SyncError::fs("writing recovery journal", tmp.clone(), e))?;
    file.sync_all()
        .await
        .map_err(|e| SyncError::fs("writing recovery journal", tmp.clone(), e))?;
    drop(file);
    fs::rename(&tmp, path)
        .await
        .map_err(|e| SyncError::fs("writing recovery journal", path.to_path_buf(), e))?;
    Ok(())
}

/// Delete a journal; an already-absent file is success.
pub async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::fs("removing recovery journal", path.to_path_buf(), e)),
    }
}

/// Roll back every in-flight transaction recorded in the state.
///
/// For each active entry the (possibly partial) destination is deleted and a
/// non-empty backup is renamed back into place. A missing backup is
/// tolerated; any other restore failure aborts with `RESTORE_FAILED` and
/// leaves the unprocessed entries in the state.
pub async fn recover_active(state: &mut JournalState) -> Result<()> {
    let entries: Vec<(String, ActiveEntry)> = state
        .active_entries
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, entry) in entries {
        let target = Path::new(&key);
        match fs::remove_file(target).await {
            Ok(()) => debug!(target = %key, "removed in-flight destination"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SyncError::fs(
                    "removing in-flight destination",
                    target.to_path_buf(),
                    e,
                ))
            }
        }

        if !entry.backup_path.is_empty() {
            match fs::rename(&entry.backup_path, target).await {
                Ok(()) => debug!(target = %key, "restored backup"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(target = %key, backup = %entry.backup_path, "backup missing during recovery");
                }
                Err(e) => {
                    return Err(SyncError::RestoreFailed {
                        backup_path: PathBuf::from(&entry.backup_path),
                        target_path: target.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
        state.active_entries.remove(&key);
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Runtime handle over the journal for one sync run.
///
/// Mutations lock the state, apply, and persist before returning, so every
/// externally visible event is durable in source order; the tokio mutex
/// queues writers fairly, giving the FIFO write chain callers await on.
/// A handle without a path keeps in-memory accounting only.
pub struct Journal {
    path: Option<PathBuf>,
    state: Mutex<JournalState>,
}

impl Journal {
    pub fn new(path: Option<PathBuf>, state: JournalState) -> Self {
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Clone of the current state.
    pub async fn snapshot(&self) -> JournalState {
        self.state.lock().await.clone()
    }

    /// Persist the current state unchanged (used once at run start).
    pub async fn persist(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.write_locked(&mut state).await
    }

    /// Apply a mutation and persist the result before returning.
    pub async fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut JournalState),
    {
        let mut state = self.state.lock().await;
        apply(&mut state);
        self.write_locked(&mut state).await
    }

    async fn write_locked(&self, state: &mut JournalState) -> Result<()> {
        match &self.path {
            Some(path) => write(path, state).await,
            None => Ok(()),
        }
    }

    /// Record the start of a transaction attempt for a plan item.
    pub async fn begin_entry(&self, item: &PlanItem, attempt: u32) -> Result<()> {
        let key = key_for(&item.target_path);
        let entry = ActiveEntry {
            source_path: item.source_path.clone(),
            target_path: item.target_path.clone(),
            source_relative_path: item.source_relative_path.clone(),
            target_relative_path: item.target_relative_path.clone(),
            backup_path: String::new(),
            started_at: Utc::now(),
            attempt: attempt + 1,
        };
        self.mutate(|state| {
            state.active_entries.insert(key, entry);
        })
        .await
    }

    /// Record that the prior destination was renamed aside.
    pub async fn set_backup(&self, target_path: &Path, backup_path: &Path) -> Result<()> {
        let key = key_for(target_path);
        let backup = backup_path.to_string_lossy().into_owned();
        self.mutate(|state| {
            if let Some(entry) = state.active_entries.get_mut(&key) {
                entry.backup_path = backup;
            }
        })
        .await
    }

    /// Commit a transaction: the target moves from active to completed.
    pub async fn commit_entry(&self, target_path: &Path, bytes: u64) -> Result<()> {
        let key = key_for(target_path);
        self.mutate(|state| {
            state.active_entries.remove(&key);
            state.completed_target_paths.insert(key.clone());
            state.bytes_transferred += bytes;
        })
        .await
    }

    /// Drop the active entry after a rollback.
    pub async fn remove_active(&self, target_path: &Path) -> Result<()> {
        let key = key_for(target_path);
        self.mutate(|state| {
            state.active_entries.remove(&key);
        })
        .await
    }

    /// Record a per-item failure.
    pub async fn record_failure(&self, entry: FailedEntry) -> Result<()> {
        self.mutate(|state| {
            state.failed.push(entry);
        })
        .await
    }

    /// Directories still waiting to be created.
    pub async fn directories_to_create(&self) -> Vec<PathBuf> {
        self.state.lock().await.directories_to_create.clone()
    }

    /// Mark the planned directories as consumed.
    pub async fn clear_directories(&self) -> Result<()> {
        self.mutate(|state| {
            state.directories_to_create.clear();
        })
        .await
    }

    /// Delete the journal file after a fully successful run.
    pub async fn remove_file(&self) -> Result<()> {
        match &self.path {
            Some(path) => remove(path).await,
            None => Ok(()),
        }
    }
}

pub(crate) fn key_for(target_path: &Path) -> String {
    target_path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state(dir: &Path) -> JournalState {
        let item = PlanItem {
            source_path: dir.join("left/a_v2.txt"),
            source_relative_path: PathBuf::from("a_v2.txt"),
            source_size: 5,
            target_path: dir.join("right/a.txt"),
            target_relative_path: PathBuf::from("a.txt"),
            version: 2,
            destination_exists: false,
            destination_size: None,
        };
        JournalState::new(
            dir.join("left"),
            dir.join("right"),
            vec![item],
            vec![PathBuf::from("sub")],
        )
    }

    #[tokio::test]
    async fn read_absent_journal_is_none() {
        let dir = TempDir::new().unwrap();
        let state = read(&dir.path().join("missing.json")).await.unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal/state.json");
        let mut state = sample_state(dir.path());
        write(&path, &mut state).await.unwrap();

        let loaded = read(&path).await.unwrap().unwrap();
        assert_eq!(loaded.version, JOURNAL_VERSION);
        assert_eq!(loaded.plan.len(), 1);
        assert_eq!(loaded.total_bytes, 5);
        assert_eq!(loaded.directories_to_create, vec![PathBuf::from("sub")]);
    }

    #[tokio::test]
    async fn malformed_journal_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = read(&path).await.unwrap_err();
        assert_eq!(err.code(), "MALFORMED_JOURNAL");
    }

    #[tokio::test]
    async fn remove_tolerates_absence() {
        let dir = TempDir::new().unwrap();
        remove(&dir.path().join("missing.json")).await.unwrap();
    }

    #[tokio::test]
    async fn updated_at_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut state = sample_state(dir.path());
        write(&path, &mut state).await.unwrap();
        let first = state.updated_at;
        write(&path, &mut state).await.unwrap();
        assert!(state.updated_at >= first);
    }

    #[tokio::test]
    async fn summary_counts_pending() {
        let dir = TempDir::new().unwrap();
        let mut state = sample_state(dir.path());
        let s = summary(&state);
        assert_eq!(s.total, 1);
        assert_eq!(s.pending, 1);
        assert_eq!(s.completed, 0);

        let target = state.plan[0].target_path.clone();
        state
            .completed_target_paths
            .insert(target.to_string_lossy().into_owned());
        let s = summary(&state);
        assert_eq!(s.pending, 0);
        assert_eq!(s.completed, 1);
    }

    #[tokio::test]
    async fn recover_active_restores_backup() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.txt");
        let backup = dir.path().join(".a.txt.lempicka-tmp-1-1-abc123");
        std::fs::write(&target, b"partial").unwrap();
        std::fs::write(&backup, b"original").unwrap();

        let mut state = sample_state(dir.path());
        state.active_entries.insert(
            target.to_string_lossy().into_owned(),
            ActiveEntry {
                source_path: dir.path().join("src.txt"),
                target_path: target.clone(),
                source_relative_path: PathBuf::from("src.txt"),
                target_relative_path: PathBuf::from("a.txt"),
                backup_path: backup.to_string_lossy().into_owned(),
                started_at: Utc::now(),
                attempt: 1,
            },
        );

        recover_active(&mut state).await.unwrap();
        assert!(state.active_entries.is_empty());
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn recover_active_without_backup_deletes_partial() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.txt");
        std::fs::write(&target, b"partial").unwrap();

        let mut state = sample_state(dir.path());
        state.active_entries.insert(
            target.to_string_lossy().into_owned(),
            ActiveEntry {
                source_path: dir.path().join("src.txt"),
                target_path: target.clone(),
                source_relative_path: PathBuf::from("src.txt"),
                target_relative_path: PathBuf::from("a.txt"),
                backup_path: String::new(),
                started_at: Utc::now(),
                attempt: 1,
            },
        );

        recover_active(&mut state).await.unwrap();
        assert!(state.active_entries.is_empty());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn journal_handle_tracks_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let state = sample_state(dir.path());
        let item = state.plan[0].clone();
        let journal = Journal::new(Some(path.clone()), state);

        journal.begin_entry(&item, 0).await.unwrap();
        let snapshot = journal.snapshot().await;
        let entry = snapshot
            .active_entries
            .get(&key_for(&item.target_path))
            .unwrap();
        assert_eq!(entry.backup_path, "");
        assert_eq!(entry.attempt, 1);

        journal
            .set_backup(&item.target_path, Path::new("/tmp/backup"))
            .await
            .unwrap();
        journal.commit_entry(&item.target_path, 5).await.unwrap();

        let snapshot = journal.snapshot().await;
        assert!(snapshot.active_entries.is_empty());
        assert!(snapshot.is_completed(&item.target_path));
        assert_eq!(snapshot.bytes_transferred, 5);

        // every mutation persisted
        let on_disk = read(&path).await.unwrap().unwrap();
        assert!(on_disk.is_completed(&item.target_path));
    }
}
