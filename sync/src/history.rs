//! Append-only history log of successful transactions

use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};

/// File name of the history log inside the left root. The scanner excludes
/// it by name so the log never becomes a sync candidate.
pub const HISTORY_FILE_NAME: &str = "sync-history.log";

/// Serialized append handle for one run's history log.
pub struct HistoryLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl HistoryLog {
    /// Open (creating if needed) `<left_root>/sync-history.log` for append.
    pub async fn open(left_root: &Path) -> Result<Self> {
        let path = left_root.join(HISTORY_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SyncError::HistoryLog {
                path: path.clone(),
                source: e,
            })?;
        debug!(path = %path.display(), "history log open");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one line for a committed transaction:
    /// `<YYYY-MM-DD HH:MM:SS>\t<source_path>\t<target_path>\n` in local time.
    pub async fn append(&self, source_path: &Path, target_path: &Path) -> Result<()> {
        let line = format!(
            "{}\t{}\t{}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            source_path.display(),
            target_path.display()
        );
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| SyncError::HistoryLog {
                path: self.path.clone(),
                source: e,
            })?;
        file.flush().await.map_err(|e| SyncError::HistoryLog {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
