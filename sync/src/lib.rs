//! Lempicka Sync Engine
//!
//! A one-way sync engine for versioned source trees:
//! - Versioned-name resolution (`report_v3.pdf` wins over `report_v1.pdf`)
//! - Size-based staleness planning against an unversioned destination
//! - Journaled, rollback-safe copy transactions with atomic replacement
//! - Cooperative pause/cancel, bounded retry, and resumable runs
//! - Typed progress events over a channel

pub mod control;
pub mod engine;
pub mod error;
pub mod history;
pub mod journal;
pub mod paths;
pub mod planner;
pub mod preservation;
pub mod progress;
pub mod runner;
pub mod scanner;
pub mod transaction;

// Re-export main types and functions
pub use control::{Checkpoints, FlagPredicate, RetryEvent, RetryPolicy, SyncControl};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use history::{HistoryLog, HISTORY_FILE_NAME};
pub use journal::{ActiveEntry, FailedEntry, JournalState, JournalSummary};
pub use paths::{parse_versioned_name, VersionedName};
pub use planner::{build_compare_plan, PlanBundle, PlanItem};
pub use progress::{ProgressChannel, ProgressReporter, ProgressUpdate, SyncPhase};
pub use runner::{SyncOptions, SyncReport};
pub use scanner::{DirectoryScanner, FileRecord, ScanOptions};

use std::path::Path;

/// Compare two roots and return the copy plan.
pub fn compare_trees(left_root: &Path, right_root: &Path) -> Result<PlanBundle> {
    build_compare_plan(left_root, right_root, &ScanOptions::default())
}

/// Compare and sync two roots in one call.
pub async fn sync_trees(
    left_root: &Path,
    right_root: &Path,
    options: SyncOptions,
) -> Result<SyncReport> {
    let engine = SyncEngine::new();
    let bundle = engine.build_compare_plan(left_root, right_root, &ScanOptions::default())?;
    engine.sync(bundle, None, options).await
}

// Test modules
#[cfg(test)]
mod planner_tests;
