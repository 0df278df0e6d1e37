//! Compare-and-plan: version resolution across two tree scans

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::paths;
use crate::scanner::{DirectoryScanner, FileRecord, ScanOptions};

/// One planned copy: the winning source candidate for a target path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    /// Absolute path of the chosen source candidate
    pub source_path: PathBuf,
    /// Source path relative to the left root
    pub source_relative_path: PathBuf,
    /// Source size at scan time
    pub source_size: u64,
    /// Absolute destination path
    pub target_path: PathBuf,
    /// Destination path relative to the right root
    pub target_relative_path: PathBuf,
    /// Version of the winning candidate; 0 for unversioned sources
    pub version: u64,
    /// Whether the destination existed at plan time
    pub destination_exists: bool,
    /// Destination size at plan time, when it existed
    pub destination_size: Option<u64>,
}

/// Result of comparing two roots: the plan plus the directories it needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanBundle {
    pub left_root: PathBuf,
    pub right_root: PathBuf,
    /// Plan items sorted by target relative path
    pub plan: Vec<PlanItem>,
    /// Destination directories to create before copying, sorted; parents are
    /// implicit (`mkdir -p` semantics)
    pub directories_to_create: Vec<PathBuf>,
    /// Number of source files considered
    pub total_candidates: usize,
    /// Number of plan items (stale or missing targets)
    pub pending_count: usize,
}

/// Compare `left_root` against `right_root` and produce a copy plan.
///
/// For every target relative path the highest-versioned source candidate
/// wins; ties on version go to the lexicographically smallest source
/// relative path. A target enters the plan when it is missing on the right
/// or its size differs from the winner's.
pub fn build_compare_plan(
    left_root: &Path,
    right_root: &Path,
    options: &ScanOptions,
) -> Result<PlanBundle> {
    ensure_readable_directory(left_root)?;
    ensure_readable_directory(right_root)?;
    paths::ensure_safe_roots(left_root, right_root)?;

    let scanner = DirectoryScanner::new(options)?;
    let left = scanner.scan(left_root)?;
    let right = scanner.scan(right_root)?;
    let total_candidates = left.len();

    let right_size_by_rel: BTreeMap<PathBuf, u64> = right
        .into_iter()
        .map(|record| (record.relative_path, record.size_bytes))
        .collect();

    struct Candidate {
        record: FileRecord,
        version: u64,
    }

    let mut best_by_target: BTreeMap<PathBuf, Candidate> = BTreeMap::new();
    for record in left {
        let name = match record.relative_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let parsed = paths::parse_versioned_name(&name);
        let target_rel = match record.relative_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                paths::normalize_relative(&parent.join(&parsed.target_file_name))?
            }
            _ => PathBuf::from(&parsed.target_file_name),
        };

        match best_by_target.entry(target_rel) {
            Entry::Vacant(slot) => {
                slot.insert(Candidate {
                    record,
                    version: parsed.version,
                });
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                let wins = parsed.version > current.version
                    || (parsed.version == current.version
                        && record.relative_path < current.record.relative_path);
                if wins {
                    slot.insert(Candidate {
                        record,
                        version: parsed.version,
                    });
                }
            }
        }
    }

    // BTreeMap iteration keeps the plan sorted by target relative path
    let mut plan = Vec::new();
    for (target_rel, candidate) in &best_by_target {
        let destination_size = right_size_by_rel.get(target_rel).copied();
        let stale = match destination_size {
            None => true,
            Some(size) => size != candidate.record.size_bytes,
        };
        if !stale {
            continue;
        }
        plan.push(PlanItem {
            source_path: candidate.record.full_path.clone(),
            source_relative_path: candidate.record.relative_path.clone(),
            source_size: candidate.record.size_bytes,
            target_path: right_root.join(target_rel),
            target_relative_path: target_rel.clone(),
            version: candidate.version,
            destination_exists: destination_size.is_some(),
            destination_size,
        });
    }

    let directories_to_create = plan_directories(right_root, &plan)?;
    let pending_count = plan.len();

    info!(
        left = %left_root.display(),
        right = %right_root.display(),
        candidates = total_candidates,
        pending = pending_count,
        directories = directories_to_create.len(),
        "compare plan built"
    );

    Ok(PlanBundle {
        left_root: left_root.to_path_buf(),
        right_root: right_root.to_path_buf(),
        plan,
        directories_to_create,
        total_candidates,
        pending_count,
    })
}

/// Destination directories referenced by the plan that do not exist yet.
/// A referenced path that exists as a non-directory is a conflict.
fn plan_directories(right_root: &Path, plan: &[PlanItem]) -> Result<Vec<PathBuf>> {
    let mut referenced = BTreeSet::new();
    for item in plan {
        if let Some(parent) = item.target_relative_path.parent() {
            if !parent.as_os_str().is_empty() {
                referenced.insert(parent.to_path_buf());
            }
        }
    }

    let mut directories = Vec::new();
    for dir in referenced {
        let absolute = right_root.join(&dir);
        match std::fs::symlink_metadata(&absolute) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(SyncError::DestinationPathConflict {
                    path: absolute,
                    expected: "directory",
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => directories.push(dir),
            Err(e) => return Err(SyncError::fs("reading file metadata", absolute, e)),
        }
    }
    debug!(count = directories.len(), "directories to create");
    Ok(directories)
}

fn ensure_readable_directory(root: &Path) -> Result<()> {
    let meta = std::fs::metadata(root).map_err(|e| SyncError::InvalidDirectory {
        path: root.to_path_buf(),
        message: format!("cannot stat root: {e}"),
    })?;
    if !meta.is_dir() {
        return Err(SyncError::InvalidDirectory {
            path: root.to_path_buf(),
            message: "root is not a directory".to_string(),
        });
    }
    std::fs::read_dir(root)
        .map_err(|e| SyncError::fs("reading directory", root.to_path_buf(), e))?;
    Ok(())
}
