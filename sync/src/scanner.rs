//! Directory scanning built on walkdir

use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::paths;

/// Options for directory scanning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Extra glob patterns excluded from the scan, matched against the
    /// relative path and the bare entry name
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// One accepted file inside a scanned root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute path of the file
    pub full_path: PathBuf,
    /// Path relative to the scan root
    pub relative_path: PathBuf,
    /// Size captured at scan time; used for equality and progress accounting
    pub size_bytes: u64,
}

/// Recursive scanner yielding the regular files a sync run can act on.
///
/// Ignored names prune whole subtrees, symlinks are skipped in both file and
/// directory form, and files without a usable extension are dropped.
pub struct DirectoryScanner {
    exclude: Option<GlobSet>,
}

impl DirectoryScanner {
    /// Create a scanner; fails when an exclude pattern does not compile.
    pub fn new(options: &ScanOptions) -> Result<Self> {
        Ok(Self {
            exclude: build_exclude_set(&options.exclude_patterns)?,
        })
    }

    /// Scan `root` and return its file records ordered by relative path.
    pub fn scan(&self, root: &Path) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !paths::is_ignored(&name)
            });

        for entry in walker {
            let entry = entry.map_err(|e| walk_error(root, e))?;
            if entry.depth() == 0 {
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_symlink() || !file_type.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if !paths::has_usable_extension(&name) {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| SyncError::InvalidDirectory {
                    path: entry.path().to_path_buf(),
                    message: "entry escapes the scan root".to_string(),
                })?
                .to_path_buf();

            if self.is_excluded(&relative, &name) {
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|e| metadata_error(entry.path(), e))?;

            records.push(FileRecord {
                full_path: entry.path().to_path_buf(),
                relative_path: relative,
                size_bytes: metadata.len(),
            });
        }

        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!(root = %root.display(), files = records.len(), "scan complete");
        Ok(records)
    }

    fn is_excluded(&self, relative: &Path, name: &str) -> bool {
        match &self.exclude {
            Some(set) => set.is_match(relative) || set.is_match(name),
            None => false,
        }
    }
}

fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            SyncError::InvalidPlan(format!("invalid exclude pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| SyncError::InvalidPlan(format!("invalid exclude patterns: {e}")))?;
    Ok(Some(set))
}

fn walk_error(root: &Path, err: walkdir::Error) -> SyncError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("directory walk error"));
    SyncError::fs("reading directory", path, source)
}

fn metadata_error(path: &Path, err: walkdir::Error) -> SyncError {
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("metadata error"));
    SyncError::fs("reading file metadata", path.to_path_buf(), source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scan(root: &Path) -> Vec<FileRecord> {
        DirectoryScanner::new(&ScanOptions::default())
            .unwrap()
            .scan(root)
            .unwrap()
    }

    fn relative_paths(records: &[FileRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.relative_path.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn collects_files_with_sizes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"xy").unwrap();

        let records = scan(dir.path());
        assert_eq!(relative_paths(&records), vec!["a.txt", "sub/b.txt"]);
        assert_eq!(records[0].size_bytes, 5);
        assert_eq!(records[1].size_bytes, 2);
    }

    #[test]
    fn skips_ignored_and_extensionless_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join(".hidden/file_v1.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"x").unwrap();
        std::fs::write(dir.path().join("Thumbs.db"), b"x").unwrap();
        std::fs::write(dir.path().join("desktop.ini"), b"x").unwrap();
        std::fs::write(dir.path().join("sync-history.log"), b"x").unwrap();
        std::fs::write(dir.path().join("notes_v3"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("visible")).unwrap();
        std::fs::write(dir.path().join("visible/readme_v2.txt"), b"x").unwrap();

        let records = scan(dir.path());
        assert_eq!(relative_paths(&records), vec!["visible/readme_v2.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn skips_symlinks_of_both_kinds() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("real.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("realdir")).unwrap();
        std::fs::write(dir.path().join("realdir/inner.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path().join("realdir"), dir.path().join("linkdir"))
            .unwrap();

        let records = scan(dir.path());
        assert_eq!(
            relative_paths(&records),
            vec!["real.txt", "realdir/inner.txt"]
        );
    }

    #[test]
    fn exclude_patterns_filter_files_by_name_and_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("skip.tmp"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("cache/data.txt"), b"x").unwrap();

        let options = ScanOptions {
            exclude_patterns: vec!["*.tmp".to_string(), "cache/**".to_string()],
        };
        let records = DirectoryScanner::new(&options)
            .unwrap()
            .scan(dir.path())
            .unwrap();
        assert_eq!(relative_paths(&records), vec!["keep.txt"]);
    }

    #[test]
    fn invalid_exclude_pattern_is_rejected() {
        let options = ScanOptions {
            exclude_patterns: vec!["a{".to_string()],
        };
        assert!(DirectoryScanner::new(&options).is_err());
    }
}
