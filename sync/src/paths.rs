//! Path and file-name utilities: version-suffix parsing, ignored-name
//! classification, and root-safety validation

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};

/// Well-known names excluded from every scan, compared case-insensitively.
/// Leading-dot names are excluded independently of this list.
const IGNORED_NAMES: &[&str] = &[
    ".ds_store",
    "thumbs.db",
    "desktop.ini",
    "icon\r",
    "sync-history.log",
];

/// Decoded form of a possibly versioned file name.
///
/// A versioned name follows `<stem>_v<digits>.<ext>` with a case-insensitive
/// `v` and a non-empty, dot-free extension. Names that don't match map to
/// themselves with version 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedName {
    /// File name the candidate maps to on the destination side
    pub target_file_name: String,
    /// Parsed version; 0 for unversioned names
    pub version: u64,
    /// Stem with the `_v<digits>` suffix removed
    pub stripped_stem: String,
    /// Whether the name matched the versioned grammar
    pub is_versioned: bool,
}

impl VersionedName {
    fn unversioned(name: &str) -> Self {
        let stem = match name.rfind('.') {
            Some(i) if i > 0 => &name[..i],
            _ => name,
        };
        Self {
            target_file_name: name.to_string(),
            version: 0,
            stripped_stem: stem.to_string(),
            is_versioned: false,
        }
    }
}

/// Parse a file name against the versioned grammar.
///
/// The digit run must sit immediately before the extension dot, preceded by
/// `_v` (any case). Leading zeros are tolerated; a digit run too large for
/// `u64` falls back to the unversioned decoding.
pub fn parse_versioned_name(name: &str) -> VersionedName {
    let dot = match name.rfind('.') {
        Some(i) if i > 0 && i + 1 < name.len() => i,
        _ => return VersionedName::unversioned(name),
    };
    let (stem, ext) = (&name[..dot], &name[dot + 1..]);

    let bytes = stem.as_bytes();
    let mut digits_start = stem.len();
    while digits_start > 0 && bytes[digits_start - 1].is_ascii_digit() {
        digits_start -= 1;
    }
    if digits_start == stem.len() || digits_start < 2 {
        return VersionedName::unversioned(name);
    }
    if !stem[digits_start - 2..digits_start].eq_ignore_ascii_case("_v") {
        return VersionedName::unversioned(name);
    }

    let version: u64 = match stem[digits_start..].parse() {
        Ok(v) => v,
        Err(_) => return VersionedName::unversioned(name),
    };
    let stripped_stem = stem[..digits_start - 2].to_string();

    VersionedName {
        target_file_name: format!("{stripped_stem}.{ext}"),
        version,
        stripped_stem,
        is_versioned: true,
    }
}

/// Whether a directory entry name is excluded from scans.
pub fn is_ignored(name: &str) -> bool {
    if name.starts_with('.') {
        return true;
    }
    let lower = name.to_lowercase();
    IGNORED_NAMES.contains(&lower.as_str())
}

/// Whether a file name carries a usable extension: a `.` that is not the
/// first character and leaves at least one extension character.
pub fn has_usable_extension(name: &str) -> bool {
    match name.rfind('.') {
        Some(i) => i > 0 && i + 1 < name.len(),
        None => false,
    }
}

/// Lexically normalize a relative path: drop `.` components and resolve `..`
/// against earlier components. Fails when the path is absolute or `..` would
/// climb past the top.
pub fn normalize_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(SyncError::InvalidPlanItem {
                        path: path.to_path_buf(),
                        message: "relative path escapes the root".to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SyncError::InvalidPlanItem {
                    path: path.to_path_buf(),
                    message: "expected a relative path".to_string(),
                });
            }
        }
    }
    Ok(out)
}

/// Lexical normalization for absolute candidates; `..` pops, `.` drops,
/// nothing touches the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Whether `candidate` stays inside `root` on path-component boundaries.
///
/// The root is canonicalized when possible (falling back to lexical
/// normalization); the candidate is normalized lexically only, so `..`
/// traversal cannot escape detection via symlink tricks on the candidate
/// side.
pub fn is_path_within(root: &Path, candidate: &Path) -> bool {
    let lexical_root = normalize_lexical(root);
    let candidate = normalize_lexical(candidate);
    if candidate.starts_with(&lexical_root) {
        return true;
    }
    match root.canonicalize() {
        Ok(canonical_root) => candidate.starts_with(&canonical_root),
        Err(_) => false,
    }
}

/// Validate the source/destination root pair.
///
/// Rejects roots that are symlinks, non-directories, filesystem roots, and
/// pairs that are equal or nested inside each other.
pub fn ensure_safe_roots(left: &Path, right: &Path) -> Result<()> {
    for root in [left, right] {
        let meta = std::fs::symlink_metadata(root).map_err(|e| SyncError::InvalidDirectory {
            path: root.to_path_buf(),
            message: format!("cannot stat root: {e}"),
        })?;
        if meta.file_type().is_symlink() {
            return Err(SyncError::InvalidDirectory {
                path: root.to_path_buf(),
                message: "root is a symbolic link".to_string(),
            });
        }
        if !meta.is_dir() {
            return Err(SyncError::InvalidDirectory {
                path: root.to_path_buf(),
                message: "root is not a directory".to_string(),
            });
        }
    }

    let canonical_left = canonicalize_root(left)?;
    let canonical_right = canonicalize_root(right)?;

    for root in [&canonical_left, &canonical_right] {
        if root.parent().is_none() {
            return Err(SyncError::InvalidDirectory {
                path: root.clone(),
                message: "refusing to sync a filesystem root".to_string(),
            });
        }
    }
    if canonical_left == canonical_right {
        return Err(SyncError::InvalidDirectory {
            path: canonical_left,
            message: "source and destination are the same directory".to_string(),
        });
    }
    if canonical_left.starts_with(&canonical_right) || canonical_right.starts_with(&canonical_left)
    {
        return Err(SyncError::InvalidDirectory {
            path: canonical_left,
            message: "source and destination overlap".to_string(),
        });
    }
    Ok(())
}

fn canonicalize_root(root: &Path) -> Result<PathBuf> {
    root.canonicalize().map_err(|e| SyncError::InvalidDirectory {
        path: root.to_path_buf(),
        message: format!("cannot canonicalize root: {e}"),
    })
}
