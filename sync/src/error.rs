//! Error types for the sync engine

use std::io;
use std::path::PathBuf;

use crate::runner::SyncReport;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations.
///
/// Every variant maps to a stable code (see [`SyncError::code`]) so callers
/// can match on behavior without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Root path is missing, unreadable, unsafe, or not a directory
    #[error("invalid directory '{}': {message}", .path.display())]
    InvalidDirectory { path: PathBuf, message: String },

    /// Wrapped OS error with the operation that produced it
    #[error("filesystem error while {action} '{}': {source}{}", .path.display(), os_hint(.source))]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A required directory exists as a file, or a copy target is not a regular file
    #[error("destination path '{}' exists but is not a {expected}", .path.display())]
    DestinationPathConflict { path: PathBuf, expected: &'static str },

    /// Source file vanished or became unreadable
    #[error("source file '{}' is unavailable: {message}", .path.display())]
    SourceUnavailable { path: PathBuf, message: String },

    /// Destination file could not be created or written
    #[error("destination '{}' cannot be written: {source}{}", .path.display(), os_hint(.source))]
    DestinationUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failure inside the streaming copy loop
    #[error("copy from '{}' to '{}' failed: {source}{}", .source_path.display(), .target_path.display(), os_hint(.source))]
    CopyFailed {
        source_path: PathBuf,
        target_path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Copy committed but the backup could not be removed
    #[error("copy committed but backup '{}' could not be removed: {source}{}", .backup_path.display(), os_hint(.source))]
    BackupCleanupFailed {
        backup_path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Rollback could not move the backup back into place; the prior
    /// destination content now lives at `backup_path`
    #[error("could not restore backup '{}' to '{}': {source}{}", .backup_path.display(), .target_path.display(), os_hint(.source))]
    RestoreFailed {
        backup_path: PathBuf,
        target_path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// History log open or write failure
    #[error("history log '{}' failed: {source}{}", .path.display(), os_hint(.source))]
    HistoryLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Cooperative cancellation observed at a checkpoint
    #[error("sync cancelled")]
    Cancelled,

    /// Caller provided a malformed plan
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Caller provided a malformed plan item
    #[error("invalid plan item '{}': {message}", .path.display())]
    InvalidPlanItem { path: PathBuf, message: String },

    /// Resume requested but no journal exists at the given path
    #[error("no recovery journal at '{}'", .path.display())]
    NoRecoveryJournal { path: PathBuf },

    /// A second sync was requested while one is live
    #[error("a sync run is already in progress")]
    AlreadyRunning,

    /// Recovery journal exists but cannot be parsed
    #[error("recovery journal '{}' is malformed: {source}", .path.display())]
    MalformedJournal {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A run-aborting error together with whatever the run accomplished
    #[error("{source}")]
    Aborted {
        #[source]
        source: Box<SyncError>,
        partial_result: Box<SyncReport>,
    },
}

impl SyncError {
    /// Stable machine-readable identifier for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDirectory { .. } => "INVALID_DIRECTORY",
            Self::Filesystem { .. } => "FILESYSTEM_ERROR",
            Self::DestinationPathConflict { .. } => "DESTINATION_PATH_CONFLICT",
            Self::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            Self::DestinationUnavailable { .. } => "DESTINATION_UNAVAILABLE",
            Self::CopyFailed { .. } => "SYNC_COPY_FAILED",
            Self::BackupCleanupFailed { .. } => "BACKUP_CLEANUP_FAILED",
            Self::RestoreFailed { .. } => "RESTORE_FAILED",
            Self::HistoryLog { .. } => "SYNC_LOG_ERROR",
            Self::Cancelled => "SYNC_CANCELLED",
            Self::InvalidPlan(_) => "INVALID_PLAN",
            Self::InvalidPlanItem { .. } => "INVALID_PLAN_ITEM",
            Self::NoRecoveryJournal { .. } => "NO_RECOVERY_JOURNAL",
            Self::AlreadyRunning => "SYNC_ALREADY_RUNNING",
            Self::MalformedJournal { .. } => "MALFORMED_JOURNAL",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Aborted { source, .. } => source.code(),
        }
    }

    /// Create a filesystem error for the given operation and path.
    pub fn fs(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    /// Create a source-unavailable error from an underlying I/O failure.
    pub fn source_unavailable(path: impl Into<PathBuf>, source: &io::Error) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            message: format!("{source}{}", os_hint(source)),
        }
    }

    /// Whether the retry kernel may re-run the failed operation.
    ///
    /// Only transient OS conditions qualify; semantic failures (conflicts,
    /// rollback trouble, cancellation) never do.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Filesystem { source, .. }
            | Self::DestinationUnavailable { source, .. }
            | Self::CopyFailed { source, .. } => is_recoverable_io(source),
            _ => false,
        }
    }

    /// Wrap a run-aborting error with the partial result of the run.
    pub fn into_aborted(self, partial_result: SyncReport) -> Self {
        match self {
            // never double-wrap
            Self::Aborted { source, .. } => Self::Aborted {
                source,
                partial_result: Box::new(partial_result),
            },
            other => Self::Aborted {
                source: Box::new(other),
                partial_result: Box::new(partial_result),
            },
        }
    }

    /// Partial result attached to a run-aborting error, if any.
    pub fn partial_result(&self) -> Option<&SyncReport> {
        match self {
            Self::Aborted { partial_result, .. } => Some(partial_result),
            _ => None,
        }
    }

    /// Whether this error (or the error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Aborted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// OS codes the retry kernel treats as transient.
#[cfg(unix)]
fn is_recoverable_io(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBUSY)
            | Some(libc::EMFILE)
            | Some(libc::ENFILE)
            | Some(libc::EIO)
            | Some(libc::ENOENT)
            | Some(libc::ENOTCONN)
            | Some(libc::EAGAIN)
            | Some(libc::ETIMEDOUT)
    )
}

#[cfg(not(unix))]
fn is_recoverable_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
    )
}

/// Short human hint for well-known OS codes, prefixed with a space so it can
/// be appended directly to a message. Empty for codes without a hint.
#[cfg(unix)]
pub fn os_hint(err: &io::Error) -> &'static str {
    match err.raw_os_error() {
        Some(libc::ENOSPC) => " No space left on destination device.",
        Some(libc::EACCES) | Some(libc::EPERM) => " Permission denied.",
        Some(libc::ENOENT) => " No such file or directory.",
        Some(libc::EROFS) => " Destination filesystem is read-only.",
        Some(libc::EMFILE) | Some(libc::ENFILE) => " Too many open files.",
        Some(libc::EBUSY) => " Resource is busy.",
        Some(libc::EIO) => " Low-level I/O error; check the device.",
        _ => "",
    }
}

#[cfg(not(unix))]
pub fn os_hint(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::PermissionDenied => " Permission denied.",
        io::ErrorKind::NotFound => " No such file or directory.",
        _ => "",
    }
}
