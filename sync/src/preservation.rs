//! Best-effort timestamp preservation for committed copies
//!
//! A committed transaction carries the source's timestamps onto the fresh
//! destination file. Creation dates are only settable where the platform
//! exposes them; elsewhere the access/modification pair is the closest the
//! OS allows. Failure here never affects the surrounding transaction.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Copy the source's timestamps onto the freshly written target.
pub fn preserve_creation_date(source: &Path, target: &Path) {
    if let Err(e) = try_preserve(source, target) {
        debug!(
            source = %source.display(),
            target = %target.display(),
            error = %e,
            "timestamp preservation skipped"
        );
    }
}

fn try_preserve(source: &Path, target: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(source)?;
    let modified = metadata.modified()?;
    let accessed = metadata.accessed().unwrap_or(modified);
    utime::set_file_times(target, epoch_secs(accessed), epoch_secs(modified))?;
    Ok(())
}

fn epoch_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}
