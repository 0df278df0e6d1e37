//! Public control surface: plan, sync, pause/cancel, recovery and resume

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::control::SyncControl;
use crate::error::{Result, SyncError};
use crate::journal::{self, JournalSummary};
use crate::planner::{self, PlanBundle, PlanItem};
use crate::progress::ProgressReporter;
use crate::runner::{self, SyncOptions, SyncReport};
use crate::scanner::ScanOptions;

/// One engine instance per process. Owns the shared cancel/pause flags and
/// enforces that only a single sync run is live at a time.
#[derive(Clone, Default)]
pub struct SyncEngine {
    control: SyncControl,
    running: Arc<AtomicBool>,
}

/// Releases the single-run latch on every exit path.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared control flags, for wiring into UIs or signal handlers.
    pub fn control(&self) -> SyncControl {
        self.control.clone()
    }

    /// Compare two roots and produce a copy plan.
    pub fn build_compare_plan(
        &self,
        left_root: &Path,
        right_root: &Path,
        scan_options: &ScanOptions,
    ) -> Result<PlanBundle> {
        planner::build_compare_plan(left_root, right_root, scan_options)
    }

    /// Run a plan bundle. Roots and planned directories flow from the
    /// bundle unless the caller already set them on the options.
    pub async fn sync(
        &self,
        bundle: PlanBundle,
        reporter: Option<ProgressReporter>,
        mut options: SyncOptions,
    ) -> Result<SyncReport> {
        if options.left_root.as_os_str().is_empty() {
            options.left_root = bundle.left_root;
        }
        if options.right_root.as_os_str().is_empty() {
            options.right_root = bundle.right_root;
        }
        if options.directories_to_create.is_empty() {
            options.directories_to_create = bundle.directories_to_create;
        }
        self.run(bundle.plan, reporter, options).await
    }

    /// Run bare plan items with fully caller-provided options.
    pub async fn sync_items(
        &self,
        plan: Vec<PlanItem>,
        reporter: Option<ProgressReporter>,
        options: SyncOptions,
    ) -> Result<SyncReport> {
        self.run(plan, reporter, options).await
    }

    /// Request cooperative cancellation of the live run.
    pub fn cancel_sync(&self) {
        info!("cancellation requested");
        self.control.cancel();
    }

    /// Flip the pause flag; returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        let paused = self.control.toggle_pause();
        info!(paused, "pause toggled");
        paused
    }

    /// Summarize the journal at `path`, or `None` when no sync is in
    /// progress there.
    pub async fn recovery_summary(&self, path: &Path) -> Result<Option<JournalSummary>> {
        Ok(journal::read(path).await?.map(|state| journal::summary(&state)))
    }

    /// Resume an interrupted run from its journal: roll back in-flight
    /// entries, persist, and re-run the pending remainder.
    pub async fn resume(
        &self,
        journal_path: &Path,
        reporter: Option<ProgressReporter>,
        mut options: SyncOptions,
    ) -> Result<SyncReport> {
        let Some(mut state) = journal::read(journal_path).await? else {
            return Err(SyncError::NoRecoveryJournal {
                path: journal_path.to_path_buf(),
            });
        };
        journal::recover_active(&mut state).await?;
        journal::write(journal_path, &mut state).await?;

        let pending = state.pending_items();
        if pending.is_empty() {
            journal::remove(journal_path).await?;
            info!(journal = %journal_path.display(), "nothing pending, journal removed");
            return Ok(SyncReport {
                left_root: state.left_root,
                right_root: state.right_root,
                resumed_from_journal: true,
                ..SyncReport::default()
            });
        }
        info!(
            journal = %journal_path.display(),
            pending = pending.len(),
            "resuming from journal"
        );

        options.left_root = state.left_root.clone();
        options.right_root = state.right_root.clone();
        options.directories_to_create = state.directories_to_create.clone();
        options.journal_path = journal_path.to_path_buf();
        options.resume_from_journal = true;
        let plan = state.plan.clone();
        options.journal_state = Some(state);

        self.run(plan, reporter, options).await
    }

    async fn run(
        &self,
        plan: Vec<PlanItem>,
        reporter: Option<ProgressReporter>,
        mut options: SyncOptions,
    ) -> Result<SyncReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = RunGuard(self.running.clone());
        self.control.reset();

        // engine flags OR caller-provided predicates
        let user_cancel = options.should_cancel.take();
        let engine_cancel = self.control.cancel_token();
        options.should_cancel = Some(Arc::new(move || {
            engine_cancel() || user_cancel.as_ref().is_some_and(|predicate| predicate())
        }));
        let user_pause = options.should_pause.take();
        let engine_pause = self.control.pause_token();
        options.should_pause = Some(Arc::new(move || {
            engine_pause() || user_pause.as_ref().is_some_and(|predicate| predicate())
        }));

        runner::run_sync(plan, reporter, options).await
    }
}
