//! Sync run orchestration: directory creation, partitioned execution,
//! journal lifecycle, history logging and result assembly

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::control::{Checkpoints, FlagPredicate, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::history::HistoryLog;
use crate::journal::{self, FailedEntry, Journal, JournalState};
use crate::paths;
use crate::planner::PlanItem;
use crate::progress::ProgressReporter;
use crate::transaction::{run_copy_transaction, TransactionContext};

/// Files at or below this size may run through the worker pool.
pub const DEFAULT_SMALL_FILE_THRESHOLD: u64 = 4 * 1024 * 1024;
/// Default upper bound on the small-file worker pool.
pub const DEFAULT_MAX_PARALLEL_SMALL_FILES: usize = 3;

/// Options for a sync run
#[derive(Clone)]
pub struct SyncOptions {
    /// Source root; used for the history log. Empty disables logging.
    pub left_root: PathBuf,
    /// Destination root; plan items must stay inside it
    pub right_root: PathBuf,
    /// Destination directories to create before copying
    pub directories_to_create: Vec<PathBuf>,
    /// Cancel-token predicate polled at checkpoints
    pub should_cancel: Option<FlagPredicate>,
    /// Pause-token predicate polled at checkpoints
    pub should_pause: Option<FlagPredicate>,
    /// Collect failures and keep going; also enables small-file parallelism
    pub continue_on_error: bool,
    /// Max retry attempts for recoverable I/O
    pub retry_count: u32,
    /// Exponential-backoff base in milliseconds
    pub retry_base_delay_ms: u64,
    /// Partition boundary between small and large files
    pub small_file_threshold_bytes: u64,
    /// Upper bound on the small-file worker pool
    pub max_parallel_small_files: usize,
    /// Recovery journal location; empty disables durability
    pub journal_path: PathBuf,
    /// Re-hash destinations after copying and fail on mismatch
    pub verify_integrity: bool,
    /// Pre-recovered journal state, wired in by resume
    pub journal_state: Option<JournalState>,
    /// Whether this run continues an interrupted one
    pub resume_from_journal: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            left_root: PathBuf::new(),
            right_root: PathBuf::new(),
            directories_to_create: Vec::new(),
            should_cancel: None,
            should_pause: None,
            continue_on_error: false,
            retry_count: 2,
            retry_base_delay_ms: 300,
            small_file_threshold_bytes: DEFAULT_SMALL_FILE_THRESHOLD,
            max_parallel_small_files: DEFAULT_MAX_PARALLEL_SMALL_FILES,
            journal_path: PathBuf::new(),
            verify_integrity: false,
            journal_state: None,
            resume_from_journal: false,
        }
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("left_root", &self.left_root)
            .field("right_root", &self.right_root)
            .field("directories_to_create", &self.directories_to_create)
            .field("has_cancel_token", &self.should_cancel.is_some())
            .field("has_pause_token", &self.should_pause.is_some())
            .field("continue_on_error", &self.continue_on_error)
            .field("retry_count", &self.retry_count)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("small_file_threshold_bytes", &self.small_file_threshold_bytes)
            .field("max_parallel_small_files", &self.max_parallel_small_files)
            .field("journal_path", &self.journal_path)
            .field("verify_integrity", &self.verify_integrity)
            .field("resume_from_journal", &self.resume_from_journal)
            .finish()
    }
}

/// Outcome of a sync run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Transactions committed by this run
    pub copied: usize,
    /// Pending items this run set out to copy
    pub total: usize,
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub failed: Vec<FailedEntry>,
    /// Target relative paths committed by this run
    pub succeeded_files: Vec<PathBuf>,
    pub duration_ms: u64,
    pub average_throughput_bps: f64,
    pub left_root: PathBuf,
    pub right_root: PathBuf,
    pub resumed_from_journal: bool,
}

struct RunContext {
    options: SyncOptions,
    checkpoints: Checkpoints,
    retry: RetryPolicy,
    journal: Arc<Journal>,
    history: Option<Arc<HistoryLog>>,
    reporter: ProgressReporter,
    abort: Arc<AtomicBool>,
    tally: Mutex<Tally>,
}

#[derive(Default)]
struct Tally {
    copied: usize,
    bytes_copied: u64,
    succeeded_files: Vec<PathBuf>,
    failed: Vec<FailedEntry>,
}

/// Execute a plan. Run-aborting errors come back wrapped with the partial
/// result of whatever was accomplished; the journal file survives an abort
/// so a later `resume` can pick the run up.
pub async fn run_sync(
    plan: Vec<PlanItem>,
    reporter: Option<ProgressReporter>,
    mut options: SyncOptions,
) -> Result<SyncReport> {
    let started = Instant::now();
    let reporter = reporter.unwrap_or_else(ProgressReporter::sink);

    validate_plan(&plan, &options)?;
    let mut plan = plan;
    fill_missing_sizes(&mut plan).await?;

    // cancel = user predicate OR the internal abort latch the pool uses to
    // wind down siblings after a fatal error
    let abort = Arc::new(AtomicBool::new(false));
    let user_cancel = options.should_cancel.clone();
    let abort_flag = abort.clone();
    let should_cancel: FlagPredicate = Arc::new(move || {
        abort_flag.load(Ordering::SeqCst)
            || user_cancel.as_ref().is_some_and(|predicate| predicate())
    });
    let should_pause = options
        .should_pause
        .clone()
        .unwrap_or_else(|| Arc::new(|| false));
    let checkpoints = Checkpoints::new(should_cancel, should_pause);

    let retry = RetryPolicy {
        max_attempts: options.retry_count,
        base_delay: Duration::from_millis(options.retry_base_delay_ms),
    };

    let journal_path =
        (!options.journal_path.as_os_str().is_empty()).then(|| options.journal_path.clone());
    let resumed_from_journal = options.resume_from_journal;
    let state = match options.journal_state.take() {
        // resume wiring: recovery already ran
        Some(state) => state,
        None => match &journal_path {
            Some(path) => match journal::read(path).await? {
                Some(mut loaded) => {
                    info!(journal = %path.display(), "found leftover journal, recovering");
                    journal::recover_active(&mut loaded).await?;
                    // adopt the caller's plan; keep the recorded progress
                    loaded.plan = plan.clone();
                    loaded.total_bytes = plan.iter().map(|item| item.source_size).sum();
                    loaded.directories_to_create = options.directories_to_create.clone();
                    loaded
                }
                None => fresh_state(&plan, &options),
            },
            None => fresh_state(&plan, &options),
        },
    };

    let journal = Arc::new(Journal::new(journal_path, state));
    journal.persist().await?;

    let history = if options.left_root.as_os_str().is_empty() {
        None
    } else {
        Some(Arc::new(HistoryLog::open(&options.left_root).await?))
    };

    let completed = journal.snapshot().await.completed_target_paths;
    let pending: Vec<(usize, PlanItem)> = plan
        .iter()
        .filter(|item| !completed.contains(&journal::key_for(&item.target_path)))
        .cloned()
        .enumerate()
        .collect();
    let total = pending.len();
    let total_bytes: u64 = pending.iter().map(|(_, item)| item.source_size).sum();

    info!(
        total,
        total_bytes,
        resumed = resumed_from_journal,
        continue_on_error = options.continue_on_error,
        "sync run starting"
    );
    reporter.begin_run(total, total_bytes, 0);

    let ctx = Arc::new(RunContext {
        options,
        checkpoints,
        retry,
        journal,
        history,
        reporter,
        abort,
        tally: Mutex::new(Tally::default()),
    });

    let outcome = execute(ctx.clone(), pending).await;
    let report = build_report(&ctx, total, total_bytes, started, resumed_from_journal);

    match outcome {
        Ok(()) => {
            if report.failed.is_empty() {
                ctx.journal.remove_file().await?;
            } else {
                // keep the journal so the failed remainder can be resumed
                warn!(failed = report.failed.len(), "run finished with failures");
            }
            ctx.reporter.complete();
            info!(
                copied = report.copied,
                bytes = report.bytes_copied,
                duration_ms = report.duration_ms,
                "sync run complete"
            );
            Ok(report)
        }
        Err(err) => {
            // all journal writes were awaited; the file stays for resume
            warn!(error = %err, copied = report.copied, "sync run aborted");
            Err(err.into_aborted(report))
        }
    }
}

fn fresh_state(plan: &[PlanItem], options: &SyncOptions) -> JournalState {
    JournalState::new(
        options.left_root.clone(),
        options.right_root.clone(),
        plan.to_vec(),
        options.directories_to_create.clone(),
    )
}

async fn execute(ctx: Arc<RunContext>, pending: Vec<(usize, PlanItem)>) -> Result<()> {
    create_directories(&ctx).await?;

    let threshold = ctx.options.small_file_threshold_bytes;
    let (small, large): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .partition(|(_, item)| item.source_size <= threshold);

    // strict runs stay sequential so fail-fast ordering holds
    let parallel = ctx.options.continue_on_error
        && ctx.options.max_parallel_small_files > 1
        && small.len() > 1;

    if parallel {
        let pool_size = ctx.options.max_parallel_small_files.min(small.len());
        debug!(pool_size, files = small.len(), "running small-file pool");
        let semaphore = Arc::new(Semaphore::new(pool_size));
        let mut handles = Vec::new();
        for (index, item) in small {
            if ctx.checkpoints.cancelled() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                run_item(&ctx, &item, index).await
            }));
        }

        let mut fatal: Option<SyncError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    ctx.abort.store(true, Ordering::SeqCst);
                    fatal.get_or_insert(err);
                }
                Err(join_err) => {
                    ctx.abort.store(true, Ordering::SeqCst);
                    fatal.get_or_insert_with(|| {
                        SyncError::fs(
                            "joining copy worker",
                            ctx.options.right_root.clone(),
                            std::io::Error::other(join_err),
                        )
                    });
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        if ctx.checkpoints.cancelled() {
            return Err(SyncError::Cancelled);
        }
    } else {
        for (index, item) in small {
            if ctx.checkpoints.cancelled() {
                return Err(SyncError::Cancelled);
            }
            run_item(&ctx, &item, index).await?;
        }
    }

    // large files run alone; they saturate disk bandwidth by themselves
    for (index, item) in large {
        if ctx.checkpoints.cancelled() {
            return Err(SyncError::Cancelled);
        }
        run_item(&ctx, &item, index).await?;
    }
    Ok(())
}

/// One plan item under the retry wrapper; bookkeeping on either outcome.
async fn run_item(ctx: &RunContext, item: &PlanItem, index: usize) -> Result<()> {
    ctx.reporter.item_started();
    let result = {
        let tx = TransactionContext {
            journal: ctx.journal.as_ref(),
            checkpoints: &ctx.checkpoints,
            reporter: &ctx.reporter,
            index,
            verify_integrity: ctx.options.verify_integrity,
        };
        ctx.retry
            .run(
                &ctx.checkpoints,
                |event| ctx.reporter.retrying(item, index, event),
                |attempt| run_copy_transaction(item, attempt, &tx),
            )
            .await
    };
    ctx.reporter.item_finished();

    match result {
        Ok(bytes) => {
            if let Some(history) = &ctx.history {
                history.append(&item.source_path, &item.target_path).await?;
            }
            {
                let mut tally = ctx.tally.lock();
                tally.copied += 1;
                tally.bytes_copied += bytes;
                tally
                    .succeeded_files
                    .push(item.target_relative_path.clone());
            }
            ctx.reporter.copied(item, index);
            Ok(())
        }
        // cancellation and restore trouble abort the run in every mode
        Err(err @ SyncError::Cancelled) => Err(err),
        Err(err @ SyncError::RestoreFailed { .. }) => Err(err),
        Err(err) => {
            let failed_entry = FailedEntry {
                target_path: item.target_path.clone(),
                target_relative_path: item.target_relative_path.clone(),
                code: err.code().to_string(),
                message: err.to_string(),
                at: Utc::now(),
            };
            ctx.journal.record_failure(failed_entry.clone()).await?;
            ctx.tally.lock().failed.push(failed_entry);
            ctx.reporter.failed(item, index, err.to_string());
            if ctx.options.continue_on_error {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

async fn create_directories(ctx: &RunContext) -> Result<()> {
    let directories = ctx.journal.directories_to_create().await;
    if directories.is_empty() {
        return Ok(());
    }
    for dir in &directories {
        let absolute = if ctx.options.right_root.as_os_str().is_empty() {
            dir.clone()
        } else {
            ctx.options.right_root.join(dir)
        };
        ctx.retry
            .run(&ctx.checkpoints, |_event| {}, |_attempt| {
                let absolute = absolute.clone();
                async move {
                    fs::create_dir_all(&absolute)
                        .await
                        .map_err(|e| SyncError::fs("creating directory", absolute.clone(), e))
                }
            })
            .await?;
        debug!(directory = %absolute.display(), "created");
    }
    ctx.journal.clear_directories().await
}

fn validate_plan(plan: &[PlanItem], options: &SyncOptions) -> Result<()> {
    let mut seen = BTreeSet::new();
    for item in plan {
        if item.source_path.as_os_str().is_empty() {
            return Err(SyncError::InvalidPlanItem {
                path: item.target_path.clone(),
                message: "empty source path".to_string(),
            });
        }
        if item.target_path.as_os_str().is_empty() {
            return Err(SyncError::InvalidPlanItem {
                path: item.source_path.clone(),
                message: "empty target path".to_string(),
            });
        }
        paths::normalize_relative(&item.target_relative_path)?;
        if !options.right_root.as_os_str().is_empty()
            && !paths::is_path_within(&options.right_root, &item.target_path)
        {
            return Err(SyncError::InvalidPlanItem {
                path: item.target_path.clone(),
                message: "target escapes the destination root".to_string(),
            });
        }
        if !seen.insert(item.target_path.clone()) {
            return Err(SyncError::InvalidPlan(format!(
                "duplicate target path '{}'",
                item.target_path.display()
            )));
        }
    }
    Ok(())
}

/// A zero source size can come from a hand-edited or older journal; a stat
/// both fills it and confirms the source is still there.
async fn fill_missing_sizes(plan: &mut [PlanItem]) -> Result<()> {
    for item in plan.iter_mut() {
        if item.source_size == 0 {
            let meta = fs::metadata(&item.source_path)
                .await
                .map_err(|e| SyncError::source_unavailable(&item.source_path, &e))?;
            item.source_size = meta.len();
        }
    }
    Ok(())
}

fn build_report(
    ctx: &RunContext,
    total: usize,
    total_bytes: u64,
    started: Instant,
    resumed_from_journal: bool,
) -> SyncReport {
    let tally = ctx.tally.lock();
    let duration = started.elapsed();
    let average_throughput_bps = if duration.as_secs_f64() > 0.0 {
        tally.bytes_copied as f64 / duration.as_secs_f64()
    } else {
        0.0
    };
    SyncReport {
        copied: tally.copied,
        total,
        bytes_copied: tally.bytes_copied,
        total_bytes,
        failed: tally.failed.clone(),
        succeeded_files: tally.succeeded_files.clone(),
        duration_ms: duration.as_millis() as u64,
        average_throughput_bps,
        left_root: ctx.options.left_root.clone(),
        right_root: ctx.options.right_root.clone(),
        resumed_from_journal,
    }
}
