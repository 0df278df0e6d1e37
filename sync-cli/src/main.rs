//! Command-line control surface for the Lempicka sync engine

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lempicka_sync::{
    ProgressChannel, ProgressUpdate, ScanOptions, SyncEngine, SyncOptions, SyncPhase, SyncReport,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lempicka")]
#[command(about = "One-way sync of versioned source trees")]
#[command(version)]
struct Cli {
    /// Verbose output (shorthand for RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the compare plan without copying anything
    Plan {
        left: PathBuf,
        right: PathBuf,
        #[command(flatten)]
        scan: ScanArgs,
        /// Emit the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Synchronize the destination tree from the source tree
    Sync {
        left: PathBuf,
        right: PathBuf,
        #[command(flatten)]
        scan: ScanArgs,
        #[command(flatten)]
        run: RunArgs,
        /// Emit the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resume an interrupted run from its recovery journal
    Resume {
        journal: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        /// Emit the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the recovery summary for a journal
    Status { journal: PathBuf },
}

#[derive(Args)]
struct ScanArgs {
    /// Glob pattern to exclude from the scan (repeatable)
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,
}

#[derive(Args)]
struct RunArgs {
    /// Collect failures and keep going instead of aborting on the first one
    #[arg(long)]
    continue_on_error: bool,

    /// Upper bound on the small-file worker pool
    #[arg(long, value_name = "N")]
    parallel: Option<usize>,

    /// Recovery journal path (enables resumable runs)
    #[arg(long, value_name = "PATH")]
    journal: Option<PathBuf>,

    /// Re-hash destinations after copying and fail on mismatch
    #[arg(long)]
    verify: bool,

    /// Max retry attempts for recoverable I/O errors
    #[arg(long, value_name = "N")]
    retries: Option<u32>,
}

impl RunArgs {
    fn apply(&self, options: &mut SyncOptions) {
        options.continue_on_error = self.continue_on_error;
        options.verify_integrity = self.verify;
        if let Some(parallel) = self.parallel {
            options.max_parallel_small_files = parallel;
        }
        if let Some(journal) = &self.journal {
            options.journal_path = journal.clone();
        }
        if let Some(retries) = self.retries {
            options.retry_count = retries;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Plan {
            left,
            right,
            scan,
            json,
        } => {
            let engine = SyncEngine::new();
            let bundle = engine.build_compare_plan(&left, &right, &scan_options(&scan))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&bundle)?);
            } else {
                for item in &bundle.plan {
                    println!(
                        "{} -> {} ({} bytes, v{})",
                        item.source_relative_path.display(),
                        item.target_relative_path.display(),
                        item.source_size,
                        item.version
                    );
                }
                println!(
                    "{} candidates, {} to copy, {} directories to create",
                    bundle.total_candidates,
                    bundle.pending_count,
                    bundle.directories_to_create.len()
                );
            }
        }

        Commands::Sync {
            left,
            right,
            scan,
            run,
            json,
        } => {
            let engine = Arc::new(SyncEngine::new());
            let bundle = engine.build_compare_plan(&left, &right, &scan_options(&scan))?;

            let mut options = SyncOptions::default();
            run.apply(&mut options);

            install_cancel_handler(engine.clone());
            let (reporter, channel) = ProgressChannel::new();
            let printer = tokio::spawn(print_progress(channel, json));

            let result = engine.sync(bundle, Some(reporter), options).await;
            printer.await.context("progress printer failed")?;
            finish(result, json)?;
        }

        Commands::Resume { journal, run, json } => {
            let engine = Arc::new(SyncEngine::new());
            let mut options = SyncOptions::default();
            run.apply(&mut options);

            install_cancel_handler(engine.clone());
            let (reporter, channel) = ProgressChannel::new();
            let printer = tokio::spawn(print_progress(channel, json));

            let result = engine.resume(&journal, Some(reporter), options).await;
            printer.await.context("progress printer failed")?;
            finish(result, json)?;
        }

        Commands::Status { journal } => {
            let engine = SyncEngine::new();
            match engine.recovery_summary(&journal).await? {
                None => println!("no sync in progress at {}", journal.display()),
                Some(summary) => {
                    println!("left:      {}", summary.left_root.display());
                    println!("right:     {}", summary.right_root.display());
                    println!("total:     {}", summary.total);
                    println!("completed: {}", summary.completed);
                    println!("pending:   {}", summary.pending);
                    println!("failed:    {}", summary.failed_count);
                    println!("active:    {}", summary.active_count);
                    println!("updated:   {}", summary.updated_at);
                }
            }
        }
    }
    Ok(())
}

fn scan_options(args: &ScanArgs) -> ScanOptions {
    ScanOptions {
        exclude_patterns: args.exclude.clone(),
    }
}

/// First Ctrl-C cancels cooperatively; a second one kills the process.
fn install_cancel_handler(engine: Arc<SyncEngine>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling; press Ctrl-C again to force quit");
            engine.cancel_sync();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });
}

async fn print_progress(mut channel: ProgressChannel, json: bool) {
    while let Some(update) = channel.recv().await {
        if json {
            continue; // JSON mode prints only the final report
        }
        render(&update);
        if update.phase == SyncPhase::Complete {
            break;
        }
    }
}

fn render(update: &ProgressUpdate) {
    let path = update
        .target_relative_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    match update.phase {
        SyncPhase::Starting => {
            println!("syncing {} files ({} bytes)", update.total, update.total_bytes);
        }
        SyncPhase::Copying => {
            println!(
                "  copying {path} {}/{} bytes ({:.1} MB/s)",
                update.current_file_bytes,
                update.current_file_total_bytes,
                update.throughput_bps / (1024.0 * 1024.0)
            );
        }
        SyncPhase::Copied => {
            println!("  copied {path} ({}/{})", update.completed, update.total);
        }
        SyncPhase::Failed => {
            eprintln!(
                "  failed {path}: {}",
                update.message.as_deref().unwrap_or("unknown error")
            );
        }
        SyncPhase::Paused => println!("  paused at {path}"),
        SyncPhase::Retrying => {
            println!(
                "  retry {} for {path}: {}",
                update.retry_attempt,
                update.message.as_deref().unwrap_or("")
            );
        }
        SyncPhase::Complete => {
            println!(
                "complete: {}/{} files, {} failed",
                update.completed, update.total, update.failed_count
            );
        }
    }
}

fn finish(result: lempicka_sync::Result<SyncReport>, json: bool) -> Result<()> {
    match result {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} of {} files copied, {} bytes in {} ms{}",
                    report.copied,
                    report.total,
                    report.bytes_copied,
                    report.duration_ms,
                    if report.resumed_from_journal {
                        " (resumed)"
                    } else {
                        ""
                    }
                );
                for failure in &report.failed {
                    eprintln!(
                        "failed: {} [{}] {}",
                        failure.target_relative_path.display(),
                        failure.code,
                        failure.message
                    );
                }
            }
            if report.failed.is_empty() {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Err(err) => {
            if let Some(partial) = err.partial_result() {
                eprintln!(
                    "aborted after {} of {} files: [{}] {err}",
                    partial.copied,
                    partial.total,
                    err.code()
                );
            }
            Err(err).context("sync failed")
        }
    }
}
