//! Minimal end-to-end use of the engine: plan, sync, print the result.
//!
//! Usage: `cargo run --example basic_sync -- <left_root> <right_root>`

use std::path::PathBuf;

use lempicka_sync::{ProgressChannel, ScanOptions, SyncEngine, SyncOptions, SyncPhase};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let left: PathBuf = args.next().ok_or("missing <left_root>")?.into();
    let right: PathBuf = args.next().ok_or("missing <right_root>")?.into();

    let engine = SyncEngine::new();
    let bundle = engine.build_compare_plan(&left, &right, &ScanOptions::default())?;
    println!(
        "{} candidates, {} to copy, {} directories to create",
        bundle.total_candidates,
        bundle.pending_count,
        bundle.directories_to_create.len()
    );

    let (reporter, mut progress) = ProgressChannel::new();
    let printer = tokio::spawn(async move {
        while let Some(update) = progress.recv().await {
            match update.phase {
                SyncPhase::Copied => {
                    if let Some(path) = &update.target_relative_path {
                        println!("copied {} ({}/{})", path.display(), update.completed, update.total);
                    }
                }
                SyncPhase::Failed => {
                    if let Some(path) = &update.target_relative_path {
                        eprintln!("failed {}", path.display());
                    }
                }
                _ => {}
            }
        }
    });

    let report = engine
        .sync(bundle, Some(reporter), SyncOptions::default())
        .await?;
    printer.await?;

    println!(
        "done: {} of {} files, {} bytes in {} ms",
        report.copied, report.total, report.bytes_copied, report.duration_ms
    );
    Ok(())
}
