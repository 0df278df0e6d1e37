//! Progress reporting for sync runs
//!
//! Events flow through an unbounded channel; emission never blocks the
//! copy pipeline and is dropped silently when nobody is listening.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::control::RetryEvent;
use crate::planner::PlanItem;

/// Minimum spacing between `copying` events for one run.
pub const COPYING_EMIT_INTERVAL: Duration = Duration::from_millis(250);
/// Throughput is computed over at least this much history.
const THROUGHPUT_WINDOW_MIN: Duration = Duration::from_secs(1);
/// Samples older than this are dropped from the throughput window.
const THROUGHPUT_WINDOW_MAX: Duration = Duration::from_secs(5);

/// Phase of a progress update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Run accepted; totals are known
    Starting,
    /// A chunk of the current file landed (throttled)
    Copying,
    /// A transaction committed
    Copied,
    /// A transaction failed
    Failed,
    /// The run is paused at a checkpoint
    Paused,
    /// A recoverable failure is about to be retried
    Retrying,
    /// The run finished
    Complete,
}

/// One progress update emitted by a sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub phase: SyncPhase,
    pub session_id: Uuid,
    pub current_index: usize,
    pub completed: usize,
    pub failed_count: usize,
    pub total: usize,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub throughput_bps: f64,
    pub target_relative_path: Option<PathBuf>,
    pub current_file_bytes: u64,
    pub current_file_total_bytes: u64,
    pub active_count: usize,
    pub is_paused: bool,
    /// 1-based retry number for `retrying` events; 0 otherwise
    pub retry_attempt: u32,
    pub message: Option<String>,
}

/// Receiving side of the progress stream
pub struct ProgressChannel {
    receiver: mpsc::UnboundedReceiver<ProgressUpdate>,
}

impl ProgressChannel {
    /// Create a reporter/channel pair.
    pub fn new() -> (ProgressReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ProgressReporter::new(sender), Self { receiver })
    }

    /// Receive the next progress event.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        self.receiver.recv().await
    }

    /// Receive without blocking; `None` when the buffer is empty.
    pub fn try_recv(&mut self) -> Option<ProgressUpdate> {
        self.receiver.try_recv().ok()
    }
}

struct ReporterState {
    completed: usize,
    failed_count: usize,
    total: usize,
    total_bytes: u64,
    bytes_transferred: u64,
    active_count: usize,
    last_copying_emit: Option<Instant>,
    // (when, cumulative bytes) samples for the sliding throughput window
    window: VecDeque<(Instant, u64)>,
}

/// Sending side of the progress stream. Cheap to clone; all clones share
/// counters, so the `completed` count stays monotonic across the worker
/// pool.
#[derive(Clone)]
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
    session_id: Uuid,
    state: Arc<Mutex<ReporterState>>,
}

impl ProgressReporter {
    fn new(sender: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            sender,
            session_id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(ReporterState {
                completed: 0,
                failed_count: 0,
                total: 0,
                total_bytes: 0,
                bytes_transferred: 0,
                active_count: 0,
                last_copying_emit: None,
                window: VecDeque::new(),
            })),
        }
    }

    /// Reporter whose events go nowhere; counters still accumulate.
    pub fn sink() -> Self {
        let (sender, _receiver) = mpsc::unbounded_channel();
        Self::new(sender)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Seed the run totals; `already_transferred` carries bytes from a
    /// resumed journal.
    pub fn begin_run(&self, total: usize, total_bytes: u64, already_transferred: u64) {
        {
            let mut state = self.state.lock();
            state.total = total;
            state.total_bytes = total_bytes;
            state.bytes_transferred = already_transferred;
        }
        self.emit(SyncPhase::Starting, None, 0, 0, 0, false, 0, None);
    }

    pub fn item_started(&self) {
        self.state.lock().active_count += 1;
    }

    pub fn item_finished(&self) {
        let mut state = self.state.lock();
        state.active_count = state.active_count.saturating_sub(1);
    }

    /// Account a copied chunk and emit a throttled `copying` event.
    pub fn copying(&self, item: &PlanItem, index: usize, file_bytes: u64, chunk_len: u64) {
        let now = Instant::now();
        let should_emit = {
            let mut state = self.state.lock();
            state.bytes_transferred += chunk_len;
            let cumulative = state.bytes_transferred;
            state.window.push_back((now, cumulative));
            while let Some((when, _)) = state.window.front() {
                if now.duration_since(*when) > THROUGHPUT_WINDOW_MAX {
                    state.window.pop_front();
                } else {
                    break;
                }
            }
            match state.last_copying_emit {
                Some(last) if now.duration_since(last) < COPYING_EMIT_INTERVAL => false,
                _ => {
                    state.last_copying_emit = Some(now);
                    true
                }
            }
        };
        if should_emit {
            self.emit(
                SyncPhase::Copying,
                Some(item.target_relative_path.clone()),
                index,
                file_bytes,
                item.source_size,
                false,
                0,
                None,
            );
        }
    }

    pub fn copied(&self, item: &PlanItem, index: usize) {
        self.state.lock().completed += 1;
        self.emit(
            SyncPhase::Copied,
            Some(item.target_relative_path.clone()),
            index,
            item.source_size,
            item.source_size,
            false,
            0,
            None,
        );
    }

    pub fn failed(&self, item: &PlanItem, index: usize, message: String) {
        self.state.lock().failed_count += 1;
        self.emit(
            SyncPhase::Failed,
            Some(item.target_relative_path.clone()),
            index,
            0,
            item.source_size,
            false,
            0,
            Some(message),
        );
    }

    pub fn paused(&self, item: &PlanItem, index: usize) {
        self.emit(
            SyncPhase::Paused,
            Some(item.target_relative_path.clone()),
            index,
            0,
            item.source_size,
            true,
            0,
            None,
        );
    }

    pub fn retrying(&self, item: &PlanItem, index: usize, event: &RetryEvent) {
        self.emit(
            SyncPhase::Retrying,
            Some(item.target_relative_path.clone()),
            index,
            0,
            item.source_size,
            false,
            event.attempt,
            Some(event.message.clone()),
        );
    }

    pub fn complete(&self) {
        self.emit(SyncPhase::Complete, None, 0, 0, 0, false, 0, None);
    }

    /// Bytes accounted so far, including any resumed offset.
    pub fn bytes_transferred(&self) -> u64 {
        self.state.lock().bytes_transferred
    }

    /// Throughput over the sliding window, in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        let state = self.state.lock();
        throughput(&state.window)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        phase: SyncPhase,
        target_relative_path: Option<PathBuf>,
        current_index: usize,
        current_file_bytes: u64,
        current_file_total_bytes: u64,
        is_paused: bool,
        retry_attempt: u32,
        message: Option<String>,
    ) {
        let update = {
            let state = self.state.lock();
            ProgressUpdate {
                phase,
                session_id: self.session_id,
                current_index,
                completed: state.completed,
                failed_count: state.failed_count,
                total: state.total,
                total_bytes: state.total_bytes,
                bytes_transferred: state.bytes_transferred,
                throughput_bps: throughput(&state.window),
                target_relative_path,
                current_file_bytes,
                current_file_total_bytes,
                active_count: state.active_count,
                is_paused,
                retry_attempt,
                message,
            }
        };
        // nobody listening is fine
        let _ = self.sender.send(update);
    }
}

fn throughput(window: &VecDeque<(Instant, u64)>) -> f64 {
    let (Some((first_at, first_bytes)), Some((last_at, last_bytes))) =
        (window.front(), window.back())
    else {
        return 0.0;
    };
    let span = last_at.duration_since(*first_at).max(THROUGHPUT_WINDOW_MIN);
    (last_bytes - first_bytes) as f64 / span.as_secs_f64()
}
