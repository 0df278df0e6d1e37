//! Cooperative cancel/pause signalling and bounded-backoff retry

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::{Result, SyncError};

/// Poll interval while paused.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(120);
/// Smallest permitted backoff base.
const MIN_RETRY_BASE: Duration = Duration::from_millis(50);
/// Slice size for backoff sleeps so cancellation can pre-empt them.
const CANCEL_POLL_SLICE: Duration = Duration::from_millis(50);

/// Boolean predicate polled at checkpoints.
pub type FlagPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared cancel/pause flags behind atomic booleans.
#[derive(Clone, Default)]
pub struct SyncControl {
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl SyncControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Flip the pause flag; returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Clear both flags at the start of a run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel_token(&self) -> FlagPredicate {
        let flag = self.cancelled.clone();
        Arc::new(move || flag.load(Ordering::SeqCst))
    }

    pub fn pause_token(&self) -> FlagPredicate {
        let flag = self.paused.clone();
        Arc::new(move || flag.load(Ordering::SeqCst))
    }
}

/// The cancel and pause predicates a run polls at every checkpoint.
#[derive(Clone)]
pub struct Checkpoints {
    should_cancel: FlagPredicate,
    should_pause: FlagPredicate,
}

impl Checkpoints {
    pub fn new(should_cancel: FlagPredicate, should_pause: FlagPredicate) -> Self {
        Self {
            should_cancel,
            should_pause,
        }
    }

    /// Checkpoints that never cancel or pause.
    pub fn never() -> Self {
        Self {
            should_cancel: Arc::new(|| false),
            should_pause: Arc::new(|| false),
        }
    }

    pub fn cancelled(&self) -> bool {
        (self.should_cancel)()
    }

    pub fn paused(&self) -> bool {
        (self.should_pause)()
    }

    /// Observe the flags. Raises `SYNC_CANCELLED` on cancel; while paused,
    /// polls in a bounded loop, invoking `on_paused_tick` each round so
    /// observers can surface the paused state.
    pub async fn checkpoint<F>(&self, mut on_paused_tick: F) -> Result<()>
    where
        F: FnMut(),
    {
        if self.cancelled() {
            return Err(SyncError::Cancelled);
        }
        while self.paused() {
            on_paused_tick();
            sleep(PAUSE_POLL_INTERVAL).await;
            if self.cancelled() {
                return Err(SyncError::Cancelled);
            }
        }
        Ok(())
    }
}

/// Context handed to retry observers before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// 1-based retry number about to run
    pub attempt: u32,
    pub delay: Duration,
    pub message: String,
}

/// Exponential-backoff retry for recoverable I/O failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries beyond the first try
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`: `max(50ms, base) * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.max(MIN_RETRY_BASE) * 2u32.saturating_pow(attempt)
    }

    /// Run `op` up to `max_attempts + 1` times. Only recoverable errors are
    /// retried; cancellation pre-empts both further tries and the backoff
    /// sleep. `on_retry` fires before each sleep.
    pub async fn run<T, F, Fut, C>(
        &self,
        checkpoints: &Checkpoints,
        mut on_retry: C,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: FnMut(&RetryEvent),
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.is_recoverable()
                        && attempt < self.max_attempts
                        && !checkpoints.cancelled() =>
                {
                    let delay = self.delay_for(attempt);
                    let event = RetryEvent {
                        attempt: attempt + 1,
                        delay,
                        message: err.to_string(),
                    };
                    on_retry(&event);
                    warn!(
                        attempt = event.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying recoverable failure"
                    );
                    sleep_cancellable(checkpoints, delay).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Sleep in slices, bailing out with `SYNC_CANCELLED` as soon as the cancel
/// flag is observed.
pub async fn sleep_cancellable(checkpoints: &Checkpoints, total: Duration) -> Result<()> {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if checkpoints.cancelled() {
            return Err(SyncError::Cancelled);
        }
        let slice = remaining.min(CANCEL_POLL_SLICE);
        sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
    if checkpoints.cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}
