//! Trailing-edge debounce for outgoing writes.
//!
//! Every [`schedule`](DebounceScheduler::schedule) supersedes the previous
//! pending value and restarts the quiet-period timer, so a burst of edits
//! collapses into one write carrying the last value.
//!
//! ```text
//!  edit "h"   edit "he"   edit "hel"          fire("hel")
//!     │          │           │                    │
//! ────┴──────────┴───────────┴──── 300ms quiet ───┴────▶ t
//!     └ timer 1 ─┘ aborted   └──── timer 3 ───────┘
//!                └ timer 2 ──┘ aborted
//! ```
//!
//! The pending write is an explicit token (generation number + timer task).
//! A timer only fires if its generation is still the pending one, which
//! closes the window where an aborted timer has already woken up.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Default quiet period before a pending write fires.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Callback invoked with the final value of a burst.
pub type FireFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// The value waiting for its timer.
struct Pending<T> {
    generation: u64,
    value: T,
}

/// Handle to the timer task of the outstanding token.
struct PendingToken {
    generation: u64,
    timer: JoinHandle<()>,
}

/// Coalesces rapid values into a single delayed callback.
pub struct DebounceScheduler<T> {
    fire: FireFn<T>,
    slot: Arc<Mutex<Option<Pending<T>>>>,
    token: Option<PendingToken>,
    next_generation: u64,
    fired: Arc<AtomicU64>,
    superseded: u64,
}

impl<T: Send + 'static> DebounceScheduler<T> {
    /// Create a scheduler that runs `fire` with the last value of each burst.
    ///
    /// The fired future is spawned on its own task: cancelling the scheduler
    /// afterwards does not interrupt it.
    pub fn new<F, Fut>(fire: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_fn(Arc::new(move |value| -> BoxFuture<'static, ()> {
            Box::pin(fire(value))
        }))
    }

    /// Create a scheduler from an already boxed callback.
    pub fn from_fn(fire: FireFn<T>) -> Self {
        Self {
            fire,
            slot: Arc::new(Mutex::new(None)),
            token: None,
            next_generation: 0,
            fired: Arc::new(AtomicU64::new(0)),
            superseded: 0,
        }
    }

    /// Record `value` as pending and (re)start the timer.
    ///
    /// Any earlier pending value is dropped without firing.
    pub fn schedule(&mut self, value: T, delay: Duration) {
        let generation = self.next_generation;
        self.next_generation += 1;

        if let Some(previous) = self.token.take() {
            previous.timer.abort();
            self.superseded += 1;
            log::trace!("Debounce token {} superseded by {generation}", previous.generation);
        }

        *self.slot.lock() = Some(Pending { generation, value });

        let slot = self.slot.clone();
        let fire = self.fire.clone();
        let fired = self.fired.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let value = {
                let mut slot = slot.lock();
                if slot.as_ref().map(|p| p.generation) != Some(generation) {
                    return;
                }
                match slot.take() {
                    Some(pending) => pending.value,
                    None => return,
                }
            };

            fired.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(fire(value));
        });

        self.token = Some(PendingToken { generation, timer });
    }

    /// Abort the pending timer without firing.
    ///
    /// Returns `true` if a value was pending.
    pub fn cancel(&mut self) -> bool {
        let had_value = self.slot.lock().take().is_some();
        if let Some(token) = self.token.take() {
            token.timer.abort();
        }
        had_value
    }

    /// Whether a value is waiting for its timer.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Number of callbacks fired so far.
    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Number of pending values dropped because a newer one arrived.
    pub fn superseded_count(&self) -> u64 {
        self.superseded
    }
}

impl<T> Drop for DebounceScheduler<T> {
    fn drop(&mut self) {
        self.slot.lock().take();
        if let Some(token) = self.token.take() {
            token.timer.abort();
        }
    }
}
