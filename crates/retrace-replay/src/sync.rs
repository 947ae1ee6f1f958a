//! Cross-queue synchronization and cancellation.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

type Waker = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

/// Cooperative cancellation for a replay run. Clones share state.
///
/// Cancelling stops feeding and dispatching and wakes every suspended waiter; adapter calls
/// already in flight run to completion and teardown still happens.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        for wake in lock(&self.0.wakers).iter() {
            wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Runs `wake` on cancellation, or right away if already cancelled.
    pub(crate) fn on_cancel(&self, wake: impl Fn() + Send + Sync + 'static) {
        let mut wakers = lock(&self.0.wakers);
        if self.is_cancelled() {
            wake();
        }
        wakers.push(Box::new(wake));
    }

    pub(crate) fn clear_wakers(&self) {
        lock(&self.0.wakers).clear();
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Ready,
    /// The run is stopping (abort or cancellation).
    Stopped,
    /// Every live worker is blocked, no more input will arrive and `token` is still unsignaled.
    Deadlock { token: u64 },
}

#[derive(Debug, Default)]
struct BoardState {
    signaled: HashSet<u64>,
    /// Queue workers that have been started and have not exited.
    active: usize,
    /// Workers suspended in `wait_for`.
    blocked: usize,
    input_closed: bool,
    stop: bool,
}

/// Signaled wait/signal tokens shared by the queue workers.
#[derive(Debug, Default)]
pub(crate) struct TokenBoard {
    state: Mutex<BoardState>,
    changed: Condvar,
}

impl TokenBoard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Suspends until every token in `tokens` has been signaled.
    pub(crate) fn wait_for(&self, tokens: &[u64]) -> WaitOutcome {
        let mut state = lock(&self.state);
        state.blocked += 1;
        let outcome = loop {
            if state.stop {
                break WaitOutcome::Stopped;
            }
            let Some(&missing) = tokens.iter().find(|t| !state.signaled.contains(*t)) else {
                break WaitOutcome::Ready;
            };
            if state.input_closed && state.blocked >= state.active {
                break WaitOutcome::Deadlock { token: missing };
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        };
        state.blocked -= 1;
        outcome
    }

    pub(crate) fn signal(&self, tokens: &[u64]) {
        if tokens.is_empty() {
            return;
        }
        lock(&self.state).signaled.extend(tokens.iter().copied());
        self.changed.notify_all();
    }

    /// Must be called before the worker thread is spawned so that a fast sibling cannot observe
    /// a transiently low worker count.
    pub(crate) fn worker_started(&self) {
        lock(&self.state).active += 1;
    }

    pub(crate) fn worker_finished(&self) {
        let mut state = lock(&self.state);
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    /// No further entries will be routed to any worker.
    pub(crate) fn close_input(&self) {
        lock(&self.state).input_closed = true;
        self.changed.notify_all();
    }

    pub(crate) fn stop(&self) {
        lock(&self.state).stop = true;
        self.changed.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
