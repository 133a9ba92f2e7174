//! Cancellable one-shot timers for retry and periodic refresh.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Default)]
struct SlotState {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// Holds at most one pending timer.
///
/// Scheduling replaces any pending timer. A timer that has been cancelled or
/// replaced never fires, even if its sleep already elapsed: the firing task
/// re-checks its generation under the slot lock before running the callback.
#[derive(Debug, Default)]
pub struct TimerSlot {
    state: Arc<Mutex<SlotState>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `callback` once after `delay`, replacing any pending timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let slot = self.state.clone();

        trace!("Timer {} scheduled in {:?}", generation, delay);
        state.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation != generation {
                return;
            }
            state.task = None;
            // Fired under the lock so a concurrent cancel is strictly ordered
            callback();
        }));
    }

    /// Cancel the pending timer. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        state.generation += 1;
        match state.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a timer is pending.
    pub fn is_pending(&self) -> bool {
        self.lock().task.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
