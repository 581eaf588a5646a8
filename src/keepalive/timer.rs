//! Probe timer
//!
//! A cancellable periodic task bound to one connection. Starting an already
//! running timer reschedules it; stopping it is permanent.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Default)]
struct TimerState {
    stopped: bool,
    task: Option<JoinHandle<()>>,
    reschedule: Arc<Notify>,
}

#[derive(Default)]
pub(crate) struct ProbeTimer {
    state: Mutex<TimerState>,
}

impl ProbeTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm the timer, or push the next firing out by a full `interval`.
    ///
    /// `fire` runs each time the interval elapses; the timer re-arms itself
    /// afterwards with the same interval. Does nothing once stopped.
    pub(crate) fn start<F, Fut>(&self, interval: Duration, fire: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        if state.stopped {
            return;
        }

        if state.task.is_some() {
            state.reschedule.notify_one();
            return;
        }

        let reschedule = Arc::clone(&state.reschedule);
        state.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        trace!("Probe timer fired after {:?}", interval);
                        fire().await;
                    }
                    _ = reschedule.notified() => {
                        trace!("Probe timer rescheduled");
                    }
                }
            }
        }));
    }

    /// Cancel the timer for good. Safe to call more than once.
    pub(crate) fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.lock().task.is_some()
    }
}

impl Drop for ProbeTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
