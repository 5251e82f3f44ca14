use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Repeating timer backing the call duration counter.
///
/// The first tick fires one period after [`start`](Self::start). Cancelling
/// aborts the task without waiting for it.
#[derive(Debug, Default)]
pub(crate) struct DurationTimer {
    handle: Option<JoinHandle<()>>,
}

impl DurationTimer {
    /// Starts ticking, replacing any running timer. `on_tick` returning
    /// `false` stops the timer.
    pub fn start<F>(&mut self, period: Duration, mut on_tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !on_tick() {
                    break;
                }
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DurationTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
