//! Cancellable periodic trigger.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Calls a tick function every `period` on a background task.
///
/// The first tick fires one full period after `start`. The task is aborted by
/// [`FlushTimer::stop`] or when the timer is dropped, and ends on its own once
/// the tick function returns `ControlFlow::Break`.
#[derive(Debug)]
pub struct FlushTimer {
    period: Duration,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    /// Must be called within a Tokio runtime.
    pub fn start<F>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if on_tick().is_break() {
                    break;
                }
            }
        });
        Self { period, handle }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_every_period_until_dropped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let timer = FlushTimer::start(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(10_200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        timer.stop();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn break_ends_the_task() {
        let timer = FlushTimer::start(Duration::from_secs(1), || ControlFlow::Break(()));
        assert!(timer.is_running());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!timer.is_running());
    }
}
