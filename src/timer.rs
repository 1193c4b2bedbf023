//! Cancellable timers.
//!
//! Every recurring callback in the client (warning escalation, frame
//! capture) is started through [`every`] and owned through the returned
//! [`TimerHandle`]. Dropping the handle cancels the timer, so a timer can
//! never outlive the component that started it. Tests drive these timers
//! with tokio's paused clock.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug)]
pub struct TimerHandle {
    name: &'static str,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Stops the timer. Calling it again is a no-op.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::trace!(timer = self.name, "Timer cancelled");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runs `on_tick` every `period`. The first tick fires one full period
/// after the call, matching `setInterval` semantics.
pub fn every<F, Fut>(name: &'static str, period: Duration, mut on_tick: F) -> TimerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            on_tick().await;
        }
    });

    TimerHandle {
        name,
        task: Some(task),
    }
}

/// Runs `on_fire` once after `delay`.
pub fn after<F, Fut>(name: &'static str, delay: Duration, on_fire: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        on_fire().await;
    });

    TimerHandle {
        name,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_every_waits_a_full_period_before_first_tick() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let _timer = every("test", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let mut timer = every("test", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(timer.is_active());
        timer.cancel();
        timer.cancel();
        assert!(!timer.is_active());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_one_shot() {
        let fired = Arc::new(AtomicU32::new(0));
        let flag = fired.clone();
        let timer = after("test", Duration::from_secs(2), move || async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
