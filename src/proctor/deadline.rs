use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::timer::{self, TimerHandle};

/// Minutes-remaining marks at which the candidate is reminded.
pub const REMINDER_MINUTES: [u32; 4] = [30, 15, 5, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineEvent {
    Reminder { minutes_left: u32 },
    Expired,
}

/// The instant an exam ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExamDeadline {
    ends_at: DateTime<Utc>,
}

impl ExamDeadline {
    pub fn at(ends_at: DateTime<Utc>) -> Self {
        Self { ends_at }
    }

    pub fn in_duration(duration: Duration) -> Self {
        let ends_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { ends_at }
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.ends_at
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.ends_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Utc::now())
    }

    /// Reminder marks still ahead, paired with how long until each fires.
    pub fn pending_reminders(&self, remaining: Duration) -> Vec<(u32, Duration)> {
        REMINDER_MINUTES
            .iter()
            .filter_map(|&minutes| {
                let mark = Duration::from_secs(u64::from(minutes) * 60);
                remaining
                    .checked_sub(mark)
                    .filter(|wait| !wait.is_zero())
                    .map(|wait| (minutes, wait))
            })
            .collect()
    }

    /// Arms one-shot timers for every pending reminder and for expiry.
    /// Dropping the returned handles disarms them.
    pub fn schedule(&self, events: mpsc::UnboundedSender<DeadlineEvent>) -> Vec<TimerHandle> {
        let remaining = self.remaining();
        let mut timers: Vec<TimerHandle> = self
            .pending_reminders(remaining)
            .into_iter()
            .map(|(minutes_left, wait)| {
                let events = events.clone();
                timer::after("exam-reminder", wait, move || async move {
                    let _ = events.send(DeadlineEvent::Reminder { minutes_left });
                })
            })
            .collect();

        timers.push(timer::after("exam-deadline", remaining, move || async move {
            let _ = events.send(DeadlineEvent::Expired);
        }));

        tracing::debug!(
            ends_at = %self.ends_at.to_rfc3339(),
            remaining_secs = remaining.as_secs(),
            timers = timers.len(),
            "Exam deadline armed"
        );
        timers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_never_negative() {
        let deadline = ExamDeadline::at(Utc::now() - chrono::Duration::minutes(5));
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_only_future_reminders_are_pending() {
        let deadline = ExamDeadline::in_duration(Duration::from_secs(20 * 60));
        let pending = deadline.pending_reminders(Duration::from_secs(20 * 60));
        let minutes: Vec<u32> = pending.iter().map(|(m, _)| *m).collect();
        assert_eq!(minutes, vec![15, 5, 1]);
        assert_eq!(pending[0].1, Duration::from_secs(5 * 60));
    }

    #[test]
    fn test_reminder_exactly_at_mark_is_skipped() {
        let deadline = ExamDeadline::in_duration(Duration::from_secs(5 * 60));
        let pending = deadline.pending_reminders(Duration::from_secs(5 * 60));
        assert_eq!(pending, vec![(1, Duration::from_secs(4 * 60))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_reminders_then_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = ExamDeadline::in_duration(Duration::from_secs(6 * 60));
        let _timers = deadline.schedule(tx);

        tokio::time::sleep(Duration::from_secs(7 * 60)).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                DeadlineEvent::Reminder { minutes_left: 5 },
                DeadlineEvent::Reminder { minutes_left: 1 },
                DeadlineEvent::Expired,
            ]
        );
    }
}
