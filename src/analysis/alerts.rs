use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::signaling::events::{AnalysisOutcome, AnalysisResult, DisconnectNotice, SuspiciousActivity};
use crate::signaling::ServerEvent;

/// A suspicious-activity report, stamped with when it was received.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspiciousActivityRecord {
    pub user_id: String,
    pub reasons: Vec<String>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Notifications for the UI layer. None of these take enforcement action.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// Our own frame came back flagged.
    FlaggedFrame(SuspiciousActivity),
    SuspiciousActivity(SuspiciousActivityRecord),
    AutomatedWarning {
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    HostWarning {
        message: String,
        warning_count: u32,
    },
    Disqualified {
        user_id: String,
    },
    CandidateDisconnected {
        user_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Bounded history of analysis results plus alert conversion.
#[derive(Debug)]
pub struct AlertFeed {
    capacity: usize,
    results: VecDeque<AnalysisResult>,
    suspicious: VecDeque<SuspiciousActivityRecord>,
}

impl AlertFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            results: VecDeque::with_capacity(capacity),
            suspicious: VecDeque::with_capacity(capacity),
        }
    }

    pub fn ingest(&mut self, event: &ServerEvent) -> Option<Alert> {
        self.ingest_at(event, Utc::now())
    }

    /// Records `event` and returns the alert it raises, if any.
    pub fn ingest_at(&mut self, event: &ServerEvent, now: DateTime<Utc>) -> Option<Alert> {
        match event {
            ServerEvent::FrameAnalysisResult(AnalysisOutcome {
                result,
                suspicious_activity,
            }) => {
                push_bounded(&mut self.results, result.clone(), self.capacity);
                suspicious_activity
                    .as_ref()
                    .filter(|activity| activity.is_suspicious)
                    .map(|activity| Alert::FlaggedFrame(activity.clone()))
            }
            ServerEvent::SuspiciousActivityDetected(alert) => {
                let record = SuspiciousActivityRecord {
                    user_id: alert.user_id.clone(),
                    reasons: alert.reasons.clone(),
                    confidence: alert.confidence,
                    timestamp: now,
                };
                push_bounded(&mut self.suspicious, record.clone(), self.capacity);
                Some(Alert::SuspiciousActivity(record))
            }
            ServerEvent::AutomatedWarningIssued(warning) => Some(Alert::AutomatedWarning {
                user_id: warning.user_id.clone(),
                timestamp: warning.timestamp.unwrap_or(now),
            }),
            ServerEvent::WarningReceived(warning) => Some(Alert::HostWarning {
                message: warning.message.clone(),
                warning_count: warning.warning_count,
            }),
            ServerEvent::CandidateDisqualified(d) => Some(Alert::Disqualified {
                user_id: d.user_id.clone(),
            }),
            ServerEvent::UserDisconnected(DisconnectNotice {
                user_id,
                reason,
                timestamp,
            }) => Some(Alert::CandidateDisconnected {
                user_id: user_id.clone(),
                reason: reason.clone(),
                timestamp: timestamp.unwrap_or(now),
            }),
            _ => None,
        }
    }

    /// Oldest first.
    pub fn recent_results(&self) -> Vec<AnalysisResult> {
        self.results.iter().cloned().collect()
    }

    pub fn suspicious_activity(&self) -> Vec<SuspiciousActivityRecord> {
        self.suspicious.iter().cloned().collect()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    while queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::events::{AutomatedWarning, SuspiciousActivityAlert};

    #[test]
    fn test_disconnect_notice_becomes_alert() {
        let mut feed = AlertFeed::new(10);
        let now = Utc::now();
        let alert = feed.ingest_at(
            &ServerEvent::UserDisconnected(DisconnectNotice {
                user_id: "u2".into(),
                reason: "ping timeout".into(),
                timestamp: None,
            }),
            now,
        );
        assert_eq!(
            alert,
            Some(Alert::CandidateDisconnected {
                user_id: "u2".into(),
                reason: "ping timeout".into(),
                timestamp: now,
            })
        );
    }

    fn result(confidence: f64) -> ServerEvent {
        ServerEvent::FrameAnalysisResult(AnalysisOutcome {
            result: AnalysisResult {
                confidence,
                ..Default::default()
            },
            suspicious_activity: None,
        })
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut feed = AlertFeed::new(10);
        for i in 0..13 {
            assert_eq!(feed.ingest(&result(i as f64)), None);
        }

        let history = feed.recent_results();
        assert_eq!(history.len(), 10);
        assert_eq!(history.first().map(|r| r.confidence), Some(3.0));
        assert_eq!(history.last().map(|r| r.confidence), Some(12.0));
    }

    #[test]
    fn test_flagged_frame_raises_alert() {
        let mut feed = AlertFeed::new(10);
        let activity = SuspiciousActivity {
            is_suspicious: true,
            reasons: vec!["multiple faces".into()],
            confidence: 0.9,
        };
        let alert = feed.ingest(&ServerEvent::FrameAnalysisResult(AnalysisOutcome {
            result: AnalysisResult {
                has_multiple_faces: true,
                ..Default::default()
            },
            suspicious_activity: Some(activity.clone()),
        }));

        assert_eq!(alert, Some(Alert::FlaggedFrame(activity)));
        assert_eq!(feed.recent_results().len(), 1);
    }

    #[test]
    fn test_suspicious_record_uses_receive_time() {
        let mut feed = AlertFeed::new(10);
        let now = Utc::now();
        let alert = feed.ingest_at(
            &ServerEvent::SuspiciousActivityDetected(SuspiciousActivityAlert {
                user_id: "u1".into(),
                reasons: vec!["no face".into()],
                confidence: 0.7,
            }),
            now,
        );

        match alert {
            Some(Alert::SuspiciousActivity(record)) => {
                assert_eq!(record.user_id, "u1");
                assert_eq!(record.timestamp, now);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        assert_eq!(feed.suspicious_activity().len(), 1);
    }

    #[test]
    fn test_automated_warning_falls_back_to_receive_time() {
        let mut feed = AlertFeed::new(10);
        let now = Utc::now();
        let alert = feed.ingest_at(
            &ServerEvent::AutomatedWarningIssued(AutomatedWarning {
                user_id: "u1".into(),
                timestamp: None,
            }),
            now,
        );
        assert_eq!(
            alert,
            Some(Alert::AutomatedWarning {
                user_id: "u1".into(),
                timestamp: now,
            })
        );
    }
}
