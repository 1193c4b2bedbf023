use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};

use crate::media::FrameSource;
use crate::signaling::events::FramePayload;
use crate::signaling::{ClientEvent, SignalingChannel};
use crate::timer::{self, TimerHandle};

/// Periodically ships one camera frame to the room service for analysis.
/// Never waits for the verdict; results arrive as separate events.
pub struct FrameReporter {
    channel: SignalingChannel,
    exam_id: String,
    timer: TimerHandle,
    stopped: bool,
}

impl FrameReporter {
    pub fn start(
        channel: SignalingChannel,
        frames: Arc<dyn FrameSource>,
        user_id: String,
        exam_id: String,
        interval: Duration,
    ) -> Self {
        channel.send(ClientEvent::StartAutomatedMonitoring {
            exam_id: exam_id.clone(),
        });

        let tick_channel = channel.clone();
        let tick_exam = exam_id.clone();
        let timer = timer::every("frame-capture", interval, move || {
            let channel = tick_channel.clone();
            let frames = frames.clone();
            let user_id = user_id.clone();
            let exam_id = tick_exam.clone();
            async move {
                report_frame(&channel, frames.as_ref(), &user_id, &exam_id);
            }
        });

        tracing::info!(exam_id = %exam_id, interval_secs = interval.as_secs(), "Automated monitoring started");
        Self {
            channel,
            exam_id,
            timer,
            stopped: false,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stopped && self.timer.is_active()
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.timer.cancel();
        self.channel.send(ClientEvent::StopAutomatedMonitoring);
        tracing::info!(exam_id = %self.exam_id, "Automated monitoring stopped");
    }
}

impl Drop for FrameReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn report_frame(channel: &SignalingChannel, frames: &dyn FrameSource, user_id: &str, exam_id: &str) {
    if !channel.is_connected() {
        tracing::debug!("Skipping frame capture while disconnected");
        return;
    }
    let Some(frame) = frames.snapshot() else {
        tracing::debug!("No frame available yet, skipping tick");
        return;
    };

    let payload = frame_payload(&frame, user_id, exam_id, Utc::now());
    tracing::trace!(bytes = frame.len(), "Submitting frame for analysis");
    channel.send(ClientEvent::AnalyzeFrame(payload));
}

pub fn frame_payload(frame: &[u8], user_id: &str, exam_id: &str, timestamp: DateTime<Utc>) -> FramePayload {
    FramePayload {
        frame_data: STANDARD.encode(frame),
        timestamp,
        user_id: user_id.to_string(),
        exam_id: exam_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{Identity, Role};
    use crate::testing::StillFrames;

    fn identity() -> Identity {
        Identity {
            user_id: "cand-1".into(),
            role: Role::Candidate,
            name: None,
            email: None,
        }
    }

    #[test]
    fn test_payload_is_plain_base64() {
        let payload = frame_payload(&[0xFF, 0xD8, 0xFF], "u1", "e1", Utc::now());
        assert_eq!(payload.frame_data, "/9j/");
        assert!(!payload.frame_data.starts_with("data:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_every_interval_and_skips_empty_ticks() {
        let (channel, mut remote) = SignalingChannel::in_memory("sock-1");
        channel.connect("exam-1", &identity()).await.unwrap();
        let frames = Arc::new(StillFrames::empty());

        let mut reporter = FrameReporter::start(
            channel.clone(),
            frames.clone(),
            "cand-1".into(),
            "exam-1".into(),
            Duration::from_secs(5),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        frames.set(vec![1, 2, 3]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        reporter.stop();
        reporter.stop();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let sent: Vec<_> = remote
            .drain_sent()
            .into_iter()
            .filter(|e| !matches!(e, ClientEvent::JoinRoom { .. } | ClientEvent::NewJoin))
            .collect();

        assert_eq!(
            sent.first(),
            Some(&ClientEvent::StartAutomatedMonitoring {
                exam_id: "exam-1".into()
            })
        );
        let frames_sent = sent
            .iter()
            .filter(|e| matches!(e, ClientEvent::AnalyzeFrame(_)))
            .count();
        assert_eq!(frames_sent, 2);
        assert_eq!(sent.last(), Some(&ClientEvent::StopAutomatedMonitoring));
        assert!(!reporter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_frames_while_disconnected() {
        let (channel, mut remote) = SignalingChannel::in_memory("sock-1");
        let frames = Arc::new(StillFrames::with_frame(vec![9]));

        let _reporter = FrameReporter::start(
            channel,
            frames,
            "cand-1".into(),
            "exam-1".into(),
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(remote.drain_sent().is_empty());
    }
}
