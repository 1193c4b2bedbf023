use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use super::deadline::{DeadlineEvent, ExamDeadline};
use super::warning::WarningCounter;
use super::window::ExamWindow;
use crate::api::ExamApi;
use crate::error::{ProctorError, Result};
use crate::room::PeerBroadcast;
use crate::signaling::DataMessage;
use crate::timer::{self, TimerHandle};

pub const SUBMIT_MESSAGE: &str = "Submitted";
pub const MALPRACTICE_MESSAGE: &str = "Malpractice";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Submitted,
    /// Auto-submitted when the exam clock ran out.
    TimedOut,
    /// Forced out by a host.
    Terminated,
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Submitted => write!(f, "submitted"),
            ExitOutcome::TimedOut => write!(f, "timed out"),
            ExitOutcome::Terminated => write!(f, "terminated for malpractice"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Instructions,
    Ready,
    InExam,
    Paused,
    Exited(ExitOutcome),
}

impl SessionState {
    pub fn is_exited(&self) -> bool {
        matches!(self, SessionState::Exited(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceSignal {
    FocusLost,
    FocusRegained,
    FullscreenExited,
    FullscreenEntered,
}

/// What the session reports to whoever renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StateChanged(SessionState),
    WarningLevel(u32),
    HostMessage { peer_id: String, text: String },
    TimeReminder { minutes_left: u32 },
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub exam_id: String,
    pub answer_id: String,
    pub warning_interval: Duration,
}

struct SessionInner {
    state: SessionState,
    agreed: bool,
    media_ready: bool,
    focused: bool,
    fullscreen: bool,
    escalation: Option<TimerHandle>,
    deadline: Vec<TimerHandle>,
}

/// Candidate-side exam lockdown.
///
/// Instructions -> Ready -> InExam <-> Paused -> Exited. While paused a
/// recurring timer raises the warning level and pushes it to every peer;
/// the level is never lowered during the session.
pub struct ProctorSession {
    me: Weak<ProctorSession>,
    options: SessionOptions,
    warnings: WarningCounter,
    window: Arc<dyn ExamWindow>,
    api: Arc<dyn ExamApi>,
    peers: Arc<dyn PeerBroadcast>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    inner: Mutex<SessionInner>,
}

impl ProctorSession {
    /// Starts a fresh session; this is the only place the persisted
    /// warning level is cleared.
    pub fn begin(
        options: SessionOptions,
        warnings: WarningCounter,
        window: Arc<dyn ExamWindow>,
        api: Arc<dyn ExamApi>,
        peers: Arc<dyn PeerBroadcast>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionNotice>)> {
        warnings.reset()?;
        Ok(Self::build(options, warnings, window, api, peers))
    }

    /// Re-enters a session after a restart, keeping the persisted level.
    pub fn resume(
        options: SessionOptions,
        warnings: WarningCounter,
        window: Arc<dyn ExamWindow>,
        api: Arc<dyn ExamApi>,
        peers: Arc<dyn PeerBroadcast>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionNotice>) {
        Self::build(options, warnings, window, api, peers)
    }

    fn build(
        options: SessionOptions,
        warnings: WarningCounter,
        window: Arc<dyn ExamWindow>,
        api: Arc<dyn ExamApi>,
        peers: Arc<dyn PeerBroadcast>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            options,
            warnings,
            window,
            api,
            peers,
            notices: tx,
            inner: Mutex::new(SessionInner {
                state: SessionState::Instructions,
                agreed: false,
                media_ready: false,
                focused: true,
                fullscreen: false,
                escalation: None,
                deadline: Vec::new(),
            }),
        });
        (session, rx)
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub fn warning_level(&self) -> u32 {
        self.warnings.level()
    }

    pub fn exam_id(&self) -> &str {
        &self.options.exam_id
    }

    /// Candidate accepted the monitoring terms.
    pub async fn agree(&self) {
        let mut inner = self.inner.lock().await;
        inner.agreed = true;
        self.promote_if_ready(&mut inner);
    }

    /// Camera and microphone were acquired.
    pub async fn media_ready(&self) {
        let mut inner = self.inner.lock().await;
        inner.media_ready = true;
        self.promote_if_ready(&mut inner);
    }

    /// Enters fullscreen and starts the exam. Only valid from Ready.
    pub async fn start_exam(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Ready {
            return Err(ProctorError::InvalidTransition(format!(
                "cannot start exam from {:?}",
                inner.state
            )));
        }
        self.window.request_fullscreen()?;
        self.enter_exam(&mut inner);
        Ok(())
    }

    /// Arms the exam clock; expiry auto-submits.
    pub async fn arm_deadline(&self, deadline: ExamDeadline) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = deadline.schedule(tx);

        let me = self.me.clone();
        let notices = self.notices.clone();
        // Expiry hands off to its own task; exit aborts every deadline timer, this relay included
        timers.push(timer::after("exam-deadline-relay", Duration::ZERO, move || async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DeadlineEvent::Reminder { minutes_left } => {
                        let _ = notices.send(SessionNotice::TimeReminder { minutes_left });
                    }
                    DeadlineEvent::Expired => {
                        if let Some(session) = me.upgrade() {
                            tokio::spawn(async move { session.time_expired().await });
                        }
                        return;
                    }
                }
            }
        }));

        let mut inner = self.inner.lock().await;
        if inner.state.is_exited() {
            return;
        }
        inner.deadline = timers;
    }

    pub async fn signal(&self, signal: ComplianceSignal) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Ready if signal == ComplianceSignal::FullscreenEntered => {
                self.enter_exam(&mut inner);
                return;
            }
            SessionState::InExam | SessionState::Paused => {}
            _ => {
                tracing::debug!(signal = ?signal, state = ?inner.state, "Ignoring compliance signal");
                return;
            }
        }

        match signal {
            ComplianceSignal::FocusLost => inner.focused = false,
            ComplianceSignal::FocusRegained => inner.focused = true,
            ComplianceSignal::FullscreenExited => inner.fullscreen = false,
            ComplianceSignal::FullscreenEntered => inner.fullscreen = true,
        }

        let compliant = inner.focused && inner.fullscreen;
        match (inner.state, compliant) {
            (SessionState::InExam, false) => {
                inner.escalation = Some(self.start_escalation());
                self.set_state(&mut inner, SessionState::Paused);
            }
            (SessionState::Paused, true) => {
                if let Some(mut escalation) = inner.escalation.take() {
                    escalation.cancel();
                }
                self.set_state(&mut inner, SessionState::InExam);
            }
            _ => {}
        }
    }

    /// Handles a data-channel payload from a host.
    pub async fn handle_peer_message(&self, peer_id: &str, message: DataMessage) {
        match message {
            DataMessage::Terminate => {
                tracing::warn!(peer_id = %peer_id, exam_id = %self.options.exam_id, "Exam terminated by host");
                self.terminate().await;
            }
            DataMessage::Text(text) => {
                let _ = self.notices.send(SessionNotice::HostMessage {
                    peer_id: peer_id.to_string(),
                    text,
                });
            }
            DataMessage::WarningLevel(level) => {
                tracing::debug!(peer_id = %peer_id, level, "Ignoring warning level from peer");
            }
        }
    }

    /// Candidate-initiated submit. On API failure the session stays put.
    pub async fn submit(&self) -> Result<()> {
        if self.state().await.is_exited() {
            return Err(ProctorError::InvalidTransition("exam already exited".into()));
        }
        self.api
            .exit_answer(&self.options.exam_id, &self.options.answer_id, SUBMIT_MESSAGE)
            .await?;
        self.exit(ExitOutcome::Submitted).await;
        Ok(())
    }

    /// Exam clock reached zero; exits without confirmation.
    pub async fn time_expired(&self) {
        tracing::info!(exam_id = %self.options.exam_id, "Exam time is up");
        self.exit(ExitOutcome::TimedOut).await;
    }

    async fn terminate(&self) {
        if self.state().await.is_exited() {
            return;
        }
        if let Err(e) = self
            .api
            .exit_answer(&self.options.exam_id, &self.options.answer_id, MALPRACTICE_MESSAGE)
            .await
        {
            tracing::warn!(error = %e, "Failed to record malpractice exit");
        }
        self.exit(ExitOutcome::Terminated).await;
    }

    /// Listeners off, timers off, fullscreen off, then leave. Every exit
    /// path goes through here.
    async fn exit(&self, outcome: ExitOutcome) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_exited() {
            return;
        }

        self.window.detach_listeners();
        if let Some(mut escalation) = inner.escalation.take() {
            escalation.cancel();
        }
        for mut deadline in inner.deadline.drain(..) {
            deadline.cancel();
        }
        if self.window.is_fullscreen() {
            self.window.exit_fullscreen();
        }
        self.window.leave(outcome);

        tracing::info!(
            exam_id = %self.options.exam_id,
            outcome = %outcome,
            warning_level = self.warnings.level(),
            "Exam session exited"
        );
        self.set_state(&mut inner, SessionState::Exited(outcome));
    }

    fn promote_if_ready(&self, inner: &mut SessionInner) {
        if inner.state == SessionState::Instructions && inner.agreed && inner.media_ready {
            self.set_state(inner, SessionState::Ready);
        }
    }

    fn enter_exam(&self, inner: &mut SessionInner) {
        inner.focused = true;
        inner.fullscreen = true;
        self.window.attach_listeners();
        self.set_state(inner, SessionState::InExam);
    }

    fn start_escalation(&self) -> TimerHandle {
        let me = self.me.clone();
        timer::every("warning-escalation", self.options.warning_interval, move || {
            let me = me.clone();
            async move {
                if let Some(session) = me.upgrade() {
                    session.escalate().await;
                }
            }
        })
    }

    async fn escalate(&self) {
        let level = match self.warnings.increment() {
            Ok(level) => level,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist warning level");
                self.warnings.level()
            }
        };
        tracing::info!(exam_id = %self.options.exam_id, level, "Warning level raised");
        let _ = self.notices.send(SessionNotice::WarningLevel(level));

        let delivered = self.peers.broadcast(DataMessage::WarningLevel(level)).await;
        tracing::debug!(level, delivered, "Warning level pushed to peers");
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        if inner.state == state {
            return;
        }
        tracing::debug!(from = ?inner.state, to = ?state, "Session state changed");
        inner.state = state;
        let _ = self.notices.send(SessionNotice::StateChanged(state));
    }
}
