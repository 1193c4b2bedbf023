use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use super::backoff::{Backoff, ReconnectPolicy};
use super::participants::{should_initiate, ParticipantRegistry, PeerSummary};
use super::peer::{PeerEvent, PeerEvents, PeerFactory, PeerHandle, PeerNotice, PeerOptions, RemoteStream};
use crate::analysis::{Alert, AlertFeed, FrameReporter, SuspiciousActivityRecord};
use crate::error::{ProctorError, Result};
use crate::media::{LocalStream, MediaProvider};
use crate::proctor::WarningReader;
use crate::signaling::events::AnalysisResult;
use crate::signaling::{
    ChannelEvent, ClientEvent, DataMessage, EventKind, Identity, Participant, Role, ServerEvent,
    SignalDescriptor, SignalKind, SignalingChannel, SubscriptionGuard,
};

/// Pushes a data message to every connected peer.
pub trait PeerBroadcast: Send + Sync {
    /// Returns how many peers accepted the message.
    fn broadcast(&self, message: DataMessage) -> BoxFuture<'_, usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Disconnected,
    Connecting,
    Joined,
}

/// What the coordinator reports to the UI layer.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    StateChanged(RoomState),
    ParticipantJoined(Participant),
    ParticipantLeft(String),
    RemoteStream(RemoteStream),
    PeerData {
        peer_id: String,
        message: DataMessage,
    },
    /// A candidate's warning level, as last reported by that candidate.
    WarningLevel {
        peer_id: String,
        level: u32,
    },
    Alert(Alert),
    ReconnectFailed {
        attempts: u32,
    },
    PermissionDenied(String),
}

#[derive(Clone)]
pub struct RoomOptions {
    pub exam_id: String,
    pub identity: Identity,
    pub reconnect: ReconnectPolicy,
    pub frame_interval: Duration,
    pub analysis_history: usize,
    /// Candidates attach their warning level to every answer they send.
    pub warning: Option<WarningReader>,
}

/// Owns every peer connection for one exam room and keeps the set in step
/// with the roster the room service announces.
///
/// All channel and peer events are handled on a single task, so roster
/// changes and signal routing never interleave.
#[derive(Clone)]
pub struct ExamRoom {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    options: RoomOptions,
    channel: SignalingChannel,
    factory: Arc<dyn PeerFactory>,
    media: Option<Arc<dyn MediaProvider>>,
    registry: ParticipantRegistry,
    local_stream: RwLock<Option<LocalStream>>,
    reporter: SyncMutex<Option<FrameReporter>>,
    alerts: SyncMutex<AlertFeed>,
    state: watch::Sender<RoomState>,
    events: mpsc::UnboundedSender<RoomEvent>,
    peer_events: PeerEvents,
    next_generation: AtomicU64,
    pending_notices: SyncMutex<Option<mpsc::UnboundedReceiver<PeerNotice>>>,
    subscriptions: SyncMutex<Option<SubscriptionGuard>>,
    shutdown: watch::Sender<bool>,
    worker: SyncMutex<Option<JoinHandle<()>>>,
}

/// Channel events the coordinator listens to.
const SUBSCRIBED: [EventKind; 13] = [
    EventKind::Disconnect,
    EventKind::ConnectError,
    EventKind::UserList,
    EventKind::UserJoined,
    EventKind::UserLeft,
    EventKind::ReceiveSignal,
    EventKind::ReceivingReturnedSignal,
    EventKind::FrameAnalysisResult,
    EventKind::SuspiciousActivityDetected,
    EventKind::AutomatedWarningIssued,
    EventKind::WarningReceived,
    EventKind::CandidateDisqualified,
    EventKind::UserDisconnected,
];

impl ExamRoom {
    pub fn new(
        options: RoomOptions,
        channel: SignalingChannel,
        factory: Arc<dyn PeerFactory>,
        media: Option<Arc<dyn MediaProvider>>,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(RoomState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let history = options.analysis_history;

        let room = Self {
            inner: Arc::new(RoomInner {
                options,
                channel,
                factory,
                media,
                registry: ParticipantRegistry::new(),
                local_stream: RwLock::new(None),
                reporter: SyncMutex::new(None),
                alerts: SyncMutex::new(AlertFeed::new(history)),
                state,
                events,
                peer_events,
                next_generation: AtomicU64::new(1),
                pending_notices: SyncMutex::new(Some(peer_rx)),
                subscriptions: SyncMutex::new(None),
                shutdown,
                worker: SyncMutex::new(None),
            }),
        };
        (room, events_rx)
    }

    /// Acquires media and joins the room. Can only be called once.
    ///
    /// A media failure is terminal and returned as `MediaAccess`. A transport
    /// failure is not: the room starts reconnecting in the background and
    /// this returns `Ok`.
    pub async fn start(&self) -> Result<()> {
        let notices = self
            .inner
            .pending_notices
            .lock()
            .ok()
            .and_then(|mut pending| pending.take())
            .ok_or_else(|| ProctorError::InvalidTransition("room already started".into()))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let mut guard = SubscriptionGuard::new(&self.inner.channel);
        for kind in SUBSCRIBED {
            let input = input_tx.clone();
            guard.on(kind, move |event| {
                let _ = input.send(event.clone());
            });
        }
        if let Ok(mut slot) = self.inner.subscriptions.lock() {
            *slot = Some(guard);
        }

        let worker = tokio::spawn(run(self.inner.clone(), input_rx, notices));
        if let Ok(mut slot) = self.inner.worker.lock() {
            *slot = Some(worker);
        }

        match self.inner.join().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                // Picked up by the worker like any other transport loss.
                let _ = input_tx.send(ChannelEvent::Disconnected {
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }

    pub fn state(&self) -> RoomState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RoomState> {
        self.inner.state.subscribe()
    }

    pub fn channel(&self) -> &SignalingChannel {
        &self.inner.channel
    }

    pub async fn participants(&self) -> Vec<PeerSummary> {
        self.inner.registry.summaries().await
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.registry.peer_count().await
    }

    /// Analysis verdicts for our own frames, oldest first.
    pub fn recent_results(&self) -> Vec<AnalysisResult> {
        self.inner
            .alerts
            .lock()
            .map(|feed| feed.recent_results())
            .unwrap_or_default()
    }

    /// Suspicious-activity reports received so far, oldest first.
    pub fn suspicious_activity(&self) -> Vec<SuspiciousActivityRecord> {
        self.inner
            .alerts
            .lock()
            .map(|feed| feed.suspicious_activity())
            .unwrap_or_default()
    }

    /// Host only: issues a formal warning through the room service, which
    /// delivers it to the candidate as `warning_received`. `id` may be a
    /// socket id or a user id.
    pub async fn warn(&self, id: &str, message: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.local_role() != Role::Host {
            return Err(ProctorError::InvalidTransition(
                "only hosts can warn candidates".into(),
            ));
        }
        let socket_id = inner
            .registry
            .resolve(id)
            .await
            .ok_or_else(|| ProctorError::PeerNotFound(id.to_string()))?;
        tracing::info!(socket_id = %socket_id, "Warning candidate");
        inner.channel.send(ClientEvent::SendWarning {
            to: socket_id,
            message: message.to_string(),
        });
        Ok(())
    }

    /// Host only: orders a candidate to end its exam.
    pub async fn terminate(&self, peer_id: &str) -> Result<()> {
        self.inner.send_as_host(peer_id, DataMessage::Terminate).await
    }

    /// Host only: sends free text to a candidate.
    pub async fn message(&self, peer_id: &str, text: &str) -> Result<()> {
        self.inner
            .send_as_host(peer_id, DataMessage::Text(text.to_string()))
            .await
    }

    /// Leaves the room and releases everything. Repeated calls do nothing.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }

        let worker = self.inner.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Room worker ended abnormally");
            }
        }

        let inner = &self.inner;
        inner.channel.send(ClientEvent::LeaveExam {
            exam_id: inner.options.exam_id.clone(),
        });
        inner.stop_reporter();
        inner.teardown_peers().await;
        inner.release_media().await;
        inner.registry.clear_members().await;
        let subscriptions = inner.subscriptions.lock().ok().and_then(|mut s| s.take());
        drop(subscriptions);
        inner.channel.disconnect().await;
        inner.set_state(RoomState::Disconnected);
        tracing::info!(exam_id = %inner.options.exam_id, "Left exam room");
    }
}

impl PeerBroadcast for ExamRoom {
    fn broadcast(&self, message: DataMessage) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let mut delivered = 0;
            for peer in self.inner.registry.all_peers().await {
                match peer.send(message.clone()).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        tracing::debug!(peer_id = %peer.peer_id(), error = %e, "Data push skipped")
                    }
                }
            }
            delivered
        })
    }
}

async fn run(
    inner: Arc<RoomInner>,
    mut input: mpsc::UnboundedReceiver<ChannelEvent>,
    mut notices: mpsc::UnboundedReceiver<PeerNotice>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(event) = input.recv() => inner.on_channel_event(event).await,
            Some(notice) = notices.recv() => inner.on_peer_notice(notice).await,
            else => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
    tracing::debug!("Room worker stopped");
}

impl RoomInner {
    fn local_role(&self) -> Role {
        self.options.identity.role
    }

    fn emit(&self, event: RoomEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Room event receiver gone");
        }
    }

    fn set_state(&self, state: RoomState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "Room state changed");
            self.emit(RoomEvent::StateChanged(state));
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn is_self(&self, participant: &Participant) -> bool {
        self.channel.socket_id().as_deref() == Some(participant.socket_id.as_str())
            || participant.identity.user_id == self.options.identity.user_id
    }

    async fn join(&self) -> Result<()> {
        self.set_state(RoomState::Connecting);
        if let Err(e) = self.acquire_media().await {
            tracing::error!(error = %e, "Camera or microphone unavailable");
            self.emit(RoomEvent::PermissionDenied(e.to_string()));
            self.set_state(RoomState::Disconnected);
            return Err(e);
        }
        self.channel
            .connect(&self.options.exam_id, &self.options.identity)
            .await
    }

    async fn acquire_media(&self) -> Result<()> {
        let Some(provider) = &self.media else {
            return Ok(());
        };
        let mut slot = self.local_stream.write().await;
        if slot.as_ref().map(LocalStream::is_live).unwrap_or(false) {
            return Ok(());
        }

        let stream = provider.acquire().await.map_err(|e| match e {
            ProctorError::MediaAccess(_) => e,
            other => ProctorError::MediaAccess(other.to_string()),
        })?;
        *slot = Some(stream);
        Ok(())
    }

    async fn release_media(&self) {
        if let Some(stream) = self.local_stream.write().await.take() {
            stream.stop();
        }
    }

    fn start_reporter(&self, stream: Option<LocalStream>) {
        if self.local_role() != Role::Candidate {
            return;
        }
        let Some(frames) = stream.and_then(|s| s.frames()) else {
            tracing::debug!("No frame source, automated monitoring disabled");
            return;
        };
        let Ok(mut slot) = self.reporter.lock() else {
            return;
        };
        if slot.as_ref().map(FrameReporter::is_running).unwrap_or(false) {
            return;
        }
        *slot = Some(FrameReporter::start(
            self.channel.clone(),
            frames,
            self.options.identity.user_id.clone(),
            self.options.exam_id.clone(),
            self.options.frame_interval,
        ));
    }

    fn stop_reporter(&self) {
        let reporter = self.reporter.lock().ok().and_then(|mut slot| slot.take());
        drop(reporter);
    }

    async fn teardown_peers(&self) {
        for entry in self.registry.drain_peers().await {
            entry.peer.destroy().await;
        }
    }

    async fn drop_peer(&self, socket_id: &str) {
        if let Some(entry) = self.registry.remove_peer(socket_id).await {
            entry.peer.destroy().await;
            tracing::info!(peer_id = %socket_id, "Peer removed");
        }
    }

    async fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {}
            ChannelEvent::Disconnected { reason } => self.handle_disconnect(reason).await,
            ChannelEvent::ConnectError { message } => {
                tracing::debug!(error = %message, "Signaling connect error");
            }
            ChannelEvent::Server(event) => match event {
                ServerEvent::UserList(roster) => self.on_roster(roster).await,
                ServerEvent::UserJoined(participant) => {
                    if !self.is_self(&participant) {
                        self.admit(participant).await;
                    }
                }
                ServerEvent::UserLeft(departure) => self.on_departure(departure.id()).await,
                ServerEvent::ReceiveSignal(envelope) => {
                    self.route_signal(&envelope.from, envelope.signal, None).await
                }
                ServerEvent::ReceivingReturnedSignal(returned) => {
                    self.route_signal(&returned.from, returned.signal, returned.warn)
                        .await
                }
                other => {
                    let alert = self.alerts.lock().ok().and_then(|mut feed| feed.ingest(&other));
                    if let Some(alert) = alert {
                        self.emit(RoomEvent::Alert(alert));
                    }
                }
            },
        }
    }

    /// The roster is a full snapshot; anyone missing from it has left.
    async fn on_roster(&self, roster: Vec<Participant>) {
        let first = *self.state.borrow() != RoomState::Joined;
        self.set_state(RoomState::Joined);

        let present: Vec<&str> = roster.iter().map(|p| p.socket_id.as_str()).collect();
        for known in self.registry.member_ids().await {
            if !present.contains(&known.as_str()) {
                self.on_departure(&known).await;
            }
        }

        for participant in roster {
            if !self.is_self(&participant) {
                self.admit(participant).await;
            }
        }

        if first {
            let stream = self.local_stream.read().await.clone();
            self.start_reporter(stream);
        }
        let members = self.registry.member_count().await;
        let peers = self.registry.peer_count().await;
        tracing::debug!(members, peers, "Roster applied");
    }

    async fn admit(&self, participant: Participant) {
        if self.registry.add_member(participant.clone()).await {
            tracing::info!(
                socket_id = %participant.socket_id,
                role = %participant.role(),
                "Participant joined"
            );
            self.emit(RoomEvent::ParticipantJoined(participant.clone()));
        }

        if should_initiate(self.local_role(), participant.role())
            && !self.registry.has_peer(&participant.socket_id).await
        {
            self.create_peer(participant, true).await;
        }
    }

    async fn on_departure(&self, id: &str) {
        let socket_id = self
            .registry
            .resolve(id)
            .await
            .unwrap_or_else(|| id.to_string());
        let member = self.registry.remove_member(&socket_id).await;
        self.drop_peer(&socket_id).await;
        if member.is_some() {
            tracing::info!(socket_id = %socket_id, "Participant left");
            self.emit(RoomEvent::ParticipantLeft(socket_id));
        }
    }

    async fn create_peer(&self, participant: Participant, initiator: bool) -> Option<Arc<dyn PeerHandle>> {
        let local_stream = self.local_stream.read().await.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let options = PeerOptions {
            peer_id: participant.socket_id.clone(),
            generation,
            initiator,
            local_stream,
        };

        let peer = match self.factory.create(options, self.peer_events.clone()).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(peer_id = %participant.socket_id, error = %e, "Failed to create peer");
                return None;
            }
        };

        let socket_id = participant.socket_id.clone();
        if !self.registry.insert_peer(participant, peer.clone(), generation).await {
            peer.destroy().await;
            return self.registry.peer(&socket_id).await;
        }
        tracing::info!(peer_id = %socket_id, initiator, "Peer created");
        Some(peer)
    }

    async fn route_signal(&self, from: &str, signal: SignalDescriptor, warn: Option<u32>) {
        if let Some(level) = warn {
            self.registry.set_warning_level(from, level).await;
            self.emit(RoomEvent::WarningLevel {
                peer_id: from.to_string(),
                level,
            });
        }

        let peer = match self.registry.peer(from).await {
            Some(peer) => Some(peer),
            None if self.local_role() == Role::Candidate && signal.kind == SignalKind::Offer => {
                let participant = match self.registry.member(from).await {
                    Some(member) => member,
                    // Offers only come from hosts.
                    None => Participant {
                        socket_id: from.to_string(),
                        identity: Identity {
                            user_id: from.to_string(),
                            role: Role::Host,
                            name: None,
                            email: None,
                        },
                    },
                };
                self.create_peer(participant, false).await
            }
            None => None,
        };

        let Some(peer) = peer else {
            tracing::debug!(from = %from, kind = ?signal.kind, "Dropping signal for unknown peer");
            return;
        };

        if let Err(e) = peer.signal(signal).await {
            tracing::warn!(peer_id = %from, error = %e, "Failed to apply remote descriptor");
            self.drop_peer(from).await;
        }
    }

    async fn on_peer_notice(&self, notice: PeerNotice) {
        let PeerNotice {
            peer_id,
            generation,
            event,
        } = notice;

        // A socket id may already belong to a newer peer; only the
        // registered generation is allowed to act on the entry.
        if let PeerEvent::Close = event {
            if self.registry.retire_peer(&peer_id, generation).await.is_some() {
                tracing::info!(peer_id = %peer_id, "Peer closed by remote");
            }
            return;
        }
        let Some(peer) = self.registry.current_peer(&peer_id, generation).await else {
            tracing::trace!(peer_id = %peer_id, generation, "Ignoring event from retired peer");
            return;
        };

        match event {
            PeerEvent::Signal(signal) => self.relay_signal(peer.as_ref(), signal),
            PeerEvent::Connect => {
                self.registry.mark_connected(&peer_id).await;
                tracing::info!(peer_id = %peer_id, "Peer connected");
                let level = self.options.warning.as_ref().map(WarningReader::get).unwrap_or(0);
                if self.local_role() == Role::Candidate && level > 0 {
                    if let Err(e) = peer.send(DataMessage::WarningLevel(level)).await {
                        tracing::debug!(peer_id = %peer_id, error = %e, "Could not push warning level");
                    }
                }
            }
            PeerEvent::Stream(stream) => {
                self.registry.set_stream(&peer_id, stream.clone()).await;
                tracing::info!(peer_id = %peer_id, stream_id = %stream.stream_id(), "Remote stream attached");
                self.emit(RoomEvent::RemoteStream(stream));
            }
            PeerEvent::Data(message) => {
                if let DataMessage::WarningLevel(level) = message {
                    if self.local_role() == Role::Host {
                        self.registry.set_warning_level(&peer_id, level).await;
                        self.emit(RoomEvent::WarningLevel {
                            peer_id: peer_id.clone(),
                            level,
                        });
                    }
                }
                self.emit(RoomEvent::PeerData { peer_id, message });
            }
            PeerEvent::Error(reason) => {
                tracing::warn!(peer_id = %peer_id, reason = %reason, "Peer failed");
                if let Some(entry) = self.registry.retire_peer(&peer_id, generation).await {
                    entry.peer.destroy().await;
                }
            }
            PeerEvent::Close => {}
        }
    }

    fn relay_signal(&self, peer: &dyn PeerHandle, signal: SignalDescriptor) {
        let Some(from) = self.channel.socket_id() else {
            tracing::debug!(peer_id = %peer.peer_id(), "Not connected, local descriptor dropped");
            return;
        };
        let to = peer.peer_id().to_string();
        let event = if peer.is_initiator() {
            ClientEvent::SendingSignal { to, from, signal }
        } else {
            ClientEvent::SendSignal {
                to,
                from,
                signal,
                warn: self.options.warning.as_ref().map(WarningReader::get),
            }
        };
        self.channel.send(event);
    }

    async fn send_as_host(&self, peer_id: &str, message: DataMessage) -> Result<()> {
        if self.local_role() != Role::Host {
            return Err(ProctorError::InvalidTransition(
                "only hosts can message candidates".into(),
            ));
        }
        let peer = self
            .registry
            .peer(peer_id)
            .await
            .ok_or_else(|| ProctorError::PeerNotFound(peer_id.to_string()))?;
        peer.send(message).await.map_err(|e| {
            tracing::warn!(peer_id = %peer_id, error = %e, "Failed to message candidate");
            e
        })
    }

    async fn handle_disconnect(&self, reason: String) {
        if self.is_shutting_down() {
            return;
        }
        tracing::warn!(reason = %reason, "Lost connection to exam room");

        self.stop_reporter();
        self.teardown_peers().await;
        self.release_media().await;
        self.registry.clear_members().await;
        self.set_state(RoomState::Disconnected);
        self.reconnect().await;
    }

    /// Retries with exponential backoff. Sleeps end early on shutdown.
    async fn reconnect(&self) {
        let mut cancel = self.shutdown.subscribe();
        let policy = self.options.reconnect;
        let mut backoff = Backoff::new(policy);

        while let Some(delay) = backoff.next_delay() {
            let attempt = backoff.attempts();
            self.set_state(RoomState::Connecting);
            tracing::info!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to exam room"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => {
                    tracing::info!("Reconnection cancelled");
                    return;
                }
            }
            if self.is_shutting_down() {
                return;
            }

            match self.join().await {
                Ok(()) => {
                    tracing::info!(attempt, "Reconnected to exam room");
                    return;
                }
                Err(e) if e.is_terminal() => return,
                Err(e) => tracing::warn!(attempt, error = %e, "Reconnection attempt failed"),
            }
        }

        let err = ProctorError::ReconnectExhausted(backoff.attempts());
        tracing::error!(error = %err, "Giving up on exam room");
        self.set_state(RoomState::Disconnected);
        self.emit(RoomEvent::ReconnectFailed {
            attempts: backoff.attempts(),
        });
    }
}
