use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, RwLock as SyncRwLock};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, RwLock};
use webrtc::api::API;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

use super::webrtc_utils::{create_webrtc_api, rtc_configuration};
use crate::config::IceConfig;
use crate::error::{ProctorError, Result};
use crate::media::LocalStream;
use crate::signaling::{DataMessage, SignalDescriptor, SignalKind};

pub const DATA_CHANNEL_LABEL: &str = "proctor";

/// What a peer reports back to whoever owns it.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Local descriptor that must be relayed to the remote side.
    Signal(SignalDescriptor),
    Connect,
    /// Raised at most once per peer.
    Stream(RemoteStream),
    Data(DataMessage),
    Error(String),
    Close,
}

/// An event tagged with the remote id and the generation of the peer that
/// raised it. A socket id can outlive several peers; the generation tells
/// them apart.
#[derive(Debug, Clone)]
pub struct PeerNotice {
    pub peer_id: String,
    pub generation: u64,
    pub event: PeerEvent,
}

pub type PeerEvents = mpsc::UnboundedSender<PeerNotice>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: RTPCodecType,
}

/// Media arriving from one remote peer. Tracks that show up after the
/// first one are appended to the same stream.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    peer_id: String,
    stream_id: String,
    tracks: Arc<SyncRwLock<Vec<TrackInfo>>>,
    packets: Arc<AtomicU64>,
}

impl RemoteStream {
    pub fn new(peer_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            stream_id: stream_id.into(),
            tracks: Arc::new(SyncRwLock::new(Vec::new())),
            packets: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn has_video(&self) -> bool {
        self.tracks().iter().any(|t| t.kind == RTPCodecType::Video)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub(crate) fn add_track(&self, track: TrackInfo) {
        if let Ok(mut tracks) = self.tracks.write() {
            if !tracks.iter().any(|t| t.id == track.id) {
                tracks.push(track);
            }
        }
    }

    pub(crate) fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct PeerOptions {
    pub peer_id: String,
    /// Copied into every notice this peer raises.
    pub generation: u64,
    pub initiator: bool,
    pub local_stream: Option<LocalStream>,
}

/// A single point-to-point media and data session.
pub trait PeerHandle: Send + Sync {
    fn peer_id(&self) -> &str;

    fn is_initiator(&self) -> bool;

    /// Applies a descriptor received from the remote side.
    fn signal(&self, descriptor: SignalDescriptor) -> BoxFuture<'_, Result<()>>;

    fn send(&self, message: DataMessage) -> BoxFuture<'_, Result<()>>;

    /// Releases the connection. Repeated calls do nothing.
    fn destroy(&self) -> BoxFuture<'_, ()>;

    fn is_destroyed(&self) -> bool;
}

pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        options: PeerOptions,
        events: PeerEvents,
    ) -> BoxFuture<'_, Result<Arc<dyn PeerHandle>>>;
}

/// Whether a received descriptor should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Apply,
    Ignore(&'static str),
}

/// Tracks which remote descriptors have been applied so that repeats and
/// out-of-order deliveries never renegotiate an established session.
#[derive(Debug, Default)]
pub(crate) struct NegotiationLedger {
    remote: Option<SignalDescriptor>,
}

impl NegotiationLedger {
    pub(crate) fn admit(&mut self, initiator: bool, descriptor: &SignalDescriptor) -> Disposition {
        if self.remote.as_ref() == Some(descriptor) {
            return Disposition::Ignore("duplicate descriptor");
        }
        if self.remote.is_some() {
            return Disposition::Ignore("session already negotiated");
        }

        let expected = match descriptor.kind {
            SignalKind::Answer | SignalKind::Pranswer => initiator,
            SignalKind::Offer => !initiator,
            SignalKind::Rollback => false,
        };
        if !expected {
            return Disposition::Ignore("unexpected descriptor for this side");
        }

        self.remote = Some(descriptor.clone());
        Disposition::Apply
    }

    /// Forgets a descriptor whose application failed so a retransmit can land.
    pub(crate) fn reject(&mut self, descriptor: &SignalDescriptor) {
        if self.remote.as_ref() == Some(descriptor) {
            self.remote = None;
        }
    }
}

/// Event plumbing shared between a peer and its callbacks.
pub(crate) struct PeerShared {
    peer_id: String,
    generation: u64,
    events: PeerEvents,
    stream: SyncMutex<Option<RemoteStream>>,
    destroyed: AtomicBool,
    close_emitted: AtomicBool,
}

impl PeerShared {
    pub(crate) fn new(peer_id: String, generation: u64, events: PeerEvents) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            generation,
            events,
            stream: SyncMutex::new(None),
            destroyed: AtomicBool::new(false),
            close_emitted: AtomicBool::new(false),
        })
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        if self.is_destroyed() {
            return;
        }
        self.deliver(event);
    }

    fn deliver(&self, event: PeerEvent) {
        let notice = PeerNotice {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        };
        if self.events.send(notice).is_err() {
            tracing::trace!(peer_id = %self.peer_id, "Peer event receiver gone");
        }
    }

    /// Adds a track and raises `stream` only for the first one.
    pub(crate) fn attach_track(&self, stream_id: &str, track: TrackInfo) -> RemoteStream {
        let (stream, first) = {
            let mut slot = match self.stream.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            match slot.as_ref() {
                Some(stream) => (stream.clone(), false),
                None => {
                    let stream = RemoteStream::new(self.peer_id.clone(), stream_id);
                    *slot = Some(stream.clone());
                    (stream, true)
                }
            }
        };

        stream.add_track(track);
        if first {
            self.emit(PeerEvent::Stream(stream.clone()));
        }
        stream
    }

    /// Marks the peer destroyed; returns false if it already was.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn emit_close(&self) {
        if !self.close_emitted.swap(true, Ordering::SeqCst) {
            self.deliver(PeerEvent::Close);
        }
    }
}

/// Peer backed by a real `RTCPeerConnection`. Negotiation is non-trickle:
/// a descriptor is only emitted once ICE gathering has completed.
pub struct RtcPeer {
    peer_id: String,
    initiator: bool,
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    ledger: Mutex<NegotiationLedger>,
    shared: Arc<PeerShared>,
}

impl RtcPeer {
    async fn new(
        api: &API,
        ice: &IceConfig,
        options: PeerOptions,
        events: PeerEvents,
    ) -> Result<Arc<Self>> {
        let PeerOptions {
            peer_id,
            generation,
            initiator,
            local_stream,
        } = options;

        let pc = Arc::new(api.new_peer_connection(rtc_configuration(ice)).await?);
        let shared = PeerShared::new(peer_id.clone(), generation, events);
        let data_channel = Arc::new(RwLock::new(None));

        match &local_stream {
            Some(stream) => {
                for track in stream.tracks() {
                    let sender = pc
                        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                        .await?;
                    // RTCP has to be drained for interceptors to work
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 1500];
                        while sender.read(&mut buf).await.is_ok() {}
                    });
                }
            }
            None => {
                for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                    pc.add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
                }
            }
        }

        if initiator {
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
            wire_data_channel(&dc, &shared);
            *data_channel.write().await = Some(dc);
        } else {
            let slot = data_channel.clone();
            let callback_shared = shared.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let shared = callback_shared.clone();
                Box::pin(async move {
                    tracing::debug!(peer_id = %shared.peer_id, label = %dc.label(), "Data channel opened by remote");
                    wire_data_channel(&dc, &shared);
                    *slot.write().await = Some(dc);
                })
            }));
        }

        let track_shared = shared.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let shared = track_shared.clone();
            Box::pin(async move {
                let info = TrackInfo {
                    id: track.id(),
                    kind: track.kind(),
                };
                tracing::info!(
                    peer_id = %shared.peer_id,
                    track_id = %info.id,
                    kind = %info.kind,
                    "Remote track received"
                );
                let stream = shared.attach_track(&track.stream_id(), info);
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {
                        stream.record_packet();
                    }
                });
            })
        }));

        let state_shared = shared.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let shared = state_shared.clone();
            Box::pin(async move {
                tracing::debug!(peer_id = %shared.peer_id, state = %state, "Peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => shared.emit(PeerEvent::Connect),
                    RTCPeerConnectionState::Failed => {
                        shared.emit(PeerEvent::Error("peer connection failed".into()))
                    }
                    RTCPeerConnectionState::Closed => shared.emit_close(),
                    _ => {}
                }
            })
        }));

        Ok(Arc::new(Self {
            peer_id,
            initiator,
            pc,
            data_channel,
            ledger: Mutex::new(NegotiationLedger::default()),
            shared,
        }))
    }

    async fn local_descriptor(&self) -> Result<SignalDescriptor> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| ProctorError::negotiation(&self.peer_id, "no local description"))?;
        SignalDescriptor::try_from(&local)
    }

    async fn start_offer(&self) -> Result<()> {
        let offer = self.pc.create_offer(None).await?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        let _ = gather_complete.recv().await;

        let descriptor = self.local_descriptor().await?;
        self.shared.emit(PeerEvent::Signal(descriptor));
        Ok(())
    }

    async fn apply_remote(&self, descriptor: &SignalDescriptor) -> Result<()> {
        let remote = descriptor.to_session_description()?;
        self.pc.set_remote_description(remote).await?;

        if descriptor.kind == SignalKind::Offer {
            let answer = self.pc.create_answer(None).await?;
            let mut gather_complete = self.pc.gathering_complete_promise().await;
            self.pc.set_local_description(answer).await?;
            let _ = gather_complete.recv().await;

            let local = self.local_descriptor().await?;
            self.shared.emit(PeerEvent::Signal(local));
        }
        Ok(())
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, shared: &Arc<PeerShared>) {
    let shared = shared.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).to_string();
        let message = text
            .parse::<DataMessage>()
            .unwrap_or(DataMessage::Text(text));
        shared.emit(PeerEvent::Data(message));
        Box::pin(async {})
    }));
}

impl PeerHandle for RtcPeer {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    fn signal(&self, descriptor: SignalDescriptor) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.shared.is_destroyed() {
                return Err(ProctorError::PeerClosed(self.peer_id.clone()));
            }

            let mut ledger = self.ledger.lock().await;
            if let Disposition::Ignore(reason) = ledger.admit(self.initiator, &descriptor) {
                tracing::debug!(peer_id = %self.peer_id, kind = ?descriptor.kind, reason, "Ignoring descriptor");
                return Ok(());
            }

            if let Err(e) = self.apply_remote(&descriptor).await {
                ledger.reject(&descriptor);
                self.shared.emit(PeerEvent::Error(e.to_string()));
                return Err(ProctorError::negotiation(&self.peer_id, e));
            }
            Ok(())
        })
    }

    fn send(&self, message: DataMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let dc = self
                .data_channel
                .read()
                .await
                .clone()
                .ok_or_else(|| ProctorError::DataChannelNotOpen(self.peer_id.clone()))?;

            if dc.ready_state() != RTCDataChannelState::Open {
                return Err(ProctorError::DataChannelNotOpen(self.peer_id.clone()));
            }

            dc.send_text(message.to_string()).await?;
            Ok(())
        })
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.shared.mark_destroyed() {
                return;
            }

            if let Some(dc) = self.data_channel.write().await.take() {
                let _ = dc.close().await;
            }
            if let Err(e) = self.pc.close().await {
                tracing::warn!(peer_id = %self.peer_id, error = %e, "Error closing peer connection");
            }
            self.shared.emit_close();
            tracing::info!(peer_id = %self.peer_id, "Peer destroyed");
        })
    }

    fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }
}

/// Creates [`RtcPeer`]s over one shared WebRTC API instance.
pub struct RtcPeerFactory {
    api: Arc<API>,
    ice: IceConfig,
}

impl RtcPeerFactory {
    pub fn new(ice: IceConfig) -> Result<Self> {
        Ok(Self {
            api: create_webrtc_api()?,
            ice,
        })
    }
}

impl PeerFactory for RtcPeerFactory {
    fn create(
        &self,
        options: PeerOptions,
        events: PeerEvents,
    ) -> BoxFuture<'_, Result<Arc<dyn PeerHandle>>> {
        Box::pin(async move {
            let peer = RtcPeer::new(&self.api, &self.ice, options, events).await?;

            if peer.initiator {
                let offering = peer.clone();
                tokio::spawn(async move {
                    if let Err(e) = offering.start_offer().await {
                        tracing::error!(peer_id = %offering.peer_id, error = %e, "Failed to create offer");
                        offering.shared.emit(PeerEvent::Error(e.to_string()));
                    }
                });
            }

            Ok(peer as Arc<dyn PeerHandle>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: SignalKind, sdp: &str) -> SignalDescriptor {
        SignalDescriptor {
            kind,
            sdp: sdp.to_string(),
        }
    }

    #[test]
    fn test_ledger_ignores_duplicate_answer() {
        let mut ledger = NegotiationLedger::default();
        let answer = descriptor(SignalKind::Answer, "a");

        assert_eq!(ledger.admit(true, &answer), Disposition::Apply);
        assert!(matches!(ledger.admit(true, &answer), Disposition::Ignore(_)));
        assert!(matches!(
            ledger.admit(true, &descriptor(SignalKind::Answer, "b")),
            Disposition::Ignore(_)
        ));
    }

    #[test]
    fn test_ledger_rejects_wrong_side() {
        let mut ledger = NegotiationLedger::default();
        assert!(matches!(
            ledger.admit(true, &descriptor(SignalKind::Offer, "o")),
            Disposition::Ignore(_)
        ));
        assert!(matches!(
            ledger.admit(false, &descriptor(SignalKind::Answer, "a")),
            Disposition::Ignore(_)
        ));
        assert_eq!(
            ledger.admit(false, &descriptor(SignalKind::Offer, "o")),
            Disposition::Apply
        );
    }

    #[test]
    fn test_ledger_reject_allows_retransmit() {
        let mut ledger = NegotiationLedger::default();
        let offer = descriptor(SignalKind::Offer, "o");
        assert_eq!(ledger.admit(false, &offer), Disposition::Apply);
        ledger.reject(&offer);
        assert_eq!(ledger.admit(false, &offer), Disposition::Apply);
    }

    #[test]
    fn test_stream_raised_once_per_peer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = PeerShared::new("peer-1".into(), 1, tx);

        let first = shared.attach_track(
            "stream",
            TrackInfo {
                id: "v".into(),
                kind: RTPCodecType::Video,
            },
        );
        shared.attach_track(
            "stream",
            TrackInfo {
                id: "a".into(),
                kind: RTPCodecType::Audio,
            },
        );

        let mut streams = 0;
        while let Ok(notice) = rx.try_recv() {
            if matches!(notice.event, PeerEvent::Stream(_)) {
                streams += 1;
            }
        }
        assert_eq!(streams, 1);
        assert_eq!(first.tracks().len(), 2);
        assert!(first.has_video());
    }

    #[test]
    fn test_no_events_after_destroy_except_single_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = PeerShared::new("peer-1".into(), 1, tx);

        assert!(shared.mark_destroyed());
        assert!(!shared.mark_destroyed());
        shared.emit(PeerEvent::Connect);
        shared.emit_close();
        shared.emit_close();

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].event, PeerEvent::Close));
    }
}
