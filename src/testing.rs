//! In-process fakes for the coordinator, session and reporter tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use futures::future::BoxFuture;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::api::ExamApi;
use crate::error::{ProctorError, Result};
use crate::media::{FrameSource, LocalStream, MediaProvider};
use crate::room::peer::{
    Disposition, NegotiationLedger, PeerEvent, PeerEvents, PeerFactory, PeerHandle, PeerOptions,
    PeerShared, TrackInfo,
};
use crate::room::PeerBroadcast;
use crate::signaling::{DataMessage, SignalDescriptor, SignalKind};

/// Peer that negotiates instantly: applying a remote offer answers it, and
/// either side reports `connect` plus a single video stream.
pub struct FakePeer {
    peer_id: String,
    initiator: bool,
    had_local_stream: bool,
    shared: Arc<PeerShared>,
    ledger: SyncMutex<NegotiationLedger>,
    open: AtomicBool,
    sent: SyncMutex<Vec<DataMessage>>,
    destroy_calls: AtomicU32,
}

impl FakePeer {
    pub fn sent(&self) -> Vec<DataMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn had_local_stream(&self) -> bool {
        self.had_local_stream
    }

    /// Reports a connection failure the way a real transport would.
    pub fn fail(&self, reason: &str) {
        self.shared.emit(PeerEvent::Error(reason.to_string()));
    }

    fn connected(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.shared.emit(PeerEvent::Connect);
        self.shared.attach_track(
            &format!("stream-{}", self.peer_id),
            TrackInfo {
                id: "video".into(),
                kind: RTPCodecType::Video,
            },
        );
    }
}

impl PeerHandle for FakePeer {
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
            let disposition = self.ledger.lock().unwrap().admit(self.initiator, &descriptor);
            if let Disposition::Ignore(_) = disposition {
                return Ok(());
            }

            if descriptor.kind == SignalKind::Offer {
                self.shared.emit(PeerEvent::Signal(SignalDescriptor {
                    kind: SignalKind::Answer,
                    sdp: format!("answer-from-{}", self.peer_id),
                }));
            }
            self.connected();
            Ok(())
        })
    }

    fn send(&self, message: DataMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.open.load(Ordering::SeqCst) || self.shared.is_destroyed() {
                return Err(ProctorError::DataChannelNotOpen(self.peer_id.clone()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            if self.shared.mark_destroyed() {
                self.open.store(false, Ordering::SeqCst);
                self.shared.emit_close();
            }
        })
    }

    fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    peers: SyncMutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn created(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    /// Most recent peer created for `peer_id`.
    pub fn peer(&self, peer_id: &str) -> Option<Arc<FakePeer>> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.peer_id == peer_id)
            .cloned()
    }
}

impl PeerFactory for FakePeerFactory {
    fn create(
        &self,
        options: PeerOptions,
        events: PeerEvents,
    ) -> BoxFuture<'_, Result<Arc<dyn PeerHandle>>> {
        Box::pin(async move {
            let peer = Arc::new(FakePeer {
                shared: PeerShared::new(options.peer_id.clone(), options.generation, events),
                peer_id: options.peer_id,
                initiator: options.initiator,
                had_local_stream: options.local_stream.is_some(),
                ledger: SyncMutex::new(NegotiationLedger::default()),
                open: AtomicBool::new(false),
                sent: SyncMutex::new(Vec::new()),
                destroy_calls: AtomicU32::new(0),
            });
            if peer.initiator {
                peer.shared.emit(PeerEvent::Signal(SignalDescriptor {
                    kind: SignalKind::Offer,
                    sdp: format!("offer-to-{}", peer.peer_id),
                }));
            }
            self.peers.lock().unwrap().push(peer.clone());
            Ok(peer as Arc<dyn PeerHandle>)
        })
    }
}

/// Frame source whose current frame tests can swap.
#[derive(Default)]
pub struct StillFrames {
    frame: SyncMutex<Option<Vec<u8>>>,
}

impl StillFrames {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_frame(frame: Vec<u8>) -> Self {
        Self {
            frame: SyncMutex::new(Some(frame)),
        }
    }

    pub fn set(&self, frame: Vec<u8>) {
        *self.frame.lock().unwrap() = Some(frame);
    }
}

impl FrameSource for StillFrames {
    fn snapshot(&self) -> Option<Vec<u8>> {
        self.frame.lock().unwrap().clone()
    }
}

/// Media that is either always granted or always denied.
#[derive(Default)]
pub struct FakeMediaProvider {
    deny: bool,
    acquired: AtomicU32,
    released: Arc<AtomicU32>,
}

impl FakeMediaProvider {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }
}

impl MediaProvider for FakeMediaProvider {
    fn acquire(&self) -> BoxFuture<'_, Result<LocalStream>> {
        Box::pin(async move {
            if self.deny {
                return Err(ProctorError::MediaAccess("permission denied".into()));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            let (video, audio) = LocalStream::create_tracks("fake-camera");
            let frames: Arc<dyn FrameSource> = Arc::new(StillFrames::with_frame(vec![0xFF, 0xD8]));
            let released = self.released.clone();
            Ok(LocalStream::new(video, Some(audio), Some(frames)).with_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        })
    }
}

/// Records successful exit calls; `fail_next` makes the next call fail.
#[derive(Default)]
pub struct RecordingApi {
    messages: SyncMutex<Vec<String>>,
    fail_next: AtomicBool,
}

impl RecordingApi {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl ExamApi for RecordingApi {
    fn exit_answer<'a>(
        &'a self,
        _exam_id: &'a str,
        _answer_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ProctorError::Api("service unavailable".into()));
            }
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct RecordingBroadcast {
    sent: SyncMutex<Vec<DataMessage>>,
}

impl RecordingBroadcast {
    pub fn sent(&self) -> Vec<DataMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl PeerBroadcast for RecordingBroadcast {
    fn broadcast(&self, message: DataMessage) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(message);
            1
        })
    }
}
