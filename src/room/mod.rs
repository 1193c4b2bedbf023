pub mod backoff;
pub mod coordinator;
pub mod participants;
pub mod peer;
pub mod webrtc_utils;

pub use backoff::{Backoff, ReconnectPolicy};
pub use coordinator::{ExamRoom, PeerBroadcast, RoomEvent, RoomOptions, RoomState};
pub use participants::{ParticipantRegistry, PeerSummary};
pub use peer::{
    PeerEvent, PeerFactory, PeerHandle, PeerNotice, PeerOptions, RemoteStream, RtcPeer,
    RtcPeerFactory,
};
