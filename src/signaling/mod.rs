pub mod channel;
pub mod events;

pub use channel::{MemoryRemote, SignalingChannel, Subscription, SubscriptionGuard};
pub use events::{
    ChannelEvent, ClientEvent, DataMessage, EventKind, Identity, Participant, Role,
    ServerEvent, SignalDescriptor, SignalKind,
};
