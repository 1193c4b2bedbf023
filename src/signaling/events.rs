use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{ProctorError, Result};

/// Data-channel command that forcibly ends a candidate's exam.
pub const TERMINATE: &str = "TERMINATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "candidate")]
    Candidate,
    #[serde(rename = "admin", alias = "host")]
    Host,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Candidate => write!(f, "candidate"),
            Role::Host => write!(f, "host"),
        }
    }
}

/// Who a client claims to be when it joins a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id", alias = "userId")]
    pub user_id: String,
    #[serde(rename = "type")]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A socket-identified endpoint in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "socketid")]
    pub socket_id: String,
    #[serde(flatten)]
    pub identity: Identity,
}

impl Participant {
    pub fn role(&self) -> Role {
        self.identity.role
    }

    pub fn display_name(&self) -> &str {
        self.identity
            .name
            .as_deref()
            .unwrap_or(&self.identity.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Connection-setup descriptor relayed between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub sdp: String,
}

impl SignalDescriptor {
    pub fn to_session_description(&self) -> Result<RTCSessionDescription> {
        let desc = match self.kind {
            SignalKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SignalKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
            SignalKind::Pranswer => RTCSessionDescription::pranswer(self.sdp.clone()),
            SignalKind::Rollback => {
                return Err(ProctorError::InvalidSignalingMessage(
                    "rollback descriptors are not supported".into(),
                ))
            }
        };
        desc.map_err(|e| ProctorError::InvalidSignalingMessage(e.to_string()))
    }
}

impl TryFrom<&RTCSessionDescription> for SignalDescriptor {
    type Error = ProctorError;

    fn try_from(desc: &RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SignalKind::Offer,
            RTCSdpType::Answer => SignalKind::Answer,
            RTCSdpType::Pranswer => SignalKind::Pranswer,
            RTCSdpType::Rollback => SignalKind::Rollback,
            RTCSdpType::Unspecified => {
                return Err(ProctorError::InvalidSignalingMessage(
                    "local description has no type".into(),
                ))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }
}

/// Signals travel as JSON strings on the wire; both the string and the
/// bare object form are accepted on the way in.
mod signal_wire {
    use super::SignalDescriptor;
    use serde::{de, ser, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(signal: &SignalDescriptor, s: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(signal).map_err(ser::Error::custom)?;
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SignalDescriptor, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Object(SignalDescriptor),
        }

        match Raw::deserialize(d)? {
            Raw::Text(text) => serde_json::from_str(&text).map_err(de::Error::custom),
            Raw::Object(signal) => Ok(signal),
        }
    }
}

fn level_as_string<S: Serializer>(level: &Option<u32>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match level {
        Some(level) => s.serialize_str(&level.to_string()),
        None => s.serialize_none(),
    }
}

fn lenient_level<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(d)? {
        Some(Raw::Number(level)) => Some(level),
        Some(Raw::Text(text)) => text.trim().parse().ok(),
        None => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub frame_data: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub exam_id: String,
}

/// Events a client sends to the room service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join_room")]
    JoinRoom { user: Identity, examid: String },

    #[serde(rename = "new_join")]
    NewJoin,

    #[serde(rename = "sending_signal")]
    SendingSignal {
        to: String,
        from: String,
        #[serde(with = "signal_wire")]
        signal: SignalDescriptor,
    },

    #[serde(rename = "send_signal")]
    SendSignal {
        to: String,
        from: String,
        #[serde(with = "signal_wire")]
        signal: SignalDescriptor,
        #[serde(
            default,
            serialize_with = "level_as_string",
            deserialize_with = "lenient_level"
        )]
        warn: Option<u32>,
    },

    #[serde(rename = "analyzeFrame")]
    AnalyzeFrame(FramePayload),

    #[serde(rename = "startAutomatedMonitoring")]
    StartAutomatedMonitoring {
        #[serde(rename = "examId")]
        exam_id: String,
    },

    #[serde(rename = "stopAutomatedMonitoring")]
    StopAutomatedMonitoring,

    #[serde(rename = "leaveExam")]
    LeaveExam {
        #[serde(rename = "examId")]
        exam_id: String,
    },

    /// Host-issued warning; the service relays it as `warning_received`.
    #[serde(rename = "send_warning")]
    SendWarning { to: String, message: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::NewJoin => "new_join",
            ClientEvent::SendingSignal { .. } => "sending_signal",
            ClientEvent::SendSignal { .. } => "send_signal",
            ClientEvent::AnalyzeFrame(_) => "analyzeFrame",
            ClientEvent::StartAutomatedMonitoring { .. } => "startAutomatedMonitoring",
            ClientEvent::StopAutomatedMonitoring => "stopAutomatedMonitoring",
            ClientEvent::LeaveExam { .. } => "leaveExam",
            ClientEvent::SendWarning { .. } => "send_warning",
        }
    }
}

/// `user_left` carries either a bare socket id or `{userId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Departure {
    SocketId(String),
    User {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl Departure {
    pub fn id(&self) -> &str {
        match self {
            Departure::SocketId(id) => id,
            Departure::User { user_id } => user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub to: String,
    pub from: String,
    #[serde(with = "signal_wire")]
    pub signal: SignalDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnedSignal {
    pub from: String,
    #[serde(with = "signal_wire")]
    pub signal: SignalDescriptor,
    #[serde(
        default,
        serialize_with = "level_as_string",
        deserialize_with = "lenient_level"
    )]
    pub warn: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisResult {
    pub has_multiple_faces: bool,
    pub has_no_face: bool,
    pub has_unusual_movement: bool,
    pub confidence: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuspiciousActivity {
    pub is_suspicious: bool,
    pub reasons: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    #[serde(default)]
    pub suspicious_activity: Option<SuspiciousActivity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousActivityAlert {
    pub user_id: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedWarning {
    pub user_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostWarning {
    pub message: String,
    #[serde(default)]
    pub warning_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disqualification {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectNotice {
    pub user_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Events the room service delivers to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "user_list")]
    UserList(Vec<Participant>),

    #[serde(rename = "user_joined")]
    UserJoined(Participant),

    #[serde(rename = "user_left")]
    UserLeft(Departure),

    #[serde(rename = "receive_signal")]
    ReceiveSignal(SignalEnvelope),

    #[serde(rename = "receiving_returned_signal")]
    ReceivingReturnedSignal(ReturnedSignal),

    #[serde(rename = "frameAnalysisResult")]
    FrameAnalysisResult(AnalysisOutcome),

    #[serde(rename = "suspiciousActivityDetected")]
    SuspiciousActivityDetected(SuspiciousActivityAlert),

    #[serde(rename = "automatedWarningIssued")]
    AutomatedWarningIssued(AutomatedWarning),

    #[serde(rename = "warning_received")]
    WarningReceived(HostWarning),

    #[serde(rename = "candidateDisqualified")]
    CandidateDisqualified(Disqualification),

    #[serde(rename = "userDisconnected")]
    UserDisconnected(DisconnectNotice),
}

/// Subscription keys. Wire events keep their wire names; `connect`,
/// `disconnect` and `connect_error` are raised locally by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    UserList,
    UserJoined,
    UserLeft,
    ReceiveSignal,
    ReceivingReturnedSignal,
    FrameAnalysisResult,
    SuspiciousActivityDetected,
    AutomatedWarningIssued,
    WarningReceived,
    CandidateDisqualified,
    UserDisconnected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::ConnectError => "connect_error",
            EventKind::UserList => "user_list",
            EventKind::UserJoined => "user_joined",
            EventKind::UserLeft => "user_left",
            EventKind::ReceiveSignal => "receive_signal",
            EventKind::ReceivingReturnedSignal => "receiving_returned_signal",
            EventKind::FrameAnalysisResult => "frameAnalysisResult",
            EventKind::SuspiciousActivityDetected => "suspiciousActivityDetected",
            EventKind::AutomatedWarningIssued => "automatedWarningIssued",
            EventKind::WarningReceived => "warning_received",
            EventKind::CandidateDisqualified => "candidateDisqualified",
            EventKind::UserDisconnected => "userDisconnected",
        }
    }
}

/// Everything a channel subscriber can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { message: String },
    Server(ServerEvent),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connected => EventKind::Connect,
            ChannelEvent::Disconnected { .. } => EventKind::Disconnect,
            ChannelEvent::ConnectError { .. } => EventKind::ConnectError,
            ChannelEvent::Server(event) => match event {
                ServerEvent::UserList(_) => EventKind::UserList,
                ServerEvent::UserJoined(_) => EventKind::UserJoined,
                ServerEvent::UserLeft(_) => EventKind::UserLeft,
                ServerEvent::ReceiveSignal(_) => EventKind::ReceiveSignal,
                ServerEvent::ReceivingReturnedSignal(_) => EventKind::ReceivingReturnedSignal,
                ServerEvent::FrameAnalysisResult(_) => EventKind::FrameAnalysisResult,
                ServerEvent::SuspiciousActivityDetected(_) => EventKind::SuspiciousActivityDetected,
                ServerEvent::AutomatedWarningIssued(_) => EventKind::AutomatedWarningIssued,
                ServerEvent::WarningReceived(_) => EventKind::WarningReceived,
                ServerEvent::CandidateDisqualified(_) => EventKind::CandidateDisqualified,
                ServerEvent::UserDisconnected(_) => EventKind::UserDisconnected,
            },
        }
    }
}

/// Peer-to-peer payload carried over the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    WarningLevel(u32),
    Terminate,
    Text(String),
}

impl FromStr for DataMessage {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == TERMINATE {
            return Ok(DataMessage::Terminate);
        }
        if let Ok(level) = trimmed.parse::<u32>() {
            return Ok(DataMessage::WarningLevel(level));
        }
        Ok(DataMessage::Text(s.to_string()))
    }
}

impl fmt::Display for DataMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataMessage::WarningLevel(level) => write!(f, "{}", level),
            DataMessage::Terminate => write!(f, "{}", TERMINATE),
            DataMessage::Text(text) => write!(f, "{}", text),
        }
    }
}
