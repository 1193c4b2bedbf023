use thiserror::Error;

/// Error types for the proctoring client
#[derive(Debug, Error)]
pub enum ProctorError {
    /// Media acquisition errors (camera/microphone denied or absent)
    #[error("Media access failed: {0}")]
    MediaAccess(String),

    #[error("Media pipeline error: {0}")]
    MediaPipeline(String),

    /// Signaling transport errors
    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Reconnection failed after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Peer negotiation errors
    #[error("Negotiation with peer {peer_id} failed: {reason}")]
    Negotiation { peer_id: String, reason: String },

    #[error("Peer {0} not found")]
    PeerNotFound(String),

    #[error("Peer {0} is closed")]
    PeerClosed(String),

    #[error("Data channel to peer {0} is not open")]
    DataChannelNotOpen(String),

    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Proctoring session errors
    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Warning store error: {0}")]
    WarningStore(String),

    /// REST collaborator errors
    #[error("Exam API error: {0}")]
    Api(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigurationParseFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ProctorError
pub type Result<T> = std::result::Result<T, ProctorError>;

impl ProctorError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ProctorError::Internal(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ProctorError::Transport(msg.into())
    }

    pub fn media(msg: impl Into<String>) -> Self {
        ProctorError::MediaPipeline(msg.into())
    }

    pub fn negotiation(peer_id: impl Into<String>, reason: impl ToString) -> Self {
        ProctorError::Negotiation {
            peer_id: peer_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Session-level failures that the UI must show as a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProctorError::MediaAccess(_) | ProctorError::ReconnectExhausted(_)
        )
    }
}

impl From<webrtc::Error> for ProctorError {
    fn from(err: webrtc::Error) -> Self {
        ProctorError::WebRtcApi(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProctorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ProctorError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ProctorError {
    fn from(err: reqwest::Error) -> Self {
        ProctorError::Api(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProctorError::PeerNotFound("socket-1".to_string());
        assert_eq!(err.to_string(), "Peer socket-1 not found");

        let err = ProctorError::negotiation("socket-2", "bad sdp");
        assert_eq!(err.to_string(), "Negotiation with peer socket-2 failed: bad sdp");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ProctorError::MediaAccess("denied".into()).is_terminal());
        assert!(ProctorError::ReconnectExhausted(3).is_terminal());
        assert!(!ProctorError::transport("reset").is_terminal());
        assert!(!ProctorError::negotiation("p", "x").is_terminal());
    }
}
