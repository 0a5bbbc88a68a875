#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Network failure before or outside any protocol exchange
    #[error("transport: {0}")]
    Transport(String),
    /// Signaling endpoint answered with a non-success status
    #[error("negotiation rejected with status {0}")]
    Negotiation(u16),
    /// Missing or malformed session description
    #[error("protocol: {0}")]
    Protocol(String),
    /// Decode or buffer level, recoverable in place
    #[error("media: {0}")]
    Media(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl SessionError {
    /// Whether a live session may renegotiate after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::Negotiation(_))
    }
}

impl From<libwish::Error> for SessionError {
    fn from(err: libwish::Error) -> Self {
        match err {
            libwish::Error::Transport(e) => SessionError::Transport(e.to_string()),
            libwish::Error::Negotiation { status, .. } => SessionError::Negotiation(status.as_u16()),
            libwish::Error::Protocol(e) => SessionError::Protocol(e),
        }
    }
}

impl From<webrtc::Error> for SessionError {
    fn from(err: webrtc::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}
