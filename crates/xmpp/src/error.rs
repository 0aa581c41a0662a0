use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error("request rejected by server: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StanzaError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),
}

impl From<StanzaError> for ConnectionError {
    fn from(error: StanzaError) -> Self {
        ConnectionError::StreamError(error.to_string())
    }
}
