use marlin_protocol::{ChannelPolicy, CodecError};

/// Why a client transport attempt or exchange failed.  Contained to the
/// attempt it arose in; the driver moves on to the next failover candidate.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("WebSocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("stream did not reach the open state in time")]
    OpenTimeout,
    #[error("no transport could be attached for policy {0}")]
    NoTransport(ChannelPolicy),
}
