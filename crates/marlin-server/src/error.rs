use axum::http::StatusCode;

/// Why an incoming connection was refused.  Contained to the connection it
/// arose in; never mutates channel state.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("transport not allowed by channel policy")]
    PolicyViolation,
    #[error("cookie authentication failed")]
    AuthFailure,
    #[error("attach attempts arriving too fast")]
    BruteForce,
    #[error("no channel for this request")]
    UnknownChannel,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("malformed request body")]
    Malformed,
}

impl AttachError {
    pub fn status(&self) -> StatusCode {
        match self {
            AttachError::PolicyViolation | AttachError::Malformed => StatusCode::BAD_REQUEST,
            AttachError::AuthFailure | AttachError::BruteForce => StatusCode::FORBIDDEN,
            AttachError::UnknownChannel | AttachError::ChannelClosed => StatusCode::NOT_FOUND,
        }
    }
}
