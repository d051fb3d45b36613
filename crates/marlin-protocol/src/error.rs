/// Errors raised while translating transport bytes to events and back.
///
/// A codec error is always contained within the record or envelope it arose
/// in; callers skip the offending unit and keep the connection alive unless
/// the stream itself is broken.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("UTF-16 body is not accepted on the wire")]
    Utf16Body,
    #[error("missing element: {0}")]
    MissingElement(&'static str),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
}
