// Event value type and addressee fingerprints.
//
// Events are immutable after construction.  The owning channel stamps the
// sequence number at enqueue time; ownership moves with the event from
// queue to queue until the last holder drains it.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Salt folded into the CRC-32 of a client identity string so that raw
/// addresses never appear as bare checksums on the wire.
pub const SENDER_FINGERPRINT_SEED: u32 = 0xADF7_4FF6;

/// The five event kinds carried over every transport.
///
/// `Open` is emitted at most once at the start of a stream and `Close` at
/// most once at its end; the other three may be interleaved freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Open,
    Message,
    Binary,
    Error,
    Close,
}

impl EventType {
    /// Wire name used by the SSE `event:` field and the SOAP `Type`
    /// parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Open => "open",
            EventType::Message => "message",
            EventType::Binary => "binary",
            EventType::Error => "error",
            EventType::Close => "close",
        }
    }

    pub fn parse(name: &str) -> Result<Self, CodecError> {
        match name {
            "open" => Ok(EventType::Open),
            "message" => Ok(EventType::Message),
            "binary" => Ok(EventType::Binary),
            "error" => Ok(EventType::Error),
            "close" => Ok(EventType::Close),
            other => Err(CodecError::UnknownEventType(other.to_owned())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload: UTF-8 text or opaque bytes.
///
/// Binary payloads survive text-only transports (SSE, long-polling) by
/// base64 armoring inside the codec layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn is_utf8(&self) -> bool {
        matches!(self, Payload::Text(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text view of the payload; binary bytes are rendered lossily.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Payload::Text(s) => std::borrow::Cow::Borrowed(s),
            Payload::Binary(b) => String::from_utf8_lossy(b),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

/// One server-push event.
///
/// `number` is 0 until the owning channel assigns it at enqueue time, then
/// monotonically increasing and gap-free within that channel.  `addressee`
/// is 0 for broadcast or the fingerprint of the single intended recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub number: u32,
    pub addressee: u32,
    /// Optional wire event-name override for `Message` events; empty means
    /// the plain type name is used on the wire.
    pub type_name: String,
    pub payload: Payload,
}

impl Event {
    pub fn new(event_type: EventType, payload: Payload) -> Self {
        Event {
            event_type,
            number: 0,
            addressee: 0,
            type_name: String::new(),
            payload,
        }
    }

    pub fn open(text: impl Into<String>) -> Self {
        Event::new(EventType::Open, Payload::Text(text.into()))
    }

    pub fn message(text: impl Into<String>) -> Self {
        Event::new(EventType::Message, Payload::Text(text.into()))
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Event::new(EventType::Binary, Payload::Binary(bytes))
    }

    pub fn error(text: impl Into<String>) -> Self {
        Event::new(EventType::Error, Payload::Text(text.into()))
    }

    pub fn close(text: impl Into<String>) -> Self {
        Event::new(EventType::Close, Payload::Text(text.into()))
    }

    /// Wire event name: the `Message` type-name override when present,
    /// otherwise the plain type name.
    pub fn wire_name(&self) -> &str {
        if self.event_type == EventType::Message && !self.type_name.is_empty() {
            &self.type_name
        } else {
            self.event_type.as_str()
        }
    }
}

/// Addressee fingerprint over a remote identity string; 0 means broadcast.
pub fn sender_fingerprint(identity: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(SENDER_FINGERPRINT_SEED);
    hasher.update(identity.as_bytes());
    hasher.finalize()
}

/// Canonical identity string for a connected peer: `S<addr>:D<desktop>`.
pub fn client_identity(addr: SocketAddr, desktop: u32) -> String {
    format!("S{addr}:D{desktop}")
}
