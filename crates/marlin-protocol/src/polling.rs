// Long-polling SOAP codec.
//
// The transport unit is a SOAP 1.2 envelope with action `GetMessage`.  The
// server decodes requests and encodes replies; the client mirrors.  The
// wire is UTF-8 only; a UTF-16 body is a parse error.

use quick_xml::escape::escape;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;

use crate::event::{EventType, Payload};
use crate::CodecError;

pub const POLLING_NAMESPACE: &str = "http://www.marlin.org/polling";
pub const SOAP_ENVELOPE_NAMESPACE: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const GET_MESSAGE_ACTION: &str = "GetMessage";

/// Client request: acknowledge everything up to `acknowledged`, optionally
/// piggyback one client→server event, optionally close the channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PollRequest {
    pub acknowledged: u32,
    pub event_type: Option<EventType>,
    pub message: Option<String>,
    pub close_channel: bool,
}

/// Server reply: the next retained event, an empty-queue marker, or the
/// channel-closed acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReply {
    Empty,
    Delivered {
        number: u32,
        event_type: EventType,
        /// Wire form of the payload; base64 when `event_type` is `Binary`.
        message: String,
    },
    Closed,
}

/// Wire form of a payload for the `Message` parameter.
pub fn payload_to_wire(payload: &Payload) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    match payload {
        Payload::Text(text) => text.clone(),
        Payload::Binary(bytes) => BASE64.encode(bytes),
    }
}

/// Inverse of [`payload_to_wire`], steered by the event type.
pub fn payload_from_wire(event_type: EventType, message: &str) -> Result<Payload, CodecError> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    if event_type == EventType::Binary {
        Ok(Payload::Binary(BASE64.decode(message.as_bytes())?))
    } else {
        Ok(Payload::Text(message.to_owned()))
    }
}

pub fn encode_request(request: &PollRequest) -> String {
    let mut body = String::new();
    text_element(&mut body, "Acknowledged", &request.acknowledged.to_string());
    if let Some(event_type) = request.event_type {
        text_element(&mut body, "Type", event_type.as_str());
    }
    if let Some(message) = &request.message {
        text_element(&mut body, "Message", message);
    }
    if request.close_channel {
        text_element(&mut body, "CloseChannel", "true");
    }
    envelope(GET_MESSAGE_ACTION, &body)
}

pub fn encode_reply(reply: &PollReply) -> String {
    let mut body = String::new();
    match reply {
        PollReply::Empty => text_element(&mut body, "Empty", "true"),
        PollReply::Delivered {
            number,
            event_type,
            message,
        } => {
            text_element(&mut body, "Number", &number.to_string());
            text_element(&mut body, "Type", event_type.as_str());
            text_element(&mut body, "Message", message);
        }
        PollReply::Closed => text_element(&mut body, "ChannelClosed", "true"),
    }
    envelope("GetMessageResponse", &body)
}

pub fn decode_request(body: &[u8]) -> Result<PollRequest, CodecError> {
    let fields = scan_envelope(body, "GetMessage")?;
    let mut request = PollRequest {
        acknowledged: 0,
        event_type: None,
        message: None,
        close_channel: false,
    };
    for (name, value) in fields {
        match name.as_str() {
            "Acknowledged" => request.acknowledged = value.trim().parse().unwrap_or(0),
            "Type" => request.event_type = Some(EventType::parse(value.trim())?),
            "Message" => request.message = Some(value),
            "CloseChannel" => request.close_channel = parse_bool(&value),
            _ => {}
        }
    }
    Ok(request)
}

pub fn decode_reply(body: &[u8]) -> Result<PollReply, CodecError> {
    let fields = scan_envelope(body, "GetMessageResponse")?;
    let mut empty = false;
    let mut closed = false;
    let mut number: Option<u32> = None;
    let mut event_type: Option<EventType> = None;
    let mut message = String::new();
    for (name, value) in fields {
        match name.as_str() {
            "Empty" => empty = parse_bool(&value),
            "ChannelClosed" => closed = parse_bool(&value),
            "Number" => number = value.trim().parse().ok(),
            "Type" => event_type = Some(EventType::parse(value.trim())?),
            "Message" => message = value,
            _ => {}
        }
    }
    if closed {
        return Ok(PollReply::Closed);
    }
    if empty {
        return Ok(PollReply::Empty);
    }
    match (number, event_type) {
        (Some(number), Some(event_type)) => Ok(PollReply::Delivered {
            number,
            event_type,
            message,
        }),
        (None, _) => Err(CodecError::MissingElement("Number")),
        (_, None) => Err(CodecError::MissingElement("Type")),
    }
}

// ---------------------------------------------------------------------------
// Envelope plumbing
// ---------------------------------------------------------------------------

fn envelope(action: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <s:Envelope xmlns:s=\"{SOAP_ENVELOPE_NAMESPACE}\">\
         <s:Body>\
         <{action} xmlns=\"{POLLING_NAMESPACE}\">{body}</{action}>\
         </s:Body>\
         </s:Envelope>"
    )
}

fn text_element(out: &mut String, name: &str, value: &str) {
    out.push('<');
    out.push_str(name);
    out.push('>');
    out.push_str(&escape(value));
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// Walk the envelope and collect `(local name, text)` pairs of the action
/// element's children.  Verifies the action element is present.
fn scan_envelope(body: &[u8], action: &str) -> Result<Vec<(String, String)>, CodecError> {
    if body.starts_with(&[0xFF, 0xFE]) || body.starts_with(&[0xFE, 0xFF]) {
        return Err(CodecError::Utf16Body);
    }
    let text =
        std::str::from_utf8(body).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
    let head = &text[..text.len().min(120)];
    if head.to_ascii_lowercase().contains("utf-16") {
        return Err(CodecError::Utf16Body);
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut fields = Vec::new();
    let mut saw_action = false;
    let mut in_action = false;
    let mut current: Option<String> = None;
    loop {
        match reader.read_event()? {
            XmlEvent::Start(start) => {
                let local = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                if local == action {
                    saw_action = true;
                    in_action = true;
                } else if in_action {
                    current = Some(local);
                }
            }
            XmlEvent::Text(content) => {
                if let Some(name) = &current {
                    let value = content.unescape()?;
                    fields.push((name.clone(), value.into_owned()));
                }
            }
            XmlEvent::End(end) => {
                let local = String::from_utf8_lossy(end.local_name().as_ref()).into_owned();
                if local == action {
                    in_action = false;
                }
                current = None;
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }
    if !saw_action {
        return Err(CodecError::MissingElement("GetMessage"));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let request = PollRequest {
            acknowledged: 17,
            event_type: Some(EventType::Message),
            message: Some("a <b> & c".to_owned()),
            close_channel: false,
        };
        let wire = encode_request(&request);
        assert!(wire.contains(POLLING_NAMESPACE));
        assert_eq!(decode_request(wire.as_bytes()).unwrap(), request);
    }

    #[test]
    fn close_request_round_trips() {
        let request = PollRequest {
            acknowledged: 5,
            close_channel: true,
            ..PollRequest::default()
        };
        let wire = encode_request(&request);
        let decoded = decode_request(wire.as_bytes()).unwrap();
        assert!(decoded.close_channel);
        assert_eq!(decoded.acknowledged, 5);
    }

    #[test]
    fn reply_variants_round_trip() {
        for reply in [
            PollReply::Empty,
            PollReply::Closed,
            PollReply::Delivered {
                number: 9,
                event_type: EventType::Binary,
                message: payload_to_wire(&Payload::Binary(vec![1, 2, 3])),
            },
        ] {
            let wire = encode_reply(&reply);
            assert_eq!(decode_reply(wire.as_bytes()).unwrap(), reply);
        }
    }

    #[test]
    fn binary_payload_survives_the_wire() {
        let payload = Payload::Binary(vec![0, 255, 128, 7]);
        let wire = payload_to_wire(&payload);
        assert_eq!(payload_from_wire(EventType::Binary, &wire).unwrap(), payload);
    }

    #[test]
    fn utf16_bodies_are_rejected() {
        assert!(matches!(
            decode_request(&[0xFF, 0xFE, 0x3C, 0x00]),
            Err(CodecError::Utf16Body)
        ));
        let declared = "<?xml version=\"1.0\" encoding=\"UTF-16\"?><x/>";
        assert!(matches!(
            decode_request(declared.as_bytes()),
            Err(CodecError::Utf16Body)
        ));
    }

    #[test]
    fn missing_action_element_is_an_error() {
        let wire = "<?xml version=\"1.0\"?><Other/>";
        assert!(matches!(
            decode_request(wire.as_bytes()),
            Err(CodecError::MissingElement(_))
        ));
    }
}
