// Server-sent-events wire parser and record encoder.
//
// The parser is a push parser: feed it transport bytes as they arrive and
// collect complete records.  A partial record at buffer end is preserved
// for the next read.  Malformed input never kills the parser; the
// offending line is skipped and parsing continues.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;

use crate::event::{Event, EventType, Payload};
use crate::tuning::{SSE_RETRY_DEFAULT, SSE_RETRY_MAX, SSE_RETRY_MIN};
use crate::CodecError;

/// Wire-format event name of a comment record (`:` at column 0).
pub const COMMENT_EVENT: &str = "comment";
/// Wire-format event name of a `retry:` advertisement.
pub const RETRY_EVENT: &str = "retry";

/// One parsed SSE record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
    /// Event name; `message` when the record carried no `event:` field.
    pub event: String,
    /// Value of the `id:` field; 0 when absent.
    pub id: u32,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
}

/// Incremental SSE parser over a byte stream.
#[derive(Debug)]
pub struct SseParser {
    buffer: String,
    /// A chunk ending in `\r` is held back one byte so a `\r\n` pair split
    /// across reads still normalizes to a single newline.
    held_cr: bool,
    at_stream_start: bool,
    // Record under construction.
    event_name: String,
    data: String,
    data_lines: u32,
    id: u32,
    saw_field: bool,
    // Running stream state.
    last_event_id: u32,
    retry: Duration,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        SseParser {
            buffer: String::new(),
            held_cr: false,
            at_stream_start: true,
            event_name: String::new(),
            data: String::new(),
            data_lines: 0,
            id: 0,
            saw_field: false,
            last_event_id: 0,
            retry: SSE_RETRY_DEFAULT,
        }
    }

    /// Largest `id:` seen so far; reset to 0 by an empty or zero id field.
    pub fn last_event_id(&self) -> u32 {
        self.last_event_id
    }

    /// Reconnection delay advertised by the server, clamped to
    /// [50 ms, 3000 ms].
    pub fn retry(&self) -> Duration {
        self.retry
    }

    /// Feed transport bytes; returns every record completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseRecord> {
        let mut bytes = bytes;
        if self.at_stream_start {
            if bytes.is_empty() {
                return Vec::new();
            }
            if bytes.starts_with(&[0xFE, 0xFF]) {
                bytes = &bytes[2..];
            }
            self.at_stream_start = false;
        }

        let mut chunk = String::new();
        if self.held_cr {
            chunk.push('\r');
            self.held_cr = false;
        }
        chunk.push_str(&String::from_utf8_lossy(bytes));
        if chunk.ends_with('\r') {
            chunk.pop();
            self.held_cr = true;
        }

        // Normalize \r\n, \n\r and bare \r to \n.
        let normalized = chunk
            .replace("\r\n", "\n")
            .replace("\n\r", "\n")
            .replace('\r', "\n");
        self.buffer.push_str(&normalized);

        let mut records = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].to_owned();
            self.buffer.drain(..=pos);
            self.take_line(&line, &mut records);
        }
        records
    }

    fn take_line(&mut self, line: &str, records: &mut Vec<SseRecord>) {
        if line.is_empty() {
            // Blank line: dispatch the record under construction, if any.
            if self.saw_field {
                records.push(SseRecord {
                    event: if self.event_name.is_empty() {
                        "message".to_owned()
                    } else {
                        std::mem::take(&mut self.event_name)
                    },
                    id: self.id,
                    data: std::mem::take(&mut self.data),
                });
            }
            self.event_name.clear();
            self.data.clear();
            self.data_lines = 0;
            self.id = 0;
            self.saw_field = false;
            return;
        }

        if line.starts_with(':') {
            // Column-0 colon is a comment; surfaced as its own record.
            records.push(SseRecord {
                event: COMMENT_EVENT.to_owned(),
                id: 0,
                data: line.to_owned(),
            });
            return;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                // One space of padding after the colon is stripped, at max.
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        if field.eq_ignore_ascii_case("event") {
            self.event_name = value.to_owned();
            self.saw_field = true;
        } else if field.eq_ignore_ascii_case("id") {
            let id = value.trim().parse::<u32>().unwrap_or(0);
            if id == 0 {
                // Empty or zero id resets the running last-event-id.
                self.last_event_id = 0;
            } else if id > self.last_event_id {
                self.last_event_id = id;
            }
            self.id = id;
            self.saw_field = true;
        } else if field.eq_ignore_ascii_case("data") {
            if self.data_lines > 0 {
                self.data.push('\n');
            }
            self.data.push_str(value);
            self.data_lines += 1;
            self.saw_field = true;
        } else if field.eq_ignore_ascii_case("retry") {
            // Value is in seconds; the wait window is [50 ms, 3000 ms].
            let seconds = value.trim().parse::<u64>().unwrap_or(0);
            self.retry = Duration::from_secs(seconds).clamp(SSE_RETRY_MIN, SSE_RETRY_MAX);
            records.push(SseRecord {
                event: RETRY_EVENT.to_owned(),
                id: 0,
                data: value.to_owned(),
            });
        } else {
            debug!(field, "ignoring unknown SSE field");
        }
    }
}

/// Canonical wire form of a record:
/// `event: <name>\nid: <n>\ndata: <payload>\n\n`.
pub fn encode_record(record: &SseRecord) -> String {
    if record.event == COMMENT_EVENT {
        return format!("{}\n\n", record.data);
    }
    let mut out = String::new();
    out.push_str("event: ");
    out.push_str(&record.event);
    out.push('\n');
    if record.id != 0 {
        out.push_str("id: ");
        out.push_str(&record.id.to_string());
        out.push('\n');
    }
    for line in record.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Wrap an event for the SSE wire.  Binary payloads travel base64-encoded
/// under the `binary` event name.
pub fn event_to_record(event: &Event) -> SseRecord {
    match &event.payload {
        Payload::Binary(bytes) => SseRecord {
            event: EventType::Binary.as_str().to_owned(),
            id: event.number,
            data: BASE64.encode(bytes),
        },
        Payload::Text(text) => SseRecord {
            event: event.wire_name().to_owned(),
            id: event.number,
            data: text.clone(),
        },
    }
}

/// Reconstruct an event from a parsed record.  Unknown event names map to
/// `Message` with the name preserved as the type name.
pub fn event_from_record(record: &SseRecord) -> Result<Event, CodecError> {
    let mut event = match record.event.as_str() {
        "binary" => Event::binary(BASE64.decode(record.data.as_bytes())?),
        "open" => Event::open(record.data.clone()),
        "error" => Event::error(record.data.clone()),
        "close" => Event::close(record.data.clone()),
        "message" => Event::message(record.data.clone()),
        custom => {
            let mut event = Event::message(record.data.clone());
            event.type_name = custom.to_owned();
            event
        }
    };
    event.number = record.id;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(records: Vec<SseRecord>) -> SseRecord {
        assert_eq!(records.len(), 1, "expected one record, got {records:?}");
        records.into_iter().next().unwrap()
    }

    #[test]
    fn comment_event_and_default_records() {
        let mut parser = SseParser::new();
        let records = parser
            .push(b":comment\nevent: tick\nid: 7\ndata: hello\n\ndata: part1\ndata: part2\n\n");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].event, "comment");
        assert_eq!(
            records[1],
            SseRecord {
                event: "tick".to_owned(),
                id: 7,
                data: "hello".to_owned()
            }
        );
        assert_eq!(
            records[2],
            SseRecord {
                event: "message".to_owned(),
                id: 0,
                data: "part1\npart2".to_owned()
            }
        );
        assert_eq!(parser.last_event_id(), 7);
    }

    #[test]
    fn partial_record_survives_the_read_boundary() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: tick\nda").is_empty());
        assert!(parser.push(b"ta: he").is_empty());
        let record = one(parser.push(b"llo\n\n"));
        assert_eq!(record.event, "tick");
        assert_eq!(record.data, "hello");
    }

    #[test]
    fn crlf_split_across_chunks_is_one_newline() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: a\r").is_empty());
        let records = parser.push(b"\n\r\n");
        assert_eq!(one(records).data, "a");
    }

    #[test]
    fn all_line_endings_normalize() {
        let mut parser = SseParser::new();
        let records = parser.push(b"data: a\r\ndata: b\rdata: c\n\n");
        assert_eq!(one(records).data, "a\nb\nc");
    }

    #[test]
    fn bom_is_stripped_at_stream_start() {
        let mut parser = SseParser::new();
        let records = parser.push(b"\xFE\xFFdata: x\n\n");
        assert_eq!(one(records).data, "x");
    }

    #[test]
    fn retry_is_clamped_and_surfaced() {
        let mut parser = SseParser::new();
        let records = parser.push(b"retry: 2\n");
        assert_eq!(one(records).event, "retry");
        assert_eq!(parser.retry(), Duration::from_millis(2000));

        parser.push(b"retry: 0\n");
        assert_eq!(parser.retry(), Duration::from_millis(50));
        parser.push(b"retry: 900\n");
        assert_eq!(parser.retry(), Duration::from_millis(3000));
    }

    #[test]
    fn empty_id_resets_last_event_id() {
        let mut parser = SseParser::new();
        parser.push(b"id: 12\ndata: x\n\n");
        assert_eq!(parser.last_event_id(), 12);
        parser.push(b"id:\ndata: y\n\n");
        assert_eq!(parser.last_event_id(), 0);
    }

    #[test]
    fn one_space_of_padding_is_stripped() {
        let mut parser = SseParser::new();
        let record = one(parser.push(b"data:  two spaces\n\n"));
        assert_eq!(record.data, " two spaces");
    }

    #[test]
    fn binary_event_round_trips_through_base64() {
        let mut event = Event::binary(vec![0, 159, 146, 150, 255]);
        event.number = 42;
        let record = event_to_record(&event);
        assert_eq!(record.event, "binary");
        let decoded = event_from_record(&record).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn encoded_record_parses_back() {
        let record = SseRecord {
            event: "tick".to_owned(),
            id: 3,
            data: "line1\nline2".to_owned(),
        };
        let wire = encode_record(&record);
        let mut parser = SseParser::new();
        assert_eq!(one(parser.push(wire.as_bytes())), record);
    }

    #[test]
    fn custom_event_name_becomes_message_type_name() {
        let record = SseRecord {
            event: "tick".to_owned(),
            id: 9,
            data: "pay".to_owned(),
        };
        let event = event_from_record(&record).unwrap();
        assert_eq!(event.event_type, EventType::Message);
        assert_eq!(event.type_name, "tick");
        assert_eq!(event.number, 9);
    }
}
