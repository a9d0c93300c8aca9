//! The binary event form: the on-disk encoding used by snapshot event
//! regions, durable-log entries, and transaction state files.
//!
//! Each event is one kind byte followed by a kind-specific payload. The
//! high bit of the kind byte flags an attached tag, encoded as a u16
//! big-endian length plus UTF-8 bytes. Strings and keys are u32 big-endian
//! length-prefixed; integers are i64 big-endian; floats are IEEE-754 bit
//! patterns, big-endian.

use bytes::{BufMut, BytesMut};
use ordered_float::NotNan;

use crate::{Event, EventError};

const KIND_BEGIN_OBJECT: u8 = 0x01;
const KIND_END_OBJECT: u8 = 0x02;
const KIND_BEGIN_ARRAY: u8 = 0x03;
const KIND_END_ARRAY: u8 = 0x04;
const KIND_KEY: u8 = 0x05;
const KIND_INT_KEY: u8 = 0x06;
const KIND_STRING: u8 = 0x07;
const KIND_INT: u8 = 0x08;
const KIND_FLOAT: u8 = 0x09;
const KIND_BOOL: u8 = 0x0a;
const KIND_NULL: u8 = 0x0b;
const KIND_COMMENT: u8 = 0x0c;
const KIND_NULL_KEY: u8 = 0x0d;

const TAG_FLAG: u8 = 0x80;

/// Appends the binary encoding of one event to `buf`.
pub fn encode_event(buf: &mut BytesMut, event: &Event) {
    let (kind, tag) = match event {
        Event::BeginObject { tag } => (KIND_BEGIN_OBJECT, tag.as_deref()),
        Event::EndObject => (KIND_END_OBJECT, None),
        Event::BeginArray { tag } => (KIND_BEGIN_ARRAY, tag.as_deref()),
        Event::EndArray => (KIND_END_ARRAY, None),
        Event::Key(_) => (KIND_KEY, None),
        Event::IntKey(_) => (KIND_INT_KEY, None),
        Event::NullKey => (KIND_NULL_KEY, None),
        Event::String { tag, .. } => (KIND_STRING, tag.as_deref()),
        Event::Int { tag, .. } => (KIND_INT, tag.as_deref()),
        Event::Float { tag, .. } => (KIND_FLOAT, tag.as_deref()),
        Event::Bool { tag, .. } => (KIND_BOOL, tag.as_deref()),
        Event::Null { tag } => (KIND_NULL, tag.as_deref()),
        Event::Comment(_) => (KIND_COMMENT, None),
    };

    buf.put_u8(if tag.is_some() { kind | TAG_FLAG } else { kind });
    if let Some(tag) = tag {
        buf.put_u16(tag.len() as u16);
        buf.put_slice(tag.as_bytes());
    }

    match event {
        Event::Key(name) => {
            buf.put_u32(name.len() as u32);
            buf.put_slice(name.as_bytes());
        }
        Event::IntKey(value) => buf.put_i64(*value),
        Event::String { value, .. } => {
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        Event::Int { value, .. } => buf.put_i64(*value),
        Event::Float { value, .. } => buf.put_u64(value.into_inner().to_bits()),
        Event::Bool { value, .. } => buf.put_u8(u8::from(*value)),
        Event::Comment(lines) => {
            buf.put_u16(lines.len() as u16);
            for line in lines {
                buf.put_u32(line.len() as u32);
                buf.put_slice(line.as_bytes());
            }
        }
        _ => {}
    }
}

/// Encodes a sequence of events.
pub fn encode_events(events: &[Event]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(events.len() * 8);
    for event in events {
        encode_event(&mut buf, event);
    }
    buf
}

/// Incremental decoder over a byte slice of binary-form events.
///
/// `position` reports the byte offset of the next unread event, which is
/// what the snapshot index records. `depth` is zero at the top of the
/// stream and again after each complete top-level value.
#[derive(Debug)]
pub struct BinaryEventDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> BinaryEventDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BinaryEventDecoder { buf, pos: 0, depth: 0 }
    }

    /// Starts decoding at a byte offset (a snapshot index offset).
    pub fn at_offset(buf: &'a [u8], offset: usize) -> Self {
        BinaryEventDecoder {
            buf,
            pos: offset,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Decodes the next event; `None` at end of input.
    pub fn next_event(&mut self) -> Result<Option<Event>, EventError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let start = self.pos;
        let kind_byte = self.take_u8()?;
        let kind = kind_byte & !TAG_FLAG;
        let tag = if kind_byte & TAG_FLAG != 0 {
            let len = self.take_u16()? as usize;
            Some(self.take_string(len, start)?)
        } else {
            None
        };

        let event = match kind {
            KIND_BEGIN_OBJECT => Event::BeginObject { tag },
            KIND_END_OBJECT => Event::EndObject,
            KIND_BEGIN_ARRAY => Event::BeginArray { tag },
            KIND_END_ARRAY => Event::EndArray,
            KIND_KEY => {
                let len = self.take_u32()? as usize;
                Event::Key(self.take_string(len, start)?)
            }
            KIND_INT_KEY => Event::IntKey(self.take_i64()?),
            KIND_NULL_KEY => Event::NullKey,
            KIND_STRING => {
                let len = self.take_u32()? as usize;
                Event::String {
                    value: self.take_string(len, start)?,
                    tag,
                }
            }
            KIND_INT => Event::Int {
                value: self.take_i64()?,
                tag,
            },
            KIND_FLOAT => {
                let bits = self.take_u64()?;
                let value = NotNan::new(f64::from_bits(bits)).map_err(|_| {
                    EventError::InvalidEncoding {
                        position: start,
                        reason: "float event is NaN".to_string(),
                    }
                })?;
                Event::Float { value, tag }
            }
            KIND_BOOL => Event::Bool {
                value: self.take_u8()? != 0,
                tag,
            },
            KIND_NULL => Event::Null { tag },
            KIND_COMMENT => {
                let count = self.take_u16()? as usize;
                let mut lines = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let len = self.take_u32()? as usize;
                    lines.push(self.take_string(len, start)?);
                }
                Event::Comment(lines)
            }
            other => {
                return Err(EventError::InvalidEncoding {
                    position: start,
                    reason: format!("unknown event kind byte {other:#04x}"),
                });
            }
        };

        match &event {
            Event::BeginObject { .. } | Event::BeginArray { .. } => self.depth += 1,
            // Saturating: a decoder restarted at an index offset sees the
            // ends of containers whose begins are before the offset.
            Event::EndObject | Event::EndArray => {
                self.depth = self.depth.saturating_sub(1);
            }
            _ => {}
        }

        Ok(Some(event))
    }

    fn take_u8(&mut self) -> Result<u8, EventError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(EventError::UnexpectedEof { depth: self.depth })?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], EventError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(EventError::UnexpectedEof { depth: self.depth })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16, EventError> {
        let bytes = self.take_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, EventError> {
        let bytes = self.take_slice(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, EventError> {
        let bytes = self.take_slice(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn take_i64(&mut self) -> Result<i64, EventError> {
        Ok(self.take_u64()? as i64)
    }

    fn take_string(&mut self, len: usize, start: usize) -> Result<String, EventError> {
        let bytes = self.take_slice(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| EventError::InvalidEncoding {
            position: start,
            reason: "string payload is not UTF-8".to_string(),
        })
    }
}

/// Decodes a full buffer of events.
pub fn decode_events(buf: &[u8]) -> Result<Vec<Event>, EventError> {
    let mut decoder = BinaryEventDecoder::new(buf);
    let mut events = Vec::new();
    while let Some(event) = decoder.next_event()? {
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::BeginObject { tag: Some("type".into()) },
            Event::key("name"),
            Event::string("ada"),
            Event::key("age"),
            Event::Int { value: 36, tag: None },
            Event::IntKey(3002),
            Event::Float {
                value: NotNan::new(2.5).unwrap(),
                tag: Some("bracket".into()),
            },
            Event::NullKey,
            Event::Null { tag: None },
            Event::key("ok"),
            Event::bool(true),
            Event::key("note"),
            Event::Comment(vec!["line one".into(), "line two".into()]),
            Event::null(),
            Event::EndObject,
        ]
    }

    #[test]
    fn round_trip() {
        let events = sample_events();
        let encoded = encode_events(&events);
        let decoded = decode_events(&encoded).unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn depth_tracks_containers() {
        let events = vec![
            Event::begin_object(),
            Event::key("xs"),
            Event::begin_array(),
            Event::int(1),
            Event::EndArray,
            Event::EndObject,
        ];
        let encoded = encode_events(&events);
        let mut decoder = BinaryEventDecoder::new(&encoded);
        let mut depths = Vec::new();
        while let Some(_) = decoder.next_event().unwrap() {
            depths.push(decoder.depth());
        }
        assert_eq!(depths, [1, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn position_is_a_valid_restart_offset() {
        let events = sample_events();
        let encoded = encode_events(&events);

        // Find the offset right after the first three events.
        let mut decoder = BinaryEventDecoder::new(&encoded);
        for _ in 0..3 {
            decoder.next_event().unwrap().unwrap();
        }
        let offset = decoder.position();

        let mut restarted = BinaryEventDecoder::at_offset(&encoded, offset);
        assert_eq!(restarted.next_event().unwrap().unwrap(), events[3]);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let encoded = encode_events(&[Event::string("hello world")]);
        let truncated = &encoded[..encoded.len() - 3];
        let mut decoder = BinaryEventDecoder::new(truncated);
        assert!(decoder.next_event().is_err());
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let mut decoder = BinaryEventDecoder::new(&[0x7f]);
        assert!(decoder.next_event().is_err());
    }
}
