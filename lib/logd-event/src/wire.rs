//! The compact textual wire form of an event stream.
//!
//! Whitespace-insignificant: `{ key: value, ... }`, `[v, ...]`, `!tag`
//! prefixes, `# ...` comment lines. The encoder and decoder here are
//! streaming counterparts of the node-level notation in `logd-value`; they
//! translate events one at a time without materializing a tree.

use std::fmt::Write as _;

use ordered_float::NotNan;

use crate::{Event, EventError};

#[derive(Debug, Clone, Copy)]
enum Container {
    Object { first: bool },
    Array { first: bool },
}

/// Renders events into the compact textual form.
#[derive(Debug, Default)]
pub struct WireEventEncoder {
    out: String,
    stack: Vec<Container>,
    after_key: bool,
}

impl WireEventEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn finish(self) -> String {
        self.out
    }

    pub fn emit(&mut self, event: &Event) -> Result<(), EventError> {
        match event {
            Event::Comment(lines) => {
                for line in lines {
                    let _ = writeln!(self.out, "# {line}");
                }
                Ok(())
            }
            Event::Key(name) => {
                self.begin_entry()?;
                if key_needs_quoting(name) {
                    write_string(&mut self.out, name);
                } else {
                    self.out.push_str(name);
                }
                self.out.push_str(": ");
                self.after_key = true;
                Ok(())
            }
            Event::IntKey(value) => {
                self.begin_entry()?;
                let _ = write!(self.out, "{value}: ");
                self.after_key = true;
                Ok(())
            }
            Event::NullKey => {
                self.begin_entry()?;
                self.out.push_str("null: ");
                self.after_key = true;
                Ok(())
            }
            Event::BeginObject { tag } => {
                self.begin_value(tag.as_deref())?;
                self.out.push('{');
                self.stack.push(Container::Object { first: true });
                Ok(())
            }
            Event::BeginArray { tag } => {
                self.begin_value(tag.as_deref())?;
                self.out.push('[');
                self.stack.push(Container::Array { first: true });
                Ok(())
            }
            Event::EndObject => match self.stack.pop() {
                Some(Container::Object { .. }) => {
                    self.out.push('}');
                    Ok(())
                }
                _ => Err(EventError::MalformedStream {
                    reason: "unmatched end of object".to_string(),
                }),
            },
            Event::EndArray => match self.stack.pop() {
                Some(Container::Array { .. }) => {
                    self.out.push(']');
                    Ok(())
                }
                _ => Err(EventError::MalformedStream {
                    reason: "unmatched end of array".to_string(),
                }),
            },
            Event::String { value, tag } => {
                self.begin_value(tag.as_deref())?;
                write_string(&mut self.out, value);
                Ok(())
            }
            Event::Int { value, tag } => {
                self.begin_value(tag.as_deref())?;
                let _ = write!(self.out, "{value}");
                Ok(())
            }
            Event::Float { value, tag } => {
                self.begin_value(tag.as_deref())?;
                write_float(&mut self.out, value.into_inner());
                Ok(())
            }
            Event::Bool { value, tag } => {
                self.begin_value(tag.as_deref())?;
                let _ = write!(self.out, "{value}");
                Ok(())
            }
            Event::Null { tag } => {
                self.begin_value(tag.as_deref())?;
                self.out.push_str("null");
                Ok(())
            }
        }
    }

    fn begin_entry(&mut self) -> Result<(), EventError> {
        match self.stack.last_mut() {
            Some(Container::Object { first }) => {
                if !*first {
                    self.out.push_str(", ");
                }
                *first = false;
                Ok(())
            }
            _ => Err(EventError::MalformedStream {
                reason: "key event outside any object".to_string(),
            }),
        }
    }

    fn begin_value(&mut self, tag: Option<&str>) -> Result<(), EventError> {
        if self.after_key {
            self.after_key = false;
        } else {
            match self.stack.last_mut() {
                Some(Container::Array { first }) => {
                    if !*first {
                        self.out.push_str(", ");
                    }
                    *first = false;
                }
                Some(Container::Object { .. }) => {
                    return Err(EventError::MalformedStream {
                        reason: "value without preceding key".to_string(),
                    });
                }
                None => {}
            }
        }
        if let Some(tag) = tag {
            let _ = write!(self.out, "!{tag} ");
        }
        Ok(())
    }
}

/// Incremental decoder over the compact textual form.
#[derive(Debug)]
pub struct WireEventDecoder<'a> {
    input: &'a str,
    pos: usize,
    stack: Vec<Container>,
    after_key: bool,
}

impl<'a> WireEventDecoder<'a> {
    pub fn new(input: &'a str) -> Self {
        WireEventDecoder {
            input,
            pos: 0,
            stack: Vec::new(),
            after_key: false,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Decodes the next event; `None` at end of input with no open
    /// containers.
    pub fn next_event(&mut self) -> Result<Option<Event>, EventError> {
        self.skip_ws_and_commas();

        if self.peek().is_none() {
            if self.stack.is_empty() {
                return Ok(None);
            }
            return Err(EventError::UnexpectedEof {
                depth: self.stack.len(),
            });
        }

        // Comment lines coalesce into a single event.
        if self.peek() == Some('#') {
            let mut lines = Vec::new();
            while self.peek() == Some('#') {
                self.bump();
                let start = self.pos;
                while !matches!(self.peek(), None | Some('\n')) {
                    self.bump();
                }
                lines.push(self.input[start..self.pos].trim().to_string());
                self.skip_ws_and_commas();
            }
            return Ok(Some(Event::Comment(lines)));
        }

        let in_object = matches!(self.stack.last(), Some(Container::Object { .. }));

        // Close events.
        match self.peek() {
            Some('}') => {
                self.bump();
                return match self.stack.pop() {
                    Some(Container::Object { .. }) => {
                        self.after_key = false;
                        Ok(Some(Event::EndObject))
                    }
                    _ => Err(self.unexpected('}')),
                };
            }
            Some(']') => {
                self.bump();
                return match self.stack.pop() {
                    Some(Container::Array { .. }) => {
                        self.after_key = false;
                        Ok(Some(Event::EndArray))
                    }
                    _ => Err(self.unexpected(']')),
                };
            }
            _ => {}
        }

        if in_object && !self.after_key {
            let event = self.parse_key()?;
            self.skip_ws_and_commas();
            match self.bump() {
                Some(':') => {}
                Some(c) => return Err(self.unexpected(c)),
                None => {
                    return Err(EventError::UnexpectedEof {
                        depth: self.stack.len(),
                    });
                }
            }
            self.after_key = true;
            return Ok(Some(event));
        }

        self.after_key = false;
        self.parse_value().map(Some)
    }

    fn parse_key(&mut self) -> Result<Event, EventError> {
        match self.peek() {
            Some('"') => Ok(Event::Key(self.parse_string()?)),
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                }
                self.input[start..self.pos]
                    .parse::<i64>()
                    .map(Event::IntKey)
                    .map_err(|_| EventError::InvalidEncoding {
                        position: start,
                        reason: "integer key out of range".to_string(),
                    })
            }
            Some(c) if is_ident_start(c) => {
                let word = self.parse_ident();
                if word == "null" {
                    Ok(Event::NullKey)
                } else {
                    Ok(Event::Key(word.to_string()))
                }
            }
            Some(c) => Err(self.unexpected(c)),
            None => Err(EventError::UnexpectedEof {
                depth: self.stack.len(),
            }),
        }
    }

    fn parse_value(&mut self) -> Result<Event, EventError> {
        let tag = self.parse_tag()?;
        self.skip_ws_and_commas();
        match self.peek() {
            Some('{') => {
                self.bump();
                self.stack.push(Container::Object { first: true });
                Ok(Event::BeginObject { tag })
            }
            Some('[') => {
                self.bump();
                self.stack.push(Container::Array { first: true });
                Ok(Event::BeginArray { tag })
            }
            Some('"') => Ok(Event::String {
                value: self.parse_string()?,
                tag,
            }),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(tag),
            Some(c) if is_ident_start(c) => {
                let start = self.pos;
                let word = self.parse_ident();
                match word {
                    "true" => Ok(Event::Bool { value: true, tag }),
                    "false" => Ok(Event::Bool { value: false, tag }),
                    "null" => Ok(Event::Null { tag }),
                    _ => Err(EventError::InvalidEncoding {
                        position: start,
                        reason: format!("unknown literal {word:?}"),
                    }),
                }
            }
            Some(c) => Err(self.unexpected(c)),
            None => Err(EventError::UnexpectedEof {
                depth: self.stack.len(),
            }),
        }
    }

    fn parse_tag(&mut self) -> Result<Option<String>, EventError> {
        if self.peek() != Some('!') {
            return Ok(None);
        }
        self.bump();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c) || c == '-') {
            self.bump();
        }
        if self.pos == start {
            return Err(EventError::InvalidEncoding {
                position: start,
                reason: "empty tag".to_string(),
            });
        }
        Ok(Some(self.input[start..self.pos].to_string()))
    }

    fn parse_string(&mut self) -> Result<String, EventError> {
        self.bump(); // opening quote, already peeked
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(EventError::UnexpectedEof {
                        depth: self.stack.len(),
                    });
                }
                Some('"') => return Ok(out),
                Some('\\') => {
                    let escape_pos = self.pos;
                    match self.bump() {
                        Some('"') => out.push('"'),
                        Some('\\') => out.push('\\'),
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some('r') => out.push('\r'),
                        Some('u') => {
                            let mut code = 0u32;
                            for _ in 0..4 {
                                let digit = self.bump().and_then(|c| c.to_digit(16)).ok_or(
                                    EventError::InvalidEncoding {
                                        position: escape_pos,
                                        reason: "invalid unicode escape".to_string(),
                                    },
                                )?;
                                code = code * 16 + digit;
                            }
                            out.push(char::from_u32(code).ok_or(EventError::InvalidEncoding {
                                position: escape_pos,
                                reason: "invalid unicode escape".to_string(),
                            })?);
                        }
                        _ => {
                            return Err(EventError::InvalidEncoding {
                                position: escape_pos,
                                reason: "invalid escape".to_string(),
                            });
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_number(&mut self, tag: Option<String>) -> Result<Event, EventError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let mut is_float = false;
        let mut prev_exponent = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {
                    prev_exponent = false;
                    self.bump();
                }
                '.' => {
                    is_float = true;
                    prev_exponent = false;
                    self.bump();
                }
                'e' | 'E' => {
                    is_float = true;
                    prev_exponent = true;
                    self.bump();
                }
                '+' | '-' if prev_exponent => {
                    prev_exponent = false;
                    self.bump();
                }
                _ => break,
            }
        }
        let text = &self.input[start..self.pos];
        if is_float {
            let value: f64 = text.parse().map_err(|_| EventError::InvalidEncoding {
                position: start,
                reason: "invalid number".to_string(),
            })?;
            let value = NotNan::new(value).map_err(|_| EventError::InvalidEncoding {
                position: start,
                reason: "number is NaN".to_string(),
            })?;
            Ok(Event::Float { value, tag })
        } else {
            text.parse::<i64>()
                .map(|value| Event::Int { value, tag })
                .map_err(|_| EventError::InvalidEncoding {
                    position: start,
                    reason: "invalid number".to_string(),
                })
        }
    }

    fn parse_ident(&mut self) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn skip_ws_and_commas(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace() || c == ',') {
            self.bump();
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn unexpected(&self, found: char) -> EventError {
        EventError::InvalidEncoding {
            position: self.pos,
            reason: format!("unexpected character {found:?}"),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    matches!(c, 'A'..='Z' | 'a'..='z' | '_' | '@')
}

fn is_ident_char(c: char) -> bool {
    matches!(c, 'A'..='Z' | 'a'..='z' | '_' | '0'..='9' | '@')
}

fn key_needs_quoting(name: &str) -> bool {
    name.is_empty()
        || name == "null"
        || !name.chars().next().is_some_and(is_ident_start)
        || !name.chars().all(is_ident_char)
}

fn write_string(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_float(out: &mut String, value: f64) {
    if value.is_infinite() {
        // f64 parsing saturates oversized exponents to infinity.
        out.push_str(if value > 0.0 { "1e999" } else { "-1e999" });
        return;
    }
    let formatted = format!("{value}");
    out.push_str(&formatted);
    if !formatted.contains(['.', 'e', 'E']) {
        // Keep a float marker so the value re-parses as a float.
        out.push_str(".0");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::node_to_events;
    use logd_value::parse_node;

    fn decode_all(input: &str) -> Result<Vec<Event>, EventError> {
        let mut decoder = WireEventDecoder::new(input);
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    fn encode_all(events: &[Event]) -> String {
        let mut encoder = WireEventEncoder::new();
        for event in events {
            encoder.emit(event).unwrap();
        }
        encoder.finish()
    }

    #[test]
    fn wire_round_trips_events() {
        let cases = [
            r#"{ name: "ada", scores: [1, 2, 3], ok: true }"#,
            r#"{ 100: { name: "old" }, 200: { name: "other" } }"#,
            "!or [1, !type 2]",
            "{ null: 1 }",
            r#"{ f: 2.0, neg: -1.5 }"#,
            "{}",
            "[]",
        ];
        for text in cases {
            let events = node_to_events(&parse_node(text).unwrap());
            let encoded = encode_all(&events);
            let decoded = decode_all(&encoded).unwrap();
            assert_eq!(decoded, events, "case {text:?}");
        }
    }

    #[test]
    fn decoder_depth_returns_to_zero() {
        let mut decoder = WireEventDecoder::new("{ a: { b: [1] } }");
        let mut final_depth = usize::MAX;
        while decoder.next_event().unwrap().is_some() {
            final_depth = decoder.depth();
        }
        assert_eq!(final_depth, 0);
    }

    #[test]
    fn comments_coalesce_into_one_event() {
        let events = decode_all("{ # a\n # b\n k: 1 }").unwrap();
        assert_eq!(
            events[1],
            Event::Comment(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn truncated_input_errors() {
        assert!(matches!(
            decode_all("{ a: 1"),
            Err(EventError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn encoder_rejects_malformed_sequences() {
        let mut encoder = WireEventEncoder::new();
        encoder.emit(&Event::begin_object()).unwrap();
        assert!(encoder.emit(&Event::int(1)).is_err());
    }
}
