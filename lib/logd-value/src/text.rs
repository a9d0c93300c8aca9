//! The textual object notation used for wire frames.
//!
//! Whitespace is insignificant. Objects are `{ key: value, ... }` with bare
//! identifier keys (quoted when they need it), integer keys for sparse
//! entries, and `null` for the merge-directive key. A `!tag` prefixes a
//! value; `# ...` comment lines attach to the value that follows them.
//!
//! A *frame* is an object body without the surrounding braces, which is the
//! form requests and responses travel in.

use std::fmt::Write as _;

use ordered_float::NotNan;
use snafu::Snafu;

use crate::{Key, Node, NodeKind, Object};

/// Error produced while parsing the textual notation.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum TextError {
    #[snafu(display("unexpected end of input at byte {position}"))]
    UnexpectedEof { position: usize },

    #[snafu(display("unexpected character {found:?} at byte {position}"))]
    UnexpectedCharacter { position: usize, found: char },

    #[snafu(display("invalid number at byte {position}"))]
    InvalidNumber { position: usize },

    #[snafu(display("invalid escape sequence at byte {position}"))]
    InvalidEscape { position: usize },

    #[snafu(display("trailing input at byte {position}"))]
    TrailingInput { position: usize },
}

/// Parses a complete braced value.
pub fn parse_node(input: &str) -> Result<Node, TextError> {
    let mut parser = Parser::new(input);
    let node = parser.parse_value()?;
    parser.skip_ws();
    parser.expect_eof()?;
    Ok(node)
}

/// Parses a frame: an object body without surrounding braces.
///
/// An empty frame parses to the empty object. A frame that begins with `{`
/// is accepted as a braced object for symmetry with [`parse_node`].
pub fn parse_frame(input: &str) -> Result<Node, TextError> {
    let mut parser = Parser::new(input);
    parser.skip_ws();
    if parser.peek() == Some('{') {
        let node = parser.parse_value()?;
        parser.skip_ws();
        parser.expect_eof()?;
        return Ok(node);
    }
    let node = parser.parse_object_body(None)?;
    parser.skip_ws();
    parser.expect_eof()?;
    Ok(node)
}

/// Renders a value in compact braced form. Comments are not emitted; the
/// compact form is single-line by construction.
pub fn render_node(node: &Node) -> String {
    let mut out = String::new();
    write_value(&mut out, node);
    out
}

/// Renders an object as a frame (no surrounding braces). Non-object nodes
/// fall back to the braced form.
pub fn render_frame(node: &Node) -> String {
    match &node.kind {
        NodeKind::Object(object) if node.tag.is_none() => {
            let mut out = String::new();
            write_entries(&mut out, object);
            out
        }
        _ => render_node(node),
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), TextError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(found) => Err(TextError::UnexpectedCharacter {
                position: self.pos - found.len_utf8(),
                found,
            }),
            None => Err(TextError::UnexpectedEof { position: self.pos }),
        }
    }

    fn expect_eof(&self) -> Result<(), TextError> {
        if self.pos < self.input.len() {
            return Err(TextError::TrailingInput { position: self.pos });
        }
        Ok(())
    }

    /// Consumes `# ...` lines and returns them; the cursor is left at the
    /// first non-whitespace, non-comment character.
    fn collect_comments(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some('#') {
                return lines;
            }
            self.bump();
            let start = self.pos;
            while !matches!(self.peek(), None | Some('\n')) {
                self.bump();
            }
            lines.push(self.input[start..self.pos].trim().to_string());
        }
    }

    fn parse_value(&mut self) -> Result<Node, TextError> {
        let comments = self.collect_comments();
        let tag = self.parse_tag()?;
        self.skip_ws();

        let mut node = match self.peek() {
            None => return Err(TextError::UnexpectedEof { position: self.pos }),
            Some('{') => {
                self.bump();
                let node = self.parse_object_body(Some('}'))?;
                self.expect('}')?;
                node
            }
            Some('[') => {
                self.bump();
                let mut values = Vec::new();
                loop {
                    self.skip_ws();
                    match self.peek() {
                        Some(']') => {
                            self.bump();
                            break;
                        }
                        None => {
                            return Err(TextError::UnexpectedEof { position: self.pos });
                        }
                        _ => {}
                    }
                    values.push(self.parse_value()?);
                    self.skip_ws();
                    if self.peek() == Some(',') {
                        self.bump();
                    }
                }
                Node::array(values)
            }
            Some('"') => Node::string(self.parse_string()?),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number()?,
            Some(c) if is_ident_start(c) => {
                let word = self.parse_ident();
                match word {
                    "true" => Node::bool(true),
                    "false" => Node::bool(false),
                    "null" => Node::null(),
                    _ => {
                        return Err(TextError::UnexpectedCharacter {
                            position: self.pos - word.len(),
                            found: c,
                        });
                    }
                }
            }
            Some(found) => {
                return Err(TextError::UnexpectedCharacter {
                    position: self.pos,
                    found,
                });
            }
        };

        node.tag = tag;
        node.comments = comments;
        Ok(node)
    }

    /// Parses entries until `close` (or end of input for frames).
    fn parse_object_body(&mut self, close: Option<char>) -> Result<Node, TextError> {
        let mut entries = Vec::new();
        loop {
            // Comments before a key attach to that entry's value; a trailing
            // comment with no entry after it is dropped.
            let comments = self.collect_comments();
            match self.peek() {
                None if close.is_none() => break,
                None => return Err(TextError::UnexpectedEof { position: self.pos }),
                Some(c) if Some(c) == close => break,
                _ => {}
            }

            let key = self.parse_key()?;
            self.skip_ws();
            self.expect(':')?;
            let mut value = self.parse_value()?;
            if !comments.is_empty() {
                let mut all = comments;
                all.append(&mut value.comments);
                value.comments = all;
            }
            entries.push((key, value));

            self.skip_ws();
            if self.peek() == Some(',') {
                self.bump();
            }
        }
        Ok(Node::object(entries))
    }

    fn parse_key(&mut self) -> Result<Key, TextError> {
        match self.peek() {
            Some('"') => Ok(Key::Field(self.parse_string()?)),
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                }
                self.input[start..self.pos]
                    .parse::<u32>()
                    .map(Key::Index)
                    .map_err(|_| TextError::InvalidNumber { position: start })
            }
            Some(c) if is_ident_start(c) => {
                let word = self.parse_ident();
                if word == "null" {
                    Ok(Key::Null)
                } else {
                    Ok(Key::Field(word.to_string()))
                }
            }
            Some(found) => Err(TextError::UnexpectedCharacter {
                position: self.pos,
                found,
            }),
            None => Err(TextError::UnexpectedEof { position: self.pos }),
        }
    }

    fn parse_tag(&mut self) -> Result<Option<String>, TextError> {
        self.skip_ws();
        if self.peek() != Some('!') {
            return Ok(None);
        }
        self.bump();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c) || c == '-') {
            self.bump();
        }
        if self.pos == start {
            return Err(TextError::UnexpectedCharacter {
                position: start,
                found: self.peek().unwrap_or('\0'),
            });
        }
        Ok(Some(self.input[start..self.pos].to_string()))
    }

    fn parse_ident(&mut self) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn parse_string(&mut self) -> Result<String, TextError> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(TextError::UnexpectedEof { position: self.pos }),
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
                                let digit = self
                                    .bump()
                                    .and_then(|c| c.to_digit(16))
                                    .ok_or(TextError::InvalidEscape {
                                        position: escape_pos,
                                    })?;
                                code = code * 16 + digit;
                            }
                            out.push(char::from_u32(code).ok_or(TextError::InvalidEscape {
                                position: escape_pos,
                            })?);
                        }
                        _ => {
                            return Err(TextError::InvalidEscape {
                                position: escape_pos,
                            });
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Node, TextError> {
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
                // A sign continues the number only right after an exponent.
                '+' | '-' if prev_exponent => {
                    prev_exponent = false;
                    self.bump();
                }
                _ => break,
            }
        }
        let text = &self.input[start..self.pos];
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| TextError::InvalidNumber { position: start })?;
            let value =
                NotNan::new(value).map_err(|_| TextError::InvalidNumber { position: start })?;
            Ok(Node::new(NodeKind::Float(value)))
        } else {
            text.parse::<i64>()
                .map(Node::int)
                .map_err(|_| TextError::InvalidNumber { position: start })
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

fn write_value(out: &mut String, node: &Node) {
    if let Some(tag) = &node.tag {
        let _ = write!(out, "!{tag} ");
    }
    match &node.kind {
        NodeKind::Object(object) => {
            out.push_str("{ ");
            write_entries(out, object);
            if object.is_empty() {
                out.pop();
                out.push('}');
            } else {
                out.push_str(" }");
            }
        }
        NodeKind::Array(values) => {
            out.push('[');
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, value);
            }
            out.push(']');
        }
        NodeKind::String(value) => write_string(out, value),
        NodeKind::Int(value) => {
            let _ = write!(out, "{value}");
        }
        NodeKind::Float(value) => {
            let value = value.into_inner();
            if value.is_infinite() {
                // f64 parsing saturates oversized exponents to infinity.
                out.push_str(if value > 0.0 { "1e999" } else { "-1e999" });
            } else {
                let formatted = format!("{value}");
                out.push_str(&formatted);
                if !formatted.contains(['.', 'e', 'E']) {
                    // Keep a float marker so the value re-parses as a float.
                    out.push_str(".0");
                }
            }
        }
        NodeKind::Bool(value) => {
            let _ = write!(out, "{value}");
        }
        NodeKind::Null => out.push_str("null"),
    }
}

fn write_entries(out: &mut String, object: &Object) {
    for (i, (key, value)) in object.entries.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match key {
            Key::Field(name) if key_needs_quoting(name) => write_string(out, name),
            Key::Field(name) => out.push_str(name),
            Key::Index(index) => {
                let _ = write!(out, "{index}");
            }
            Key::Null => out.push_str("null"),
        }
        out.push_str(": ");
        write_value(out, value);
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalars() {
        assert_eq!(parse_node("42").unwrap(), Node::int(42));
        assert_eq!(parse_node("-7").unwrap(), Node::int(-7));
        assert_eq!(parse_node("2.5").unwrap(), Node::float(2.5));
        assert_eq!(parse_node("true").unwrap(), Node::bool(true));
        assert_eq!(parse_node("null").unwrap(), Node::null());
        assert_eq!(parse_node(r#""hi\nthere""#).unwrap(), Node::string("hi\nthere"));
    }

    #[test]
    fn parse_object_and_array() {
        let node = parse_node(r#"{ name: "ada", scores: [1, 2, 3], ok: true }"#).unwrap();
        let object = node.as_object().unwrap();
        assert_eq!(object.get_field("name").unwrap(), &Node::string("ada"));
        assert_eq!(
            object.get_field("scores").unwrap(),
            &Node::array(vec![Node::int(1), Node::int(2), Node::int(3)])
        );
    }

    #[test]
    fn sparse_keys_make_sparse_objects() {
        let node = parse_node("{ 100: \"a\", 3002: \"b\" }").unwrap();
        let object = node.as_object().unwrap();
        assert!(object.sparse);
        assert_eq!(object.get(&Key::Index(3002)).unwrap(), &Node::string("b"));
    }

    #[test]
    fn null_key_is_the_merge_directive_key() {
        let node = parse_node("{ null: 1, a: 2 }").unwrap();
        let object = node.as_object().unwrap();
        assert_eq!(object.get(&Key::Null).unwrap(), &Node::int(1));
        assert!(!object.sparse);
    }

    #[test]
    fn tags_attach_to_values() {
        let node = parse_node("!or [1, 2]").unwrap();
        assert_eq!(node.tag.as_deref(), Some("or"));
        let node = parse_node("{ a: !delete null }").unwrap();
        let inner = node.as_object().unwrap().get_field("a").unwrap();
        assert_eq!(inner.tag.as_deref(), Some("delete"));
        assert!(inner.is_null());
    }

    #[test]
    fn comments_attach_to_following_value() {
        let node = parse_node("{\n  # the answer\n  a: 42\n}").unwrap();
        let inner = node.as_object().unwrap().get_field("a").unwrap();
        assert_eq!(inner.comments, ["the answer"]);
    }

    #[test]
    fn frames_are_braceless_objects() {
        let node = parse_frame(r#"path: "users.alice", patch: { name: "Alice" }"#).unwrap();
        let object = node.as_object().unwrap();
        assert_eq!(
            object.get_field("path").unwrap(),
            &Node::string("users.alice")
        );
        assert!(object.get_field("patch").is_some());

        assert_eq!(parse_frame("").unwrap(), Node::empty_object());
        assert!(parse_frame("{ a: 1 }").is_ok());
    }

    #[test]
    fn render_round_trips() {
        let cases = [
            r#"{ name: "ada", scores: [1, 2, 3] }"#,
            r#"{ 100: { name: "old" }, 200: { name: "other" } }"#,
            r#"{ a: !delete null, "odd key": 1 }"#,
            "!or [1, 2]",
            "{}",
            "[]",
            r#"{ f: 2.0, g: -1.25 }"#,
        ];
        for text in cases {
            let node = parse_node(text).unwrap();
            let rendered = render_node(&node);
            assert_eq!(parse_node(&rendered).unwrap(), node, "case {text:?}");
        }
    }

    #[test]
    fn parse_errors_carry_positions() {
        assert!(matches!(
            parse_node("{ a: }"),
            Err(TextError::UnexpectedCharacter { .. })
        ));
        assert!(matches!(
            parse_node("{ a: 1"),
            Err(TextError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            parse_node("99999999999999999999"),
            Err(TextError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse_node("1 2"),
            Err(TextError::TrailingInput { .. })
        ));
    }
}
