//! Hand-written character state machine for the path grammar.
//!
//! The grammar is small enough that a single pass over `char_indices` with an
//! explicit state enum is both the fastest and the easiest way to produce
//! precise error positions.

use crate::{KindedPath, PathError, Segment};

enum State {
    /// Start of the path, or right after a completed segment.
    SegmentBoundary { leading: bool },
    /// Just consumed a `.`; a field-shaped segment must follow.
    Dot,
    /// Inside a bare field, started at the byte offset.
    Field { start: usize },
    /// Inside a quoted field with no escapes seen so far.
    Quote { start: usize },
    /// Inside a quoted field that contained an escape; characters are
    /// accumulated in the scratch buffer.
    EscapedQuote,
    /// Inside `[..]` (`sparse == false`) or `{..}` (`sparse == true`).
    Bracket {
        open: usize,
        sparse: bool,
        value: Option<u64>,
        wild: bool,
    },
    /// Inside a `(..)` key-by-value selector.
    Selector { open: usize },
}

/// Parses a path expression.
///
/// The empty string parses to the root path. A single leading `.` is
/// accepted and normalized away.
pub fn parse_path(input: &str) -> Result<KindedPath, PathError> {
    let mut segments = Vec::new();
    let mut state = State::SegmentBoundary { leading: true };
    let mut scratch = String::new();

    let err_path = || input.to_string();

    let mut chars = input.char_indices();
    loop {
        let next = chars.next();
        let (position, c) = match next {
            Some((i, c)) => (i, Some(c)),
            None => (input.len(), None),
        };

        state = match state {
            State::SegmentBoundary { leading } => match c {
                None => break,
                Some('.') => State::Dot,
                Some('[') => State::Bracket {
                    open: position,
                    sparse: false,
                    value: None,
                    wild: false,
                },
                Some('{') => State::Bracket {
                    open: position,
                    sparse: true,
                    value: None,
                    wild: false,
                },
                Some('(') => {
                    scratch.clear();
                    State::Selector { open: position }
                }
                Some('*') if leading => {
                    segments.push(Segment::FieldWild);
                    State::SegmentBoundary { leading: false }
                }
                Some('"') if leading => {
                    scratch.clear();
                    State::Quote {
                        start: position + 1,
                    }
                }
                Some(c) if leading && is_field_char(c) => State::Field { start: position },
                Some(found) => {
                    return Err(PathError::UnexpectedCharacter {
                        path: err_path(),
                        position,
                        found,
                    });
                }
            },
            State::Dot => match c {
                None => {
                    return Err(PathError::EmptySegment {
                        path: err_path(),
                        position,
                    });
                }
                Some('*') => {
                    segments.push(Segment::FieldWild);
                    State::SegmentBoundary { leading: false }
                }
                Some('"') => {
                    scratch.clear();
                    State::Quote {
                        start: position + 1,
                    }
                }
                Some(c) if is_field_char(c) => State::Field { start: position },
                Some('.') => {
                    return Err(PathError::EmptySegment {
                        path: err_path(),
                        position,
                    });
                }
                Some(found) => {
                    return Err(PathError::UnexpectedCharacter {
                        path: err_path(),
                        position,
                        found,
                    });
                }
            },
            State::Field { start } => match c {
                None => {
                    segments.push(Segment::Field(input[start..].to_string()));
                    break;
                }
                Some(c) if is_field_char(c) => State::Field { start },
                Some('.') => {
                    segments.push(Segment::Field(input[start..position].to_string()));
                    State::Dot
                }
                Some('[') => {
                    segments.push(Segment::Field(input[start..position].to_string()));
                    State::Bracket {
                        open: position,
                        sparse: false,
                        value: None,
                        wild: false,
                    }
                }
                Some('{') => {
                    segments.push(Segment::Field(input[start..position].to_string()));
                    State::Bracket {
                        open: position,
                        sparse: true,
                        value: None,
                        wild: false,
                    }
                }
                Some('(') => {
                    segments.push(Segment::Field(input[start..position].to_string()));
                    scratch.clear();
                    State::Selector { open: position }
                }
                Some(found) => {
                    return Err(PathError::UnexpectedCharacter {
                        path: err_path(),
                        position,
                        found,
                    });
                }
            },
            State::Quote { start } => match c {
                None => {
                    return Err(PathError::UnterminatedQuote {
                        path: err_path(),
                        position: start - 1,
                    });
                }
                Some('"') => {
                    segments.push(Segment::Field(input[start..position].to_string()));
                    State::SegmentBoundary { leading: false }
                }
                Some('\\') => {
                    // Escapes force a copy; replay the quoted prefix into the
                    // scratch buffer and continue in copying mode.
                    scratch.clear();
                    scratch.push_str(&input[start..position]);
                    match chars.next() {
                        Some((_, c @ ('"' | '\\'))) => {
                            scratch.push(c);
                            State::EscapedQuote
                        }
                        Some((escape_pos, _)) => {
                            return Err(PathError::InvalidEscape {
                                path: err_path(),
                                position: escape_pos,
                            });
                        }
                        None => {
                            return Err(PathError::UnterminatedQuote {
                                path: err_path(),
                                position: start - 1,
                            });
                        }
                    }
                }
                Some(_) => State::Quote { start },
            },
            State::EscapedQuote => match c {
                None => {
                    return Err(PathError::UnterminatedQuote {
                        path: err_path(),
                        position,
                    });
                }
                Some('"') => {
                    segments.push(Segment::Field(std::mem::take(&mut scratch)));
                    State::SegmentBoundary { leading: false }
                }
                Some('\\') => match chars.next() {
                    Some((_, c @ ('"' | '\\'))) => {
                        scratch.push(c);
                        State::EscapedQuote
                    }
                    Some((escape_pos, _)) => {
                        return Err(PathError::InvalidEscape {
                            path: err_path(),
                            position: escape_pos,
                        });
                    }
                    None => {
                        return Err(PathError::UnterminatedQuote {
                            path: err_path(),
                            position,
                        });
                    }
                },
                Some(c) => {
                    scratch.push(c);
                    State::EscapedQuote
                }
            },
            State::Bracket {
                open,
                sparse,
                value,
                wild,
            } => match c {
                None => {
                    return Err(PathError::UnterminatedBracket {
                        path: err_path(),
                        position: open,
                        open: if sparse { '{' } else { '[' },
                    });
                }
                Some('*') if value.is_none() && !wild => State::Bracket {
                    open,
                    sparse,
                    value,
                    wild: true,
                },
                Some(d @ '0'..='9') if !wild => {
                    let digit = u64::from(d as u8 - b'0');
                    let value = value.unwrap_or(0) * 10 + digit;
                    if value > u64::from(u32::MAX) {
                        return Err(PathError::InvalidIndex {
                            path: err_path(),
                            position,
                        });
                    }
                    State::Bracket {
                        open,
                        sparse,
                        value: Some(value),
                        wild,
                    }
                }
                Some(close @ (']' | '}')) => {
                    let expected = if sparse { '}' } else { ']' };
                    if close != expected {
                        return Err(PathError::UnexpectedCharacter {
                            path: err_path(),
                            position,
                            found: close,
                        });
                    }
                    let segment = match (value, wild) {
                        (_, true) if sparse => Segment::SparseWild,
                        (_, true) => Segment::IndexWild,
                        (Some(v), false) if sparse => Segment::Sparse(v as u32),
                        (Some(v), false) => Segment::Index(v as u32),
                        (None, false) => {
                            return Err(PathError::InvalidIndex {
                                path: err_path(),
                                position,
                            });
                        }
                    };
                    segments.push(segment);
                    State::SegmentBoundary { leading: false }
                }
                Some(_) => {
                    return Err(PathError::InvalidIndex {
                        path: err_path(),
                        position,
                    });
                }
            },
            State::Selector { open } => match c {
                None => {
                    return Err(PathError::UnterminatedSelector {
                        path: err_path(),
                        position: open,
                    });
                }
                Some(')') => {
                    if scratch.is_empty() {
                        return Err(PathError::EmptySegment {
                            path: err_path(),
                            position,
                        });
                    }
                    segments.push(Segment::KeyValue(std::mem::take(&mut scratch)));
                    State::SegmentBoundary { leading: false }
                }
                Some('\\') => match chars.next() {
                    Some((_, c @ (')' | '\\'))) => {
                        scratch.push(c);
                        State::Selector { open }
                    }
                    Some((escape_pos, _)) => {
                        return Err(PathError::InvalidEscape {
                            path: err_path(),
                            position: escape_pos,
                        });
                    }
                    None => {
                        return Err(PathError::UnterminatedSelector {
                            path: err_path(),
                            position: open,
                        });
                    }
                },
                Some(c) => {
                    scratch.push(c);
                    State::Selector { open }
                }
            },
        };
    }

    Ok(KindedPath::from_segments(segments))
}

fn is_field_char(c: char) -> bool {
    matches!(c, 'A'..='Z' | 'a'..='z' | '_' | '0'..='9' | '@')
}
