//! Kinded paths: location expressions over structured documents.
//!
//! A kinded path is a sequence of segments, each carrying the kind of
//! container it selects into: named fields (`a.b`), array indexes (`[0]`),
//! sparse-array indexes (`{3002}`), the matching wildcards (`*`, `[*]`,
//! `{*}`), and key-by-value selectors (`(literal)`).
//!
//! Paths have a strict total order, so sorted collections of paths can be
//! binary-searched, and prefix relations (`is_prefix`, `ancestor_or_equal`)
//! are cheap segment-wise comparisons.

mod parser;
mod path;
mod segment;

pub use parser::parse_path;
pub use path::KindedPath;
pub use segment::Segment;

use snafu::Snafu;

/// Error produced when a path expression fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum PathError {
    /// An index (`[..]`) or sparse index (`{{..}}`) was opened but never closed.
    #[snafu(display("unterminated '{open}' in path {path:?} at byte {position}"))]
    UnterminatedBracket {
        path: String,
        position: usize,
        open: char,
    },

    /// A quoted field was opened but never closed.
    #[snafu(display("unterminated quote in path {path:?} at byte {position}"))]
    UnterminatedQuote { path: String, position: usize },

    /// A key-by-value selector (`(..)`) was opened but never closed.
    #[snafu(display("unterminated '(' in path {path:?} at byte {position}"))]
    UnterminatedSelector { path: String, position: usize },

    /// The contents of `[..]` or `{{..}}` were not a valid unsigned integer
    /// or `*`.
    #[snafu(display("invalid index in path {path:?} at byte {position}"))]
    InvalidIndex { path: String, position: usize },

    /// A separator introduced a segment that never materialized
    /// (trailing `.`, `..`, or a bare separator).
    #[snafu(display("empty segment in path {path:?} at byte {position}"))]
    EmptySegment { path: String, position: usize },

    /// A character that cannot start or continue a segment.
    #[snafu(display("unexpected character {found:?} in path {path:?} at byte {position}"))]
    UnexpectedCharacter {
        path: String,
        position: usize,
        found: char,
    },

    /// An escape sequence other than `\\` or `\"` inside a quoted field.
    #[snafu(display("invalid escape in path {path:?} at byte {position}"))]
    InvalidEscape { path: String, position: usize },
}
