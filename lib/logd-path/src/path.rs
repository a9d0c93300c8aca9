use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::{parse_path, PathError, Segment};

/// An owned, parsed path expression.
///
/// Paths are ordered: segment kinds rank field < field-wildcard < index <
/// index-wildcard < sparse-index < sparse-wildcard, ties are broken segment
/// by segment, and a proper prefix sorts before any of its extensions. This
/// is the order snapshot indexes are sorted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KindedPath {
    segments: Vec<Segment>,
}

impl KindedPath {
    /// The root path, which addresses the whole document.
    pub const fn root() -> Self {
        KindedPath {
            segments: Vec::new(),
        }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        KindedPath { segments }
    }

    /// Parses a path expression; see [`parse_path`].
    pub fn parse(input: &str) -> Result<Self, PathError> {
        parse_path(input)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.extend_from_slice(&self.segments);
        segments.push(segment);
        KindedPath { segments }
    }

    /// Concatenates two paths.
    pub fn join(&self, other: &KindedPath) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + other.segments.len());
        segments.extend_from_slice(&self.segments);
        segments.extend_from_slice(&other.segments);
        KindedPath { segments }
    }

    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// The path with the last segment removed; `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(KindedPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Splits off the first segment: `(first, rest)`; `None` for the root.
    pub fn split(&self) -> Option<(Segment, KindedPath)> {
        let (first, rest) = self.segments.split_first()?;
        Some((
            first.clone(),
            KindedPath {
                segments: rest.to_vec(),
            },
        ))
    }

    /// Splits off the last segment: `(init, last)`; `None` for the root.
    pub fn rsplit(&self) -> Option<(KindedPath, Segment)> {
        let (last, init) = self.segments.split_last()?;
        Some((
            KindedPath {
                segments: init.to_vec(),
            },
            last.clone(),
        ))
    }

    /// Renders every segment as its own top-level-parseable path string.
    pub fn split_all(&self) -> Vec<String> {
        self.segments
            .iter()
            .map(|segment| {
                KindedPath {
                    segments: vec![segment.clone()],
                }
                .to_string()
            })
            .collect()
    }

    /// Whether `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix(&self, other: &KindedPath) -> bool {
        other.segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Prefix comparison: `(ancestor, equal)`.
    ///
    /// `ancestor` is true when `self` is a strict prefix of `other`;
    /// `equal` when the two paths are identical.
    pub fn ancestor_or_equal(&self, other: &KindedPath) -> (bool, bool) {
        if !self.is_prefix(other) {
            return (false, false);
        }
        let equal = self.segments.len() == other.segments.len();
        (!equal, equal)
    }

    /// The suffix of `other` below `self`, when `self` is a prefix.
    pub fn strip_prefix(&self, other: &KindedPath) -> Option<KindedPath> {
        if !self.is_prefix(other) {
            return None;
        }
        Some(KindedPath {
            segments: other.segments[self.segments.len()..].to_vec(),
        })
    }
}

impl Display for KindedPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 && matches!(segment, Segment::Field(_) | Segment::FieldWild) {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for KindedPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_path(s)
    }
}

impl From<Segment> for KindedPath {
    fn from(segment: Segment) -> Self {
        KindedPath {
            segments: vec![segment],
        }
    }
}

impl FromIterator<Segment> for KindedPath {
    fn from_iter<T: IntoIterator<Item = Segment>>(iter: T) -> Self {
        KindedPath {
            segments: iter.into_iter().collect(),
        }
    }
}
