use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

/// One step of a [`KindedPath`](crate::KindedPath).
///
/// Each variant records the kind of container it selects into, which is what
/// makes two textually similar steps like `[3]` and `{3}` distinct segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A named object field: `name`, `"quoted name"`.
    Field(String),
    /// Matches any object field: `*`.
    FieldWild,
    /// A dense array index: `[3]`.
    Index(u32),
    /// Matches any dense array index: `[*]`.
    IndexWild,
    /// A sparse-array index: `{3002}`.
    Sparse(u32),
    /// Matches any sparse-array index: `{*}`.
    SparseWild,
    /// Selects the child whose value equals the literal: `(literal)`.
    KeyValue(String),
}

impl Segment {
    pub fn field(name: impl Into<String>) -> Self {
        Segment::Field(name.into())
    }

    pub const fn index(i: u32) -> Self {
        Segment::Index(i)
    }

    pub const fn sparse(i: u32) -> Self {
        Segment::Sparse(i)
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(
            self,
            Segment::FieldWild | Segment::IndexWild | Segment::SparseWild
        )
    }

    /// Rank used for cross-kind ordering: field < field-wildcard < index <
    /// index-wildcard < sparse-index < sparse-wildcard < key-by-value.
    fn kind_rank(&self) -> u8 {
        match self {
            Segment::Field(_) => 0,
            Segment::FieldWild => 1,
            Segment::Index(_) => 2,
            Segment::IndexWild => 3,
            Segment::Sparse(_) => 4,
            Segment::SparseWild => 5,
            Segment::KeyValue(_) => 6,
        }
    }

    /// Whether a wildcard segment of `self`'s shape accepts `other`.
    ///
    /// Non-wildcard segments accept only an equal segment.
    pub fn accepts(&self, other: &Segment) -> bool {
        match self {
            Segment::FieldWild => matches!(other, Segment::Field(_) | Segment::FieldWild),
            Segment::IndexWild => matches!(other, Segment::Index(_) | Segment::IndexWild),
            Segment::SparseWild => matches!(other, Segment::Sparse(_) | Segment::SparseWild),
            other_kind => other_kind == other,
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Field(a), Segment::Field(b)) => a.cmp(b),
            (Segment::Index(a), Segment::Index(b)) => a.cmp(b),
            (Segment::Sparse(a), Segment::Sparse(b)) => a.cmp(b),
            (Segment::KeyValue(a), Segment::KeyValue(b)) => a.cmp(b),
            (a, b) => a.kind_rank().cmp(&b.kind_rank()),
        }
    }
}

pub(crate) fn field_needs_quoting(name: &str) -> bool {
    name.is_empty()
        || name
            .chars()
            .any(|c| !matches!(c, 'A'..='Z' | 'a'..='z' | '_' | '0'..='9' | '@'))
}

pub(crate) fn write_quoted(f: &mut Formatter<'_>, name: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in name.chars() {
        if matches!(c, '"' | '\\') {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => {
                if field_needs_quoting(name) {
                    write_quoted(f, name)
                } else {
                    f.write_str(name)
                }
            }
            Segment::FieldWild => f.write_str("*"),
            Segment::Index(i) => write!(f, "[{i}]"),
            Segment::IndexWild => f.write_str("[*]"),
            Segment::Sparse(i) => write!(f, "{{{i}}}"),
            Segment::SparseWild => f.write_str("{*}"),
            Segment::KeyValue(literal) => {
                f.write_str("(")?;
                for c in literal.chars() {
                    if matches!(c, ')' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_order_is_total() {
        let order = [
            Segment::field("a"),
            Segment::field("b"),
            Segment::FieldWild,
            Segment::index(0),
            Segment::index(7),
            Segment::IndexWild,
            Segment::sparse(0),
            Segment::sparse(3002),
            Segment::SparseWild,
            Segment::KeyValue("x".into()),
        ];
        for (i, a) in order.iter().enumerate() {
            for (j, b) in order.iter().enumerate() {
                assert_eq!(a.cmp(b), i.cmp(&j), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn wildcard_acceptance() {
        assert!(Segment::FieldWild.accepts(&Segment::field("x")));
        assert!(!Segment::FieldWild.accepts(&Segment::index(0)));
        assert!(Segment::IndexWild.accepts(&Segment::index(9)));
        assert!(!Segment::IndexWild.accepts(&Segment::sparse(9)));
        assert!(Segment::SparseWild.accepts(&Segment::sparse(3002)));
        assert!(Segment::field("x").accepts(&Segment::field("x")));
        assert!(!Segment::field("x").accepts(&Segment::field("y")));
    }
}
