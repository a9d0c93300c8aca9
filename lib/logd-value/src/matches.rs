//! The match predicate evaluated against the committed view before a
//! transaction is allowed to commit.

use crate::{Node, NodeKind};

/// Tag turning an array condition into a disjunction of its elements.
pub const OR_TAG: &str = "or";

/// Tag asserting that the value at the path does not exist.
pub const ABSENT_TAG: &str = "absent";

/// Evaluates `cond` against a possibly absent current value.
///
/// Objects are subset conditions: every key in `cond` must exist and match
/// recursively. Arrays and scalars compare structurally (tags and comments
/// ignored). A plain `null` condition matches any present value; only an
/// `!absent`-tagged null matches a missing one.
pub fn matches(current: Option<&Node>, cond: &Node) -> bool {
    if cond.has_tag(ABSENT_TAG) && cond.is_null() {
        return current.is_none();
    }

    let Some(current) = current else {
        return false;
    };

    if cond.has_tag(OR_TAG) {
        if let NodeKind::Array(branches) = &cond.kind {
            return branches
                .iter()
                .any(|branch| matches(Some(current), branch));
        }
    }

    match (&current.kind, &cond.kind) {
        (_, NodeKind::Null) => true,
        (NodeKind::Object(current_object), NodeKind::Object(cond_object)) => cond_object
            .entries
            .iter()
            .all(|(key, cond_value)| matches(current_object.get(key), cond_value)),
        (NodeKind::Array(current_values), NodeKind::Array(cond_values)) => {
            current_values.len() == cond_values.len()
                && current_values
                    .iter()
                    .zip(cond_values.iter())
                    .all(|(value, cond)| matches(Some(value), cond))
        }
        (NodeKind::String(a), NodeKind::String(b)) => a == b,
        (NodeKind::Int(a), NodeKind::Int(b)) => a == b,
        (NodeKind::Float(a), NodeKind::Float(b)) => a == b,
        (NodeKind::Bool(a), NodeKind::Bool(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Key;

    fn obj(entries: Vec<(&str, Node)>) -> Node {
        Node::object(
            entries
                .into_iter()
                .map(|(k, v)| (Key::from(k), v))
                .collect(),
        )
    }

    #[test]
    fn subset_condition_on_objects() {
        let current = obj(vec![("n", Node::int(1)), ("m", Node::int(2))]);
        assert!(matches(Some(&current), &obj(vec![("n", Node::int(1))])));
        assert!(!matches(Some(&current), &obj(vec![("n", Node::int(2))])));
        assert!(!matches(Some(&current), &obj(vec![("q", Node::int(1))])));
        assert!(matches(Some(&current), &obj(vec![])));
    }

    #[test]
    fn null_condition_requires_presence() {
        assert!(matches(Some(&Node::int(1)), &Node::null()));
        assert!(!matches(None, &Node::null()));
    }

    #[test]
    fn absent_condition() {
        let absent = Node::null().with_tag(ABSENT_TAG);
        assert!(matches(None, &absent));
        assert!(!matches(Some(&Node::int(1)), &absent));
    }

    #[test]
    fn or_condition_is_a_disjunction() {
        let cond = Node::array(vec![Node::int(1), Node::int(2)]).with_tag(OR_TAG);
        assert!(matches(Some(&Node::int(2)), &cond));
        assert!(!matches(Some(&Node::int(3)), &cond));
    }

    #[test]
    fn arrays_compare_elementwise() {
        let current = Node::array(vec![Node::int(1), Node::int(2)]);
        assert!(matches(
            Some(&current),
            &Node::array(vec![Node::int(1), Node::int(2)])
        ));
        assert!(!matches(Some(&current), &Node::array(vec![Node::int(1)])));
    }

    #[test]
    fn tags_and_comments_do_not_affect_equality() {
        let current = Node::int(5).with_tag("type");
        assert!(matches(Some(&current), &Node::int(5)));
        let current = Node::string("x").with_comments(vec!["c".into()]);
        assert!(matches(Some(&current), &Node::string("x")));
    }
}
