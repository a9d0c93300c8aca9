//! The merge operator applied at commit and read time.
//!
//! Objects (plain or sparse) merge recursively; every other combination is
//! replaced by the diff wholesale. A `!delete`-tagged null removes the key
//! it is merged into.

use crate::{Node, NodeKind, Object};

/// Tag marking a null diff value as a deletion directive.
pub const DELETE_TAG: &str = "delete";

/// Whether `node` is a deletion directive.
pub fn is_delete(node: &Node) -> bool {
    node.is_null() && node.has_tag(DELETE_TAG)
}

/// Merges `diff` onto `base`. `None` means the value was deleted.
pub fn merge(base: &Node, diff: &Node) -> Option<Node> {
    if is_delete(diff) {
        return None;
    }

    match (&base.kind, &diff.kind) {
        (NodeKind::Object(base_object), NodeKind::Object(diff_object)) => {
            let mut entries = Vec::with_capacity(base_object.len() + diff_object.len());

            // Base entries first, in base order, merged where the diff
            // also has the key.
            for (key, base_value) in &base_object.entries {
                match diff_object.get(key) {
                    Some(diff_value) => {
                        if let Some(merged) = merge(base_value, diff_value) {
                            entries.push((key.clone(), merged));
                        }
                        // Deleted: the key is dropped.
                    }
                    None => entries.push((key.clone(), base_value.clone())),
                }
            }

            // Diff-only keys append in diff order.
            for (key, diff_value) in &diff_object.entries {
                if base_object.contains(key) {
                    continue;
                }
                if let Some(added) = scrub(diff_value) {
                    entries.push((key.clone(), added));
                }
            }

            let mut node = Node::new(NodeKind::Object(Object::new(entries)));
            node.tag = diff.tag.clone().or_else(|| base.tag.clone());
            node.comments = if diff.comments.is_empty() {
                base.comments.clone()
            } else {
                diff.comments.clone()
            };
            Some(node)
        }
        _ => {
            // Replacement: the diff wins, with tag fallback to the base.
            let mut node = scrub(diff)?;
            if node.tag.is_none() {
                node.tag = base.tag.clone();
            }
            Some(node)
        }
    }
}

/// Merges a diff against a possibly absent base.
pub fn merge_opt(base: Option<&Node>, diff: &Node) -> Option<Node> {
    match base {
        Some(base) => merge(base, diff),
        None => scrub(diff),
    }
}

/// Removes deletion directives from a diff that is being applied where no
/// base value exists. `None` when the diff itself is a deletion.
pub fn scrub(diff: &Node) -> Option<Node> {
    if is_delete(diff) {
        return None;
    }
    match &diff.kind {
        NodeKind::Object(object) => {
            let entries = object
                .entries
                .iter()
                .filter_map(|(key, value)| Some((key.clone(), scrub(value)?)))
                .collect();
            let mut node = Node::new(NodeKind::Object(Object::new(entries)));
            node.tag = diff.tag.clone();
            node.comments = diff.comments.clone();
            Some(node)
        }
        _ => Some(diff.clone()),
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
    fn objects_merge_recursively() {
        let base = obj(vec![
            ("a", Node::int(1)),
            ("nested", obj(vec![("x", Node::int(10)), ("y", Node::int(20))])),
        ]);
        let diff = obj(vec![
            ("nested", obj(vec![("y", Node::int(99))])),
            ("b", Node::int(2)),
        ]);

        let merged = merge(&base, &diff).unwrap();
        let expected = obj(vec![
            ("a", Node::int(1)),
            ("nested", obj(vec![("x", Node::int(10)), ("y", Node::int(99))])),
            ("b", Node::int(2)),
        ]);
        assert_eq!(merged, expected);
    }

    #[test]
    fn non_objects_replace() {
        assert_eq!(
            merge(&Node::int(1), &Node::string("x")).unwrap(),
            Node::string("x")
        );
        assert_eq!(
            merge(
                &Node::array(vec![Node::int(1)]),
                &Node::array(vec![Node::int(2), Node::int(3)])
            )
            .unwrap(),
            Node::array(vec![Node::int(2), Node::int(3)])
        );
        // Array vs object is also a replacement.
        assert_eq!(
            merge(&Node::array(vec![]), &obj(vec![("a", Node::int(1))])).unwrap(),
            obj(vec![("a", Node::int(1))])
        );
    }

    #[test]
    fn delete_removes_keys() {
        let base = obj(vec![("a", Node::int(1)), ("b", Node::int(2))]);
        let diff = obj(vec![("a", Node::null().with_tag(DELETE_TAG))]);
        let merged = merge(&base, &diff).unwrap();
        assert_eq!(merged, obj(vec![("b", Node::int(2))]));
    }

    #[test]
    fn delete_at_root_yields_none() {
        assert!(merge(&Node::int(1), &Node::null().with_tag(DELETE_TAG)).is_none());
        assert!(merge_opt(None, &Node::null().with_tag(DELETE_TAG)).is_none());
    }

    #[test]
    fn absent_base_takes_scrubbed_diff() {
        let diff = obj(vec![
            ("keep", Node::int(1)),
            ("drop", Node::null().with_tag(DELETE_TAG)),
        ]);
        assert_eq!(merge_opt(None, &diff).unwrap(), obj(vec![("keep", Node::int(1))]));
    }

    #[test]
    fn sparse_objects_merge_by_integer_key() {
        let base = Node::object(vec![
            (Key::Index(100), obj(vec![("name", Node::string("old"))])),
            (Key::Index(200), obj(vec![("name", Node::string("other"))])),
        ]);
        let diff = Node::object(vec![(
            Key::Index(100),
            obj(vec![("name", Node::string("new"))]),
        )]);
        let merged = merge(&base, &diff).unwrap();
        assert_eq!(
            merged,
            Node::object(vec![
                (Key::Index(100), obj(vec![("name", Node::string("new"))])),
                (Key::Index(200), obj(vec![("name", Node::string("other"))])),
            ])
        );
        assert!(merged.as_object().unwrap().sparse);
    }

    #[test]
    fn diff_tag_wins_base_tag_survives() {
        let base = obj(vec![]).with_tag("type");
        let merged = merge(&base, &obj(vec![])).unwrap();
        assert_eq!(merged.tag.as_deref(), Some("type"));

        let merged = merge(&base, &obj(vec![]).with_tag("bracket")).unwrap();
        assert_eq!(merged.tag.as_deref(), Some("bracket"));
    }

    #[test]
    fn same_path_patches_compose_in_order() {
        let base = obj(vec![("n", Node::int(1))]);
        let first = obj(vec![("n", Node::int(2)), ("a", Node::int(10))]);
        let second = obj(vec![("n", Node::int(3))]);

        let folded = merge(&merge(&base, &first).unwrap(), &second).unwrap();
        assert_eq!(
            folded,
            obj(vec![("n", Node::int(3)), ("a", Node::int(10))])
        );
    }
}
