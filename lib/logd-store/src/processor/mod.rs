//! The streaming patch processor: merges an ordered list of patch nodes
//! onto a base event stream in a single pass, without materializing the
//! full document.
//!
//! Patches mirror the document from the root; every subtree that applies
//! at a path carries the patch-root marker tag. The processor collects
//! exactly the event ranges under marked paths, applies the merges, and
//! re-emits the result; everything else passes through untouched. Keys the
//! base lacks are injected when their parent container closes, so a patch
//! can introduce paths as well as rewrite them.

mod collector;

pub use collector::{process_events, PatchProcessor};

use std::collections::BTreeMap;

use logd_path::{KindedPath, Segment};
use logd_value::{merge_opt, Key, Node, NodeKind};
use tracing::warn;

use crate::error::StoreError;

/// Internal tag marking the subtree at which a patch applies. Never
/// appears in output.
pub const PATCH_ROOT_TAG: &str = "logd-patch-root";

/// Wraps a diff as a patch-root subtree.
///
/// The marker is a tagged single-entry object under the null
/// merge-directive key rather than a tag on the diff itself, so the
/// diff's own tag (a `!delete`, say) survives marking.
pub fn mark_patch_root(diff: Node) -> Node {
    Node::object(vec![(Key::Null, diff)]).with_tag(PATCH_ROOT_TAG)
}

/// Recovers the diff from a marked patch-root subtree.
pub fn unmark_patch_root(node: &Node) -> Node {
    if let NodeKind::Object(object) = &node.kind {
        if node.has_tag(PATCH_ROOT_TAG)
            && object.entries.len() == 1
            && matches!(object.entries[0].0, Key::Null)
        {
            return object.entries[0].1.clone();
        }
    }
    // Not in wrapper form; treat the node itself as the diff, minus the
    // marker.
    let mut diff = node.clone();
    if diff.has_tag(PATCH_ROOT_TAG) {
        diff.tag = None;
    }
    diff
}

/// The preprocessed patch set: marked subtrees grouped by the path they
/// apply at, dominated paths already filtered out.
#[derive(Debug, Default, Clone)]
pub struct PatchSet {
    entries: BTreeMap<KindedPath, Vec<Node>>,
}

impl PatchSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &KindedPath) -> Option<&[Node]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &KindedPath> {
        self.entries.keys()
    }

    /// The unique entry whose path is ancestor-or-equal to `path`, if any.
    /// Dominated-path filtering guarantees at most one exists.
    pub fn ancestor_of(&self, path: &KindedPath) -> Option<(&KindedPath, &[Node])> {
        self.entries
            .range(..=path.clone())
            .rev()
            .find(|(candidate, _)| {
                let (ancestor, equal) = candidate.ancestor_or_equal(path);
                ancestor || equal
            })
            .map(|(candidate, patches)| (candidate, patches.as_slice()))
    }

    /// Entries whose paths lie strictly below `prefix`.
    pub fn entries_under<'a>(
        &'a self,
        prefix: &'a KindedPath,
    ) -> impl Iterator<Item = (&'a KindedPath, &'a [Node])> + 'a {
        self.entries
            .iter()
            .filter(move |(path, _)| {
                let (ancestor, _) = prefix.ancestor_or_equal(path);
                ancestor
            })
            .map(|(path, patches)| (path, patches.as_slice()))
    }

    pub fn has_entries_under(&self, prefix: &KindedPath) -> bool {
        self.entries_under(prefix).next().is_some()
    }
}

/// Walks every patch depth-first, recording each marked subtree under its
/// path and filtering out dominated paths (paths with a strict ancestor
/// that is itself marked).
pub fn build_patch_value_index(patches: &[Node]) -> PatchSet {
    let mut collected: Vec<(KindedPath, Node)> = Vec::new();
    for patch in patches {
        collect_marked(patch, &KindedPath::root(), &mut collected);
    }

    // Sort by path, keeping same-path patches in input order, then drop
    // anything below an already kept root.
    collected.sort_by(|a, b| a.0.cmp(&b.0));
    let mut roots: Vec<KindedPath> = Vec::new();
    let mut entries: BTreeMap<KindedPath, Vec<Node>> = BTreeMap::new();
    for (path, node) in collected {
        if roots
            .iter()
            .any(|root| root.ancestor_or_equal(&path).0)
        {
            continue;
        }
        if !entries.contains_key(&path) {
            roots.push(path.clone());
        }
        entries.entry(path).or_default().push(node);
    }

    PatchSet { entries }
}

fn collect_marked(node: &Node, path: &KindedPath, out: &mut Vec<(KindedPath, Node)>) {
    if node.has_tag(PATCH_ROOT_TAG) {
        out.push((path.clone(), node.clone()));
        return;
    }
    match &node.kind {
        NodeKind::Object(object) => {
            for (key, value) in &object.entries {
                let segment = match key {
                    Key::Field(name) => Segment::Field(name.clone()),
                    Key::Index(index) => Segment::Sparse(*index),
                    // Merge-directive keys are not addressable.
                    Key::Null => continue,
                };
                collect_marked(value, &path.child(segment), out);
            }
        }
        NodeKind::Array(values) => {
            for (i, value) in values.iter().enumerate() {
                collect_marked(value, &path.child(Segment::Index(i as u32)), out);
            }
        }
        _ => {}
    }
}

/// Computes the merged value for the subtree at `prefix`: the base value
/// (possibly absent) with every patch at or below `prefix` applied.
/// `None` means the value is deleted or never existed.
pub fn apply_patches_at(
    base: Option<Node>,
    prefix: &KindedPath,
    patches: &PatchSet,
) -> Result<Option<Node>, StoreError> {
    if let Some(list) = patches.get(prefix) {
        // Entries below an applied root were dominated away, so folding
        // the root's patches in order is the whole story.
        let mut current = base;
        for patch in list {
            current = merge_opt(current.as_ref(), &unmark_patch_root(patch));
        }
        return Ok(current);
    }

    // Group the entries strictly below the prefix by their next segment
    // and recurse per immediate child.
    let mut children: BTreeMap<Segment, KindedPath> = BTreeMap::new();
    for (path, _) in patches.entries_under(prefix) {
        let rest = prefix
            .strip_prefix(path)
            .expect("entries_under yields descendants");
        let segment = rest.segments()[0].clone();
        children
            .entry(segment.clone())
            .or_insert_with(|| prefix.child(segment));
    }
    if children.is_empty() {
        return Ok(base);
    }

    let mut node = base.unwrap_or_else(Node::null);
    for (segment, child_path) in children {
        let child_base = node.get(&segment).cloned();
        let child_value = apply_patches_at(child_base, &child_path, patches)?;
        let child_rel = KindedPath::from(segment.clone());
        match child_value {
            Some(value) => {
                if let Err(e) = node.set_path(&child_rel, value) {
                    warn!(path = %child_path, error = %e, "patch does not apply; skipping");
                }
            }
            None => {
                remove_child(&mut node, &segment);
            }
        }
    }
    if node.is_null() {
        return Ok(None);
    }
    Ok(Some(node))
}

fn remove_child(node: &mut Node, segment: &Segment) {
    match (segment, &mut node.kind) {
        (Segment::Field(name), NodeKind::Object(object)) => {
            object.remove(&Key::Field(name.clone()));
        }
        (Segment::Sparse(index), NodeKind::Object(object)) => {
            object.remove(&Key::Index(*index));
        }
        (Segment::Index(index), NodeKind::Array(values)) => {
            // Removal would shift later elements; deleted array slots
            // become null instead.
            if let Some(slot) = values.get_mut(*index as usize) {
                *slot = Node::null();
            }
        }
        _ => {}
    }
}
