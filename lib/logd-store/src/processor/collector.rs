//! The subtree collector: the single-pass state machine that drives base
//! events through the patch set.
//!
//! Matched subtrees are buffered, materialized, merged, and re-emitted;
//! all other events pass straight through. When a container closes, any
//! patch paths beneath it that never matched a base element are injected,
//! so patches can introduce keys the base does not have.

use std::collections::{BTreeMap, HashSet};

use logd_event::{events_to_node, node_to_events, Event, EventSink, State};
use logd_path::{KindedPath, Segment};
use tracing::{trace, warn};

use crate::error::StoreError;
use crate::processor::{apply_patches_at, PatchSet};

struct Collector {
    start_path: KindedPath,
    /// The buffered key event when collection began at a key.
    key_event: Option<Event>,
    events: Vec<Event>,
    depth: usize,
}

/// Tracks the direct children observed inside one open container, for
/// containers that have patch entries beneath them.
struct ContainerFrame {
    path: KindedPath,
    seen: HashSet<Segment>,
    is_object: bool,
}

/// Streams base events onto a sink, applying a patch set on the way.
pub struct PatchProcessor<'a, S: EventSink> {
    state: State,
    patches: &'a PatchSet,
    sink: S,
    collecting: Option<Collector>,
    /// Set when a key matched a patch root; the value begins on the next
    /// event.
    pending: Option<(KindedPath, Event)>,
    frames: Vec<ContainerFrame>,
    consumed: HashSet<KindedPath>,
}

impl<'a, S: EventSink> PatchProcessor<'a, S> {
    /// A processor for a stream that starts at the top of a document.
    pub fn new(patches: &'a PatchSet, sink: S) -> Self {
        Self::with_state(State::new(), patches, sink)
    }

    /// A processor for a sub-stream, with a pre-positioned path cursor
    /// (see [`State::at_value`]).
    pub fn with_state(state: State, patches: &'a PatchSet, sink: S) -> Self {
        PatchProcessor {
            state,
            patches,
            sink,
            collecting: None,
            pending: None,
            frames: Vec::new(),
            consumed: HashSet::new(),
        }
    }

    /// Feeds one base event through the processor.
    pub fn process(&mut self, event: Event) -> Result<(), StoreError> {
        self.state.process_event(&event)?;
        let cp = self.state.current_path().clone();

        // Inside a collected subtree: buffer until its end.
        if let Some(collector) = &mut self.collecting {
            match &event {
                Event::BeginObject { .. } | Event::BeginArray { .. } => collector.depth += 1,
                Event::EndObject | Event::EndArray => collector.depth -= 1,
                _ => {}
            }
            collector.events.push(event);
            if self.collecting.as_ref().expect("collecting").depth == 0 {
                self.finalize_collection()?;
            }
            return Ok(());
        }

        // A key matched; this event is its value.
        if let Some((path, key_event)) = self.pending.take() {
            match &event {
                Event::Comment(_) => {
                    // The value is being replaced; its comments go with it.
                    self.pending = Some((path, key_event));
                    return Ok(());
                }
                event if event.starts_value() => {
                    let depth = usize::from(!event.is_scalar());
                    self.collecting = Some(Collector {
                        start_path: path,
                        key_event: Some(key_event),
                        events: vec![event.clone()],
                        depth,
                    });
                    if depth == 0 {
                        self.finalize_collection()?;
                    }
                    return Ok(());
                }
                _ => {
                    return Err(StoreError::Malformed {
                        source: logd_event::EventError::MalformedStream {
                            reason: "key not followed by a value".to_string(),
                        },
                    });
                }
            }
        }

        // Record direct children of tracked containers, so end-of-container
        // injection knows which keys the base already had.
        if event.is_key() || event.starts_value() {
            if let (Some(frame), Some(parent)) = (self.frames.last_mut(), cp.parent()) {
                if frame.path == parent {
                    if let Some(segment) = cp.last_segment() {
                        frame.seen.insert(segment.clone());
                    }
                }
            }
        }

        // A key whose path is a patch root: hold it, do not emit.
        if event.is_key() && self.patches.get(&cp).is_some() {
            trace!(path = %cp, "patch root matched at key");
            self.pending = Some((cp, event));
            return Ok(());
        }

        // A value whose path is a patch root: collect it.
        if event.starts_value() && self.patches.get(&cp).is_some() {
            trace!(path = %cp, "patch root matched at value");
            let depth = usize::from(!event.is_scalar());
            self.collecting = Some(Collector {
                start_path: cp,
                key_event: None,
                events: vec![event],
                depth,
            });
            if depth == 0 {
                self.finalize_collection()?;
            }
            return Ok(());
        }

        // Opening a container with patch entries beneath it: start
        // tracking its children.
        if matches!(event, Event::BeginObject { .. } | Event::BeginArray { .. })
            && self.patches.has_entries_under(&cp)
        {
            self.frames.push(ContainerFrame {
                path: cp.clone(),
                seen: HashSet::new(),
                is_object: matches!(event, Event::BeginObject { .. }),
            });
        }

        // Closing a tracked container: inject patch paths the base lacked,
        // before the end event goes out.
        if matches!(event, Event::EndObject | Event::EndArray) {
            if self
                .frames
                .last()
                .is_some_and(|frame| frame.path == cp)
            {
                let frame = self.frames.pop().expect("checked above");
                self.inject_missing(&frame)?;
            }
        }

        self.sink.emit(event)?;
        Ok(())
    }

    /// Runs a whole event sequence through the processor and closes it.
    pub fn process_all(
        mut self,
        events: impl IntoIterator<Item = Event>,
    ) -> Result<S, StoreError> {
        for event in events {
            self.process(event)?;
        }
        self.finish()
    }

    /// Finishes processing, returning the sink.
    pub fn finish(self) -> Result<S, StoreError> {
        if self.collecting.is_some() || self.pending.is_some() {
            return Err(StoreError::Malformed {
                source: logd_event::EventError::UnexpectedEof {
                    depth: self.state.depth(),
                },
            });
        }
        Ok(self.sink)
    }

    fn finalize_collection(&mut self) -> Result<(), StoreError> {
        let collector = self.collecting.take().expect("finalize while collecting");
        let base = events_to_node(&collector.events)?;
        let result = apply_patches_at(Some(base), &collector.start_path, self.patches)?;
        self.consumed.insert(collector.start_path.clone());

        match result {
            Some(node) => {
                if let Some(key_event) = collector.key_event {
                    self.sink.emit(key_event)?;
                }
                for event in node_to_events(&node) {
                    self.sink.emit(event)?;
                }
            }
            None => {
                trace!(path = %collector.start_path, "patched value deleted; key dropped");
            }
        }
        Ok(())
    }

    /// Emits merged values for patch paths under `frame.path` whose
    /// immediate child the base never produced.
    fn inject_missing(&mut self, frame: &ContainerFrame) -> Result<(), StoreError> {
        let mut children: BTreeMap<Segment, Vec<KindedPath>> = BTreeMap::new();
        for (path, _) in self.patches.entries_under(&frame.path) {
            if self.consumed.contains(path) {
                continue;
            }
            let rest = frame
                .path
                .strip_prefix(path)
                .expect("entries_under yields descendants");
            children
                .entry(rest.segments()[0].clone())
                .or_default()
                .push(path.clone());
        }
        if children.is_empty() {
            return Ok(());
        }

        let mut array_len = frame
            .seen
            .iter()
            .filter(|segment| matches!(segment, Segment::Index(_)))
            .count() as u32;

        for (segment, group) in children {
            if frame.seen.contains(&segment) {
                // The base has this child; if it did not trigger
                // collection the patch cannot apply (a scalar shadows it).
                continue;
            }

            match (&segment, frame.is_object) {
                (Segment::Field(_) | Segment::Sparse(_), true) => {}
                (Segment::Index(index), false) => {
                    if *index != array_len {
                        warn!(
                            path = %frame.path,
                            index,
                            len = array_len,
                            "array patch index beyond end; skipping"
                        );
                        continue;
                    }
                }
                _ => {
                    warn!(
                        path = %frame.path,
                        segment = %segment,
                        "patch segment does not fit container; skipping"
                    );
                    continue;
                }
            }

            let child_path = frame.path.child(segment.clone());
            let value = apply_patches_at(None, &child_path, self.patches)?;
            for path in &group {
                self.consumed.insert(path.clone());
            }
            let Some(value) = value else {
                continue;
            };

            match &segment {
                Segment::Field(name) => self.sink.emit(Event::Key(name.clone()))?,
                Segment::Sparse(index) => {
                    self.sink.emit(Event::IntKey(i64::from(*index)))?;
                }
                Segment::Index(_) => {
                    array_len += 1;
                }
                _ => continue,
            }
            for event in node_to_events(&value) {
                self.sink.emit(event)?;
            }
        }
        Ok(())
    }
}

/// Convenience: runs `events` through a fresh processor into a buffer.
pub fn process_events(
    events: impl IntoIterator<Item = Event>,
    patches: &PatchSet,
) -> Result<Vec<Event>, StoreError> {
    PatchProcessor::new(patches, Vec::new()).process_all(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{build_patch_value_index, mark_patch_root, PATCH_ROOT_TAG};
    use logd_value::{parse_node, Node};

    fn p(s: &str) -> KindedPath {
        KindedPath::parse(s).unwrap()
    }

    fn run(base_text: &str, patches: Vec<Node>) -> Node {
        let base = parse_node(base_text).unwrap();
        let set = build_patch_value_index(&patches);
        let output = process_events(node_to_events(&base), &set).unwrap();
        events_to_node(&output).unwrap()
    }

    fn patch_at(path: &str, value_text: &str) -> Node {
        let value = mark_patch_root(parse_node(value_text).unwrap());
        if path.is_empty() {
            value
        } else {
            let mut patch = parse_node("{}").unwrap();
            patch.set_path(&p(path), value).unwrap();
            patch
        }
    }

    #[test]
    fn passthrough_without_patches() {
        let base = parse_node(r#"{ a: 1, b: [2, 3] }"#).unwrap();
        let set = PatchSet::default();
        let output = process_events(node_to_events(&base), &set).unwrap();
        assert_eq!(events_to_node(&output).unwrap(), base);
    }

    #[test]
    fn replaces_a_sparse_leaf() {
        let result = run(
            r#"{ data: { 100: { name: "old" }, 200: { name: "other" } } }"#,
            vec![patch_at("data{100}.name", r#""new""#)],
        );
        assert_eq!(
            result,
            parse_node(r#"{ data: { 100: { name: "new" }, 200: { name: "other" } } }"#).unwrap()
        );
    }

    #[test]
    fn no_marker_tag_leaks_into_output() {
        let result = run(
            r#"{ data: { 100: { name: "old" } } }"#,
            vec![patch_at("data{100}", r#"{ name: "new" }"#)],
        );
        fn assert_no_marker(node: &Node) {
            assert!(!node.has_tag(PATCH_ROOT_TAG));
            match &node.kind {
                logd_value::NodeKind::Object(object) => {
                    for (_, value) in &object.entries {
                        assert_no_marker(value);
                    }
                }
                logd_value::NodeKind::Array(values) => {
                    for value in values {
                        assert_no_marker(value);
                    }
                }
                _ => {}
            }
        }
        assert_no_marker(&result);
    }

    #[test]
    fn merges_objects_rather_than_replacing() {
        let result = run(
            r#"{ k: { n: 1, keep: "yes" } }"#,
            vec![patch_at("k", "{ n: 2 }")],
        );
        assert_eq!(
            result,
            parse_node(r#"{ k: { n: 2, keep: "yes" } }"#).unwrap()
        );
    }

    #[test]
    fn same_path_patches_apply_in_order() {
        let result = run(
            "{ k: { n: 1 } }",
            vec![patch_at("k", "{ n: 2 }"), patch_at("k", "{ n: 3 }")],
        );
        assert_eq!(result, parse_node("{ k: { n: 3 } }").unwrap());
    }

    #[test]
    fn dominated_patch_contributes_nothing() {
        let result = run(
            "{ a: 1, b: 2 }",
            vec![patch_at("", "{ a: 10, b: 20 }"), patch_at("a", "999")],
        );
        assert_eq!(result, parse_node("{ a: 10, b: 20 }").unwrap());
    }

    #[test]
    fn injects_keys_the_base_lacks() {
        let result = run(
            "{ existing: 1 }",
            vec![patch_at("users.alice", r#"{ name: "Alice" }"#)],
        );
        assert_eq!(
            result,
            parse_node(r#"{ existing: 1, users: { alice: { name: "Alice" } } }"#).unwrap()
        );
    }

    #[test]
    fn injects_into_existing_containers() {
        let result = run(
            "{ users: { bob: 1 } }",
            vec![patch_at("users.alice", r#"{ name: "Alice" }"#)],
        );
        assert_eq!(
            result,
            parse_node(r#"{ users: { bob: 1, alice: { name: "Alice" } } }"#).unwrap()
        );
    }

    #[test]
    fn delete_drops_key_and_value() {
        let result = run(
            "{ a: 1, b: 2 }",
            vec![patch_at("a", "!delete null")],
        );
        assert_eq!(result, parse_node("{ b: 2 }").unwrap());
    }

    #[test]
    fn scalar_base_shadows_deeper_patch() {
        let result = run("{ a: 1 }", vec![patch_at("a.b", "2")]);
        assert_eq!(result, parse_node("{ a: 1 }").unwrap());
    }

    #[test]
    fn root_patch_replaces_whole_document() {
        let result = run("{ a: 1 }", vec![patch_at("", "{ z: 9 }")]);
        assert_eq!(result, parse_node("{ a: 1, z: 9 }").unwrap());
    }

    #[test]
    fn array_element_patches_apply_positionally() {
        let result = run(
            "{ xs: [ { id: 1 }, { id: 2 } ] }",
            vec![patch_at("xs[1]", "{ id: 20 }")],
        );
        assert_eq!(
            result,
            parse_node("{ xs: [ { id: 1 }, { id: 20 } ] }").unwrap()
        );
    }

    #[test]
    fn array_append_at_exact_end() {
        let result = run("{ xs: [1] }", vec![patch_at("xs[1]", "2")]);
        assert_eq!(result, parse_node("{ xs: [1, 2] }").unwrap());
    }

    #[test]
    fn array_patch_beyond_end_is_skipped() {
        let result = run("{ xs: [1] }", vec![patch_at("xs[5]", "9")]);
        assert_eq!(result, parse_node("{ xs: [1] }").unwrap());
    }

    #[test]
    fn comments_pass_through_untouched() {
        let base = parse_node("{ # note\n a: 1, b: 2 }").unwrap();
        let set = build_patch_value_index(&[patch_at("b", "3")]);
        let output = process_events(node_to_events(&base), &set).unwrap();
        let result = events_to_node(&output).unwrap();
        assert_eq!(
            result.as_object().unwrap().get_field("a").unwrap().comments,
            vec!["note".to_string()]
        );
        assert_eq!(
            result.as_object().unwrap().get_field("b").unwrap(),
            &Node::int(3)
        );
    }
}
