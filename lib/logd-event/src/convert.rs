//! Conversion between the node tree and the event stream.

use logd_value::{Key, Node, NodeKind, Object};

use crate::{Event, EventError};

/// Flattens a node into its depth-first event sequence.
///
/// Every `BeginObject`/`BeginArray` is matched by an end event, and every
/// key event is immediately followed by exactly one value. Comments are
/// emitted immediately before the value they attach to.
pub fn node_to_events(node: &Node) -> Vec<Event> {
    let mut events = Vec::new();
    emit_node(node, &mut events);
    events
}

fn emit_node(node: &Node, out: &mut Vec<Event>) {
    if !node.comments.is_empty() {
        out.push(Event::Comment(node.comments.clone()));
    }
    let tag = node.tag.clone();
    match &node.kind {
        NodeKind::Object(object) => {
            out.push(Event::BeginObject { tag });
            for (key, value) in &object.entries {
                match key {
                    Key::Field(name) => out.push(Event::Key(name.clone())),
                    Key::Index(index) => out.push(Event::IntKey(i64::from(*index))),
                    Key::Null => out.push(Event::NullKey),
                }
                emit_node(value, out);
            }
            out.push(Event::EndObject);
        }
        NodeKind::Array(values) => {
            out.push(Event::BeginArray { tag });
            for value in values {
                emit_node(value, out);
            }
            out.push(Event::EndArray);
        }
        NodeKind::String(value) => out.push(Event::String {
            value: value.clone(),
            tag,
        }),
        NodeKind::Int(value) => out.push(Event::Int { value: *value, tag }),
        NodeKind::Float(value) => out.push(Event::Float { value: *value, tag }),
        NodeKind::Bool(value) => out.push(Event::Bool { value: *value, tag }),
        NodeKind::Null => out.push(Event::Null { tag }),
    }
}

enum Builder {
    Object {
        entries: Vec<(Key, Node)>,
        tag: Option<String>,
        comments: Vec<String>,
        pending_key: Option<Key>,
    },
    Array {
        values: Vec<Node>,
        tag: Option<String>,
        comments: Vec<String>,
    },
}

/// Rebuilds a node from its event sequence: the inverse of
/// [`node_to_events`].
///
/// Fails with `MalformedStream` on unmatched ends, keys outside objects,
/// values without keys, or trailing events, and with `UnexpectedEof` when
/// the sequence stops inside an open container.
pub fn events_to_node(events: &[Event]) -> Result<Node, EventError> {
    events_to_node_iter(events.iter().cloned())
}

/// Iterator form of [`events_to_node`].
pub fn events_to_node_iter(
    events: impl IntoIterator<Item = Event>,
) -> Result<Node, EventError> {
    let mut stack: Vec<Builder> = Vec::new();
    let mut pending_comments: Vec<String> = Vec::new();
    let mut finished: Option<Node> = None;

    for event in events {
        if finished.is_some() {
            return Err(EventError::MalformedStream {
                reason: "events after complete top-level value".to_string(),
            });
        }

        match event {
            Event::Comment(lines) => pending_comments.extend(lines),
            Event::Key(name) => set_pending_key(&mut stack, Key::Field(name))?,
            Event::IntKey(value) => {
                let index =
                    u32::try_from(value).map_err(|_| EventError::MalformedStream {
                        reason: format!("integer key {value} out of sparse index range"),
                    })?;
                set_pending_key(&mut stack, Key::Index(index))?;
            }
            Event::NullKey => set_pending_key(&mut stack, Key::Null)?,
            Event::BeginObject { tag } => stack.push(Builder::Object {
                entries: Vec::new(),
                tag,
                comments: std::mem::take(&mut pending_comments),
                pending_key: None,
            }),
            Event::BeginArray { tag } => stack.push(Builder::Array {
                values: Vec::new(),
                tag,
                comments: std::mem::take(&mut pending_comments),
            }),
            Event::EndObject => {
                let node = match stack.pop() {
                    Some(Builder::Object {
                        entries,
                        tag,
                        comments,
                        pending_key,
                    }) => {
                        if pending_key.is_some() {
                            return Err(EventError::MalformedStream {
                                reason: "object ended after key with no value".to_string(),
                            });
                        }
                        let mut node = Node::new(NodeKind::Object(Object::new(entries)));
                        node.tag = tag;
                        node.comments = comments;
                        node
                    }
                    Some(Builder::Array { .. }) | None => {
                        return Err(EventError::MalformedStream {
                            reason: "unmatched end of object".to_string(),
                        });
                    }
                };
                attach(&mut stack, &mut finished, node)?;
            }
            Event::EndArray => {
                let node = match stack.pop() {
                    Some(Builder::Array {
                        values,
                        tag,
                        comments,
                    }) => {
                        let mut node = Node::array(values);
                        node.tag = tag;
                        node.comments = comments;
                        node
                    }
                    Some(Builder::Object { .. }) | None => {
                        return Err(EventError::MalformedStream {
                            reason: "unmatched end of array".to_string(),
                        });
                    }
                };
                attach(&mut stack, &mut finished, node)?;
            }
            Event::String { value, tag } => {
                let node = scalar(NodeKind::String(value), tag, &mut pending_comments);
                attach(&mut stack, &mut finished, node)?;
            }
            Event::Int { value, tag } => {
                let node = scalar(NodeKind::Int(value), tag, &mut pending_comments);
                attach(&mut stack, &mut finished, node)?;
            }
            Event::Float { value, tag } => {
                let node = scalar(NodeKind::Float(value), tag, &mut pending_comments);
                attach(&mut stack, &mut finished, node)?;
            }
            Event::Bool { value, tag } => {
                let node = scalar(NodeKind::Bool(value), tag, &mut pending_comments);
                attach(&mut stack, &mut finished, node)?;
            }
            Event::Null { tag } => {
                let node = scalar(NodeKind::Null, tag, &mut pending_comments);
                attach(&mut stack, &mut finished, node)?;
            }
        }
    }

    match finished {
        Some(node) => Ok(node),
        None => Err(EventError::UnexpectedEof { depth: stack.len() }),
    }
}

fn scalar(kind: NodeKind, tag: Option<String>, pending_comments: &mut Vec<String>) -> Node {
    let mut node = Node::new(kind);
    node.tag = tag;
    node.comments = std::mem::take(pending_comments);
    node
}

fn set_pending_key(stack: &mut [Builder], key: Key) -> Result<(), EventError> {
    match stack.last_mut() {
        Some(Builder::Object { pending_key, .. }) => {
            if pending_key.replace(key).is_some() {
                return Err(EventError::MalformedStream {
                    reason: "key event while a key was already pending".to_string(),
                });
            }
            Ok(())
        }
        Some(Builder::Array { .. }) => Err(EventError::MalformedStream {
            reason: "key event inside array".to_string(),
        }),
        None => Err(EventError::MalformedStream {
            reason: "key event outside any object".to_string(),
        }),
    }
}

fn attach(
    stack: &mut Vec<Builder>,
    finished: &mut Option<Node>,
    node: Node,
) -> Result<(), EventError> {
    match stack.last_mut() {
        Some(Builder::Object {
            entries,
            pending_key,
            ..
        }) => {
            let key = pending_key.take().ok_or_else(|| EventError::MalformedStream {
                reason: "value without preceding key".to_string(),
            })?;
            entries.push((key, node));
            Ok(())
        }
        Some(Builder::Array { values, .. }) => {
            values.push(node);
            Ok(())
        }
        None => {
            *finished = Some(node);
            Ok(())
        }
    }
}
