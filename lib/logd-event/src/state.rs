//! The path-cursor state machine.
//!
//! Fed one event at a time, [`State`] tracks the kinded path of the event
//! just processed: value and container-begin events report the path of the
//! value, end events the path of the just-closed container. Comments do not
//! move the cursor; array indexes advance when an element completes, not
//! before.

use logd_path::{KindedPath, Segment};

use crate::{Event, EventError};

#[derive(Debug, Clone)]
enum Frame {
    Object {
        sparse: bool,
        seg: Option<Segment>,
        /// A key has been read and its value has not yet begun.
        pending: bool,
    },
    Array {
        index: u32,
    },
}

/// Path cursor over an event stream.
#[derive(Debug, Clone)]
pub struct State {
    frames: Vec<Frame>,
    current: KindedPath,
    complete: bool,
}

impl State {
    /// A cursor positioned before a fresh top-level value.
    pub fn new() -> Self {
        State {
            frames: Vec::new(),
            current: KindedPath::root(),
            complete: false,
        }
    }

    /// Primes the cursor mid-stream, just before the key event whose path
    /// is `path`. Used when decoding starts at a snapshot index entry.
    ///
    /// The last segment of `path` must select into an object (plain or
    /// sparse); the key event that arrives first will re-establish it.
    pub fn at_key(path: &KindedPath) -> Self {
        let mut frames = Vec::with_capacity(path.len());
        for segment in path.segments() {
            frames.push(Self::frame_for(segment));
        }
        if let Some(Frame::Object { seg, .. }) = frames.last_mut() {
            *seg = None;
        }
        State {
            frames,
            current: path.parent().unwrap_or_else(KindedPath::root),
            complete: false,
        }
    }

    /// Primes the cursor mid-stream, just before the value event at `path`.
    pub fn at_value(path: &KindedPath) -> Self {
        let segments = path.segments();
        let mut frames = Vec::with_capacity(segments.len());
        for segment in segments {
            frames.push(Self::frame_for(segment));
        }
        // The innermost frame has already selected the value's own segment.
        if let Some(last) = segments.last() {
            let frame = frames.last_mut().expect("frame per segment");
            match (frame, last) {
                (Frame::Object { seg, pending, .. }, seg_last) => {
                    *seg = Some(seg_last.clone());
                    *pending = true;
                }
                (Frame::Array { index }, Segment::Index(i)) => *index = *i,
                _ => {}
            }
        }
        State {
            frames,
            current: path.clone(),
            complete: false,
        }
    }

    /// Builds the frame for the container that `segment` selects into.
    fn frame_for(segment: &Segment) -> Frame {
        match segment {
            Segment::Index(i) => Frame::Array { index: *i },
            Segment::IndexWild => Frame::Array { index: 0 },
            Segment::Sparse(_) | Segment::SparseWild => Frame::Object {
                sparse: true,
                seg: Some(segment.clone()),
                pending: false,
            },
            _ => Frame::Object {
                sparse: false,
                seg: Some(segment.clone()),
                pending: false,
            },
        }
    }

    /// The kinded path of the event most recently processed.
    pub fn current_path(&self) -> &KindedPath {
        &self.current
    }

    /// Number of open containers. Zero at top of stream and again once a
    /// complete top-level value has been consumed.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True once one complete top-level value has been consumed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Advances the cursor over one event.
    pub fn process_event(&mut self, event: &Event) -> Result<(), EventError> {
        match event {
            Event::Comment(_) => Ok(()),
            Event::Key(name) => self.process_key(Some(Segment::Field(name.clone()))),
            Event::IntKey(value) => {
                let index = u32::try_from(*value).map_err(|_| EventError::MalformedStream {
                    reason: format!("integer key {value} out of sparse index range"),
                })?;
                self.process_key(Some(Segment::Sparse(index)))
            }
            Event::NullKey => self.process_key(None),
            Event::BeginObject { .. } => {
                self.enter_value()?;
                self.frames.push(Frame::Object {
                    sparse: false,
                    seg: None,
                    pending: false,
                });
                Ok(())
            }
            Event::BeginArray { .. } => {
                self.enter_value()?;
                self.frames.push(Frame::Array { index: 0 });
                Ok(())
            }
            Event::EndObject => self.end_container(true),
            Event::EndArray => self.end_container(false),
            _ => {
                // Scalar value.
                self.enter_value()?;
                self.finish_value();
                Ok(())
            }
        }
    }

    fn process_key(&mut self, segment: Option<Segment>) -> Result<(), EventError> {
        match self.frames.last_mut() {
            Some(Frame::Object {
                sparse,
                seg,
                pending,
            }) => {
                if matches!(segment, Some(Segment::Sparse(_))) {
                    *sparse = true;
                }
                *seg = segment;
                *pending = true;
                self.current = self.path_of_frames();
                Ok(())
            }
            Some(Frame::Array { .. }) => Err(EventError::MalformedStream {
                reason: "key event inside array".to_string(),
            }),
            None => Err(EventError::MalformedStream {
                reason: "key event outside any object".to_string(),
            }),
        }
    }

    /// Establishes the cursor for a value event that is about to be
    /// consumed, validating key/value pairing.
    fn enter_value(&mut self) -> Result<(), EventError> {
        if self.complete {
            return Err(EventError::MalformedStream {
                reason: "value after complete top-level value".to_string(),
            });
        }
        match self.frames.last_mut() {
            None => {
                self.current = KindedPath::root();
                Ok(())
            }
            Some(Frame::Object { pending, .. }) => {
                if !*pending {
                    return Err(EventError::MalformedStream {
                        reason: "value without preceding key".to_string(),
                    });
                }
                *pending = false;
                self.current = self.path_of_frames();
                Ok(())
            }
            Some(Frame::Array { .. }) => {
                self.current = self.path_of_frames();
                Ok(())
            }
        }
    }

    fn end_container(&mut self, object: bool) -> Result<(), EventError> {
        match self.frames.pop() {
            Some(Frame::Object { pending, .. }) if object => {
                if pending {
                    return Err(EventError::MalformedStream {
                        reason: "object ended after key with no value".to_string(),
                    });
                }
            }
            Some(Frame::Array { .. }) if !object => {}
            Some(_) => {
                return Err(EventError::MalformedStream {
                    reason: "mismatched container end".to_string(),
                });
            }
            None => {
                return Err(EventError::MalformedStream {
                    reason: "container end with no open container".to_string(),
                });
            }
        }
        // The closed container's path is the path it had as a value.
        self.current = self.path_of_frames();
        self.finish_value();
        Ok(())
    }

    /// Marks the value at the top of the stack complete: array elements
    /// advance their index, a completed top-level value ends the stream.
    fn finish_value(&mut self) {
        match self.frames.last_mut() {
            Some(Frame::Array { index }) => *index += 1,
            Some(Frame::Object { .. }) => {}
            None => self.complete = true,
        }
    }

    fn path_of_frames(&self) -> KindedPath {
        let mut path = KindedPath::root();
        for frame in &self.frames {
            match frame {
                Frame::Object { seg: Some(seg), .. } => path.push(seg.clone()),
                // Only the top frame can be segment-less (a just-opened
                // object, or a null merge-directive key).
                Frame::Object { seg: None, .. } => {}
                Frame::Array { index } => path.push(Segment::Index(*index)),
            }
        }
        path
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> KindedPath {
        KindedPath::parse(s).unwrap()
    }

    fn drive(state: &mut State, events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|event| {
                state.process_event(event).unwrap();
                state.current_path().to_string()
            })
            .collect()
    }

    #[test]
    fn object_cursor_tracks_keys() {
        let mut state = State::new();
        let paths = drive(
            &mut state,
            &[
                Event::begin_object(),
                Event::key("a"),
                Event::int(1),
                Event::key("b"),
                Event::begin_object(),
                Event::key("c"),
                Event::string("x"),
                Event::EndObject,
                Event::EndObject,
            ],
        );
        assert_eq!(paths, ["", "a", "a", "b", "b", "b.c", "b.c", "b", ""]);
        assert_eq!(state.depth(), 0);
        assert!(state.is_complete());
    }

    #[test]
    fn array_indexes_advance_after_each_element() {
        let mut state = State::new();
        let paths = drive(
            &mut state,
            &[
                Event::begin_object(),
                Event::key("xs"),
                Event::begin_array(),
                Event::int(0),
                Event::begin_object(),
                Event::key("k"),
                Event::int(1),
                Event::EndObject,
                Event::int(2),
                Event::EndArray,
                Event::EndObject,
            ],
        );
        assert_eq!(
            paths,
            [
                "", "xs", "xs", "xs[0]", "xs[1]", "xs[1].k", "xs[1].k", "xs[1]", "xs[2]", "xs",
                ""
            ]
        );
    }

    #[test]
    fn int_keys_mark_sparse_frames() {
        let mut state = State::new();
        let paths = drive(
            &mut state,
            &[
                Event::begin_object(),
                Event::key("users"),
                Event::begin_object(),
                Event::IntKey(3002),
                Event::begin_object(),
                Event::key("name"),
                Event::string("ada"),
                Event::EndObject,
                Event::EndObject,
                Event::EndObject,
            ],
        );
        assert_eq!(
            paths,
            [
                "",
                "users",
                "users",
                "users{3002}",
                "users{3002}",
                "users{3002}.name",
                "users{3002}.name",
                "users{3002}",
                "users",
                ""
            ]
        );
    }

    #[test]
    fn comments_do_not_move_the_cursor() {
        let mut state = State::new();
        let paths = drive(
            &mut state,
            &[
                Event::begin_object(),
                Event::key("a"),
                Event::Comment(vec!["note".into()]),
                Event::int(1),
                Event::EndObject,
            ],
        );
        assert_eq!(paths, ["", "a", "a", "a", ""]);
    }

    #[test]
    fn primed_at_key_resumes_mid_stream() {
        let mut state = State::at_key(&path("users"));
        let paths = drive(
            &mut state,
            &[
                Event::key("users"),
                Event::begin_object(),
                Event::key("alice"),
                Event::string("a"),
                Event::EndObject,
            ],
        );
        assert_eq!(paths, ["users", "users", "users.alice", "users.alice", "users"]);
        // Closing the (already open) root would complete the value.
        state.process_event(&Event::EndObject).unwrap();
        assert_eq!(state.depth(), 0);
    }

    #[test]
    fn primed_at_value_reads_a_subtree() {
        let mut state = State::at_value(&path("data{100}"));
        let paths = drive(
            &mut state,
            &[
                Event::begin_object(),
                Event::key("name"),
                Event::string("old"),
                Event::EndObject,
            ],
        );
        assert_eq!(
            paths,
            ["data{100}", "data{100}.name", "data{100}.name", "data{100}"]
        );
    }

    #[test]
    fn malformed_streams_are_rejected() {
        let mut state = State::new();
        state.process_event(&Event::begin_object()).unwrap();
        assert!(state.process_event(&Event::int(1)).is_err());

        let mut state = State::new();
        state.process_event(&Event::begin_array()).unwrap();
        assert!(state.process_event(&Event::key("k")).is_err());

        let mut state = State::new();
        state.process_event(&Event::begin_object()).unwrap();
        state.process_event(&Event::key("k")).unwrap();
        assert!(state.process_event(&Event::EndObject).is_err());

        let mut state = State::new();
        assert!(state.process_event(&Event::EndArray).is_err());

        let mut state = State::new();
        state.process_event(&Event::int(1)).unwrap();
        assert!(state.process_event(&Event::int(2)).is_err());
    }
}
