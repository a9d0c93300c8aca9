//! The event stream: typed parsing events over documents, the path-cursor
//! state machine, and the binary and textual codecs.
//!
//! Events are the unit everything else in the storage engine moves:
//! snapshots persist them, the durable log frames them, and the streaming
//! patch processor rewrites them in flight. `NodeToEvents`/`EventsToNode`
//! round-trip losslessly, including tags, key order, and comments.

mod binary;
mod convert;
mod event;
mod state;
mod wire;

pub use binary::{decode_events, encode_event, encode_events, BinaryEventDecoder};
pub use convert::{events_to_node, events_to_node_iter, node_to_events};
pub use event::{Event, EventSink};
pub use state::State;
pub use wire::{WireEventDecoder, WireEventEncoder};

use snafu::Snafu;

/// Errors surfaced by event codecs, conversion, and the path cursor.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum EventError {
    /// The event sequence violates framing invariants: unmatched container
    /// ends, values without keys, keys outside objects, trailing events.
    #[snafu(display("malformed event stream: {reason}"))]
    MalformedStream { reason: String },

    /// The stream ended while containers were still open.
    #[snafu(display("event stream ended at depth {depth}"))]
    UnexpectedEof { depth: usize },

    /// A byte- or text-level encoding problem, with the offset of the
    /// offending event.
    #[snafu(display("invalid event encoding at byte {position}: {reason}"))]
    InvalidEncoding { position: usize, reason: String },
}
