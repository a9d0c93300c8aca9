//! The document value model: a tagged tree of objects, sparse arrays,
//! arrays, and scalars, plus the merge and match operators the storage
//! engine applies to it.
//!
//! Sparse arrays are objects whose keys are all integers; comments attach
//! to the node that follows them; every node may carry a `!tag`. The
//! textual notation in [`text`] is the form values travel in on the wire.

mod matches;
mod merge;
mod node;
pub mod text;

pub use matches::{matches, ABSENT_TAG, OR_TAG};
pub use merge::{is_delete, merge, merge_opt, scrub, DELETE_TAG};
pub use node::{Key, Node, NodeKind, Object, SetError};
pub use text::{parse_frame, parse_node, render_frame, render_node, TextError};
