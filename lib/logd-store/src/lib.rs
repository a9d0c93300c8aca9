//! The storage and transaction core of the document log server.
//!
//! Documents persist as an append-only log of patches ([`dlog`]); reads
//! compose the latest [`snapshot`] with the log tail through the streaming
//! patch [`processor`]; writes go through the multi-participant
//! transaction coordinator ([`txn`]). The [`Store`] facade ties the
//! pieces to one data directory.

pub mod config;
pub mod dlog;
mod error;
pub mod processor;
pub mod snapshot;
mod store;
pub mod txn;

pub use config::{StoreConfig, DEFAULT_SNAP_CHUNK_SIZE, SNAP_CHUNK_SIZE_ENV};
pub use dlog::Entry;
pub use error::StoreError;
pub use store::{CommitNotice, Store};
pub use txn::{DiffRequest, Tx, TxIdPool, TxResult};
