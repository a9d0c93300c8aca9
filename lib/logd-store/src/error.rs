use std::io;
use std::path::PathBuf;

use logd_event::EventError;
use logd_path::{KindedPath, PathError};
use snafu::Snafu;

/// Errors surfaced by the storage engine.
///
/// Every failure mode of the engine maps onto exactly one of these; the
/// server tier translates variants into wire error kinds via
/// [`StoreError::wire_kind`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// A path expression failed to parse.
    #[snafu(display("bad path: {source}"))]
    BadPath { source: PathError },

    /// A request was structurally invalid (empty virtual path, missing
    /// diff, commit before all participants arrived).
    #[snafu(display("invalid request: {reason}"))]
    InvalidRequest { reason: String },

    /// A match predicate evaluated false at commit time.
    #[snafu(display("match failed at {path}"))]
    MatchFailed { path: KindedPath },

    /// The transaction transitioned to aborted.
    #[snafu(display("transaction {txid} aborted: {reason}"))]
    Aborted { txid: u64, reason: String },

    /// An operation addressed a transaction that is not pending.
    #[snafu(display("transaction {txid} is not pending"))]
    Conflict { txid: u64 },

    /// An event stream violated framing invariants.
    #[snafu(display("malformed event stream: {source}"))]
    Malformed { source: EventError },

    /// An I/O failure on a log, snapshot, or state file.
    #[snafu(display("storage error on {}: {source}", path.display()))]
    Storage { path: PathBuf, source: io::Error },

    /// A postcondition was violated; always a bug.
    #[snafu(display("internal error: {reason}"))]
    Internal { reason: String },
}

impl StoreError {
    /// The wire-protocol error kind tag for this error.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            StoreError::BadPath { .. } => "BadPath",
            StoreError::InvalidRequest { .. } => "UsageError",
            StoreError::MatchFailed { .. } => "MatchFailed",
            StoreError::Aborted { .. } => "Aborted",
            StoreError::Conflict { .. } => "Conflict",
            StoreError::Malformed { .. } => "MalformedStream",
            StoreError::Storage { .. } => "StorageError",
            StoreError::Internal { .. } => "Internal",
        }
    }
}

impl From<PathError> for StoreError {
    fn from(source: PathError) -> Self {
        StoreError::BadPath { source }
    }
}

impl From<EventError> for StoreError {
    fn from(source: EventError) -> Self {
        StoreError::Malformed { source }
    }
}
