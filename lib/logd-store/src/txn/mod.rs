//! The transaction coordinator: multi-participant atomic commit with
//! match-condition evaluation and ordered commit identifiers.
//!
//! Participants share a transaction by txid. Each contributes one diff
//! (and optionally a match predicate); the last participant commits. The
//! commit evaluates every predicate against one consistent committed view,
//! allocates the commit number, persists pending diff files, promotes
//! them, and appends a single durable-log entry grouping all diffs. Any
//! failure drives the abort path, which removes every trace of the
//! transaction.

pub(crate) mod pending;
pub(crate) mod pool;
pub(crate) mod recovery;
mod state;

pub use pool::TxIdPool;
pub use state::{DiffEntry, MatchEntry, TransactionState, TxStatus};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use logd_path::KindedPath;
use logd_value::{matches as eval_match, merge, Node};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::error::StoreError;
use crate::processor::{mark_patch_root, PATCH_ROOT_TAG};
use crate::store::{CommitNotice, Store};
use crate::dlog::Entry;
use pending::DiffFile;

/// One participant's contribution to a transaction.
#[derive(Debug, Clone)]
pub struct DiffRequest {
    pub path: KindedPath,
    pub match_cond: Option<Node>,
    pub diff: Node,
}

/// The final outcome of a transaction, shared by every participant.
#[derive(Debug, Clone)]
pub struct TxResult {
    pub committed: bool,
    pub commit: Option<u64>,
    pub error: Option<Arc<StoreError>>,
}

/// Per-transaction shared state: the completion channel all handles wait
/// on. The sender side is closed exactly once, at finalization.
pub(crate) struct TxShared {
    pub(crate) txid: u64,
    pub(crate) result: watch::Sender<Option<TxResult>>,
}

/// A handle to one transaction. Handles referring to the same txid share
/// completion state; one `AddDiff` per participant is the caller's
/// responsibility.
#[derive(Clone)]
pub struct Tx {
    store: Store,
    shared: Arc<TxShared>,
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx").field("txid", &self.shared.txid).finish()
    }
}

impl Store {
    /// Starts a new transaction expecting `participant_count` diffs.
    pub async fn new_tx(&self, participant_count: u32) -> Result<Tx, StoreError> {
        if participant_count < 1 {
            return Err(StoreError::InvalidRequest {
                reason: "participant count must be at least 1".to_string(),
            });
        }
        let txid = self.inner.dlog.allocate_txseq().await?;
        state::write_state(
            &self.inner.config.state_dir(),
            &TransactionState::new(txid, participant_count),
        )
        .await?;

        debug!(txid, participant_count, "new transaction");
        Ok(Tx {
            store: self.clone(),
            shared: self.tx_shared(txid),
        })
    }

    /// Joins an existing pending transaction.
    pub async fn join_tx(&self, txid: u64) -> Result<Tx, StoreError> {
        let state = state::read_state(&self.inner.config.state_dir(), txid)
            .await?
            .ok_or(StoreError::Conflict { txid })?;
        if state.status != TxStatus::Pending {
            return Err(StoreError::Conflict { txid });
        }
        Ok(Tx {
            store: self.clone(),
            shared: self.tx_shared(txid),
        })
    }

    fn tx_shared(&self, txid: u64) -> Arc<TxShared> {
        let mut registry = self.inner.tx_shared.lock();
        registry
            .entry(txid)
            .or_insert_with(|| {
                let (result, _) = watch::channel(None);
                Arc::new(TxShared { txid, result })
            })
            .clone()
    }

    fn tx_lock(&self, txid: u64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.tx_locks.lock();
        locks.entry(txid).or_default().clone()
    }

    fn forget_tx(&self, txid: u64) {
        self.inner.tx_shared.lock().remove(&txid);
        self.inner.tx_locks.lock().remove(&txid);
    }
}

impl Tx {
    pub fn txid(&self) -> u64 {
        self.shared.txid
    }

    /// Submits one participant's diff. Returns whether this was the last
    /// expected participant.
    ///
    /// Concurrency-safe: updates to the shared state are serialized per
    /// txid, in-process and across processes.
    #[instrument(skip_all, fields(txid = self.shared.txid, path = %request.path), level = "debug")]
    pub async fn add_diff(&self, request: DiffRequest) -> Result<bool, StoreError> {
        if request.path.is_root() {
            return Err(StoreError::InvalidRequest {
                reason: "a diff requires a non-empty virtual path".to_string(),
            });
        }

        let txid = self.shared.txid;
        let timestamp_ms = now_ms();
        let request_node = request_to_node(&request);

        let lock = self.store.tx_lock(txid);
        let _guard = lock.lock().await;

        state::locked_update(&self.store.inner.config.state_dir(), txid, move |state| {
            if state.status != TxStatus::Pending {
                return Err(StoreError::Conflict { txid });
            }
            state.participants_received += 1;
            state.diffs.push(DiffEntry {
                path: request.path.clone(),
                diff: request.diff.clone(),
                timestamp_ms,
            });
            state.participant_requests.push(request_node);
            if let Some(cond) = request.match_cond {
                state.matches.push(MatchEntry {
                    path: request.path,
                    cond,
                });
            }
            Ok(state.participants_received >= state.participant_count)
        })
        .await
    }

    /// Commits the transaction. Idempotent: a second call returns the
    /// stored result. Intended to be invoked by the last participant.
    #[instrument(skip_all, fields(txid = self.shared.txid), level = "debug")]
    pub async fn commit(&self) -> Result<TxResult, StoreError> {
        let txid = self.shared.txid;
        let lock = self.store.tx_lock(txid);
        let _guard = lock.lock().await;

        if let Some(result) = self.shared.result.borrow().clone() {
            return Ok(result);
        }

        let state_dir = self.store.inner.config.state_dir();
        let state = state::read_state(&state_dir, txid)
            .await?
            .ok_or(StoreError::Conflict { txid })?;
        if state.status != TxStatus::Pending {
            return Err(StoreError::Conflict { txid });
        }
        if state.participants_received < state.participant_count {
            return Err(StoreError::InvalidRequest {
                reason: format!(
                    "commit with {}/{} participants present",
                    state.participants_received, state.participant_count
                ),
            });
        }

        // Everything from match evaluation to the log append happens under
        // the store-wide commit lock: predicates are judged against the
        // view the commit number is allocated for.
        let commit_guard = self.store.inner.commit_lock.lock().await;

        for entry in &state.matches {
            let holds = match self.store.read_path(&entry.path).await {
                Ok(view) => eval_match(view.as_ref(), &entry.cond),
                Err(e) => {
                    drop(commit_guard);
                    return self.abort(&state, e).await;
                }
            };
            if !holds {
                debug!(txid, path = %entry.path, "match predicate failed");
                drop(commit_guard);
                return self
                    .abort(
                        &state,
                        StoreError::MatchFailed {
                            path: entry.path.clone(),
                        },
                    )
                    .await;
            }
        }

        let commit = match self.store.inner.dlog.allocate_commit().await {
            Ok(commit) => commit,
            Err(e) => {
                drop(commit_guard);
                return self.abort(&state, e).await;
            }
        };

        // Write, then promote, every pending diff file.
        let pending_dir = self.store.inner.config.pending_dir();
        let committed_dir = self.store.inner.config.committed_dir();
        let mut promoted = Vec::new();
        for diff in &state.diffs {
            let write = pending::write_pending(
                &pending_dir,
                &DiffFile {
                    path: diff.path.clone(),
                    txseq: txid,
                    timestamp_ms: diff.timestamp_ms,
                    diff: diff.diff.clone(),
                },
            )
            .await;
            if let Err(e) = write {
                drop(commit_guard);
                return self.abort_with_promoted(&state, promoted, e).await;
            }
        }
        for diff in &state.diffs {
            match pending::promote_pending(&pending_dir, &committed_dir, &diff.path, txid, commit)
                .await
            {
                Ok(path) => promoted.push(path),
                Err(e) => {
                    drop(commit_guard);
                    return self.abort_with_promoted(&state, promoted, e).await;
                }
            }
        }

        let entry = Entry {
            commit,
            txid,
            timestamp_ms: now_ms(),
            patch: build_patch_node(&state.diffs),
            paths: state.diffs.iter().map(|diff| diff.path.clone()).collect(),
        };
        if let Err(e) = self.store.inner.dlog.append(&entry).await {
            drop(commit_guard);
            return self.abort_with_promoted(&state, promoted, e).await;
        }
        drop(commit_guard);

        // The transaction is durable; everything past this point is
        // cleanup that recovery would redo anyway.
        state::delete_state(&state_dir, txid).await?;

        let result = TxResult {
            committed: true,
            commit: Some(commit),
            error: None,
        };
        self.shared.result.send_replace(Some(result.clone()));
        self.store.forget_tx(txid);

        let _ = self.store.inner.commits.send(CommitNotice {
            commit,
            txid,
            paths: entry.paths.clone(),
        });

        debug!(txid, commit, "transaction committed");
        Ok(result)
    }

    /// Blocks until the transaction finalizes, returning the shared
    /// result. Safe to call from any number of tasks.
    pub async fn wait_for_completion(&self) -> TxResult {
        let mut rx = self.shared.result.subscribe();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a result; treat as aborted.
                return TxResult {
                    committed: false,
                    commit: None,
                    error: Some(Arc::new(StoreError::Aborted {
                        txid: self.shared.txid,
                        reason: "coordinator dropped".to_string(),
                    })),
                };
            }
        }
    }

    async fn abort(&self, state: &TransactionState, err: StoreError) -> Result<TxResult, StoreError> {
        self.abort_with_promoted(state, Vec::new(), err).await
    }

    /// The abort path: deletes every pending file produced so far (and any
    /// already promoted file), removes the state file, and records the
    /// result.
    async fn abort_with_promoted(
        &self,
        state: &TransactionState,
        promoted: Vec<std::path::PathBuf>,
        err: StoreError,
    ) -> Result<TxResult, StoreError> {
        let txid = self.shared.txid;
        warn!(txid, error = %err, "aborting transaction");

        let pending_dir = self.store.inner.config.pending_dir();
        for diff in &state.diffs {
            if let Err(e) = pending::delete_pending(&pending_dir, &diff.path, txid).await {
                warn!(txid, path = %diff.path, error = %e, "failed to delete pending file");
            }
        }
        for path in promoted {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(txid, file = %path.display(), error = %e, "failed to delete promoted file");
            }
        }
        state::delete_state(&self.store.inner.config.state_dir(), txid).await?;

        let result = TxResult {
            committed: false,
            commit: None,
            error: Some(Arc::new(err)),
        };
        self.shared.result.send_replace(Some(result.clone()));
        self.store.forget_tx(txid);
        Ok(result)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

fn request_to_node(request: &DiffRequest) -> Node {
    let mut entries = vec![(
        logd_value::Key::from("path"),
        Node::string(request.path.to_string()),
    )];
    if let Some(cond) = &request.match_cond {
        entries.push((logd_value::Key::from("match"), cond.clone()));
    }
    entries.push((logd_value::Key::from("patch"), request.diff.clone()));
    Node::object(entries)
}

/// Builds the combined patch node for a log entry: every diff placed at
/// its virtual path, each wrapped as a patch root, in arrival order.
/// Same-path diffs merge in order; a diff at an ancestor of an existing
/// marked path replaces that subtree, which is what dominated-path
/// filtering would do anyway.
pub(crate) fn build_patch_node(diffs: &[DiffEntry]) -> Node {
    let mut combined = Node::null();
    for entry in diffs {
        let marked = mark_patch_root(entry.diff.clone());

        // Nesting a path under an already marked ancestor would corrupt
        // the ancestor's wrapper; merge into its diff instead.
        if let Some(ancestor) = find_marked_ancestor(&combined, &entry.path) {
            let rest = ancestor
                .strip_prefix(&entry.path)
                .expect("marked ancestor is a prefix");
            if let Some(wrapper) = combined.get_path(&ancestor) {
                let mut inner = crate::processor::unmark_patch_root(wrapper);
                let merged_child = match inner.get_path(&rest) {
                    Some(existing) => merge(existing, &entry.diff).unwrap_or_else(Node::null),
                    None => entry.diff.clone(),
                };
                if inner.set_path(&rest, merged_child).is_ok() {
                    let _ = combined.set_path(&ancestor, mark_patch_root(inner));
                    continue;
                }
            }
            warn!(path = %entry.path, "diff shadowed by an earlier ancestor diff");
            continue;
        }

        let value = match combined.get_path(&entry.path) {
            Some(existing) if existing.has_tag(PATCH_ROOT_TAG) => {
                // Same path twice in one transaction: merge the wrappers,
                // which merges the diffs under their null keys.
                merge(existing, &marked).unwrap_or(marked)
            }
            _ => marked,
        };
        if let Err(e) = combined.set_path(&entry.path, value) {
            warn!(path = %entry.path, error = %e, "diff does not fit the combined patch");
        }
    }
    combined
}

fn find_marked_ancestor(combined: &Node, path: &KindedPath) -> Option<KindedPath> {
    let mut prefix = KindedPath::root();
    for segment in path.segments().iter().take(path.len().saturating_sub(1)) {
        prefix.push(segment.clone());
        if combined
            .get_path(&prefix)
            .is_some_and(|node| node.has_tag(PATCH_ROOT_TAG))
        {
            return Some(prefix);
        }
    }
    None
}
