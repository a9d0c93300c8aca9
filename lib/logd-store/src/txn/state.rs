//! Persistent transaction state and the exclusive read-modify-write
//! primitive over it.
//!
//! One file per active transaction, `state/tx-{txid}`, holding the binary
//! event form of the state node. Concurrent updates on the same txid are
//! serialized two ways: an in-process per-txid mutex, and a cross-process
//! `fslock` file, taken in that order.

use std::path::{Path, PathBuf};

use logd_event::{decode_events, encode_events, events_to_node, node_to_events};
use logd_path::KindedPath;
use logd_value::{Key, Node};
use snafu::ResultExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{StorageSnafu, StoreError};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Committed,
    Aborted,
}

impl TxStatus {
    fn as_str(self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Committed => "committed",
            TxStatus::Aborted => "aborted",
        }
    }

    fn parse(raw: &str) -> Option<TxStatus> {
        match raw {
            "pending" => Some(TxStatus::Pending),
            "committed" => Some(TxStatus::Committed),
            "aborted" => Some(TxStatus::Aborted),
            _ => None,
        }
    }
}

/// One participant's extracted diff.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub path: KindedPath,
    pub diff: Node,
    pub timestamp_ms: i64,
}

/// One participant's match predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEntry {
    pub path: KindedPath,
    pub cond: Node,
}

/// The persistent record of one transaction.
///
/// Both the extracted `(path, diff)` pairs and the full per-participant
/// request nodes are stored; match predicates are extracted separately so
/// commit-time evaluation does not re-walk requests.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionState {
    pub txid: u64,
    pub participant_count: u32,
    pub participants_received: u32,
    pub status: TxStatus,
    pub diffs: Vec<DiffEntry>,
    pub participant_requests: Vec<Node>,
    pub matches: Vec<MatchEntry>,
}

impl TransactionState {
    pub fn new(txid: u64, participant_count: u32) -> Self {
        TransactionState {
            txid,
            participant_count,
            participants_received: 0,
            status: TxStatus::Pending,
            diffs: Vec::new(),
            participant_requests: Vec::new(),
            matches: Vec::new(),
        }
    }

    fn to_node(&self) -> Node {
        Node::object(vec![
            (Key::from("tx"), Node::int(self.txid as i64)),
            (
                Key::from("participants"),
                Node::int(i64::from(self.participant_count)),
            ),
            (
                Key::from("received"),
                Node::int(i64::from(self.participants_received)),
            ),
            (Key::from("status"), Node::string(self.status.as_str())),
            (
                Key::from("diffs"),
                Node::array(
                    self.diffs
                        .iter()
                        .map(|entry| {
                            Node::object(vec![
                                (Key::from("path"), Node::string(entry.path.to_string())),
                                (Key::from("ts"), Node::int(entry.timestamp_ms)),
                                (Key::from("diff"), entry.diff.clone()),
                            ])
                        })
                        .collect(),
                ),
            ),
            (
                Key::from("requests"),
                Node::array(self.participant_requests.clone()),
            ),
            (
                Key::from("matches"),
                Node::array(
                    self.matches
                        .iter()
                        .map(|entry| {
                            Node::object(vec![
                                (Key::from("path"), Node::string(entry.path.to_string())),
                                (Key::from("cond"), entry.cond.clone()),
                            ])
                        })
                        .collect(),
                ),
            ),
        ])
    }

    fn from_node(node: &Node) -> Result<TransactionState, StoreError> {
        let object = node.as_object().ok_or_else(|| StoreError::Internal {
            reason: "transaction state is not an object".to_string(),
        })?;
        let int_field = |name: &str| -> Result<i64, StoreError> {
            object
                .get_field(name)
                .and_then(Node::as_int)
                .ok_or_else(|| StoreError::Internal {
                    reason: format!("transaction state missing field {name:?}"),
                })
        };
        let array_field = |name: &str| -> Result<&[Node], StoreError> {
            object
                .get_field(name)
                .and_then(Node::as_array)
                .ok_or_else(|| StoreError::Internal {
                    reason: format!("transaction state missing field {name:?}"),
                })
        };
        let path_field = |entry: &Node| -> Result<KindedPath, StoreError> {
            let text = entry
                .as_object()
                .and_then(|o| o.get_field("path"))
                .and_then(Node::as_str)
                .ok_or_else(|| StoreError::Internal {
                    reason: "transaction state entry missing path".to_string(),
                })?;
            KindedPath::parse(text).map_err(StoreError::from)
        };

        let status_raw = object
            .get_field("status")
            .and_then(Node::as_str)
            .ok_or_else(|| StoreError::Internal {
                reason: "transaction state missing status".to_string(),
            })?;
        let status = TxStatus::parse(status_raw).ok_or_else(|| StoreError::Internal {
            reason: format!("unknown transaction status {status_raw:?}"),
        })?;

        let diffs = array_field("diffs")?
            .iter()
            .map(|entry| {
                Ok(DiffEntry {
                    path: path_field(entry)?,
                    timestamp_ms: entry
                        .as_object()
                        .and_then(|o| o.get_field("ts"))
                        .and_then(Node::as_int)
                        .unwrap_or_default(),
                    diff: entry
                        .as_object()
                        .and_then(|o| o.get_field("diff"))
                        .cloned()
                        .ok_or_else(|| StoreError::Internal {
                            reason: "transaction state diff entry missing diff".to_string(),
                        })?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let matches = array_field("matches")?
            .iter()
            .map(|entry| {
                Ok(MatchEntry {
                    path: path_field(entry)?,
                    cond: entry
                        .as_object()
                        .and_then(|o| o.get_field("cond"))
                        .cloned()
                        .ok_or_else(|| StoreError::Internal {
                            reason: "transaction state match entry missing cond".to_string(),
                        })?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(TransactionState {
            txid: int_field("tx")? as u64,
            participant_count: int_field("participants")? as u32,
            participants_received: int_field("received")? as u32,
            status,
            diffs,
            participant_requests: array_field("requests")?.to_vec(),
            matches,
        })
    }
}

pub(crate) fn state_file_path(state_dir: &Path, txid: u64) -> PathBuf {
    state_dir.join(format!("tx-{txid}"))
}

pub(crate) async fn read_state(
    state_dir: &Path,
    txid: u64,
) -> Result<Option<TransactionState>, StoreError> {
    let path = state_file_path(state_dir, txid);
    let raw = match fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(StorageSnafu { path }),
    };
    let node = events_to_node(&decode_events(&raw)?)?;
    TransactionState::from_node(&node).map(Some)
}

pub(crate) async fn write_state(
    state_dir: &Path,
    state: &TransactionState,
) -> Result<(), StoreError> {
    let path = state_file_path(state_dir, state.txid);
    let raw = encode_events(&node_to_events(&state.to_node()));

    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)
        .await
        .context(StorageSnafu { path: tmp.clone() })?;
    file.write_all(&raw)
        .await
        .context(StorageSnafu { path: tmp.clone() })?;
    file.sync_all()
        .await
        .context(StorageSnafu { path: tmp.clone() })?;
    fs::rename(&tmp, &path)
        .await
        .context(StorageSnafu { path })?;
    Ok(())
}

pub(crate) async fn delete_state(state_dir: &Path, txid: u64) -> Result<(), StoreError> {
    let path = state_file_path(state_dir, txid);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(StorageSnafu { path }),
    }
}

/// Takes the cross-process lock for `txid`'s state file, runs `f` on the
/// loaded state, and persists the result.
///
/// The lock acquisition is blocking, so it runs on the blocking pool. The
/// in-process per-txid mutex must already be held by the caller.
pub(crate) async fn locked_update<R>(
    state_dir: &Path,
    txid: u64,
    f: impl FnOnce(&mut TransactionState) -> Result<R, StoreError>,
) -> Result<R, StoreError> {
    let lock_path = state_file_path(state_dir, txid).with_extension("lock");
    let mut lock = acquire_file_lock(&lock_path).await?;

    let result = async {
        let mut state = read_state(state_dir, txid)
            .await?
            .ok_or(StoreError::Conflict { txid })?;
        let value = f(&mut state)?;
        write_state(state_dir, &state).await?;
        Ok(value)
    }
    .await;

    let _ = tokio::task::spawn_blocking(move || lock.unlock()).await;
    result
}

pub(crate) async fn acquire_file_lock(path: &Path) -> Result<fslock::LockFile, StoreError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut lock = fslock::LockFile::open(&path).map_err(|e| StoreError::Storage {
            path: path.clone(),
            source: e.into(),
        })?;
        lock.lock().map_err(|e| StoreError::Storage {
            path: path.clone(),
            source: e.into(),
        })?;
        Ok(lock)
    })
    .await
    .map_err(|e| StoreError::Internal {
        reason: format!("lock task panicked: {e}"),
    })?
}
