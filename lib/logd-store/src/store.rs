//! The store facade: owns the data directory, composes reads from the
//! latest snapshot plus the durable-log tail, and hosts the transaction
//! registry.

use std::collections::HashMap;
use std::sync::Arc;

use logd_event::{node_to_events, State};
use logd_path::KindedPath;
use logd_value::{matches as eval_match, Node};
use snafu::ResultExt;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument};

use crate::config::StoreConfig;
use crate::dlog::{DLog, Entry};
use crate::error::{StorageSnafu, StoreError};
use crate::processor::{apply_patches_at, build_patch_value_index, PatchProcessor, PatchSet};
use crate::snapshot::{snapshot_file_name, Snapshot, SnapshotBuilder};
use crate::txn::{recovery, TxShared};

/// Announcement of a committed transaction, for watchers.
#[derive(Debug, Clone)]
pub struct CommitNotice {
    pub commit: u64,
    pub txid: u64,
    pub paths: Vec<KindedPath>,
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) dlog: DLog,
    pub(crate) snapshot: RwLock<Option<Snapshot>>,
    /// Serializes match evaluation + commit allocation + append, so every
    /// commit's predicates are judged against one consistent view.
    pub(crate) commit_lock: tokio::sync::Mutex<()>,
    pub(crate) tx_shared: parking_lot::Mutex<HashMap<u64, Arc<TxShared>>>,
    pub(crate) tx_locks: parking_lot::Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) commits: broadcast::Sender<CommitNotice>,
    /// Held for the lifetime of the store; prevents a second process from
    /// opening the same data directory.
    _dir_lock: fslock::LockFile,
}

/// A handle to an open store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (or initializes) the store at the configured data directory,
    /// running crash recovery before anything is served.
    pub async fn open(config: StoreConfig) -> Result<Store, StoreError> {
        for dir in [
            config.data_dir().to_path_buf(),
            config.snap_dir(),
            config.state_dir(),
            config.pending_dir(),
            config.committed_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .context(StorageSnafu { path: dir.clone() })?;
        }

        let lock_path = config.lock_path();
        let mut dir_lock =
            fslock::LockFile::open(&lock_path).map_err(|e| StoreError::Storage {
                path: lock_path.clone(),
                source: e,
            })?;
        let locked = dir_lock.try_lock().map_err(|e| StoreError::Storage {
            path: lock_path.clone(),
            source: e,
        })?;
        if !locked {
            return Err(StoreError::Internal {
                reason: format!(
                    "failed to lock {}; is another logd process using this data directory?",
                    lock_path.display()
                ),
            });
        }

        let dlog = DLog::open(&config).await?;
        let snapshot = latest_snapshot(&config).await?;
        if let Some(snapshot) = &snapshot {
            debug!(lo = snapshot.lo, hi = snapshot.hi, "loaded snapshot");
        }

        let (commits, _) = broadcast::channel(64);
        let store = Store {
            inner: Arc::new(StoreInner {
                dlog,
                snapshot: RwLock::new(snapshot),
                commit_lock: tokio::sync::Mutex::new(()),
                tx_shared: parking_lot::Mutex::new(HashMap::new()),
                tx_locks: parking_lot::Mutex::new(HashMap::new()),
                commits,
                _dir_lock: dir_lock,
                config,
            }),
        };

        recovery::run(&store).await?;

        info!(
            data_dir = %store.inner.config.data_dir().display(),
            last_commit = store.inner.dlog.last_commit(),
            "store open"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The most recently committed commit number; zero before the first.
    pub fn last_commit(&self) -> u64 {
        self.inner.dlog.last_commit()
    }

    /// Subscribes to committed-transaction announcements.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitNotice> {
        self.inner.commits.subscribe()
    }

    /// Reads the current committed value at `path`: the latest snapshot
    /// with the durable-log tail merged on top. `None` when the path does
    /// not resolve.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_path(&self, path: &KindedPath) -> Result<Option<Node>, StoreError> {
        let snapshot = self.inner.snapshot.read().await;
        let snap_hi = snapshot.as_ref().map_or(0, |snap| snap.hi);
        let tail = self.inner.dlog.tail(snap_hi).await?;
        compose_read(snapshot.as_ref(), &tail, path)
    }

    /// Evaluates a match predicate against the current committed view.
    pub async fn matches(&self, path: &KindedPath, cond: &Node) -> Result<bool, StoreError> {
        let view = self.read_path(path).await?;
        Ok(eval_match(view.as_ref(), cond))
    }

    /// Composes the current view into a new snapshot file and makes it the
    /// read base. Returns the covered commit range, or `None` when there
    /// is nothing new to fold in.
    #[instrument(skip(self), level = "debug")]
    pub async fn write_snapshot(&self) -> Result<Option<(u64, u64)>, StoreError> {
        // Hold the commit lock so the cut is a commit boundary.
        let _commit_guard = self.inner.commit_lock.lock().await;

        let mut snapshot_slot = self.inner.snapshot.write().await;
        let snap_hi = snapshot_slot.as_ref().map_or(0, |snap| snap.hi);
        let hi = self.inner.dlog.last_commit();
        if hi == snap_hi {
            debug!("no commits beyond the current snapshot");
            return Ok(None);
        }

        let tail = self.inner.dlog.tail(snap_hi).await?;
        let root = compose_read(snapshot_slot.as_ref(), &tail, &KindedPath::root())?
            .unwrap_or_else(Node::empty_object);

        let lo = snapshot_slot.as_ref().map_or(0, |snap| snap.hi + 1);
        let mut builder = SnapshotBuilder::new(self.inner.config.snap_chunk_size);
        for event in node_to_events(&root) {
            builder.push(&event)?;
        }
        let path = self.inner.config.snap_dir().join(snapshot_file_name(lo, hi));
        builder.write_atomically(&path).await?;

        let old = snapshot_slot.replace(Snapshot::open(&path)?);
        drop(snapshot_slot);

        if let Some(old) = old {
            // Superseded snapshots are unlinked; open readers on other
            // handles finish against their mapped copy.
            let _ = fs::remove_file(old.file_path()).await;
        }

        info!(lo, hi, snapshot = %path.display(), "published snapshot");
        Ok(Some((lo, hi)))
    }

    /// Drops log segments entirely covered by commits `<= up_to`.
    /// Intended for maintenance after a snapshot has been published for
    /// the same range; reads racing the removal of segments they still
    /// need surface a `StorageError` and should retry.
    pub async fn truncate_log(&self, up_to: u64) -> Result<(), StoreError> {
        self.inner.dlog.truncate(up_to).await
    }
}

/// Snapshot-only read, with the empty-store base rule: an absent snapshot
/// reads as the empty document at the root.
fn base_read(snapshot: Option<&Snapshot>, path: &KindedPath) -> Result<Option<Node>, StoreError> {
    match snapshot {
        Some(snapshot) => snapshot.read_path(path),
        None if path.is_root() => Ok(Some(Node::empty_object())),
        None => Ok(None),
    }
}

/// The composed read: seek the snapshot, stream the subtree through the
/// patch processor fed by the log tail.
pub(crate) fn compose_read(
    snapshot: Option<&Snapshot>,
    tail: &[Entry],
    path: &KindedPath,
) -> Result<Option<Node>, StoreError> {
    let patches: Vec<Node> = tail.iter().map(|entry| entry.patch.clone()).collect();
    let set = build_patch_value_index(&patches);
    compose_read_with(snapshot, &set, path)
}

pub(crate) fn compose_read_with(
    snapshot: Option<&Snapshot>,
    set: &PatchSet,
    path: &KindedPath,
) -> Result<Option<Node>, StoreError> {
    // A patch at or above the target: materialize the patched ancestor,
    // then navigate the remainder.
    if let Some((ancestor, _)) = set.ancestor_of(path) {
        let ancestor = ancestor.clone();
        let base = base_read(snapshot, &ancestor)?;
        let composed = apply_patches_at(base, &ancestor, set)?;
        let rest = ancestor
            .strip_prefix(path)
            .expect("ancestor_of returned a non-ancestor");
        return Ok(composed.and_then(|node| node.get_path(&rest).cloned()));
    }

    // Patches strictly below the target: stream the base subtree through
    // the processor, which rewrites and injects as it goes.
    if set.has_entries_under(path) {
        let base_events = match snapshot {
            Some(snapshot) => snapshot.read_path_events(path)?,
            None if path.is_root() => Some(node_to_events(&Node::empty_object())),
            None => None,
        };
        return match base_events {
            Some(events) => {
                let state = State::at_value(path);
                let processor = PatchProcessor::with_state(state, set, Vec::new());
                let output = processor.process_all(events)?;
                Ok(Some(logd_event::events_to_node(&output)?))
            }
            // No base at the path: the patches alone decide what exists.
            None => apply_patches_at(None, path, set),
        };
    }

    base_read(snapshot, path)
}

/// Finds and opens the snapshot with the highest covered commit.
async fn latest_snapshot(config: &StoreConfig) -> Result<Option<Snapshot>, StoreError> {
    let dir = config.snap_dir();
    let mut read_dir = fs::read_dir(&dir)
        .await
        .context(StorageSnafu { path: dir.clone() })?;
    let mut best: Option<(u64, std::path::PathBuf)> = None;
    while let Some(dirent) = read_dir
        .next_entry()
        .await
        .context(StorageSnafu { path: dir.clone() })?
    {
        let path = dirent.path();
        if let Some((_, hi)) = crate::snapshot::parse_snapshot_name(&path) {
            if best.as_ref().is_none_or(|(best_hi, _)| hi > *best_hi) {
                best = Some((hi, path));
            }
        }
    }
    match best {
        Some((_, path)) => Ok(Some(Snapshot::open(&path)?)),
        None => Ok(None),
    }
}
