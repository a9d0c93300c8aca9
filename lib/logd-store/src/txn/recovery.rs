//! Startup recovery: reconciles pending diff files and transaction state
//! files against the durable log before the store serves anything.
//!
//! The log is the source of truth. A pending file whose transaction has a
//! log entry was part of a durable commit that crashed before promotion,
//! so it is promoted now; a pending file with no log entry belongs to a
//! transaction that never committed, so it is deleted. State files for
//! logged transactions are leftovers of a crashed finalization and are
//! removed; state files for unlogged transactions stay, since those
//! transactions can still be joined and committed.

use std::collections::HashMap;

use snafu::ResultExt;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{StorageSnafu, StoreError};
use crate::store::Store;
use crate::txn::pending;

pub(crate) async fn run(store: &Store) -> Result<(), StoreError> {
    let entries = store.inner.dlog.iterate(0, u64::MAX).await?;
    let logged: HashMap<u64, u64> = entries
        .iter()
        .map(|entry| (entry.txid, entry.commit))
        .collect();

    let mut promoted = 0usize;
    let mut deleted = 0usize;

    let pending_dir = store.inner.config.pending_dir();
    let committed_dir = store.inner.config.committed_dir();
    let mut dirs = fs::read_dir(&pending_dir).await.context(StorageSnafu {
        path: pending_dir.clone(),
    })?;
    while let Some(dir) = dirs.next_entry().await.context(StorageSnafu {
        path: pending_dir.clone(),
    })? {
        if !dir
            .file_type()
            .await
            .context(StorageSnafu { path: dir.path() })?
            .is_dir()
        {
            continue;
        }
        let mut files = fs::read_dir(dir.path()).await.context(StorageSnafu {
            path: dir.path(),
        })?;
        while let Some(file) = files.next_entry().await.context(StorageSnafu {
            path: dir.path(),
        })? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pending") {
                continue;
            }
            let raw = fs::read(&path).await.context(StorageSnafu {
                path: path.clone(),
            })?;
            let diff_file = match pending::DiffFile::from_bytes(&raw) {
                Ok(diff_file) => diff_file,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable pending file; deleting");
                    let _ = fs::remove_file(&path).await;
                    deleted += 1;
                    continue;
                }
            };

            match logged.get(&diff_file.txseq) {
                Some(&commit) => {
                    debug!(
                        txid = diff_file.txseq,
                        commit,
                        file = %path.display(),
                        "promoting pending file for logged transaction"
                    );
                    pending::promote_pending(
                        &pending_dir,
                        &committed_dir,
                        &diff_file.path,
                        diff_file.txseq,
                        commit,
                    )
                    .await?;
                    promoted += 1;
                }
                None => {
                    debug!(
                        txid = diff_file.txseq,
                        file = %path.display(),
                        "deleting orphan pending file"
                    );
                    fs::remove_file(&path).await.context(StorageSnafu {
                        path: path.clone(),
                    })?;
                    deleted += 1;
                }
            }
        }
    }

    // State files for transactions the log already has were finalized;
    // their deletion just did not land before the crash.
    let state_dir = store.inner.config.state_dir();
    let mut files = fs::read_dir(&state_dir).await.context(StorageSnafu {
        path: state_dir.clone(),
    })?;
    while let Some(file) = files.next_entry().await.context(StorageSnafu {
        path: state_dir.clone(),
    })? {
        let path = file.path();
        let txid = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("tx-"))
            .and_then(|raw| raw.parse::<u64>().ok());
        if let Some(txid) = txid {
            if logged.contains_key(&txid) {
                debug!(txid, "removing state file of committed transaction");
                let _ = fs::remove_file(&path).await;
            }
        }
    }

    if promoted > 0 || deleted > 0 {
        info!(promoted, deleted, "recovery reconciled pending files");
    }
    Ok(())
}
