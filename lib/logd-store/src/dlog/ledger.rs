//! The ledger: the durable commit and transaction-sequence counters.
//!
//! The `meta` file is 16 bytes, `[u64 BE next_commit][u64 BE next_txseq]`,
//! rewritten through a temp file and rename so a crash never leaves a torn
//! counter. Counters are flushed before an allocation returns, which is
//! what makes a commit number that was allocated but never appended an
//! effectively skipped commit after a crash.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::ResultExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{StorageSnafu, StoreError};

pub(crate) struct Ledger {
    meta_path: PathBuf,
    next_commit: AtomicU64,
    next_txseq: AtomicU64,
    /// Serializes allocate-and-flush sequences.
    alloc_lock: tokio::sync::Mutex<()>,
}

impl Ledger {
    /// Loads the counters from the meta file, creating it when absent.
    pub(crate) async fn load_or_create(meta_path: PathBuf) -> Result<Self, StoreError> {
        let (next_commit, next_txseq) = match fs::read(&meta_path).await {
            Ok(raw) if raw.len() == 16 => (
                u64::from_be_bytes(raw[0..8].try_into().expect("8 bytes")),
                u64::from_be_bytes(raw[8..16].try_into().expect("8 bytes")),
            ),
            Ok(raw) => {
                return Err(StoreError::Internal {
                    reason: format!(
                        "ledger meta file {} has {} bytes, expected 16",
                        meta_path.display(),
                        raw.len()
                    ),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (1, 1),
            Err(e) => {
                return Err(e).context(StorageSnafu {
                    path: meta_path.clone(),
                });
            }
        };

        debug!(
            next_commit,
            next_txseq,
            "loaded ledger from {}",
            meta_path.display()
        );

        let ledger = Ledger {
            meta_path,
            next_commit: AtomicU64::new(next_commit),
            next_txseq: AtomicU64::new(next_txseq),
            alloc_lock: tokio::sync::Mutex::new(()),
        };
        ledger.flush().await?;
        Ok(ledger)
    }

    /// The commit number the next allocation will return.
    pub(crate) fn peek_next_commit(&self) -> u64 {
        self.next_commit.load(Ordering::Acquire)
    }

    /// The most recently allocated commit, zero when none has been.
    pub(crate) fn last_commit(&self) -> u64 {
        self.peek_next_commit() - 1
    }

    /// Allocates the next commit number. The counter is durable before
    /// this returns.
    pub(crate) async fn allocate_commit(&self) -> Result<u64, StoreError> {
        let _guard = self.alloc_lock.lock().await;
        let commit = self.next_commit.fetch_add(1, Ordering::AcqRel);
        self.flush().await?;
        Ok(commit)
    }

    /// Allocates the next transaction sequence number, durably.
    pub(crate) async fn allocate_txseq(&self) -> Result<u64, StoreError> {
        let _guard = self.alloc_lock.lock().await;
        let txseq = self.next_txseq.fetch_add(1, Ordering::AcqRel);
        self.flush().await?;
        Ok(txseq)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&self.next_commit.load(Ordering::Acquire).to_be_bytes());
        raw[8..16].copy_from_slice(&self.next_txseq.load(Ordering::Acquire).to_be_bytes());

        let tmp_path = self.meta_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).await.context(StorageSnafu {
            path: tmp_path.clone(),
        })?;
        file.write_all(&raw).await.context(StorageSnafu {
            path: tmp_path.clone(),
        })?;
        file.sync_all().await.context(StorageSnafu {
            path: tmp_path.clone(),
        })?;
        fs::rename(&tmp_path, &self.meta_path)
            .await
            .context(StorageSnafu {
                path: self.meta_path.clone(),
            })?;
        Ok(())
    }
}
