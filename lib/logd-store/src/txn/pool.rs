//! The transaction-id pool: a bounded prefetch cache of ready
//! transactions, keyed by participant count.
//!
//! Front-end code that opens transactions in a hot path can take one from
//! the pool instead of round-tripping the allocator. One background task
//! refills every participant count the pool has seen; allocator failures
//! are logged and retried with capped exponential backoff, never surfaced
//! to `get` unless the deadline passes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::Store;
use crate::txn::Tx;

/// Initial retry delay after an allocator failure.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Retry delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Cache {
    ready: HashMap<u32, VecDeque<Tx>>,
}

/// A prefetching pool of open transactions.
pub struct TxIdPool {
    store: Store,
    capacity: usize,
    cache: Arc<Mutex<Cache>>,
    refill: Arc<Notify>,
}

impl TxIdPool {
    /// Creates the pool and spawns its refill task. `capacity` bounds the
    /// number of prefetched transactions per participant count.
    pub fn new(store: Store, capacity: usize) -> Arc<TxIdPool> {
        let pool = Arc::new(TxIdPool {
            store,
            capacity: capacity.max(1),
            cache: Arc::new(Mutex::new(Cache::default())),
            refill: Arc::new(Notify::new()),
        });
        tokio::spawn(refill_task(Arc::clone(&pool)));
        pool
    }

    /// Takes a ready transaction for `participants`, waiting up to
    /// `deadline` for the refill task when the cache is dry.
    pub async fn get(&self, participants: u32, deadline: Duration) -> Result<Tx, StoreError> {
        if let Some(tx) = self.pop(participants) {
            self.refill.notify_one();
            return Ok(tx);
        }

        // Make the count known to the refill task and wait for stock.
        self.cache
            .lock()
            .ready
            .entry(participants)
            .or_default();
        self.refill.notify_one();

        let waited = timeout(deadline, async {
            loop {
                if let Some(tx) = self.pop(participants) {
                    return tx;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        match waited {
            Ok(tx) => {
                self.refill.notify_one();
                Ok(tx)
            }
            Err(_) => Err(StoreError::InvalidRequest {
                reason: format!("timed out waiting for a transaction ({participants} participants)"),
            }),
        }
    }

    fn pop(&self, participants: u32) -> Option<Tx> {
        self.cache
            .lock()
            .ready
            .get_mut(&participants)
            .and_then(VecDeque::pop_front)
    }

    /// Participant counts currently below capacity.
    fn deficits(&self) -> Vec<u32> {
        let cache = self.cache.lock();
        cache
            .ready
            .iter()
            .filter(|(_, queue)| queue.len() < self.capacity)
            .map(|(&count, _)| count)
            .collect()
    }

    fn push(&self, participants: u32, tx: Tx) {
        self.cache
            .lock()
            .ready
            .entry(participants)
            .or_default()
            .push_back(tx);
    }
}

async fn refill_task(pool: Arc<TxIdPool>) {
    let mut backoff = BACKOFF_BASE;
    loop {
        let deficits = pool.deficits();
        if deficits.is_empty() {
            pool.refill.notified().await;
            continue;
        }

        let mut failed = false;
        for participants in deficits {
            match pool.store.new_tx(participants).await {
                Ok(tx) => {
                    debug!(participants, txid = tx.txid(), "prefetched transaction");
                    pool.push(participants, tx);
                }
                Err(e) => {
                    warn!(participants, error = %e, "transaction prefetch failed; backing off");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        } else {
            backoff = BACKOFF_BASE;
        }
    }
}
