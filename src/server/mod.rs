//! The server tier: request handling shared by the TCP session surface
//! and the HTTP endpoint.

pub mod codec;
pub mod http;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use logd_store::{DiffRequest, Store, StoreError, TxIdPool, TxResult};

use crate::frame::{
    commit_frame, new_tx_frame, ok_frame, value_frame, Request, RequestError,
};

/// How long a request may wait on the transaction-id pool.
const POOL_DEADLINE: Duration = Duration::from_secs(5);

/// Everything a request handler needs: the store and the transaction
/// prefetch pool in front of its allocator.
#[derive(Clone)]
pub struct ServerContext {
    pub store: Store,
    pub pool: Arc<TxIdPool>,
}

impl ServerContext {
    pub fn new(store: Store) -> ServerContext {
        let pool = TxIdPool::new(store.clone(), 8);
        ServerContext { store, pool }
    }
}

fn store_error_frame_parts(error: &StoreError) -> RequestError {
    RequestError {
        kind: error.wire_kind(),
        message: error.to_string(),
    }
}

fn result_to_frame(txid: u64, result: &TxResult) -> Result<String, RequestError> {
    if result.committed {
        let commit = result.commit.ok_or_else(|| RequestError {
            kind: "Internal",
            message: "committed result without a commit number".to_string(),
        })?;
        Ok(commit_frame(txid, commit))
    } else {
        match &result.error {
            Some(error) => Err(store_error_frame_parts(error)),
            None => Err(RequestError {
                kind: "Aborted",
                message: format!("transaction {txid} aborted"),
            }),
        }
    }
}

/// Executes one request against the store and renders the response frame.
///
/// `Watch` is connection-oriented and handled by the TCP session loop;
/// here it is a usage error.
pub async fn handle_request(
    context: &ServerContext,
    request: Request,
) -> Result<String, RequestError> {
    let store = &context.store;
    match request {
        Request::Hello { .. } => Ok(ok_frame(true)),

        Request::NewTx { participants } => {
            let tx = context.pool.get(participants, POOL_DEADLINE).await?;
            Ok(new_tx_frame(tx.txid()))
        }

        Request::Watch { .. } => Err(RequestError::usage(
            "watch requires a session connection",
        )),

        Request::Match { path, match_cond } => match match_cond {
            Some(cond) => {
                let holds = store.matches(&path, &cond).await?;
                Ok(ok_frame(holds))
            }
            None => match store.read_path(&path).await? {
                Some(value) => Ok(value_frame(&value)),
                None => Err(RequestError::not_found(&path)),
            },
        },

        Request::Patch {
            path,
            match_cond,
            patch,
            tx,
            participants,
        } => {
            let handle = match tx {
                Some(txid) => store.join_tx(txid).await?,
                None => {
                    context
                        .pool
                        .get(participants.unwrap_or(1), POOL_DEADLINE)
                        .await?
                }
            };
            let txid = handle.txid();

            let is_last = handle
                .add_diff(DiffRequest {
                    path,
                    match_cond,
                    diff: patch,
                })
                .await?;

            let result = if is_last {
                handle.commit().await?
            } else {
                handle.wait_for_completion().await
            };
            result_to_frame(txid, &result)
        }
    }
}
