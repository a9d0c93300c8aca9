//! End-to-end transaction scenarios against a real data directory.

use std::sync::Arc;

use logd_path::KindedPath;
use logd_store::{DiffRequest, Store, StoreConfig, StoreError};
use logd_value::{parse_node, Node};
use temp_dir::TempDir;

fn p(s: &str) -> KindedPath {
    KindedPath::parse(s).unwrap()
}

fn diff(path: &str, patch_text: &str) -> DiffRequest {
    DiffRequest {
        path: p(path),
        match_cond: None,
        diff: parse_node(patch_text).unwrap(),
    }
}

fn diff_with_match(path: &str, match_text: &str, patch_text: &str) -> DiffRequest {
    DiffRequest {
        path: p(path),
        match_cond: Some(parse_node(match_text).unwrap()),
        diff: parse_node(patch_text).unwrap(),
    }
}

async fn open_store(dir: &TempDir) -> Store {
    Store::open(StoreConfig::from_path(dir.path()).build())
        .await
        .unwrap()
}

#[tokio::test]
async fn single_participant_commit() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let tx = store.new_tx(1).await.unwrap();
    let is_last = tx
        .add_diff(diff("users.alice", r#"{ name: "Alice" }"#))
        .await
        .unwrap();
    assert!(is_last);

    let result = tx.commit().await.unwrap();
    assert!(result.committed);
    let commit = result.commit.unwrap();

    let value = store.read_path(&p("users.alice")).await.unwrap().unwrap();
    assert_eq!(value, parse_node(r#"{ name: "Alice" }"#).unwrap());

    assert_eq!(store.last_commit(), commit);
}

#[tokio::test]
async fn multi_participant_atomic_commit() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let tx = store.new_tx(3).await.unwrap();
    let txid = tx.txid();

    let mut handles = Vec::new();
    for (i, path) in ["p1", "p2", "p3"].iter().enumerate() {
        let store = store.clone();
        let path = path.to_string();
        handles.push(tokio::spawn(async move {
            let tx = store.join_tx(txid).await.unwrap();
            let is_last = tx
                .add_diff(diff(&path, &format!("{{ n: {i} }}")))
                .await
                .unwrap();
            if is_last {
                tx.commit().await.unwrap()
            } else {
                tx.wait_for_completion().await
            }
        }));
    }

    let mut commits = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.committed, "error: {:?}", result.error);
        commits.push(result.commit.unwrap());
    }
    // Every participant observes the same commit.
    assert!(commits.windows(2).all(|pair| pair[0] == pair[1]));

    for (i, path) in ["p1", "p2", "p3"].iter().enumerate() {
        let value = store.read_path(&p(path)).await.unwrap().unwrap();
        assert_eq!(value, parse_node(&format!("{{ n: {i} }}")).unwrap());
    }
}

#[tokio::test]
async fn match_failed_abort_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    // Pre-state: k = { n: 1 }.
    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff("k", "{ n: 1 }")).await.unwrap();
    assert!(tx.commit().await.unwrap().committed);
    let commit_before = store.last_commit();

    // Predicate expects n = 2; must abort.
    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff_with_match("k", "{ n: 2 }", "{ n: 3 }"))
        .await
        .unwrap();
    let result = tx.commit().await.unwrap();
    assert!(!result.committed);
    assert!(matches!(
        result.error.as_deref(),
        Some(StoreError::MatchFailed { .. })
    ));

    // No mutation, no new log entry.
    let value = store.read_path(&p("k")).await.unwrap().unwrap();
    assert_eq!(value, parse_node("{ n: 1 }").unwrap());
    assert_eq!(store.last_commit(), commit_before);

    // No pending or committed files for the aborted txseq remain.
    let mut leftovers = Vec::new();
    for sub in ["pending", "committed"] {
        let root = dir.path().join(sub);
        let mut stack = vec![root];
        while let Some(next) = stack.pop() {
            let Ok(mut read_dir) = tokio::fs::read_dir(&next).await else {
                continue;
            };
            while let Some(entry) = read_dir.next_entry().await.unwrap() {
                if entry.file_type().await.unwrap().is_dir() {
                    stack.push(entry.path());
                } else if entry
                    .path()
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with(&format!("{}", tx.txid()))
                {
                    leftovers.push(entry.path());
                }
            }
        }
    }
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
}

#[tokio::test]
async fn match_against_current_view_commits() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff("k", "{ n: 1 }")).await.unwrap();
    tx.commit().await.unwrap();

    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff_with_match("k", "{ n: 1 }", "{ n: 3 }"))
        .await
        .unwrap();
    let result = tx.commit().await.unwrap();
    assert!(result.committed);

    let value = store.read_path(&p("k")).await.unwrap().unwrap();
    assert_eq!(value, parse_node("{ n: 3 }").unwrap());
}

#[tokio::test]
async fn commit_is_idempotent_and_add_diff_after_commit_conflicts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff("a", "1")).await.unwrap();
    let first = tx.commit().await.unwrap();
    let second = tx.commit().await.unwrap();
    assert_eq!(first.commit, second.commit);

    let err = tx.add_diff(diff("b", "2")).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
}

#[tokio::test]
async fn commit_before_all_participants_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let tx = store.new_tx(2).await.unwrap();
    let is_last = tx.add_diff(diff("a", "1")).await.unwrap();
    assert!(!is_last);

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest { .. }));

    // The transaction is still pending and completable.
    let other = store.join_tx(tx.txid()).await.unwrap();
    assert!(other.add_diff(diff("b", "2")).await.unwrap());
    assert!(other.commit().await.unwrap().committed);
}

#[tokio::test]
async fn join_of_unknown_or_finalized_tx_conflicts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    assert!(matches!(
        store.join_tx(999).await.unwrap_err(),
        StoreError::Conflict { .. }
    ));

    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff("a", "1")).await.unwrap();
    tx.commit().await.unwrap();
    assert!(matches!(
        store.join_tx(tx.txid()).await.unwrap_err(),
        StoreError::Conflict { .. }
    ));
}

#[tokio::test]
async fn root_path_diff_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let tx = store.new_tx(1).await.unwrap();
    let err = tx.add_diff(diff("", "{ a: 1 }")).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest { .. }));
}

#[tokio::test]
async fn no_partial_state_is_ever_observable() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    // Writer: transactions that set p1 and p2 together, to matching
    // values. Reader: p1 and p2 must never disagree.
    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for round in 1..=20i64 {
                let tx = store.new_tx(2).await.unwrap();
                let joined = store.join_tx(tx.txid()).await.unwrap();
                tx.add_diff(diff("pair.p1", &format!("{{ v: {round} }}")))
                    .await
                    .unwrap();
                let is_last = joined
                    .add_diff(diff("pair.p2", &format!("{{ v: {round} }}")))
                    .await
                    .unwrap();
                assert!(is_last);
                assert!(joined.commit().await.unwrap().committed);
            }
        })
    };

    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let pair = store.read_path(&p("pair")).await.unwrap();
                if let Some(pair) = pair {
                    let v1 = pair.get_path(&p("p1.v")).cloned();
                    let v2 = pair.get_path(&p("p2.v")).cloned();
                    assert_eq!(v1, v2, "torn read: {v1:?} vs {v2:?}");
                }
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();

    let value = store.read_path(&p("pair.p1.v")).await.unwrap().unwrap();
    assert_eq!(value, Node::int(20));
}

#[tokio::test]
async fn commits_are_strictly_increasing_across_restart() {
    let dir = TempDir::new().unwrap();
    let mut seen = Vec::new();

    for _ in 0..2 {
        let store = open_store(&dir).await;
        for _ in 0..3 {
            let tx = store.new_tx(1).await.unwrap();
            tx.add_diff(diff("counter", "{ tick: true }")).await.unwrap();
            let result = tx.commit().await.unwrap();
            seen.push(result.commit.unwrap());
        }
        drop(store);
    }

    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{seen:?}");
}

#[tokio::test]
async fn watchers_see_each_commit_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let mut rx = store.subscribe();

    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff("watched.value", "{ n: 7 }")).await.unwrap();
    let result = tx.commit().await.unwrap();

    let notice = rx.recv().await.unwrap();
    assert_eq!(Some(notice.commit), result.commit);
    assert_eq!(notice.paths, vec![p("watched.value")]);
}

#[tokio::test]
async fn wait_for_completion_is_multi_consumer() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let tx = store.new_tx(1).await.unwrap();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let tx = tx.clone();
            tokio::spawn(async move { tx.wait_for_completion().await })
        })
        .collect();

    tx.add_diff(diff("w", "{ ok: true }")).await.unwrap();
    let result = tx.commit().await.unwrap();

    for waiter in waiters {
        let waited = waiter.await.unwrap();
        assert_eq!(waited.committed, result.committed);
        assert_eq!(waited.commit, result.commit);
    }
}

#[tokio::test]
async fn snapshot_compaction_preserves_reads() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    for i in 0..5i64 {
        let tx = store.new_tx(1).await.unwrap();
        tx.add_diff(diff(
            &format!("docs.d{i}"),
            &format!("{{ body: \"text {i}\" }}"),
        ))
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    let range = store.write_snapshot().await.unwrap().unwrap();
    assert_eq!(range.1, store.last_commit());

    // Reads served from the snapshot alone.
    for i in 0..5i64 {
        let value = store
            .read_path(&p(&format!("docs.d{i}.body")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Node::string(format!("text {i}")));
    }

    // And commits after the snapshot compose on top of it.
    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(diff("docs.d0", r#"{ body: "updated" }"#))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    let value = store.read_path(&p("docs.d0.body")).await.unwrap().unwrap();
    assert_eq!(value, Node::string("updated"));
    let untouched = store.read_path(&p("docs.d4.body")).await.unwrap().unwrap();
    assert_eq!(untouched, Node::string("text 4"));
}

#[tokio::test]
async fn concurrent_single_participant_transactions_serialize() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut handles = Vec::new();
    for i in 0..8i64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let tx = store.new_tx(1).await.unwrap();
            tx.add_diff(diff(&format!("slot.s{i}"), &format!("{{ i: {i} }}")))
                .await
                .unwrap();
            tx.commit().await.unwrap().commit.unwrap()
        }));
    }

    let mut commits = Vec::new();
    for handle in handles {
        commits.push(handle.await.unwrap());
    }
    commits.sort_unstable();
    commits.dedup();
    assert_eq!(commits.len(), 8, "duplicate commit numbers");

    for i in 0..8i64 {
        let value = store
            .read_path(&p(&format!("slot.s{i}.i")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Node::int(i));
    }
}

#[tokio::test]
async fn txid_pool_hands_out_usable_transactions() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let pool = logd_store::TxIdPool::new(store.clone(), 4);

    let tx = pool
        .get(1, std::time::Duration::from_secs(5))
        .await
        .unwrap();
    tx.add_diff(diff("pooled", "{ ok: true }")).await.unwrap();
    assert!(tx.commit().await.unwrap().committed);

    let value = store.read_path(&p("pooled.ok")).await.unwrap().unwrap();
    assert_eq!(value, Node::bool(true));
    drop(Arc::clone(&pool));
}
