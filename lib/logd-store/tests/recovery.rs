//! Crash-recovery behavior: the durable log decides the fate of pending
//! diff files found at startup.

use logd_event::{encode_events, node_to_events};
use logd_path::KindedPath;
use logd_store::{DiffRequest, Store, StoreConfig};
use logd_value::{parse_node, Key, Node};
use temp_dir::TempDir;

fn p(s: &str) -> KindedPath {
    KindedPath::parse(s).unwrap()
}

async fn open_store(dir: &TempDir) -> Store {
    Store::open(StoreConfig::from_path(dir.path()).build())
        .await
        .unwrap()
}

fn diff_file_bytes(path: &str, txseq: u64, diff_text: &str) -> Vec<u8> {
    let node = Node::object(vec![
        (Key::from("path"), Node::string(path)),
        (Key::from("tx"), Node::int(txseq as i64)),
        (Key::from("ts"), Node::int(0)),
        (Key::from("diff"), parse_node(diff_text).unwrap()),
    ]);
    encode_events(&node_to_events(&node)).to_vec()
}

#[tokio::test]
async fn orphan_pending_files_are_deleted() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir).await;
        drop(store);
    }

    // A pending file for a transaction the log never saw.
    let orphan_dir = dir.path().join("pending").join("ghost.path");
    std::fs::create_dir_all(&orphan_dir).unwrap();
    let orphan = orphan_dir.join("424242.pending");
    std::fs::write(&orphan, diff_file_bytes("ghost.path", 424242, "{ lost: true }")).unwrap();

    let store = open_store(&dir).await;
    assert!(!orphan.exists(), "orphan pending file survived recovery");
    assert!(store.read_path(&p("ghost.path")).await.unwrap().is_none());
}

#[tokio::test]
async fn logged_pending_files_are_promoted() {
    let dir = TempDir::new().unwrap();

    // Commit normally, then simulate a crash between the log append and
    // promotion by moving the committed file back to its pending name.
    let txid;
    let commit;
    {
        let store = open_store(&dir).await;
        let tx = store.new_tx(1).await.unwrap();
        txid = tx.txid();
        tx.add_diff(DiffRequest {
            path: p("doc.entry"),
            match_cond: None,
            diff: parse_node(r#"{ body: "kept" }"#).unwrap(),
        })
        .await
        .unwrap();
        commit = tx.commit().await.unwrap().commit.unwrap();
        drop(store);
    }

    let committed = dir
        .path()
        .join("committed")
        .join("doc.entry")
        .join(format!("{txid}-{commit}.diff"));
    assert!(committed.exists());

    let pending_parent = dir.path().join("pending").join("doc.entry");
    std::fs::create_dir_all(&pending_parent).unwrap();
    let pending = pending_parent.join(format!("{txid}.pending"));
    std::fs::rename(&committed, &pending).unwrap();

    let store = open_store(&dir).await;
    assert!(!pending.exists(), "pending file was not promoted");
    assert!(committed.exists(), "committed file missing after recovery");

    // The value still reads back.
    let value = store.read_path(&p("doc.entry.body")).await.unwrap().unwrap();
    assert_eq!(value, Node::string("kept"));
}

#[tokio::test]
async fn state_files_of_committed_transactions_are_removed() {
    let dir = TempDir::new().unwrap();

    let txid;
    {
        let store = open_store(&dir).await;
        let tx = store.new_tx(1).await.unwrap();
        txid = tx.txid();
        tx.add_diff(DiffRequest {
            path: p("x"),
            match_cond: None,
            diff: parse_node("{ a: 1 }").unwrap(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
        drop(store);
    }

    // Simulate a crash before state-file deletion landed: resurrect it.
    let state_file = dir.path().join("state").join(format!("tx-{txid}"));
    std::fs::write(&state_file, b"stale").unwrap();

    let _store = open_store(&dir).await;
    assert!(!state_file.exists(), "stale state file survived recovery");
}

#[tokio::test]
async fn pending_transactions_survive_restart() {
    let dir = TempDir::new().unwrap();

    let txid;
    {
        let store = open_store(&dir).await;
        let tx = store.new_tx(2).await.unwrap();
        txid = tx.txid();
        tx.add_diff(DiffRequest {
            path: p("half"),
            match_cond: None,
            diff: parse_node("{ first: true }").unwrap(),
        })
        .await
        .unwrap();
        drop(store);
    }

    let store = open_store(&dir).await;
    let tx = store.join_tx(txid).await.unwrap();
    let is_last = tx
        .add_diff(DiffRequest {
            path: p("other"),
            match_cond: None,
            diff: parse_node("{ second: true }").unwrap(),
        })
        .await
        .unwrap();
    assert!(is_last);
    assert!(tx.commit().await.unwrap().committed);

    assert!(store.read_path(&p("half.first")).await.unwrap().is_some());
    assert!(store.read_path(&p("other.second")).await.unwrap().is_some());
}
