//! End-to-end session test: hello, patch, read, match, newTx, and error
//! frames over a real TCP connection.

use logd::server;
use logd_store::{Store, StoreConfig};
use logd_value::{parse_frame, Node};
use temp_dir::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

struct Session {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Session {
    async fn connect(addr: std::net::SocketAddr) -> Session {
        let socket = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = socket.into_split();
        Session {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn round_trip(&mut self, frame: &str) -> Node {
        self.writer
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        parse_frame(line.trim_end()).unwrap()
    }
}

async fn start_server(dir: &TempDir) -> (Store, std::net::SocketAddr) {
    let store = Store::open(StoreConfig::from_path(dir.path()).build())
        .await
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let context = server::ServerContext::new(store.clone());
    tokio::spawn(server::tcp::serve(context, listener));
    (store, addr)
}

fn field<'a>(node: &'a Node, name: &str) -> &'a Node {
    node.as_object()
        .unwrap()
        .get_field(name)
        .unwrap_or_else(|| panic!("missing field {name:?} in {node:?}"))
}

#[tokio::test]
async fn session_patch_then_read() {
    let dir = TempDir::new().unwrap();
    let (_store, addr) = start_server(&dir).await;
    let mut session = Session::connect(addr).await;

    let ack = session
        .round_trip(r#"hello: { clientID: "test-client" }"#)
        .await;
    assert_eq!(field(&ack, "ok"), &Node::bool(true));

    let committed = session
        .round_trip(r#"path: "users.alice", patch: { name: "Alice" }"#)
        .await;
    assert!(field(&committed, "commit").as_int().is_some());

    let value = session.round_trip(r#"path: "users.alice""#).await;
    assert_eq!(field(&value, "name"), &Node::string("Alice"));

    let check = session
        .round_trip(r#"path: "users.alice", match: { name: "Alice" }"#)
        .await;
    assert_eq!(field(&check, "ok"), &Node::bool(true));

    let check = session
        .round_trip(r#"path: "users.alice", match: { name: "Bob" }"#)
        .await;
    assert_eq!(field(&check, "ok"), &Node::bool(false));
}

#[tokio::test]
async fn multi_participant_commit_over_two_sessions() {
    let dir = TempDir::new().unwrap();
    let (_store, addr) = start_server(&dir).await;

    let mut first = Session::connect(addr).await;
    let opened = first.round_trip("newTx: { participants: 2 }").await;
    let txid = field(field(&opened, "newTx"), "txID").as_int().unwrap();

    // The first participant blocks until the second completes the
    // transaction, so it runs on its own task.
    let first_task = tokio::spawn(async move {
        first
            .round_trip(&format!(r#"path: "p1", patch: {{ n: 1 }}, tx: {txid}"#))
            .await
    });

    let mut second = Session::connect(addr).await;
    let second_response = second
        .round_trip(&format!(r#"path: "p2", patch: {{ n: 2 }}, tx: {txid}"#))
        .await;
    let first_response = first_task.await.unwrap();

    let first_commit = field(&first_response, "commit").as_int().unwrap();
    let second_commit = field(&second_response, "commit").as_int().unwrap();
    assert_eq!(first_commit, second_commit);

    let value = second.round_trip(r#"path: "p1""#).await;
    assert_eq!(field(&value, "n"), &Node::int(1));
}

#[tokio::test]
async fn errors_come_back_as_error_frames() {
    let dir = TempDir::new().unwrap();
    let (_store, addr) = start_server(&dir).await;
    let mut session = Session::connect(addr).await;

    let missing = session.round_trip(r#"path: "no.such.path""#).await;
    assert_eq!(
        field(field(&missing, "error"), "kind"),
        &Node::string("NotFound")
    );

    let bad = session.round_trip(r#"path: "a..b""#).await;
    assert_eq!(
        field(field(&bad, "error"), "kind"),
        &Node::string("BadPath")
    );

    let garbled = session.round_trip(r#"path: "#).await;
    assert_eq!(
        field(field(&garbled, "error"), "kind"),
        &Node::string("MalformedStream")
    );
}

#[tokio::test]
async fn watch_streams_matching_commits() {
    let dir = TempDir::new().unwrap();
    let (store, addr) = start_server(&dir).await;

    let mut watcher = Session::connect(addr).await;
    watcher
        .writer
        .write_all(b"watch: { path: \"feed\" }\n")
        .await
        .unwrap();
    // Give the watch a moment to subscribe before committing.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let tx = store.new_tx(1).await.unwrap();
    tx.add_diff(logd_store::DiffRequest {
        path: "feed.item".parse().unwrap(),
        match_cond: None,
        diff: logd_value::parse_node(r#"{ text: "hi" }"#).unwrap(),
    })
    .await
    .unwrap();
    let commit = tx.commit().await.unwrap().commit.unwrap();

    let mut line = String::new();
    watcher.reader.read_line(&mut line).await.unwrap();
    let notice = parse_frame(line.trim_end()).unwrap();
    assert_eq!(field(&notice, "commit").as_int(), Some(commit as i64));
    assert_eq!(field(&notice, "path"), &Node::string("feed"));
    let value = field(&notice, "value");
    assert!(value.get_path(&"item.text".parse().unwrap()).is_some());
}
