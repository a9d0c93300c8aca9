//! Snapshots: persisted base documents as `[header | event stream |
//! path→offset index]`, immutable once published.

mod builder;
mod index;
mod reader;

pub use builder::SnapshotBuilder;
pub use reader::Snapshot;
pub(crate) use reader::{parse_snapshot_name, snapshot_file_name};

#[cfg(test)]
mod tests {
    use super::*;
    use logd_event::node_to_events;
    use logd_path::KindedPath;
    use logd_value::{parse_node, Node};
    use temp_dir::TempDir;

    fn p(s: &str) -> KindedPath {
        KindedPath::parse(s).unwrap()
    }

    async fn build_snapshot(node: &Node, chunk_size: usize, dir: &TempDir) -> Snapshot {
        let mut builder = SnapshotBuilder::new(chunk_size);
        for event in node_to_events(node) {
            builder.push(&event).unwrap();
        }
        let path = dir.path().join(snapshot_file_name(0, 1));
        builder.write_atomically(&path).await.unwrap();
        Snapshot::open(&path).unwrap()
    }

    #[tokio::test]
    async fn read_paths_from_small_snapshot() {
        let dir = TempDir::new().unwrap();
        let doc = parse_node(
            r#"{ users: { 3002: { name: "ada" }, 7: { name: "bob" } }, tags: ["x", "y"] }"#,
        )
        .unwrap();
        let snapshot = build_snapshot(&doc, 4096, &dir).await;

        assert_eq!(
            snapshot.read_path(&p("users{3002}.name")).unwrap().unwrap(),
            Node::string("ada")
        );
        assert_eq!(
            snapshot.read_path(&p("tags[1]")).unwrap().unwrap(),
            Node::string("y")
        );
        assert_eq!(snapshot.read_path(&KindedPath::root()).unwrap().unwrap(), doc);
        assert!(snapshot.read_path(&p("users{9}")).unwrap().is_none());
        assert!(snapshot.read_path(&p("nope")).unwrap().is_none());
    }

    #[tokio::test]
    async fn small_chunk_bound_produces_multiple_entries() {
        let dir = TempDir::new().unwrap();
        let mut entries = Vec::new();
        for i in 0..60 {
            let name = format!("field_{i}_with_a_much_longer_name_for_padding");
            let value = format!("value {i} {}", "x".repeat(80));
            entries.push((logd_value::Key::field(name), Node::string(value)));
        }
        let doc = Node::object(entries);

        let mut builder = SnapshotBuilder::new(256);
        for event in node_to_events(&doc) {
            builder.push(&event).unwrap();
        }
        assert!(builder.index_len() >= 2, "index: {}", builder.index_len());

        let path = dir.path().join(snapshot_file_name(0, 1));
        builder.write_atomically(&path).await.unwrap();
        let snapshot = Snapshot::open(&path).unwrap();

        for i in 0..60 {
            let field = format!("field_{i}_with_a_much_longer_name_for_padding");
            let expected = format!("value {i} {}", "x".repeat(80));
            let value = snapshot
                .read_path(&p(&field))
                .unwrap()
                .unwrap_or_else(|| panic!("missing {field}"));
            assert_eq!(value, Node::string(expected));
        }
        assert!(snapshot.read_path(&p("nonexistent")).unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_containers_round_trip() {
        let dir = TempDir::new().unwrap();
        for text in ["{}", "[]"] {
            let doc = parse_node(text).unwrap();
            let snapshot = build_snapshot(&doc, 4096, &dir).await;
            assert_eq!(
                snapshot.read_path(&KindedPath::root()).unwrap().unwrap(),
                doc
            );
        }
    }

    #[tokio::test]
    async fn array_root_snapshots_index_elements() {
        let dir = TempDir::new().unwrap();
        let doc = parse_node(r#"[{ id: 1 }, { id: 2 }, "tail"]"#).unwrap();
        let snapshot = build_snapshot(&doc, 1, &dir).await;

        assert_eq!(
            snapshot.read_path(&p("[1].id")).unwrap().unwrap(),
            Node::int(2)
        );
        assert_eq!(
            snapshot.read_path(&p("[2]")).unwrap().unwrap(),
            Node::string("tail")
        );
        assert!(snapshot.read_path(&p("[3]")).unwrap().is_none());
    }
}
