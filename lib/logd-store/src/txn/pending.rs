//! Pending and committed diff files.
//!
//! One file per `(virtual path, transaction sequence)`: written with the
//! `.pending` suffix while a commit is in flight, renamed to its committed
//! name (which adds the commit number) when the transaction finalizes, and
//! deleted on abort. Readers never look at pending files; the committed
//! directory is the per-path index of applied diffs.

use std::path::{Path, PathBuf};

use logd_event::{decode_events, encode_events, events_to_node, node_to_events};
use logd_path::KindedPath;
use logd_value::{Key, Node};
use snafu::ResultExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::error::{StorageSnafu, StoreError};

/// Encodes a virtual path for use as a directory name: alphanumerics and
/// `. _ @ -` pass through, everything else is `%XX` percent-encoded. The
/// root path encodes as a bare `%`, which no non-root path can produce.
pub(crate) fn encode_virtual_path(path: &KindedPath) -> String {
    let text = path.to_string();
    if text.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'@' | b'-' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

pub(crate) fn pending_file_path(pending_dir: &Path, path: &KindedPath, txseq: u64) -> PathBuf {
    pending_dir
        .join(encode_virtual_path(path))
        .join(format!("{txseq}.pending"))
}

pub(crate) fn committed_file_path(
    committed_dir: &Path,
    path: &KindedPath,
    txseq: u64,
    commit: u64,
) -> PathBuf {
    committed_dir
        .join(encode_virtual_path(path))
        .join(format!("{txseq}-{commit}.diff"))
}

/// A diff as stored in a pending or committed file.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DiffFile {
    pub path: KindedPath,
    pub txseq: u64,
    pub timestamp_ms: i64,
    pub diff: Node,
}

impl DiffFile {
    fn to_node(&self) -> Node {
        Node::object(vec![
            (Key::from("path"), Node::string(self.path.to_string())),
            (Key::from("tx"), Node::int(self.txseq as i64)),
            (Key::from("ts"), Node::int(self.timestamp_ms)),
            (Key::from("diff"), self.diff.clone()),
        ])
    }

    pub(crate) fn from_bytes(raw: &[u8]) -> Result<DiffFile, StoreError> {
        let node = events_to_node(&decode_events(raw)?)?;
        let object = node.as_object().ok_or_else(|| StoreError::Internal {
            reason: "diff file is not an object".to_string(),
        })?;
        let path_text = object
            .get_field("path")
            .and_then(Node::as_str)
            .ok_or_else(|| StoreError::Internal {
                reason: "diff file missing path".to_string(),
            })?;
        Ok(DiffFile {
            path: KindedPath::parse(path_text)?,
            txseq: object
                .get_field("tx")
                .and_then(Node::as_int)
                .unwrap_or_default() as u64,
            timestamp_ms: object
                .get_field("ts")
                .and_then(Node::as_int)
                .unwrap_or_default(),
            diff: object
                .get_field("diff")
                .cloned()
                .ok_or_else(|| StoreError::Internal {
                    reason: "diff file missing diff".to_string(),
                })?,
        })
    }
}

/// Writes one pending diff file, fsynced before return.
pub(crate) async fn write_pending(
    pending_dir: &Path,
    file: &DiffFile,
) -> Result<PathBuf, StoreError> {
    let path = pending_file_path(pending_dir, &file.path, file.txseq);
    let parent = path.parent().expect("pending file has a parent");
    fs::create_dir_all(parent).await.context(StorageSnafu {
        path: parent.to_path_buf(),
    })?;

    let raw = encode_events(&node_to_events(&file.to_node()));
    let mut handle = fs::File::create(&path).await.context(StorageSnafu {
        path: path.clone(),
    })?;
    handle.write_all(&raw).await.context(StorageSnafu {
        path: path.clone(),
    })?;
    handle.sync_all().await.context(StorageSnafu {
        path: path.clone(),
    })?;

    trace!(file = %path.display(), "wrote pending diff");
    Ok(path)
}

/// Atomically promotes a pending file to its committed name.
pub(crate) async fn promote_pending(
    pending_dir: &Path,
    committed_dir: &Path,
    path: &KindedPath,
    txseq: u64,
    commit: u64,
) -> Result<PathBuf, StoreError> {
    let from = pending_file_path(pending_dir, path, txseq);
    let to = committed_file_path(committed_dir, path, txseq, commit);
    let parent = to.parent().expect("committed file has a parent");
    fs::create_dir_all(parent).await.context(StorageSnafu {
        path: parent.to_path_buf(),
    })?;
    fs::rename(&from, &to)
        .await
        .context(StorageSnafu { path: from })?;
    trace!(file = %to.display(), "promoted pending diff");
    Ok(to)
}

/// Deletes a pending file, tolerating its absence.
pub(crate) async fn delete_pending(
    pending_dir: &Path,
    path: &KindedPath,
    txseq: u64,
) -> Result<(), StoreError> {
    let file = pending_file_path(pending_dir, path, txseq);
    match fs::remove_file(&file).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(StorageSnafu { path: file }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_path_encoding_is_filesystem_safe() {
        let cases = [
            ("users.alice", "users.alice"),
            ("users{3002}.name", "users%7B3002%7D.name"),
            ("a[0]", "a%5B0%5D"),
            ("", "%"),
        ];
        for (input, expected) in cases {
            let path = KindedPath::parse(input).unwrap();
            assert_eq!(encode_virtual_path(&path), expected, "input {input:?}");
        }
    }
}
