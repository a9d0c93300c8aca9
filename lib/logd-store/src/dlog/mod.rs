//! The durable log: an append-only, commit-ordered sequence of patch
//! entries, stored as checksummed records in rolling segment files.
//!
//! A segment file is named for the first commit it holds, zero-padded so
//! lexical order is commit order. Appends are flushed and fsynced before
//! they return; a torn tail left by a crash is truncated away at open, so
//! readers never observe a partial record.

mod ledger;
mod record;

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use logd_event::{decode_events, encode_events, events_to_node, node_to_events};
use logd_path::KindedPath;
use logd_value::{Key, Node, NodeKind};
use snafu::ResultExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, instrument, trace, warn};

use crate::config::StoreConfig;
use crate::error::{StorageSnafu, StoreError};
use ledger::Ledger;
use record::{create_checksummer, decode_record_body, encode_record, RecordStatus};

const SEGMENT_SUFFIX: &str = "seg";

/// One durable-log entry: the patch a transaction committed, the paths it
/// touched, and its position in the commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub commit: u64,
    pub txid: u64,
    pub timestamp_ms: i64,
    /// The combined patch node: every participant diff placed at its
    /// virtual path, each diff root carrying the patch-root marker.
    pub patch: Node,
    /// The participants' virtual paths, in the order their diffs arrived.
    pub paths: Vec<KindedPath>,
}

impl Entry {
    fn to_payload(&self) -> BytesMut {
        let node = Node::object(vec![
            (Key::from("commit"), Node::int(self.commit as i64)),
            (Key::from("tx"), Node::int(self.txid as i64)),
            (Key::from("ts"), Node::int(self.timestamp_ms)),
            (
                Key::from("paths"),
                Node::array(
                    self.paths
                        .iter()
                        .map(|path| Node::string(path.to_string()))
                        .collect(),
                ),
            ),
            (Key::from("patch"), self.patch.clone()),
        ]);
        encode_events(&node_to_events(&node))
    }

    fn from_payload(payload: &[u8]) -> Result<Entry, StoreError> {
        let node = events_to_node(&decode_events(payload)?)?;
        let object = node.as_object().ok_or_else(|| StoreError::Internal {
            reason: "log entry payload is not an object".to_string(),
        })?;

        let int_field = |name: &str| -> Result<i64, StoreError> {
            object
                .get_field(name)
                .and_then(Node::as_int)
                .ok_or_else(|| StoreError::Internal {
                    reason: format!("log entry missing integer field {name:?}"),
                })
        };

        let paths = object
            .get_field("paths")
            .and_then(Node::as_array)
            .ok_or_else(|| StoreError::Internal {
                reason: "log entry missing paths".to_string(),
            })?
            .iter()
            .map(|value| {
                let text = value.as_str().ok_or_else(|| StoreError::Internal {
                    reason: "log entry path is not a string".to_string(),
                })?;
                KindedPath::parse(text).map_err(StoreError::from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Entry {
            commit: int_field("commit")? as u64,
            txid: int_field("tx")? as u64,
            timestamp_ms: int_field("ts")?,
            patch: object
                .get_field("patch")
                .cloned()
                .ok_or_else(|| StoreError::Internal {
                    reason: "log entry missing patch".to_string(),
                })?,
            paths,
        })
    }
}

struct SegmentWriter {
    path: PathBuf,
    file: File,
    size: u64,
}

/// The append-only durable log.
pub struct DLog {
    dir: PathBuf,
    max_segment_size: u64,
    max_record_size: usize,
    ledger: Ledger,
    writer: tokio::sync::Mutex<Option<SegmentWriter>>,
}

impl DLog {
    /// Opens the log, creating the directory when needed, validating the
    /// tail of the last segment, and truncating any torn record.
    pub(crate) async fn open(config: &StoreConfig) -> Result<DLog, StoreError> {
        let dir = config.dlog_dir();
        fs::create_dir_all(&dir)
            .await
            .context(StorageSnafu { path: dir.clone() })?;

        let ledger = Ledger::load_or_create(config.meta_path()).await?;

        let dlog = DLog {
            dir,
            max_segment_size: config.max_segment_size,
            max_record_size: config.max_record_size,
            ledger,
            writer: tokio::sync::Mutex::new(None),
        };
        dlog.validate_last_segment().await?;
        Ok(dlog)
    }

    pub(crate) fn last_commit(&self) -> u64 {
        self.ledger.last_commit()
    }

    /// Returns a strictly increasing commit number; durable before return.
    pub(crate) async fn allocate_commit(&self) -> Result<u64, StoreError> {
        self.ledger.allocate_commit().await
    }

    /// Returns a strictly increasing transaction sequence number.
    pub(crate) async fn allocate_txseq(&self) -> Result<u64, StoreError> {
        self.ledger.allocate_txseq().await
    }

    /// Appends one entry. The entry's commit must be the most recently
    /// allocated one; the write is durable before this returns.
    #[instrument(skip_all, fields(commit = entry.commit), level = "debug")]
    pub(crate) async fn append(&self, entry: &Entry) -> Result<(), StoreError> {
        if entry.commit != self.ledger.last_commit() {
            return Err(StoreError::Internal {
                reason: format!(
                    "append of commit {} but most recently allocated is {}",
                    entry.commit,
                    self.ledger.last_commit()
                ),
            });
        }

        let payload = entry.to_payload();
        if payload.len() > self.max_record_size {
            return Err(StoreError::InvalidRequest {
                reason: format!(
                    "log record of {} bytes exceeds limit of {}",
                    payload.len(),
                    self.max_record_size
                ),
            });
        }

        let mut buf = BytesMut::with_capacity(payload.len() + record::RECORD_OVERHEAD);
        encode_record(&mut buf, entry.commit, &payload, &create_checksummer());

        let mut guard = self.writer.lock().await;
        let writer = self.writer_for_append(&mut *guard, entry.commit).await?;
        writer
            .file
            .write_all(&buf)
            .await
            .context(StorageSnafu {
                path: writer.path.clone(),
            })?;
        writer.file.flush().await.context(StorageSnafu {
            path: writer.path.clone(),
        })?;
        writer.file.sync_all().await.context(StorageSnafu {
            path: writer.path.clone(),
        })?;
        writer.size += buf.len() as u64;

        trace!(
            commit = entry.commit,
            bytes = buf.len(),
            segment = %writer.path.display(),
            "appended log entry"
        );
        Ok(())
    }

    /// Ensures the current segment writer is open and has room, rolling to
    /// a new segment named for `commit` when needed.
    async fn writer_for_append<'a>(
        &self,
        guard: &'a mut Option<SegmentWriter>,
        commit: u64,
    ) -> Result<&'a mut SegmentWriter, StoreError> {
        let roll = match guard.as_ref() {
            Some(writer) => writer.size >= self.max_segment_size,
            None => true,
        };

        if roll {
            let path = match self.segment_paths().await?.pop() {
                // Reuse the newest existing segment while it has room and
                // we are not rolling away from a full one.
                Some(existing) if guard.is_none() => {
                    let len = fs::metadata(&existing)
                        .await
                        .context(StorageSnafu {
                            path: existing.clone(),
                        })?
                        .len();
                    if len < self.max_segment_size {
                        existing
                    } else {
                        self.segment_path(commit)
                    }
                }
                _ => self.segment_path(commit),
            };

            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .await
                .context(StorageSnafu { path: path.clone() })?;
            let size = file
                .metadata()
                .await
                .context(StorageSnafu { path: path.clone() })?
                .len();

            debug!(segment = %path.display(), size, "opened log segment for append");
            *guard = Some(SegmentWriter { path, file, size });
        }

        Ok(guard.as_mut().expect("writer opened above"))
    }

    /// Reads entries with `from <= commit <= to`, in ascending commit
    /// order.
    pub(crate) async fn iterate(&self, from: u64, to: u64) -> Result<Vec<Entry>, StoreError> {
        let mut entries = Vec::new();
        for path in self.segment_paths().await? {
            // Segments whose first commit is beyond the range cannot
            // contribute; lexical order equals commit order.
            if segment_first_commit(&path).is_some_and(|first| first > to) {
                break;
            }
            self.scan_segment(&path, &mut |entry| {
                if entry.commit >= from && entry.commit <= to {
                    entries.push(entry);
                }
            })
            .await?;
        }
        entries.sort_by_key(|entry| entry.commit);
        Ok(entries)
    }

    /// Reads every entry with `commit > after`.
    pub(crate) async fn tail(&self, after: u64) -> Result<Vec<Entry>, StoreError> {
        self.iterate(after.saturating_add(1), u64::MAX).await
    }

    /// Removes whole segments whose every commit is `<= up_to`. Readers
    /// running concurrently still see a consistent prefix: scan order is
    /// oldest-first and removal only ever drops the oldest segments.
    pub(crate) async fn truncate(&self, up_to: u64) -> Result<(), StoreError> {
        let paths = self.segment_paths().await?;
        for window in paths.windows(2) {
            let next_first = match segment_first_commit(&window[1]) {
                Some(first) => first,
                None => continue,
            };
            // Every commit in window[0] is < next_first.
            if next_first <= up_to + 1 {
                debug!(segment = %window[0].display(), "removing compacted log segment");
                fs::remove_file(&window[0]).await.context(StorageSnafu {
                    path: window[0].clone(),
                })?;
            }
        }
        Ok(())
    }

    /// Scans one segment, invoking `visit` per valid record.
    ///
    /// The scan stops at the first record that does not verify. A torn or
    /// unverifiable tail is expected while an append is in flight (or was
    /// cut short by a crash); readers always observe a consistent prefix.
    async fn scan_segment(
        &self,
        path: &Path,
        visit: &mut (dyn FnMut(Entry) + Send),
    ) -> Result<(), StoreError> {
        let raw = fs::read(path).await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        let checksummer = create_checksummer();

        let mut pos = 0usize;
        while pos < raw.len() {
            if raw.len() - pos < 8 {
                break;
            }
            let frame_len =
                u64::from_be_bytes(raw[pos..pos + 8].try_into().expect("8 bytes")) as usize;
            if frame_len > self.max_record_size + 12 || raw.len() - pos - 8 < frame_len {
                break;
            }
            pos += 8;
            match decode_record_body(&raw[pos..pos + frame_len], &checksummer) {
                Some(RecordStatus::Valid { payload, .. }) => {
                    visit(Entry::from_payload(&payload)?);
                }
                Some(RecordStatus::Corrupted { calculated, actual }) => {
                    error!(
                        calculated,
                        actual,
                        segment = %path.display(),
                        "record failed checksum verification; scan stops here"
                    );
                    break;
                }
                None => break,
            }
            pos += frame_len;
        }
        Ok(())
    }

    /// Walks the newest segment and truncates a torn trailing record, so
    /// appends always begin at a record boundary.
    async fn validate_last_segment(&self) -> Result<(), StoreError> {
        let Some(path) = self.segment_paths().await?.pop() else {
            return Ok(());
        };
        let raw = fs::read(&path).await.context(StorageSnafu {
            path: path.clone(),
        })?;
        let checksummer = create_checksummer();

        let mut pos = 0usize;
        let mut valid_end = 0usize;
        while pos < raw.len() {
            if raw.len() - pos < 8 {
                break;
            }
            let frame_len =
                u64::from_be_bytes(raw[pos..pos + 8].try_into().expect("8 bytes")) as usize;
            if frame_len > self.max_record_size + 12 || raw.len() - pos - 8 < frame_len {
                break;
            }
            match decode_record_body(&raw[pos + 8..pos + 8 + frame_len], &checksummer) {
                Some(RecordStatus::Valid { .. }) => {
                    pos += 8 + frame_len;
                    valid_end = pos;
                }
                _ => break,
            }
        }

        if valid_end < raw.len() {
            warn!(
                segment = %path.display(),
                valid_end,
                len = raw.len(),
                "truncating torn tail of newest log segment"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .context(StorageSnafu { path: path.clone() })?;
            file.set_len(valid_end as u64)
                .await
                .context(StorageSnafu { path: path.clone() })?;
            file.sync_all()
                .await
                .context(StorageSnafu { path: path.clone() })?;
        }
        Ok(())
    }

    fn segment_path(&self, first_commit: u64) -> PathBuf {
        self.dir
            .join(format!("{first_commit:020}.{SEGMENT_SUFFIX}"))
    }

    /// Segment paths in ascending commit order.
    async fn segment_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut read_dir = fs::read_dir(&self.dir).await.context(StorageSnafu {
            path: self.dir.clone(),
        })?;
        let mut paths = Vec::new();
        while let Some(dirent) = read_dir.next_entry().await.context(StorageSnafu {
            path: self.dir.clone(),
        })? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_SUFFIX) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn segment_first_commit(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse::<u64>().ok()
}
