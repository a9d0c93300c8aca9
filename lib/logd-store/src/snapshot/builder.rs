//! The snapshot builder: accepts events in order, tracks byte offsets,
//! and records a size-bound index at natural boundaries.
//!
//! A natural boundary is the start of a direct element of the root
//! container: a key event at depth one for object roots, any value event
//! at depth one for array roots. An index entry is recorded at a boundary
//! once at least `chunk_size` event bytes have accumulated since the last
//! entry, and always at the first boundary, so a non-empty document always
//! has a first entry.

use std::path::Path;

use bytes::BytesMut;
use logd_event::{encode_event, Event, EventSink, State};
use logd_path::KindedPath;
use snafu::ResultExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{StorageSnafu, StoreError};
use crate::snapshot::index::SnapshotIndex;

/// Builds one snapshot: `[header | event region | index region]`.
pub struct SnapshotBuilder {
    state: State,
    events: BytesMut,
    index: Vec<(KindedPath, u64)>,
    bytes_since_entry: usize,
    chunk_size: usize,
    root_is_array: Option<bool>,
}

impl SnapshotBuilder {
    pub fn new(chunk_size: usize) -> Self {
        SnapshotBuilder {
            state: State::new(),
            events: BytesMut::new(),
            index: Vec::new(),
            // The first boundary always gets an entry.
            bytes_since_entry: chunk_size,
            chunk_size,
            root_is_array: None,
        }
    }

    /// Seeds the index, for callers that carry entries over from an
    /// existing snapshot.
    #[allow(dead_code)]
    pub fn with_initial_index(mut self, entries: Vec<(KindedPath, u64)>) -> Self {
        self.index = entries;
        self
    }

    /// Appends one event to the event region, recording an index entry
    /// when this event starts an indexable element.
    pub fn push(&mut self, event: &Event) -> Result<(), StoreError> {
        let offset = self.events.len() as u64;
        let pre_depth = self.state.depth();

        self.state.process_event(event)?;

        if self.root_is_array.is_none() {
            self.root_is_array = Some(matches!(event, Event::BeginArray { .. }));
        }

        let boundary = pre_depth == 1
            && if self.root_is_array == Some(true) {
                event.starts_value()
            } else {
                event.is_key()
            };
        if boundary && self.bytes_since_entry >= self.chunk_size {
            self.index
                .push((self.state.current_path().clone(), offset));
            self.bytes_since_entry = 0;
        }

        encode_event(&mut self.events, event);
        self.bytes_since_entry += self.events.len() as usize - offset as usize;
        Ok(())
    }

    /// Number of index entries recorded so far.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Serializes the snapshot to `path`: header rewritten in place after
    /// the regions are known, then flushed and fsynced.
    pub async fn write_to(self, path: &Path) -> Result<(), StoreError> {
        if self.state.depth() != 0 {
            return Err(StoreError::Internal {
                reason: format!(
                    "snapshot builder closed at depth {}",
                    self.state.depth()
                ),
            });
        }

        let index_raw = SnapshotIndex::serialize(&self.index);

        let mut header = [0u8; 12];
        header[0..8].copy_from_slice(&(self.events.len() as u64).to_be_bytes());
        header[8..12].copy_from_slice(&(index_raw.len() as u32).to_be_bytes());

        let mut file = File::create(path).await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        file.write_all(&header).await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        file.write_all(&self.events).await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        file.write_all(&index_raw).await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        file.flush().await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        file.sync_all().await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;

        debug!(
            snapshot = %path.display(),
            event_bytes = self.events.len(),
            index_entries = self.index.len(),
            "wrote snapshot"
        );
        Ok(())
    }

    /// Like [`write_to`](Self::write_to), but through a temp file renamed
    /// into place, so a crash never leaves a partial snapshot visible.
    pub async fn write_atomically(self, path: &Path) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        self.write_to(&tmp).await?;
        fs::rename(&tmp, path).await.context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        Ok(())
    }
}

impl EventSink for SnapshotBuilder {
    fn emit(&mut self, event: Event) -> Result<(), logd_event::EventError> {
        self.push(&event).map_err(|e| logd_event::EventError::MalformedStream {
            reason: e.to_string(),
        })
    }
}
