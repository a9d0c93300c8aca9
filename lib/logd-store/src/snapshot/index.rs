//! The snapshot path index: sorted `(kinded path, offset)` entries mapping
//! indexed paths to byte offsets in the event region.

use bytes::{BufMut, BytesMut};
use logd_path::KindedPath;

use crate::error::StoreError;

/// Upper bound on a serialized index; anything larger fails the open-time
/// sanity check.
pub(crate) const MAX_INDEX_SIZE: u32 = 1 << 30;

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub path: KindedPath,
    /// Byte offset of the entry's first event, relative to the start of
    /// the event region.
    pub offset: u64,
    /// Bytes from this entry's offset to the next entry's (or the end of
    /// the event region for the last entry).
    pub size: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SnapshotIndex {
    /// Sorted ascending by path.
    entries: Vec<IndexEntry>,
}

impl SnapshotIndex {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Serializes `(path, offset)` pairs, sorted by path.
    pub(crate) fn serialize(entries: &[(KindedPath, u64)]) -> BytesMut {
        let mut sorted: Vec<&(KindedPath, u64)> = entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buf = BytesMut::new();
        for (path, offset) in sorted {
            let text = path.to_string();
            buf.put_u32(text.len() as u32);
            buf.put_slice(text.as_bytes());
            buf.put_i64(*offset as i64);
        }
        buf
    }

    /// Deserializes the index region, computing per-entry sizes against
    /// `event_size` (the byte length of the event region).
    pub(crate) fn deserialize(raw: &[u8], event_size: u64) -> Result<SnapshotIndex, StoreError> {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < raw.len() {
            if raw.len() - pos < 4 {
                return Err(StoreError::Internal {
                    reason: "torn snapshot index entry".to_string(),
                });
            }
            let text_len =
                u32::from_be_bytes(raw[pos..pos + 4].try_into().expect("4 bytes")) as usize;
            pos += 4;
            if raw.len() - pos < text_len + 8 {
                return Err(StoreError::Internal {
                    reason: "torn snapshot index entry".to_string(),
                });
            }
            let text = std::str::from_utf8(&raw[pos..pos + text_len]).map_err(|_| {
                StoreError::Internal {
                    reason: "snapshot index path is not UTF-8".to_string(),
                }
            })?;
            let path = KindedPath::parse(text)?;
            pos += text_len;
            let offset =
                i64::from_be_bytes(raw[pos..pos + 8].try_into().expect("8 bytes")) as u64;
            pos += 8;
            if offset > event_size {
                return Err(StoreError::Internal {
                    reason: format!("snapshot index offset {offset} beyond event region"),
                });
            }
            entries.push(IndexEntry {
                path,
                offset,
                size: 0,
            });
        }

        // Sizes derive from offset order, which for indexes produced by
        // the builder coincides with path order.
        let mut by_offset: Vec<usize> = (0..entries.len()).collect();
        by_offset.sort_by_key(|&i| entries[i].offset);
        for pair in by_offset.windows(2) {
            entries[pair[0]].size = entries[pair[1]].offset - entries[pair[0]].offset;
        }
        if let Some(&last) = by_offset.last() {
            entries[last].size = event_size - entries[last].offset;
        }

        Ok(SnapshotIndex { entries })
    }

    /// The entry to start decoding from for a read of `target`: the
    /// deepest entry whose path is ancestor-or-equal to the target, else
    /// the first entry.
    pub(crate) fn lookup(&self, target: &KindedPath) -> Option<&IndexEntry> {
        if self.entries.is_empty() {
            return None;
        }
        // Ancestors are prefixes and therefore sort before the target;
        // walking back from the insertion point, the first ancestor found
        // is the deepest.
        let insertion = self
            .entries
            .partition_point(|entry| entry.path <= *target);
        for entry in self.entries[..insertion].iter().rev() {
            let (ancestor, equal) = entry.path.ancestor_or_equal(target);
            if ancestor || equal {
                return Some(entry);
            }
        }
        self.entries.first()
    }
}
