//! Random-access snapshot reads.
//!
//! A snapshot file is immutable once written, so the reader memory-maps it
//! and decodes events straight out of the map. A read seeks to the deepest
//! indexed ancestor of the requested path and drives the path cursor from
//! there until the target's subtree has been collected.

use std::fs;
use std::path::{Path, PathBuf};

use logd_event::{events_to_node, BinaryEventDecoder, Event, State};
use logd_path::{KindedPath, Segment};
use logd_value::Node;
use memmap2::Mmap;
use snafu::ResultExt;
use tracing::{instrument, trace};

use crate::error::{StorageSnafu, StoreError};
use crate::snapshot::index::{SnapshotIndex, MAX_INDEX_SIZE};

/// An open, immutable snapshot.
pub struct Snapshot {
    path: PathBuf,
    mmap: Mmap,
    event_len: usize,
    index: SnapshotIndex,
    /// Commit range the snapshot covers, from its file name.
    pub(crate) lo: u64,
    pub(crate) hi: u64,
}

impl Snapshot {
    /// Opens and validates a snapshot file.
    pub fn open(path: &Path) -> Result<Snapshot, StoreError> {
        let (lo, hi) = parse_snapshot_name(path).ok_or_else(|| StoreError::Internal {
            reason: format!("snapshot file name {} is not lo-hi.snap", path.display()),
        })?;

        let file = fs::File::open(path).context(StorageSnafu {
            path: path.to_path_buf(),
        })?;
        // Safety: snapshot files are immutable after the atomic rename
        // that published them.
        let mmap = unsafe {
            Mmap::map(&file).context(StorageSnafu {
                path: path.to_path_buf(),
            })?
        };

        if mmap.len() < 12 {
            return Err(StoreError::Internal {
                reason: format!("snapshot {} shorter than its header", path.display()),
            });
        }
        let event_len = u64::from_be_bytes(mmap[0..8].try_into().expect("8 bytes")) as usize;
        let index_len = u32::from_be_bytes(mmap[8..12].try_into().expect("4 bytes"));
        if index_len > MAX_INDEX_SIZE {
            return Err(StoreError::Internal {
                reason: format!("snapshot index of {index_len} bytes fails sanity bound"),
            });
        }
        let index_len = index_len as usize;
        if mmap.len() < 12 + event_len + index_len {
            return Err(StoreError::Internal {
                reason: format!("snapshot {} truncated", path.display()),
            });
        }

        let index =
            SnapshotIndex::deserialize(&mmap[12 + event_len..12 + event_len + index_len], event_len as u64)?;

        trace!(
            snapshot = %path.display(),
            event_len,
            index_entries = index.len(),
            "opened snapshot"
        );

        Ok(Snapshot {
            path: path.to_path_buf(),
            mmap,
            event_len,
            index,
            lo,
            hi,
        })
    }

    pub(crate) fn file_path(&self) -> &Path {
        &self.path
    }

    fn events(&self) -> &[u8] {
        &self.mmap[12..12 + self.event_len]
    }

    /// Decodes the entire event region.
    pub(crate) fn all_events(&self) -> Result<Vec<Event>, StoreError> {
        logd_event::decode_events(self.events()).map_err(StoreError::from)
    }

    /// Materializes the subtree at `target`; `None` when absent.
    #[instrument(skip(self), level = "trace")]
    pub fn read_path(&self, target: &KindedPath) -> Result<Option<Node>, StoreError> {
        match self.read_path_events(target)? {
            Some(events) => Ok(Some(events_to_node(&events)?)),
            None => Ok(None),
        }
    }

    /// Returns the event sequence forming the subtree at `target`, without
    /// materializing it; `None` when the path does not resolve.
    pub fn read_path_events(
        &self,
        target: &KindedPath,
    ) -> Result<Option<Vec<Event>>, StoreError> {
        if target.is_root() {
            return Ok(Some(self.all_events()?));
        }
        // Wildcards address sets of paths, never one subtree.
        if target.segments().iter().any(Segment::is_wildcard) {
            return Ok(None);
        }

        let raw = self.events();
        let (offset, mut state) = match self.index.lookup(target) {
            Some(entry) => {
                let (ancestor, equal) = entry.path.ancestor_or_equal(target);
                if ancestor || equal {
                    let state = self.primed_state(&entry.path, entry.offset)?;
                    (entry.offset as usize, state)
                } else {
                    // The index has no ancestor; scan from the top.
                    (0, State::new())
                }
            }
            None => (0, State::new()),
        };

        let mut decoder = BinaryEventDecoder::at_offset(raw, offset);
        let mut collecting: Option<(Vec<Event>, usize)> = None;

        while let Some(event) = decoder.next_event()? {
            state.process_event(&event)?;

            if let Some((events, depth)) = &mut collecting {
                events.push(event.clone());
                match &event {
                    Event::BeginObject { .. } | Event::BeginArray { .. } => *depth += 1,
                    Event::EndObject | Event::EndArray => {
                        *depth -= 1;
                        if *depth == 0 {
                            let (events, _) = collecting.take().expect("currently collecting");
                            return Ok(Some(events));
                        }
                    }
                    _ => {}
                }
                continue;
            }

            if event.starts_value() && state.current_path() == target {
                if event.is_scalar() {
                    return Ok(Some(vec![event]));
                }
                collecting = Some((vec![event], 1));
            }
        }

        if collecting.is_some() {
            return Err(StoreError::Malformed {
                source: logd_event::EventError::UnexpectedEof {
                    depth: state.depth(),
                },
            });
        }
        Ok(None)
    }

    /// Primes a path cursor for decoding that starts at an index entry:
    /// at the entry's key event for object elements, at the value event
    /// for array elements.
    fn primed_state(&self, entry_path: &KindedPath, offset: u64) -> Result<State, StoreError> {
        let mut peek = BinaryEventDecoder::at_offset(self.events(), offset as usize);
        match peek.next_event()? {
            Some(event) if event.is_key() => Ok(State::at_key(entry_path)),
            Some(_) => Ok(State::at_value(entry_path)),
            None => Err(StoreError::Internal {
                reason: "snapshot index offset at end of event region".to_string(),
            }),
        }
    }
}

/// Parses `{lo}-{hi}.snap` file names.
pub(crate) fn parse_snapshot_name(path: &Path) -> Option<(u64, u64)> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "snap" {
        return None;
    }
    let (lo, hi) = stem.split_once('-')?;
    Some((lo.parse().ok()?, hi.parse().ok()?))
}

/// Formats the `{lo}-{hi}.snap` name for a commit range.
pub(crate) fn snapshot_file_name(lo: u64, hi: u64) -> String {
    format!("{lo}-{hi}.snap")
}
