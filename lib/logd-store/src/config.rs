use std::path::{Path, PathBuf};

/// Default per-index-entry size bound for snapshot builders, in bytes.
pub const DEFAULT_SNAP_CHUNK_SIZE: usize = 4096;

/// Environment variable overriding [`DEFAULT_SNAP_CHUNK_SIZE`].
pub const SNAP_CHUNK_SIZE_ENV: &str = "SNAP_MAX_CHUNK_SIZE";

/// Durable-log segments roll over once they reach this size.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

/// Records larger than this are rejected outright.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 8 * 1024 * 1024;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory the store owns. Must be unique per store instance; an
    /// exclusive lock file inside it enforces single ownership.
    pub(crate) data_dir: PathBuf,
    /// Maximum size, in bytes, to target for each log segment file.
    pub(crate) max_segment_size: u64,
    /// Maximum size, in bytes, of one encoded log record.
    pub(crate) max_record_size: usize,
    /// Minimum number of event bytes between two snapshot index entries.
    pub(crate) snap_chunk_size: usize,
}

impl StoreConfig {
    pub fn from_path<P>(data_dir: P) -> StoreConfigBuilder
    where
        P: AsRef<Path>,
    {
        StoreConfigBuilder {
            data_dir: data_dir.as_ref().to_path_buf(),
            max_segment_size: None,
            max_record_size: None,
            snap_chunk_size: None,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn dlog_dir(&self) -> PathBuf {
        self.data_dir.join("dlog")
    }

    pub(crate) fn meta_path(&self) -> PathBuf {
        self.dlog_dir().join("meta")
    }

    pub(crate) fn snap_dir(&self) -> PathBuf {
        self.data_dir.join("snap")
    }

    pub(crate) fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub(crate) fn pending_dir(&self) -> PathBuf {
        self.data_dir.join("pending")
    }

    pub(crate) fn committed_dir(&self) -> PathBuf {
        self.data_dir.join("committed")
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.data_dir.join("store.lock")
    }
}

/// Builder for [`StoreConfig`].
pub struct StoreConfigBuilder {
    data_dir: PathBuf,
    max_segment_size: Option<u64>,
    max_record_size: Option<usize>,
    snap_chunk_size: Option<usize>,
}

impl StoreConfigBuilder {
    /// Sets the target size for log segment files. Defaults to 128 MiB.
    #[allow(dead_code)]
    pub fn max_segment_size(mut self, amount: u64) -> Self {
        self.max_segment_size = Some(amount);
        self
    }

    /// Sets the maximum encoded record size. Defaults to 8 MiB.
    #[allow(dead_code)]
    pub fn max_record_size(mut self, amount: usize) -> Self {
        self.max_record_size = Some(amount);
        self
    }

    /// Sets the snapshot index chunk bound. Defaults to the
    /// `SNAP_MAX_CHUNK_SIZE` environment variable, falling back to 4096.
    pub fn snap_chunk_size(mut self, amount: usize) -> Self {
        self.snap_chunk_size = Some(amount);
        self
    }

    pub fn build(self) -> StoreConfig {
        let snap_chunk_size = self.snap_chunk_size.unwrap_or_else(chunk_size_from_env);
        StoreConfig {
            data_dir: self.data_dir,
            max_segment_size: self.max_segment_size.unwrap_or(DEFAULT_MAX_SEGMENT_SIZE),
            max_record_size: self.max_record_size.unwrap_or(DEFAULT_MAX_RECORD_SIZE),
            snap_chunk_size: snap_chunk_size.max(1),
        }
    }
}

fn chunk_size_from_env() -> usize {
    std::env::var(SNAP_CHUNK_SIZE_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_SNAP_CHUNK_SIZE)
}
