use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size of a sector: 4 MiB.
pub const SECTOR_SIZE: u64 = 1 << 22;

/// Slot indexes are `u32`.
pub const MAX_SECTORS_PER_FOLDER: u64 = u32::MAX as u64;

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

pub const WAL_COMPACT_THRESHOLD: u64 = 4 << 20;

pub const METADATA_COMPACT_THRESHOLD: u64 = 16 << 20;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Directory holding the write-ahead log and the metadata store.
    pub persist_dir: PathBuf,
    pub sector_size: u64,
    pub max_sectors_per_folder: u64,
    /// Period of the background maintenance thread.
    pub maintenance_interval: Duration,
    /// Rewrite the write-ahead log once it grows beyond this many bytes.
    pub wal_compact_threshold: u64,
    /// Snapshot the metadata store once its log grows beyond this many bytes.
    pub metadata_compact_threshold: u64,
}

impl StorageOptions {
    pub fn new(persist_dir: impl AsRef<Path>) -> StorageOptions {
        StorageOptions {
            persist_dir: persist_dir.as_ref().to_path_buf(),
            sector_size: SECTOR_SIZE,
            max_sectors_per_folder: MAX_SECTORS_PER_FOLDER,
            maintenance_interval: MAINTENANCE_INTERVAL,
            wal_compact_threshold: WAL_COMPACT_THRESHOLD,
            metadata_compact_threshold: METADATA_COMPACT_THRESHOLD,
        }
    }

    pub fn with_sector_size(mut self, sector_size: u64) -> StorageOptions {
        self.sector_size = sector_size;
        self
    }

    pub fn with_max_sectors_per_folder(mut self, max_sectors: u64) -> StorageOptions {
        self.max_sectors_per_folder = max_sectors.min(MAX_SECTORS_PER_FOLDER);
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> StorageOptions {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_wal_compact_threshold(mut self, threshold: u64) -> StorageOptions {
        self.wal_compact_threshold = threshold;
        self
    }

    pub fn with_metadata_compact_threshold(mut self, threshold: u64) -> StorageOptions {
        self.metadata_compact_threshold = threshold;
        self
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        StorageOptions::new("storage")
    }
}
