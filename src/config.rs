use std::path::PathBuf;

/// Maximum number of distinct keys the memtable holds before it is
/// flushed to an SSTable.
pub const MEMTABLE_CAPACITY: usize = 30;

/// Maximum number of entries a single SSTable may carry.
pub const SSTABLE_MAX_ENTRIES: usize = 30;

/// Number of live SSTables that triggers compaction after a flush.
pub const COMPACTION_THRESHOLD: usize = 5;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding SSTable files and the catalog manifest.
    pub data_dir: PathBuf,

    /// Path of the write-ahead log file.
    pub wal_path: PathBuf,

    /// Distinct keys admitted into the memtable before a flush.
    pub memtable_capacity: usize,

    /// Entries per SSTable; compaction output is split to respect this.
    pub sstable_max_entries: usize,

    /// Live-table count at which a flush triggers compaction.
    pub compaction_threshold: usize,
}

impl EngineConfig {
    /// Create a config with the given data directory and WAL path.
    pub fn new(data_dir: impl Into<PathBuf>, wal_path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            wal_path: wal_path.into(),
            memtable_capacity: MEMTABLE_CAPACITY,
            sstable_max_entries: SSTABLE_MAX_ENTRIES,
            compaction_threshold: COMPACTION_THRESHOLD,
        }
    }

    /// Set the memtable capacity.
    pub fn memtable_capacity(mut self, capacity: usize) -> Self {
        self.memtable_capacity = capacity;
        self
    }

    /// Set the per-SSTable entry limit.
    pub fn sstable_max_entries(mut self, max: usize) -> Self {
        self.sstable_max_entries = max;
        self
    }

    /// Set the compaction trigger threshold.
    pub fn compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }
}
