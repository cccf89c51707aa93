//! The LSM engine: write path, read path, flush, and compaction
//! triggers behind the public API.
//!
//! # Concurrency
//!
//! Single writer, multiple readers. One `RwLock` guards the WAL, the
//! memtable, the catalog, and the logical clock: mutations take the
//! exclusive lock and hold it across fsyncs (acceptable at this scale),
//! reads share the shared lock. Scans copy their sources out
//! under the lock and merge afterwards, so a scan never blocks writers
//! while it drains.
//!
//! # Write path
//!
//! ```text
//! put/delete ──► full? ──flush──► WAL append (fsync) ──► memtable
//!                  │                                        │
//!                  └── catalog ≥ threshold? ──► compaction ◄┘
//! ```
//!
//! The overflow check runs before a new mutation is admitted: a full
//! memtable is sealed into one SSTable and the incoming record lands in
//! the fresh memtable. The WAL is truncated only by a flush that
//! succeeded, and the incoming record is appended after that truncation,
//! so an acknowledged write is always either in the WAL or in a table.

use std::fs;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::compaction;
use crate::config::EngineConfig;
use crate::entry::Entry;
use crate::error::Result;
use crate::flock::FileLock;
use crate::iterator::MergeIterator;
use crate::memtable::Memtable;
use crate::sstable::Catalog;
use crate::wal::{Wal, WalOp};

const LOCK_FILE: &str = "LOCK";

/// Mutable engine state, guarded as one unit.
struct Inner {
    wal: Wal,
    memtable: Memtable,
    catalog: Catalog,
    /// Logical clock; the authoritative ordering source. Wall time is
    /// used only for diagnostics.
    clock: u64,
    last_flush_at: Option<SystemTime>,
    last_compaction_at: Option<SystemTime>,
    last_compaction_error: Option<String>,
}

/// An embedded, durable, ordered key-value store.
pub struct Engine {
    config: EngineConfig,
    _lock: FileLock,
    inner: RwLock<Inner>,
}

impl Engine {
    /// Opens or creates the store at `data_dir` with its WAL at
    /// `wal_path`.
    pub fn open(
        data_dir: impl Into<std::path::PathBuf>,
        wal_path: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        Self::open_with_config(EngineConfig::new(data_dir, wal_path))
    }

    /// Opens or creates the store with a custom configuration, running
    /// the full startup protocol: directory lock, catalog recovery,
    /// WAL replay.
    pub fn open_with_config(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        if let Some(parent) = config.wal_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = FileLock::lock(config.data_dir.join(LOCK_FILE))?;

        let catalog = Catalog::open(&config.data_dir)?;
        let wal = Wal::open(&config.wal_path)?;
        let memtable = Memtable::new(config.memtable_capacity);

        // Resume the clock past every persisted timestamp so restarts
        // never reissue an ordering position.
        let clock = catalog
            .tables()
            .iter()
            .map(|t| t.max_timestamp())
            .max()
            .unwrap_or(0);

        let mut inner = Inner {
            wal,
            memtable,
            catalog,
            clock,
            last_flush_at: None,
            last_compaction_at: None,
            last_compaction_error: None,
        };

        // Replay unflushed mutations with their recorded timestamps and
        // sequence numbers; nothing is re-logged. If the memtable fills
        // mid-replay it is flushed like a live overflow, except the WAL
        // is kept intact until the next natural flush truncates it;
        // re-replay is idempotent because identical entries reconcile
        // to the same visible state.
        let records: Vec<_> = inner.wal.replay()?.collect();
        let replayed = records.len();
        for record in records {
            if inner.memtable.is_full() {
                flush_memtable(&mut inner, false)?;
            }
            inner.clock = inner.clock.max(record.timestamp);
            let entry = match record.op {
                WalOp::Put => Entry::put(
                    record.key,
                    record.value.unwrap_or_default(),
                    record.timestamp,
                    record.seq,
                ),
                WalOp::Delete => Entry::tombstone(record.key, record.timestamp, record.seq),
            };
            inner.memtable.insert(entry);
        }

        if replayed > 0 {
            tracing::info!(
                records = replayed,
                resident = inner.memtable.len(),
                "WAL replay complete"
            );
        }

        Ok(Self {
            config,
            _lock: lock,
            inner: RwLock::new(inner),
        })
    }

    /// Inserts or updates a key. Durable once this returns.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut inner = self.inner.write().unwrap();
        self.apply(&mut inner, key, Some(value))
    }

    /// Deletes a key by writing a tombstone. Durable once this returns.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut inner = self.inner.write().unwrap();
        self.apply(&mut inner, key, None)
    }

    /// Applies the key-value pairs in input order. Each mutation is
    /// logged individually; there is no all-or-nothing guarantee, so a
    /// crash (or an error) mid-batch may leave a prefix applied.
    pub fn batch_put(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for (key, value) in pairs {
            validate_key(key)?;
            self.apply(&mut inner, key, Some(value))?;
        }
        Ok(())
    }

    /// Returns the value for `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let inner = self.inner.read().unwrap();

        // The memtable holds the newest state; a resident tombstone
        // answers "not found" without touching any table.
        if let Some(entry) = inner.memtable.get(key) {
            return Ok(entry.value);
        }

        // Tables youngest to oldest, first hit wins; the key-range
        // check skips tables that cannot contain the key.
        for table in inner.catalog.tables() {
            if !table.may_contain(key) {
                continue;
            }
            if let Some(entry) = table.get(key) {
                return Ok(entry.value.clone());
            }
        }

        Ok(None)
    }

    /// Ascending scan over `[low, high]`, both bounds inclusive. Yields
    /// the latest live value per key; deleted keys are skipped.
    pub fn range(&self, low: &[u8], high: &[u8]) -> Result<RangeScan> {
        validate_key(low)?;
        validate_key(high)?;
        if low > high {
            return Err(crate::errinput!("inverted range bounds"));
        }

        let inner = self.inner.read().unwrap();
        let mut sources = vec![inner.memtable.entries_in(low, high)];
        for table in inner.catalog.tables() {
            if table.min_key() > high || table.max_key() < low {
                continue;
            }
            sources.push(table.range(low, high).to_vec());
        }

        Ok(RangeScan {
            merged: MergeIterator::new(sources),
        })
    }

    /// Flushes the memtable to an SSTable even if it is not full, then
    /// runs the usual compaction-trigger check. A no-op on an empty
    /// memtable.
    pub fn force_flush(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if flush_memtable(&mut inner, true)? {
            self.maybe_compact(&mut inner);
        }
        Ok(())
    }

    /// Runs compaction regardless of the table-count threshold.
    pub fn force_compact(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        compact(&mut inner, &self.config)
    }

    /// Snapshot of engine state for dashboards and diagnostics.
    pub fn stats(&self) -> Stats {
        let inner = self.inner.read().unwrap();

        let mut sources = vec![inner.memtable.entries()];
        for table in inner.catalog.tables() {
            sources.push(table.entries().to_vec());
        }
        let total_keys = MergeIterator::new(sources)
            .filter(|entry| !entry.is_tombstone())
            .count();

        Stats {
            total_keys,
            memtable_entries: inner.memtable.len(),
            sstable_count: inner.catalog.len(),
            tables: inner
                .catalog
                .tables()
                .iter()
                .map(|t| TableStats {
                    id: t.id(),
                    entries: t.len(),
                    size: t.size(),
                })
                .collect(),
            wal_records: inner.wal.record_count(),
            wal_size: inner.wal.size(),
            last_flush_at: inner.last_flush_at,
            last_compaction_at: inner.last_compaction_at,
            last_compaction_error: inner.last_compaction_error.clone(),
        }
    }

    /// Closes the store, releasing the directory lock. Every
    /// acknowledged write is already durable in the WAL or a table.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// The shared body of `put`/`delete`/`batch_put`. The caller has
    /// validated the key and holds the write lock.
    fn apply(&self, inner: &mut Inner, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if inner.memtable.is_full() {
            flush_memtable(inner, true)?;
            self.maybe_compact(inner);
        }

        inner.clock += 1;
        let timestamp = inner.clock;

        let op = match value {
            Some(_) => WalOp::Put,
            None => WalOp::Delete,
        };
        // The commit point: nothing is visible until this returns.
        let seq = inner.wal.append(op, key, value, timestamp)?;

        let entry = match value {
            Some(value) => Entry::put(key.to_vec(), value.to_vec(), timestamp, seq),
            None => Entry::tombstone(key.to_vec(), timestamp, seq),
        };
        inner.memtable.insert(entry);
        Ok(())
    }

    /// Runs compaction if the catalog crossed the threshold. Failures
    /// here never fail the triggering write; they surface through
    /// stats() and the log.
    fn maybe_compact(&self, inner: &mut Inner) {
        if inner.catalog.len() < self.config.compaction_threshold {
            return;
        }
        if let Err(e) = compact(inner, &self.config) {
            tracing::error!(error = %e, "compaction failed");
        }
    }
}

/// Seals the memtable into a new SSTable, returning whether anything
/// was flushed. On failure the drained entries are re-inserted (same
/// timestamps and sequences), restoring the pre-operation state; the
/// WAL still holds their records either way. `truncate_wal` is false
/// only during startup replay.
fn flush_memtable(inner: &mut Inner, truncate_wal: bool) -> Result<bool> {
    let entries = inner.memtable.drain_sorted();
    if entries.is_empty() {
        return Ok(false);
    }

    let (table_id, entry_count) = match inner.catalog.create_from(&entries, unix_now()) {
        Ok(table) => (table.id(), table.len()),
        Err(e) => {
            for entry in entries {
                inner.memtable.insert(entry);
            }
            return Err(e);
        }
    };

    if truncate_wal {
        inner.wal.truncate()?;
    }
    inner.last_flush_at = Some(SystemTime::now());

    tracing::info!(
        table_id = table_id,
        entries = entry_count,
        "memtable flushed"
    );
    Ok(true)
}

fn compact(inner: &mut Inner, config: &EngineConfig) -> Result<()> {
    match compaction::compact_all(&mut inner.catalog, config.sstable_max_entries, unix_now()) {
        Ok(_) => {
            inner.last_compaction_at = Some(SystemTime::now());
            inner.last_compaction_error = None;
            Ok(())
        }
        Err(e) => {
            inner.last_compaction_error = Some(e.to_string());
            Err(e)
        }
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(crate::errinput!("key must not be empty"));
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Ascending iterator over the live entries of a range scan. The
/// sources were copied out under the read lock, so iteration runs
/// without holding it; per-key reconciliation still guarantees the
/// latest entry at the moment the key was captured.
pub struct RangeScan {
    merged: MergeIterator,
}

impl Iterator for RangeScan {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.merged.next()?;
            if let Some(value) = entry.value {
                return Some((entry.key, value));
            }
        }
    }
}

/// Per-table numbers reported by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub id: u64,
    pub entries: usize,
    pub size: u64,
}

/// Engine state snapshot.
#[derive(Debug, Clone)]
pub struct Stats {
    /// Keys visible through the read path (tombstones excluded).
    pub total_keys: usize,
    pub memtable_entries: usize,
    pub sstable_count: usize,
    pub tables: Vec<TableStats>,
    pub wal_records: u64,
    pub wal_size: u64,
    pub last_flush_at: Option<SystemTime>,
    pub last_compaction_at: Option<SystemTime>,
    /// Message of the most recent failed compaction, cleared by the
    /// next successful one.
    pub last_compaction_error: Option<String>,
}
