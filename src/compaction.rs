//! Compaction: merging the whole catalog into fresh tables.
//!
//! The policy is compact-all. Every live table feeds the k-way merge,
//! one entry per key survives (largest `(timestamp, seq)`), and
//! tombstone winners are dropped outright: no table outside the input
//! set exists, so nothing older can resurface a deleted key. The
//! surviving stream is split into runs of at most the configured table
//! size, each run sorted with a key range disjoint from its neighbors,
//! and ids are assigned in output order so the catalog's youngest-first
//! rule stays intact.
//!
//! Output files are written first (each atomically); a single manifest
//! edit then swaps the input set for the output set. A failure anywhere
//! before that edit aborts the compaction with the catalog unchanged,
//! leaving at most orphan files for the next startup to sweep.

use itertools::Itertools;

use crate::entry::Entry;
use crate::error::Result;
use crate::iterator::MergeIterator;
use crate::sstable::{Catalog, Table};

/// Outcome summary for logs and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSummary {
    pub tables_in: usize,
    pub tables_out: usize,
    pub entries_in: usize,
    pub entries_out: usize,
    pub tombstones_dropped: usize,
}

/// Merges every live table into ≤ `max_entries`-sized replacements.
/// No-op on an empty catalog.
pub fn compact_all(
    catalog: &mut Catalog,
    max_entries: usize,
    created_at: u64,
) -> Result<CompactionSummary> {
    let (deleted, sources, entries_in) = {
        let tables = catalog.tables();
        let deleted: Vec<u64> = tables.iter().map(|t| t.id()).collect();
        let sources: Vec<Vec<Entry>> = tables.iter().map(|t| t.entries().to_vec()).collect();
        let entries_in: usize = tables.iter().map(|t| t.len()).sum();
        (deleted, sources, entries_in)
    };

    if deleted.is_empty() {
        return Ok(CompactionSummary {
            tables_in: 0,
            tables_out: 0,
            entries_in: 0,
            entries_out: 0,
            tombstones_dropped: 0,
        });
    }

    let mut tombstones_dropped = 0usize;
    let survivors = MergeIterator::new(sources).filter(|entry| {
        if entry.is_tombstone() {
            tombstones_dropped += 1;
            false
        } else {
            true
        }
    });

    let mut new_tables: Vec<Table> = Vec::new();
    let mut entries_out = 0usize;
    for chunk in &survivors.chunks(max_entries) {
        let run: Vec<Entry> = chunk.collect();
        entries_out += run.len();
        let id = catalog.allocate_table_id();
        let table = Table::write(id, &run, catalog.table_path(id), created_at)?;
        new_tables.push(table);
    }

    let summary = CompactionSummary {
        tables_in: deleted.len(),
        tables_out: new_tables.len(),
        entries_in,
        entries_out,
        tombstones_dropped,
    };

    catalog.replace(&deleted, new_tables)?;

    tracing::info!(
        tables_in = summary.tables_in,
        tables_out = summary.tables_out,
        entries_in = summary.entries_in,
        entries_out = summary.entries_out,
        tombstones_dropped = summary.tombstones_dropped,
        "compaction committed"
    );

    Ok(summary)
}
