//! Registry of live SSTables.
//!
//! The catalog owns every table file in the data directory. Tables are
//! ordered youngest first (ids strictly increase for the life of the
//! store, so youngest means largest id), which is the order the read
//! path consults them in. All creation and deletion of table files goes
//! through the catalog so that the manifest stays the single source of
//! truth: on startup the manifest is replayed, files it does not list
//! are deleted as failed-compaction debris, and every listed file is
//! opened and verified against its recorded metadata.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::manifest::{Manifest, TableMeta, VersionEdit};
use super::table::Table;
use crate::entry::Entry;
use crate::error::Result;
use crate::Error;

const MANIFEST_FILE: &str = "MANIFEST";

pub struct Catalog {
    dir: PathBuf,
    manifest: Manifest,
    /// Live tables, youngest (largest id) first.
    tables: Vec<Table>,
}

impl Catalog {
    /// Opens the catalog in `dir`, replaying the manifest, removing
    /// orphan table files, and verifying every live table against its
    /// recorded metadata.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut manifest = Manifest::open(dir.join(MANIFEST_FILE))?;
        let metas = manifest.replay()?;

        let live_ids: HashSet<u64> = metas.iter().map(|m| m.id).collect();
        remove_orphans(&dir, &live_ids)?;

        let mut tables = Vec::with_capacity(metas.len());
        for meta in &metas {
            let path = table_path(&dir, meta.id);
            let table = Table::open(&path)?;
            if table.id() != meta.id || table.len() as u64 != meta.entry_count {
                return Err(Error::Corruption(format!(
                    "SSTable {} disagrees with manifest (id {} count {}, expected id {} count {})",
                    path.display(),
                    table.id(),
                    table.len(),
                    meta.id,
                    meta.entry_count
                )));
            }
            tables.push(table);
        }

        tracing::info!(
            dir = %dir.display(),
            tables = tables.len(),
            "catalog opened"
        );

        Ok(Self {
            dir,
            manifest,
            tables,
        })
    }

    /// Live tables, youngest first.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Writes `entries` as a fresh table and publishes it at the head of
    /// the catalog. The manifest append is the commit point; if it
    /// fails, the written file is left as an orphan for the next open.
    pub fn create_from(&mut self, entries: &[Entry], created_at: u64) -> Result<&Table> {
        let id = self.manifest.allocate_table_id();
        let table = Table::write(id, entries, table_path(&self.dir, id), created_at)?;
        self.manifest.append(&VersionEdit::Flush {
            table: TableMeta::of(&table),
        })?;
        self.tables.insert(0, table);
        Ok(&self.tables[0])
    }

    /// Allocates an id for a compaction output table.
    pub fn allocate_table_id(&mut self) -> u64 {
        self.manifest.allocate_table_id()
    }

    /// Path a table with `id` lives at.
    pub fn table_path(&self, id: u64) -> PathBuf {
        table_path(&self.dir, id)
    }

    /// Atomically swaps `deleted` for `new_tables`: one fsynced manifest
    /// edit commits the change, then the in-memory list is updated and
    /// the obsolete files are removed. The catalog never observably
    /// contains both the old and new sets, nor neither.
    pub fn replace(&mut self, deleted: &[u64], new_tables: Vec<Table>) -> Result<()> {
        let added: Vec<TableMeta> = new_tables.iter().map(TableMeta::of).collect();
        self.manifest.append(&VersionEdit::Compact {
            deleted: deleted.to_vec(),
            added,
        })?;

        let mut obsolete = Vec::new();
        self.tables.retain(|table| {
            if deleted.contains(&table.id()) {
                obsolete.push(table.path().to_path_buf());
                false
            } else {
                true
            }
        });
        self.tables.extend(new_tables);
        self.tables.sort_by(|a, b| b.id().cmp(&a.id()));

        for path in obsolete {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete obsolete SSTable");
            }
        }
        Ok(())
    }

    /// Removes a single table (bookkeeping primitive).
    pub fn remove(&mut self, id: u64) -> Result<()> {
        self.replace(&[id], Vec::new())
    }
}

fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:08}.sst"))
}

/// Deletes `.sst` files the manifest does not list. They are debris from
/// a flush or compaction that crashed before its commit point.
fn remove_orphans(dir: &Path, live_ids: &HashSet<u64>) -> Result<()> {
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let is_sst = path.extension().and_then(|e| e.to_str()) == Some("sst");
        if !is_sst {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok());
        match id {
            Some(id) if live_ids.contains(&id) => {}
            _ => {
                tracing::warn!(path = %path.display(), "removing orphan SSTable file");
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}
