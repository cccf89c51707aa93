//! A single immutable SSTable file.
//!
//! ## File layout
//!
//! ```text
//! +----------------------------------------+
//! | magic:u32 | version:u32                |
//! | id:u64 | entry_count:u32 | created:u64 |
//! | min_key_len:u32 | min_key              |
//! | max_key_len:u32 | max_key              |
//! +----------------------------------------+
//! | entries, ascending key order           |
//! +----------------------------------------+
//! | crc32:u32 over everything above        |
//! +----------------------------------------+
//! ```
//!
//! Tables are small enough (≤ 30 entries) that the whole file is loaded
//! and verified on open; `get` is a binary search over the in-memory
//! entries and `range` a slice scan. Creation is atomic: the file is
//! written to a `.tmp` sibling, fsynced, then renamed into place, so a
//! partial file can never become visible to the catalog.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::entry::Entry;
use crate::error::Result;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: u32 = 0x454b_5354; // "EKST"
const VERSION: u32 = 1;

/// An immutable sorted table, fully resident in memory for its lifetime.
pub struct Table {
    id: u64,
    path: PathBuf,
    entries: Vec<Entry>,
    created_at: u64,
    max_timestamp: u64,
    size: u64,
}

impl Table {
    /// Atomically materializes `entries` (non-empty, strictly ascending
    /// by key) at `path` and returns the live handle.
    pub fn write(id: u64, entries: &[Entry], path: impl Into<PathBuf>, created_at: u64) -> Result<Self> {
        let path = path.into();

        if entries.is_empty() {
            return Err(crate::errdata!("refusing to write empty SSTable {id}"));
        }
        for pair in entries.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(crate::errdata!(
                    "SSTable {id} input not strictly ascending"
                ));
            }
        }

        let min_key = &entries[0].key;
        let max_key = &entries[entries.len() - 1].key;

        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(MAGIC)?;
        buf.write_u32::<BigEndian>(VERSION)?;
        buf.write_u64::<BigEndian>(id)?;
        buf.write_u32::<BigEndian>(entries.len() as u32)?;
        buf.write_u64::<BigEndian>(created_at)?;
        buf.write_u32::<BigEndian>(min_key.len() as u32)?;
        buf.extend_from_slice(min_key);
        buf.write_u32::<BigEndian>(max_key.len() as u32)?;
        buf.extend_from_slice(max_key);
        for entry in entries {
            entry.encode_into(&mut buf);
        }
        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum)?;

        // Temp sibling + rename keeps partial writes invisible.
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        let max_timestamp = entries.iter().map(|e| e.timestamp).max().unwrap_or(0);

        Ok(Self {
            id,
            path,
            entries: entries.to_vec(),
            created_at,
            max_timestamp,
            size: buf.len() as u64,
        })
    }

    /// Opens and fully verifies an existing table file. Any mismatch is
    /// a corruption error fatal for this table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = fs::read(&path)?;
        let display = path.display();

        if data.len() < 4 {
            return Err(Error::Corruption(format!("SSTable {display} too short")));
        }

        let body_len = data.len() - 4;
        let stored_crc = (&data[body_len..]).read_u32::<BigEndian>()?;
        if CRC32.checksum(&data[..body_len]) != stored_crc {
            return Err(Error::Corruption(format!(
                "SSTable {display} checksum mismatch"
            )));
        }

        let mut cursor = Cursor::new(&data[..body_len]);
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::Corruption(format!("SSTable {display} bad magic")));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::Corruption(format!(
                "SSTable {display} unsupported version {version}"
            )));
        }

        let id = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u32::<BigEndian>()? as usize;
        let created_at = cursor.read_u64::<BigEndian>()?;

        let min_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut min_key = vec![0u8; min_key_len];
        cursor.read_exact(&mut min_key)?;
        let max_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut max_key = vec![0u8; max_key_len];
        cursor.read_exact(&mut max_key)?;

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let slice = &data[cursor.position() as usize..body_len];
            let mut entry_cursor = Cursor::new(slice);
            let entry = Entry::decode_from(&mut entry_cursor)
                .map_err(|e| Error::Corruption(format!("SSTable {display}: {e}")))?;
            cursor.set_position(cursor.position() + entry_cursor.position());
            entries.push(entry);
        }
        if cursor.position() as usize != body_len {
            return Err(Error::Corruption(format!(
                "SSTable {display} has trailing bytes"
            )));
        }

        for pair in entries.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(Error::Corruption(format!(
                    "SSTable {display} entries out of order"
                )));
            }
        }
        let header_bounds_ok = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => first.key == min_key && last.key == max_key,
            _ => false,
        };
        if !header_bounds_ok {
            return Err(Error::Corruption(format!(
                "SSTable {display} header key range disagrees with entries"
            )));
        }

        let max_timestamp = entries.iter().map(|e| e.timestamp).max().unwrap_or(0);
        let size = data.len() as u64;

        Ok(Self {
            id,
            path,
            entries,
            created_at,
            max_timestamp,
            size,
        })
    }

    /// Returns the entry for exactly this key, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Raw entries with keys in `[low, high]`, ascending. Tombstone
    /// filtering is the engine's responsibility.
    pub fn range(&self, low: &[u8], high: &[u8]) -> &[Entry] {
        let start = self.entries.partition_point(|e| e.key.as_slice() < low);
        let end = self.entries.partition_point(|e| e.key.as_slice() <= high);
        &self.entries[start..end]
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn min_key(&self) -> &[u8] {
        &self.entries[0].key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.entries[self.entries.len() - 1].key
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Key-range check used to skip tables that cannot hold `key`.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        key >= self.min_key() && key <= self.max_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<Entry> {
        vec![
            Entry::put(b"apple".to_vec(), b"fruit".to_vec(), 1, 1),
            Entry::tombstone(b"banana".to_vec(), 2, 2),
            Entry::put(b"cherry".to_vec(), b"fruit".to_vec(), 3, 3),
            Entry::put(b"damson".to_vec(), b"fruit".to_vec(), 4, 4),
        ]
    }

    #[test]
    fn test_write_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000007.sst");

        let entries = sample_entries();
        let written = Table::write(7, &entries, &path, 1700000000).unwrap();
        assert_eq!(written.id(), 7);
        assert_eq!(written.len(), 4);
        assert_eq!(written.max_timestamp(), 4);

        let opened = Table::open(&path).unwrap();
        assert_eq!(opened.id(), 7);
        assert_eq!(opened.created_at(), 1700000000);
        assert_eq!(opened.entries(), entries.as_slice());
        assert_eq!(opened.min_key(), b"apple");
        assert_eq!(opened.max_key(), b"damson");
    }

    #[test]
    fn test_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.sst");
        let table = Table::write(1, &sample_entries(), &path, 0).unwrap();

        assert_eq!(table.get(b"apple").unwrap().value, Some(b"fruit".to_vec()));
        assert!(table.get(b"banana").unwrap().is_tombstone());
        assert!(table.get(b"blueberry").is_none());
    }

    #[test]
    fn test_range_is_inclusive_and_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.sst");
        let table = Table::write(1, &sample_entries(), &path, 0).unwrap();

        let hits = table.range(b"banana", b"cherry");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].is_tombstone(), "range must return raw entries");
        assert_eq!(hits[1].key, b"cherry");

        assert!(table.range(b"x", b"z").is_empty());
    }

    #[test]
    fn test_may_contain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.sst");
        let table = Table::write(1, &sample_entries(), &path, 0).unwrap();

        assert!(table.may_contain(b"apple"));
        assert!(table.may_contain(b"blueberry"));
        assert!(!table.may_contain(b"aardvark"));
        assert!(!table.may_contain(b"elderberry"));
    }

    #[test]
    fn test_rejects_unsorted_and_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.sst");

        assert!(Table::write(1, &[], &path, 0).is_err());

        let unsorted = vec![
            Entry::put(b"b".to_vec(), b"2".to_vec(), 1, 1),
            Entry::put(b"a".to_vec(), b"1".to_vec(), 2, 2),
        ];
        assert!(Table::write(1, &unsorted, &path, 0).is_err());
        assert!(!path.exists(), "failed write must not leave a file");
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.sst");
        Table::write(1, &sample_entries(), &path, 0).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.sst");
        Table::write(1, &sample_entries(), &path, 0).unwrap();

        let mut data = fs::read(&path).unwrap();
        let middle = data.len() / 2;
        data[middle] ^= 0xff;
        fs::write(&path, data).unwrap();

        assert!(matches!(Table::open(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_truncated_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.sst");
        Table::write(1, &sample_entries(), &path, 0).unwrap();

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 7]).unwrap();

        assert!(matches!(Table::open(&path), Err(Error::Corruption(_))));
    }
}
