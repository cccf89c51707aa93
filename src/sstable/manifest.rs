//! Append-only log of catalog edits.
//!
//! The manifest is a WAL for metadata: while the data WAL records
//! key-value mutations, the manifest records changes to the set of live
//! SSTables. Replaying it on startup rebuilds the catalog exactly.
//!
//! # File format
//!
//! ```text
//! +-------------------+
//! | Header (16 bytes) |      magic | version | next_table_id
//! +-------------------+
//! | Edit 1            |      length:u32 | payload | crc32:u32
//! +-------------------+
//! | ...               |
//! +-------------------+
//! ```
//!
//! Two edit kinds exist. `Flush` publishes one new table at the head of
//! the catalog. `Compact` atomically swaps a set of tables for the
//! compaction output; because the whole swap is one fsynced append, the
//! record itself is the commit point: a crash before it leaves the old
//! set intact (the new files are orphans), a crash after it shows the
//! new set only.
//!
//! A torn trailing edit is the residue of a crash mid-append and is
//! dropped on open, like the data WAL's tail; the table it described is
//! collected as an orphan.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::Result;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: u32 = 0x454b_4d46; // "EKMF"
const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 16;

const FLUSH: u8 = 0x01;
const COMPACT: u8 = 0x02;

/// Catalog-visible metadata of one live table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub id: u64,
    pub entry_count: u64,
    pub size: u64,
    pub created_at: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl TableMeta {
    pub fn of(table: &super::Table) -> Self {
        Self {
            id: table.id(),
            entry_count: table.len() as u64,
            size: table.size(),
            created_at: table.created_at(),
            min_key: table.min_key().to_vec(),
            max_key: table.max_key().to_vec(),
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.id).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.created_at).unwrap();
        buf.write_u32::<BigEndian>(self.min_key.len() as u32).unwrap();
        buf.extend_from_slice(&self.min_key);
        buf.write_u32::<BigEndian>(self.max_key.len() as u32).unwrap();
        buf.extend_from_slice(&self.max_key);
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let created_at = cursor.read_u64::<BigEndian>()?;

        let min_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut min_key = vec![0u8; min_key_len];
        cursor.read_exact(&mut min_key)?;

        let max_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut max_key = vec![0u8; max_key_len];
        cursor.read_exact(&mut max_key)?;

        Ok(Self {
            id,
            entry_count,
            size,
            created_at,
            min_key,
            max_key,
        })
    }
}

/// One atomic change to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionEdit {
    /// A memtable flush published `table` at the head of the catalog.
    Flush { table: TableMeta },
    /// A compaction replaced `deleted` with `added`, atomically.
    Compact {
        deleted: Vec<u64>,
        added: Vec<TableMeta>,
    },
}

impl VersionEdit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            VersionEdit::Flush { table } => {
                buf.write_u8(FLUSH).unwrap();
                table.encode_into(&mut buf);
            }
            VersionEdit::Compact { deleted, added } => {
                buf.write_u8(COMPACT).unwrap();
                buf.write_u32::<BigEndian>(deleted.len() as u32).unwrap();
                for id in deleted {
                    buf.write_u64::<BigEndian>(*id).unwrap();
                }
                buf.write_u32::<BigEndian>(added.len() as u32).unwrap();
                for table in added {
                    table.encode_into(&mut buf);
                }
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        match cursor.read_u8()? {
            FLUSH => {
                let table = TableMeta::decode_from(&mut cursor)?;
                Ok(VersionEdit::Flush { table })
            }
            COMPACT => {
                let deleted_count = cursor.read_u32::<BigEndian>()? as usize;
                let mut deleted = Vec::with_capacity(deleted_count);
                for _ in 0..deleted_count {
                    deleted.push(cursor.read_u64::<BigEndian>()?);
                }
                let added_count = cursor.read_u32::<BigEndian>()? as usize;
                let mut added = Vec::with_capacity(added_count);
                for _ in 0..added_count {
                    added.push(TableMeta::decode_from(&mut cursor)?);
                }
                Ok(VersionEdit::Compact { deleted, added })
            }
            other => Err(crate::errdata!("unknown manifest edit type: {other:#04x}")),
        }
    }
}

/// The manifest log plus the persisted table-id counter.
pub struct Manifest {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    next_table_id: u64,
}

impl Manifest {
    /// Opens or creates the manifest, validating the header and dropping
    /// a torn trailing edit.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut writer = BufWriter::new(file.try_clone()?);

        let next_table_id = if file.metadata()?.len() == 0 {
            let mut buf = Vec::with_capacity(HEADER_SIZE);
            buf.write_u32::<BigEndian>(MAGIC)?;
            buf.write_u32::<BigEndian>(VERSION)?;
            buf.write_u64::<BigEndian>(0)?;
            writer.write_all(&buf)?;
            writer.flush()?;
            file.sync_all()?;
            0
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let mut reader = BufReader::new(file.try_clone()?);
            reader.read_exact(&mut buf).map_err(|_| {
                Error::Corruption(format!("short manifest header in {}", path.display()))
            })?;
            let magic = (&buf[0..4]).read_u32::<BigEndian>()?;
            if magic != MAGIC {
                return Err(Error::Corruption("bad manifest magic".to_string()));
            }
            let version = (&buf[4..8]).read_u32::<BigEndian>()?;
            if version != VERSION {
                return Err(Error::Corruption(format!(
                    "unsupported manifest version {version}"
                )));
            }
            (&buf[8..16]).read_u64::<BigEndian>()?
        };

        // Find where the well-formed prefix ends; anything after it is a
        // crash residue and is physically dropped.
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut valid_len = HEADER_SIZE as u64;
        loop {
            match read_edit(&mut reader) {
                Ok(Some((_, frame_len))) => valid_len += frame_len,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = valid_len,
                        "dropping torn manifest tail"
                    );
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        Ok(Self {
            file,
            writer,
            path,
            next_table_id,
        })
    }

    /// Allocates the next table id. The new counter value is persisted
    /// by the append that publishes the table.
    pub fn allocate_table_id(&mut self) -> u64 {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }

    /// Appends one edit and fsyncs it together with the refreshed
    /// header. Returns only after the edit is durable: this is the
    /// commit point for the catalog change it describes.
    pub fn append(&mut self, edit: &VersionEdit) -> Result<()> {
        let payload = edit.encode();

        self.writer.get_mut().seek(SeekFrom::End(0))?;
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(&payload)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        self.writer.flush()?;

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.write_u32::<BigEndian>(MAGIC)?;
        header.write_u32::<BigEndian>(VERSION)?;
        header.write_u64::<BigEndian>(self.next_table_id)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_all()?;

        Ok(())
    }

    /// Folds every edit into the list of live tables, youngest (largest
    /// id) first, and advances the id counter past everything seen.
    pub fn replay(&mut self) -> Result<Vec<TableMeta>> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        let mut live: Vec<TableMeta> = Vec::new();
        let mut max_id_seen: Option<u64> = None;
        loop {
            let edit = match read_edit(&mut reader) {
                Ok(Some((edit, _))) => edit,
                Ok(None) => break,
                // open() already truncated the tail; damage here is real.
                Err(e) => {
                    return Err(Error::Corruption(format!(
                        "manifest {}: {e}",
                        self.path.display()
                    )))
                }
            };
            match edit {
                VersionEdit::Flush { table } => {
                    max_id_seen = Some(max_id_seen.map_or(table.id, |m| m.max(table.id)));
                    live.push(table);
                }
                VersionEdit::Compact { deleted, added } => {
                    live.retain(|t| !deleted.contains(&t.id));
                    for table in added {
                        max_id_seen = Some(max_id_seen.map_or(table.id, |m| m.max(table.id)));
                        live.push(table);
                    }
                }
            }
        }

        live.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(max_id) = max_id_seen {
            self.next_table_id = self.next_table_id.max(max_id + 1);
        }
        Ok(live)
    }
}

/// Reads one framed edit; `Ok(None)` is a clean end of log, any error a
/// torn or damaged frame.
fn read_edit<R: Read>(reader: &mut R) -> Result<Option<(VersionEdit, u64)>> {
    let payload_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .map_err(|_| Error::Corruption("torn manifest edit".to_string()))?;

    let stored_crc = reader
        .read_u32::<BigEndian>()
        .map_err(|_| Error::Corruption("torn manifest checksum".to_string()))?;
    if CRC32.checksum(&payload) != stored_crc {
        return Err(Error::Corruption(
            "manifest edit checksum mismatch".to_string(),
        ));
    }

    let edit = VersionEdit::decode(&payload)?;
    Ok(Some((edit, 4 + payload_len as u64 + 4)))
}
