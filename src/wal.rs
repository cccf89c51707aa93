//! Write-ahead log: the durability point of the engine.
//!
//! Every mutation is appended and fsynced here before it becomes visible
//! in the memtable. On startup the log is replayed to rebuild the
//! memtable contents that never made it into an SSTable.
//!
//! # File format
//!
//! ```text
//! +-------------------+
//! | Header (16 bytes) |
//! +-------------------+
//! | Record 1          |
//! +-------------------+
//! | Record 2          |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! ```
//!
//! Each record is a self-delimiting frame:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! with payload `seq:u64 | op:u8 | timestamp:u64 | key_len:u32 | key |
//! val_len:u32 | value`. All integers are big-endian. A truncated or
//! checksum-damaged frame marks the end of the log: it is the residue of
//! a crash mid-append, so the tail is dropped and every record before it
//! is replayed. The header persists the sequence counter across
//! `truncate()` so sequence numbers stay monotonic for the life of the
//! store.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: u32 = 0x454b_574c; // "EKWL"
const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 16;

const OP_PUT: u8 = 0x01;
const OP_DELETE: u8 = 0x02;

/// Operation kind carried by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Put,
    Delete,
}

/// A single replayed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub seq: u64,
    pub op: WalOp,
    pub timestamp: u64,
    pub key: Vec<u8>,
    /// Always `None` for deletes.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Header {
    magic: u32,
    version: u32,
    next_seq: u64,
}

impl Header {
    fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            next_seq: 1,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        (&mut buf[0..4]).write_u32::<BigEndian>(self.magic).unwrap();
        (&mut buf[4..8])
            .write_u32::<BigEndian>(self.version)
            .unwrap();
        (&mut buf[8..16])
            .write_u64::<BigEndian>(self.next_seq)
            .unwrap();
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = (&buf[0..4]).read_u32::<BigEndian>()?;
        let version = (&buf[4..8]).read_u32::<BigEndian>()?;
        let next_seq = (&buf[8..16]).read_u64::<BigEndian>()?;

        if magic != MAGIC {
            return Err(Error::Corruption("bad WAL magic".to_string()));
        }
        if version != VERSION {
            return Err(Error::Corruption(format!(
                "unsupported WAL version {version}"
            )));
        }
        Ok(Self {
            magic,
            version,
            next_seq,
        })
    }
}

/// Append-only durable log of mutations. Owned by the engine and
/// serialized under its mutation lock; not internally concurrent.
#[derive(Debug)]
pub struct Wal {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    next_seq: u64,
    record_count: u64,
}

impl Wal {
    /// Opens or creates the log. Recovers the sequence counter from the
    /// header and the surviving records, and physically drops a torn
    /// tail left by a crash mid-append.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut writer = BufWriter::new(file.try_clone()?);

        let header = if file.metadata()?.len() == 0 {
            let header = Header::new();
            writer.write_all(&header.encode())?;
            writer.flush()?;
            file.sync_all()?;
            header
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let mut reader = BufReader::new(file.try_clone()?);
            reader.read_exact(&mut buf).map_err(|_| {
                Error::Corruption(format!("short WAL header in {}", path.display()))
            })?;
            Header::decode(&buf)?
        };

        // Scan the records once: find where the well-formed prefix ends,
        // the largest sequence number in it, and how many records it has.
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        let mut valid_len = HEADER_SIZE as u64;
        let mut max_seq = 0u64;
        let mut record_count = 0u64;
        loop {
            match read_record(&mut reader) {
                Ok(Some((record, frame_len))) => {
                    valid_len += frame_len;
                    max_seq = max_seq.max(record.seq);
                    record_count += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = valid_len,
                        "dropping torn WAL tail"
                    );
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        writer.get_mut().seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            file,
            writer,
            path,
            next_seq: header.next_seq.max(max_seq + 1),
            record_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records currently in the log.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    /// Appends one mutation and flushes it to disk before returning.
    /// Returns the assigned, strictly increasing sequence number. On an
    /// IO error the mutation is considered not acknowledged.
    pub fn append(
        &mut self,
        op: WalOp,
        key: &[u8],
        value: Option<&[u8]>,
        timestamp: u64,
    ) -> Result<u64> {
        let seq = self.next_seq;

        let mut payload = Vec::with_capacity(25 + key.len() + value.map_or(0, |v| v.len()));
        payload.write_u64::<BigEndian>(seq)?;
        payload.write_u8(match op {
            WalOp::Put => OP_PUT,
            WalOp::Delete => OP_DELETE,
        })?;
        payload.write_u64::<BigEndian>(timestamp)?;
        payload.write_u32::<BigEndian>(key.len() as u32)?;
        payload.extend_from_slice(key);
        let value = value.unwrap_or(&[]);
        payload.write_u32::<BigEndian>(value.len() as u32)?;
        payload.extend_from_slice(value);

        // Cloned handles share one file offset with replay readers, so
        // position explicitly at the end before every append.
        self.writer.get_mut().seek(SeekFrom::End(0))?;
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(&payload)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        self.writer.flush()?;
        self.file.sync_all()?;

        self.next_seq += 1;
        self.record_count += 1;
        Ok(seq)
    }

    /// Yields the surviving records in append order. A torn or damaged
    /// trailing frame ends iteration; everything before it is yielded.
    pub fn replay(&self) -> Result<ReplayIterator> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(ReplayIterator {
            reader,
            path: self.path.clone(),
            done: false,
        })
    }

    /// Discards every record. Called after a successful flush has made
    /// them redundant. The sequence counter survives via the header.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(HEADER_SIZE as u64)?;

        let header = Header {
            magic: MAGIC,
            version: VERSION,
            next_seq: self.next_seq,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;

        self.writer.get_mut().seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        self.record_count = 0;
        Ok(())
    }
}

/// Reads one frame. `Ok(None)` is a clean end of log; any error means
/// the frame is torn or damaged and the log ends here.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<(WalRecord, u64)>> {
    let payload_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .map_err(|_| Error::Corruption("torn WAL record payload".to_string()))?;

    let stored_crc = reader
        .read_u32::<BigEndian>()
        .map_err(|_| Error::Corruption("torn WAL record checksum".to_string()))?;

    if CRC32.checksum(&payload) != stored_crc {
        return Err(Error::Corruption("WAL record checksum mismatch".to_string()));
    }

    let mut cursor = Cursor::new(payload.as_slice());
    let seq = cursor.read_u64::<BigEndian>()?;
    let op = match cursor.read_u8()? {
        OP_PUT => WalOp::Put,
        OP_DELETE => WalOp::Delete,
        other => return Err(crate::errdata!("unknown WAL op: {other:#04x}")),
    };
    let timestamp = cursor.read_u64::<BigEndian>()?;

    let key_len = cursor.read_u32::<BigEndian>()? as usize;
    let mut key = vec![0u8; key_len];
    cursor.read_exact(&mut key)?;

    let value_len = cursor.read_u32::<BigEndian>()? as usize;
    let mut value = vec![0u8; value_len];
    cursor.read_exact(&mut value)?;

    let value = match op {
        WalOp::Put => Some(value),
        WalOp::Delete => None,
    };

    let frame_len = 4 + payload_len as u64 + 4;
    Ok(Some((
        WalRecord {
            seq,
            op,
            timestamp,
            key,
            value,
        },
        frame_len,
    )))
}

pub struct ReplayIterator {
    reader: BufReader<File>,
    path: PathBuf,
    done: bool,
}

impl Iterator for ReplayIterator {
    type Item = WalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record(&mut self.reader) {
            Ok(Some((record, _))) => Some(record),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "stopping WAL replay at damaged tail");
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn wal_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("wal.log")
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(wal_path(&dir)).unwrap();

        assert_eq!(wal.append(WalOp::Put, b"a", Some(b"1"), 1).unwrap(), 1);
        assert_eq!(wal.append(WalOp::Put, b"b", Some(b"2"), 2).unwrap(), 2);
        assert_eq!(wal.append(WalOp::Delete, b"a", None, 3).unwrap(), 3);

        let records: Vec<_> = wal.replay().unwrap().collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, b"a");
        assert_eq!(records[0].value, Some(b"1".to_vec()));
        assert_eq!(records[1].seq, 2);
        assert_eq!(records[2].op, WalOp::Delete);
        assert_eq!(records[2].value, None);
        assert_eq!(wal.record_count(), 3);
    }

    #[test]
    fn test_replay_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(wal_path(&dir)).unwrap();
        assert_eq!(wal.replay().unwrap().count(), 0);
    }

    #[test]
    fn test_torn_tail_dropped_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(WalOp::Put, b"a", Some(b"1"), 1).unwrap();
            wal.append(WalOp::Put, b"b", Some(b"2"), 2).unwrap();
        }

        // Simulate a crash mid-append: a frame that claims more bytes
        // than the file holds.
        {
            let mut file = File::options().append(true).open(&path).unwrap();
            file.write_all(&[0x00, 0x00, 0x01, 0x00, 0xde, 0xad]).unwrap();
        }
        let damaged_len = std::fs::metadata(&path).unwrap().len();

        let wal = Wal::open(&path).unwrap();
        let records: Vec<_> = wal.replay().unwrap().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].key, b"b");
        assert!(wal.size() < damaged_len, "torn tail not truncated");
    }

    #[test]
    fn test_checksum_damage_ends_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(WalOp::Put, b"a", Some(b"1"), 1).unwrap();
            wal.append(WalOp::Put, b"b", Some(b"2"), 2).unwrap();
        }

        // Flip a byte inside the second record's payload.
        {
            let data = std::fs::read(&path).unwrap();
            let mut damaged = data.clone();
            let second_record_at = data.len() - 5;
            damaged[second_record_at] ^= 0xff;
            std::fs::write(&path, damaged).unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        let records: Vec<_> = wal.replay().unwrap().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"a");
    }

    #[test]
    fn test_truncate_preserves_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(WalOp::Put, b"a", Some(b"1"), 1).unwrap();
        wal.append(WalOp::Put, b"b", Some(b"2"), 2).unwrap();

        wal.truncate().unwrap();
        assert_eq!(wal.record_count(), 0);
        assert_eq!(wal.replay().unwrap().count(), 0);

        // Sequence numbers continue after truncation, and survive reopen.
        assert_eq!(wal.append(WalOp::Put, b"c", Some(b"3"), 3).unwrap(), 3);
        drop(wal);

        let mut wal = Wal::open(&path).unwrap();
        assert_eq!(wal.append(WalOp::Put, b"d", Some(b"4"), 4).unwrap(), 4);
    }

    #[test]
    fn test_sequence_recovered_from_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 1..=3u64 {
                wal.append(WalOp::Put, format!("k{i}").as_bytes(), Some(b"v"), i)
                    .unwrap();
            }
        }

        // The header still says next_seq = 1; the scan must win.
        let mut wal = Wal::open(&path).unwrap();
        assert_eq!(wal.append(WalOp::Put, b"k4", Some(b"v"), 4).unwrap(), 4);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);
        std::fs::write(&path, b"not a wal file at all").unwrap();

        assert!(matches!(Wal::open(&path), Err(Error::Corruption(_))));
    }
}
