//! The entry type shared by every layer of the tree, and its on-disk
//! encoding.
//!
//! An entry pairs a key with either a live value or a tombstone
//! (`value == None`), stamped with the engine's logical timestamp and the
//! WAL sequence number that recorded it. When a key is present in more
//! than one layer, the copy with the largest `(timestamp, seq)` wins.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::Result;

const FLAG_LIVE: u8 = 0x00;
const FLAG_TOMBSTONE: u8 = 0x01;

/// A single key-value mutation as stored in the memtable and SSTables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    /// `None` marks the key as deleted.
    pub value: Option<Vec<u8>>,
    /// Logical timestamp assigned by the engine at write time.
    pub timestamp: u64,
    /// WAL sequence number, breaks timestamp ties.
    pub seq: u64,
}

impl Entry {
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: u64, seq: u64) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp,
            seq,
        }
    }

    pub fn tombstone(key: Vec<u8>, timestamp: u64, seq: u64) -> Self {
        Self {
            key,
            value: None,
            timestamp,
            seq,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Ordering key for reconciling duplicates across layers.
    pub fn recency(&self) -> (u64, u64) {
        (self.timestamp, self.seq)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.key.len() as u32).unwrap();
        buf.extend_from_slice(&self.key);

        let flag = if self.is_tombstone() {
            FLAG_TOMBSTONE
        } else {
            FLAG_LIVE
        };
        buf.write_u8(flag).unwrap();
        buf.write_u64::<BigEndian>(self.timestamp).unwrap();
        buf.write_u64::<BigEndian>(self.seq).unwrap();

        let value = self.value.as_deref().unwrap_or(&[]);
        buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
        buf.extend_from_slice(value);
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;

        let flag = cursor.read_u8()?;
        let timestamp = cursor.read_u64::<BigEndian>()?;
        let seq = cursor.read_u64::<BigEndian>()?;

        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value)?;

        let value = match flag {
            FLAG_TOMBSTONE => None,
            FLAG_LIVE => Some(value),
            other => return Err(crate::errdata!("unknown entry flag: {other:#04x}")),
        };

        Ok(Self {
            key,
            value,
            timestamp,
            seq,
        })
    }
}
