//! emberkv is an embedded, single-node, durable ordered key-value store
//! built on a Log-Structured Merge tree.
//!
//! # Architecture
//!
//! ```text
//!            write                         read
//!              │                             │
//!              ▼                             ▼
//!      ┌──────────────┐              ┌──────────────┐
//!      │  WAL (fsync) │              │   memtable   │
//!      └──────┬───────┘              └──────┬───────┘
//!             ▼                             ▼ miss
//!      ┌──────────────┐              ┌──────────────┐
//!      │   memtable   │──full/flush─►│   SSTables   │ youngest → oldest
//!      └──────────────┘              └──────┬───────┘
//!                                           ▼ ≥ 5 tables
//!                                    ┌──────────────┐
//!                                    │  compaction  │ merge + tombstone GC
//!                                    └──────────────┘
//! ```
//!
//! Every mutation is appended and fsynced to the write-ahead log before
//! it becomes visible, so acknowledged writes survive a crash. The
//! memtable holds the newest thirty keys; when it fills, it is sealed
//! into an immutable sorted table and registered in the catalog. Reads
//! consult the memtable, then tables youngest to oldest, and the first
//! hit wins; a tombstone hit answers "not found". Once five tables
//! accumulate, compaction merges them all, keeping the most recent entry
//! per key and dropping deleted ones.
//!
//! # Example
//!
//! ```no_run
//! use emberkv::Engine;
//!
//! let engine = Engine::open("./db", "./db/wal.log")?;
//! engine.put(b"key", b"value")?;
//! assert_eq!(engine.get(b"key")?, Some(b"value".to_vec()));
//! for (key, value) in engine.range(b"a", b"z")? {
//!     println!("{:?} = {:?}", key, value);
//! }
//! # Ok::<(), emberkv::Error>(())
//! ```

pub mod compaction;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod flock;
pub mod iterator;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, RangeScan, Stats, TableStats};
pub use entry::Entry;
pub use error::{Error, Result};
