//! SlotKV Core — sharded write-back cache over a persistent hash table
//!
//! The storage layer of a replicated key-value node. Every value carries the
//! clocktime of the write that produced it, and the newest clocktime wins:
//! stale updates and deletes are rejected, so replicas converge regardless of
//! delivery order.
//!
//! # Architecture
//!
//! - **Slots**: the keyspace is split over independently locked shards, each a
//!   fixed array of cache entries backed by its own byte arena
//! - **Write path**: updates land in the cache as dirty entries
//! - **Flush**: dirty entries are written back to the backend under a global
//!   exclusive lock, either on demand, on contention, or from the background
//!   flusher
//! - **Backend**: an append-only, checksummed hash table on disk ([`HashDb`]),
//!   or anything else implementing [`Backend`]
//!
//! # Keys and values
//!
//! A raw key starts with an 8-byte digest that picks its slot and bucket; a
//! raw value starts with an 8-byte big-endian clocktime. [`encode_key`] and
//! [`encode_value`] build both.

pub mod backend;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod durability;
pub mod error;
pub mod flusher;
pub mod format;
pub mod hashdb;
pub mod slot;
pub mod storage;

// Re-export key types for convenience
pub use backend::{Backend, CompactionReport};
pub use bytes::Bytes;
pub use clock::ClockTime;
pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use flusher::{FlusherHandle, start_flusher};
pub use format::{KEY_META_SIZE, VALUE_META_SIZE, encode_key, encode_value};
pub use hashdb::HashDb;
pub use slot::{Deletion, FlushReport, Lookup};
pub use storage::{Cursor, FlushStats, Storage};
