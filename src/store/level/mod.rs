//! The uniform level contract.
//!
//! Both the mutable in-memory level and immutable on-disk levels implement
//! [`ReadLevel`], which is what lets the merge algebra and the orchestrator
//! treat them interchangeably: a point lookup, a key-only scan, a full scan,
//! and the size/age accounting used by the dump/merge/expire heuristics.

pub mod disk;
pub mod iterator;
pub mod mem;

use bytes::Bytes;

use crate::error::Result;
use crate::profile::{CheckProfileResult, GetProfileResult, Operation};

/// One full scan element: everything a level knows about a key.
#[derive(Debug, Clone)]
pub struct LevelEntry<K> {
    pub key: K,
    pub operation: Operation,
    pub access_time: u64,
    pub next_size: u64,
    pub blob: Bytes,
}

/// One key-only scan element.
#[derive(Debug, Clone)]
pub struct KeyEntry<K> {
    pub key: K,
    pub operation: Operation,
    pub access_time: u64,
}

impl<K> From<KeyEntry<K>> for LevelEntry<K> {
    fn from(entry: KeyEntry<K>) -> Self {
        LevelEntry {
            key: entry.key,
            operation: entry.operation,
            access_time: entry.access_time,
            next_size: 0,
            blob: Bytes::new(),
        }
    }
}

/// Full-scan iterator: finite, single-pass, non-restartable, key-ascending.
pub type EntryIter<K> = Box<dyn Iterator<Item = Result<LevelEntry<K>>> + Send>;

/// Key-only variant of [`EntryIter`].
pub type KeyIter<K> = Box<dyn Iterator<Item = Result<KeyEntry<K>>> + Send>;

/// Read contract shared by the in-memory level and on-disk levels.
pub trait ReadLevel<K>: Send + Sync {
    /// Existence/metadata probe; never materializes the blob.
    fn check_profile(&self, key: &K) -> Result<CheckProfileResult>;

    /// Point lookup.
    fn get_profile(&self, key: &K) -> Result<GetProfileResult>;

    /// Key-ascending scan over keys and per-key metadata.
    fn key_iterator(&self) -> Result<KeyIter<K>>;

    /// Key-ascending scan including blobs; on-disk levels stream the body
    /// file using the given read-buffer size.
    fn iterator(&self, read_buffer_size: usize) -> Result<EntryIter<K>>;

    /// Number of stored entries, tombstones included.
    fn size(&self) -> u64;

    /// Estimated physical footprint in bytes.
    fn area_size(&self) -> u64;

    /// Estimated bytes reclaimable by merging this level with everything
    /// deeper, maintained from per-entry `next_size` bookkeeping.
    fn merge_free_size(&self) -> u64;

    /// Oldest access time present, `u64::MAX` for an empty level. Used to
    /// skip whole levels during expiration passes.
    fn min_access_time(&self) -> u64;
}
