//! The mutable in-memory level and its frozen read-only counterpart.
//!
//! Backed by a concurrent skip list so point reads and scans never block
//! behind writers; mutations are serialized by a small internal mutex so the
//! incremental size counters stay consistent with the map contents. Freezing
//! is O(1): the read-only view shares the same backing map, it is never
//! copied, since the conversion runs under the orchestrator's level-swap
//! lock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::key::StorageKey;
use crate::profile::{CheckProfileResult, GetProfileResult, Operation, ProfileHolder};
use crate::store::level::{EntryIter, KeyEntry, KeyIter, LevelEntry, ReadLevel};

pub struct MemLevelCore<K: StorageKey> {
    map: SkipMap<K, ProfileHolder>,
    write_lock: Mutex<()>,
    frozen: AtomicBool,
    entries: AtomicU64,
    area_size: AtomicI64,
    merge_free_size: AtomicI64,
    min_access_time: AtomicU64,
}

impl<K: StorageKey> MemLevelCore<K> {
    fn new() -> Self {
        Self {
            map: SkipMap::new(),
            write_lock: Mutex::new(()),
            frozen: AtomicBool::new(false),
            entries: AtomicU64::new(0),
            area_size: AtomicI64::new(0),
            merge_free_size: AtomicI64::new(0),
            min_access_time: AtomicU64::new(u64::MAX),
        }
    }

    /// Inserts or overwrites an entry, deriving the stored operation from
    /// this level's own history: first write of the key here is `Insert`
    /// (whatever deeper levels hold), an overwrite is `Rewrite`.
    fn save_profile(
        &self,
        key: K,
        blob: Bytes,
        next_size: u64,
        now: u64,
    ) -> Result<Option<Bytes>> {
        let _guard = self.write_lock.lock().unwrap();
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }

        let prev = self.map.get(&key).map(|entry| entry.value().clone());
        let holder = ProfileHolder {
            operation: if prev.is_some() {
                Operation::Rewrite
            } else {
                Operation::Insert
            },
            access_time: now,
            next_size,
            blob,
        };

        match &prev {
            None => {
                self.entries.fetch_add(1, Ordering::SeqCst);
                self.area_size
                    .fetch_add(holder.area() as i64, Ordering::SeqCst);
                self.merge_free_size
                    .fetch_add(next_size as i64, Ordering::SeqCst);
            }
            Some(p) => {
                self.area_size
                    .fetch_add(holder.area() as i64 - p.area() as i64, Ordering::SeqCst);
                // The superseded in-level entry becomes reclaimable, and the
                // deeper-level estimate is replaced by the fresh one.
                self.merge_free_size.fetch_add(
                    p.area() as i64 + next_size as i64 - p.next_size as i64,
                    Ordering::SeqCst,
                );
            }
        }
        self.min_access_time.fetch_min(now, Ordering::SeqCst);

        let prev_blob = prev
            .filter(|p| p.operation != Operation::Erase)
            .map(|p| p.blob);
        self.map.insert(key, holder);
        Ok(prev_blob)
    }

    /// Writes a tombstone: the entry stays in the map with an empty blob and
    /// `Erase`, so the deletion participates in merges with deeper levels.
    /// Returns the freed blob size.
    fn remove_profile(&self, key: &K, next_size: u64, now: u64) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }

        let prev = self.map.get(key).map(|entry| entry.value().clone());
        let holder = ProfileHolder {
            operation: Operation::Erase,
            access_time: now,
            next_size,
            blob: Bytes::new(),
        };

        let freed = match &prev {
            None => {
                self.entries.fetch_add(1, Ordering::SeqCst);
                self.area_size
                    .fetch_add(holder.area() as i64, Ordering::SeqCst);
                self.merge_free_size
                    .fetch_add(next_size as i64, Ordering::SeqCst);
                0
            }
            Some(p) => {
                self.area_size
                    .fetch_sub(p.blob.len() as i64, Ordering::SeqCst);
                self.merge_free_size.fetch_add(
                    p.area() as i64 + next_size as i64 - p.next_size as i64,
                    Ordering::SeqCst,
                );
                p.blob.len() as u64
            }
        };
        self.min_access_time.fetch_min(now, Ordering::SeqCst);

        self.map.insert(key.clone(), holder);
        Ok(freed)
    }

    fn freeze(&self) {
        let _guard = self.write_lock.lock().unwrap();
        self.frozen.store(true, Ordering::SeqCst);
    }

    fn check_profile(&self, key: &K) -> CheckProfileResult {
        match self.map.get(key) {
            Some(entry) => {
                let holder = entry.value();
                CheckProfileResult {
                    operation: holder.operation,
                    size: holder.blob.len() as u64,
                }
            }
            None => CheckProfileResult::not_found(),
        }
    }

    fn get_profile(&self, key: &K) -> GetProfileResult {
        match self.map.get(key) {
            Some(entry) => {
                let holder = entry.value();
                GetProfileResult {
                    operation: holder.operation,
                    access_time: holder.access_time,
                    blob: if holder.operation == Operation::Erase {
                        None
                    } else {
                        Some(holder.blob.clone())
                    },
                }
            }
            None => GetProfileResult::not_found(),
        }
    }

    fn size(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    fn area_size(&self) -> u64 {
        self.area_size.load(Ordering::SeqCst).max(0) as u64
    }

    fn merge_free_size(&self) -> u64 {
        self.merge_free_size.load(Ordering::SeqCst).max(0) as u64
    }

    fn min_access_time(&self) -> u64 {
        self.min_access_time.load(Ordering::SeqCst)
    }
}

/// Lazy cursor over the backing skip list; yields owned entries so the
/// iterator can outlive any map guard.
struct MemLevelIter<K: StorageKey> {
    core: Arc<MemLevelCore<K>>,
    last: Option<K>,
    exhausted: bool,
}

impl<K: StorageKey> MemLevelIter<K> {
    fn new(core: Arc<MemLevelCore<K>>) -> Self {
        Self {
            core,
            last: None,
            exhausted: false,
        }
    }

    fn advance(&mut self) -> Option<(K, ProfileHolder)> {
        if self.exhausted {
            return None;
        }
        use std::ops::Bound;
        let range = match &self.last {
            Some(key) => (Bound::Excluded(key.clone()), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        match self.core.map.range(range).next() {
            Some(entry) => {
                let key = entry.key().clone();
                let holder = entry.value().clone();
                self.last = Some(key.clone());
                Some((key, holder))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

struct MemEntryIter<K: StorageKey>(MemLevelIter<K>);

impl<K: StorageKey> Iterator for MemEntryIter<K> {
    type Item = Result<LevelEntry<K>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, holder) = self.0.advance()?;
        Some(Ok(LevelEntry {
            key,
            operation: holder.operation,
            access_time: holder.access_time,
            next_size: holder.next_size,
            blob: holder.blob,
        }))
    }
}

struct MemKeyIter<K: StorageKey>(MemLevelIter<K>);

impl<K: StorageKey> Iterator for MemKeyIter<K> {
    type Item = Result<KeyEntry<K>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, holder) = self.0.advance()?;
        Some(Ok(KeyEntry {
            key,
            operation: holder.operation,
            access_time: holder.access_time,
        }))
    }
}

/// The single mutable level ("level 0").
pub struct RwMemLevel<K: StorageKey> {
    core: Arc<MemLevelCore<K>>,
}

impl<K: StorageKey> RwMemLevel<K> {
    pub fn new() -> Self {
        Self {
            core: Arc::new(MemLevelCore::new()),
        }
    }

    pub fn save_profile(
        &self,
        key: K,
        blob: Bytes,
        next_size: u64,
        now: u64,
    ) -> Result<Option<Bytes>> {
        self.core.save_profile(key, blob, next_size, now)
    }

    pub fn remove_profile(&self, key: &K, next_size: u64, now: u64) -> Result<u64> {
        self.core.remove_profile(key, next_size, now)
    }

    pub fn is_empty(&self) -> bool {
        self.core.size() == 0
    }

    /// Freezes this level and returns a read-only view sharing the same
    /// backing map. Runs under the orchestrator's swap lock, hence O(1).
    pub fn convert_to_read_level(&self) -> ReadMemLevel<K> {
        self.core.freeze();
        ReadMemLevel {
            core: self.core.clone(),
        }
    }
}

impl<K: StorageKey> Default for RwMemLevel<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen snapshot of an exchanged in-memory level, awaiting dump.
#[derive(Clone)]
pub struct ReadMemLevel<K: StorageKey> {
    core: Arc<MemLevelCore<K>>,
}

impl<K: StorageKey> ReadMemLevel<K> {
    /// Identity check: two views over the same backing map.
    pub fn shares_core(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

macro_rules! delegate_read_level {
    ($type:ident) => {
        impl<K: StorageKey> ReadLevel<K> for $type<K> {
            fn check_profile(&self, key: &K) -> Result<CheckProfileResult> {
                Ok(self.core.check_profile(key))
            }

            fn get_profile(&self, key: &K) -> Result<GetProfileResult> {
                Ok(self.core.get_profile(key))
            }

            fn key_iterator(&self) -> Result<KeyIter<K>> {
                Ok(Box::new(MemKeyIter(MemLevelIter::new(self.core.clone()))))
            }

            fn iterator(&self, _read_buffer_size: usize) -> Result<EntryIter<K>> {
                Ok(Box::new(MemEntryIter(MemLevelIter::new(self.core.clone()))))
            }

            fn size(&self) -> u64 {
                self.core.size()
            }

            fn area_size(&self) -> u64 {
                self.core.area_size()
            }

            fn merge_free_size(&self) -> u64 {
                self.core.merge_free_size()
            }

            fn min_access_time(&self) -> u64 {
                self.core.min_access_time()
            }
        }
    };
}

delegate_read_level!(RwMemLevel);
delegate_read_level!(ReadMemLevel);
