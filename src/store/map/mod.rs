//! The orchestrator: a leveled map of profile blobs.
//!
//! [`LevelProfileMap`] owns the copy-on-write snapshot (one mutable in-memory
//! level, a queue of frozen levels awaiting dump, and the ordered set of
//! on-disk levels) plus the machinery the background tasks drive: exchanging
//! the mutable level, dumping frozen levels, merging on-disk levels, and
//! folding expiration into the next compaction pass.
//!
//! ## Read path
//! Mutable level first, then frozen levels (newest first), then on-disk
//! levels (newest first), short-circuiting on the first hit.
//!
//! ## Write path
//! Writes land in the mutable level under its own lock; if the level was
//! exchanged out mid-write the write retries against the fresh snapshot.
//! Foreground calls never wait on background work.

pub mod dump;
pub mod merge;
pub mod snapshot;
pub mod tasks;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::config::{RuntimeMode, StorageConfig};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::io::FileController;
use crate::key::{KeySerializer, StorageKey};
use crate::profile::{
    CheckProfileResult, GetProfileResult, Operation, WritePriority, ENTRY_OVERHEAD,
};
use crate::store::level::iterator::{KeyMergeIterator, MergeInput, OperationPackIterator};
use crate::store::level::mem::RwMemLevel;
use crate::store::level::{KeyEntry, ReadLevel};
use crate::store::ProfileStorage;
use snapshot::{LevelHolder, LevelId, MapHolder};

const LOCK_FILE: &str = "profiledb.lock";

/// Unix seconds; the engine's access-time clock.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Observational callback invoked while existing levels are loaded during
/// activation.
pub trait LoadingProgressCallback: Send + Sync {
    fn post_progress(&self, _fraction: f64) {}
    fn loading_is_finished(&self) {}
}

/// No-op progress sink.
pub struct NoProgress;

impl LoadingProgressCallback for NoProgress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    Inactive = 0,
    Activating = 1,
    Active = 2,
    Deactivating = 3,
}

impl ObjectState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ObjectState::Activating,
            2 => ObjectState::Active,
            3 => ObjectState::Deactivating,
            _ => ObjectState::Inactive,
        }
    }
}

/// Leveled profile storage map.
pub struct LevelProfileMap<K: StorageKey> {
    pub(crate) config: StorageConfig,
    pub(crate) serializer: Arc<dyn KeySerializer<K>>,
    pub(crate) controller: Arc<dyn FileController>,

    state: AtomicU8,
    accepting_runtime: AtomicBool,

    holder: RwLock<Arc<MapHolder<K>>>,
    /// Serializes snapshot read-modify-install sequences (exchange and
    /// dump/merge commits). Never held across file I/O.
    pub(crate) swap_lock: Mutex<()>,
    /// Serializes dump passes (background task vs. forced dumps).
    pub(crate) dump_lock: Mutex<()>,
    /// Serializes merge passes.
    pub(crate) merge_lock: Mutex<()>,

    sub_seq: AtomicU64,
    uniq_seq: AtomicU64,
    last_exchange: Mutex<Instant>,

    /// Wakes the exchange task when a write trips a dump threshold.
    pub(crate) dump_signal: Arc<Notify>,
    /// Wakes the dump task once an exchange has queued a frozen level.
    pub(crate) frozen_signal: Arc<Notify>,
    /// Wakes the merge task after a dump or an expiration-threshold update.
    pub(crate) merge_signal: Arc<Notify>,
    /// Expiration threshold published by the clear-expired task; 0 disables.
    expire_before: AtomicU64,

    busy: Mutex<usize>,
    busy_cond: Condvar,

    _lock: FileLock,
}

impl<K: StorageKey> LevelProfileMap<K> {
    /// Creates the map over the configured directory. Levels are not loaded
    /// until [`activate_object`](Self::activate_object).
    pub fn open(
        config: StorageConfig,
        serializer: Arc<dyn KeySerializer<K>>,
        controller: Arc<dyn FileController>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE)).map_err(Error::LockError)?;

        Ok(Self {
            config,
            serializer,
            controller,
            state: AtomicU8::new(ObjectState::Inactive as u8),
            accepting_runtime: AtomicBool::new(false),
            holder: RwLock::new(Arc::new(MapHolder::empty())),
            swap_lock: Mutex::new(()),
            dump_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
            sub_seq: AtomicU64::new(0),
            uniq_seq: AtomicU64::new(0),
            last_exchange: Mutex::new(Instant::now()),
            dump_signal: Arc::new(Notify::new()),
            frozen_signal: Arc::new(Notify::new()),
            merge_signal: Arc::new(Notify::new()),
            expire_before: AtomicU64::new(0),
            busy: Mutex::new(0),
            busy_cond: Condvar::new(),
            _lock: lock,
        })
    }

    pub fn object_state(&self) -> ObjectState {
        ObjectState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ObjectState, to: ObjectState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|actual| {
                Error::InvalidState(format!(
                    "state transition {:?} -> {:?} refused, currently {:?}",
                    from,
                    to,
                    ObjectState::from_u8(actual)
                ))
            })?;
        Ok(())
    }

    /// Loads existing on-disk levels and flips the map to ACTIVE. A corrupt
    /// level file pair is logged and skipped: it must not prevent service of
    /// the remaining levels.
    pub fn activate_object(&self, progress: &dyn LoadingProgressCallback) -> Result<()> {
        self.transition(ObjectState::Inactive, ObjectState::Activating)?;
        match self.activate_inner(progress) {
            Ok(()) => {
                self.transition(ObjectState::Activating, ObjectState::Active)?;
                self.accepting_runtime.store(true, Ordering::SeqCst);
                progress.loading_is_finished();

                tracing::info!(
                    levels = self.snapshot().levels.len(),
                    dir = %self.config.dir.display(),
                    "Profile map activated"
                );
                Ok(())
            }
            Err(e) => {
                self.state
                    .store(ObjectState::Inactive as u8, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn activate_inner(&self, progress: &dyn LoadingProgressCallback) -> Result<()> {
        let mut ids = Vec::new();
        for path in self.controller.list_dir(&self.config.dir)? {
            if path.extension().and_then(|e| e.to_str()) != Some("ix") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if let Some(id) = LevelId::parse(&self.config.prefix, stem) {
                ids.push(id);
            }
        }
        // Newest first. A merge output shares its newest input's sub_index;
        // after a crash both can be present, and the higher merge generation
        // is the authoritative one.
        ids.sort_by(|a, b| (b.sub_index, b.index).cmp(&(a.sub_index, a.index)));

        let total = ids.len();
        let mut holders = Vec::with_capacity(total);
        for (i, id) in ids.into_iter().enumerate() {
            match self.add_level_(id) {
                Ok(holder) => holders.push(holder),
                Err(e) => {
                    tracing::error!(
                        index = id.index,
                        sub_index = id.sub_index,
                        error = %e,
                        "Skipping unreadable level during activation"
                    );
                }
            }
            progress.post_progress((i + 1) as f64 / total.max(1) as f64);
        }

        let max_sub = holders.iter().map(|h| h.id.sub_index).max().unwrap_or(0);
        let max_uniq = holders.iter().map(|h| h.id.uniq_index).max().unwrap_or(0);
        self.sub_seq.store(max_sub + 1, Ordering::SeqCst);
        self.uniq_seq.store(max_uniq + 1, Ordering::SeqCst);

        {
            let _swap = self.swap_lock.lock().unwrap();
            let mut holder = MapHolder::empty();
            holder.levels = holders;
            self.install(Arc::new(holder));
        }
        *self.last_exchange.lock().unwrap() = Instant::now();
        Ok(())
    }

    fn add_level_(&self, id: LevelId) -> Result<Arc<LevelHolder<K>>> {
        let files = id.files(&self.config.dir, &self.config.prefix);
        let level =
            crate::store::level::disk::DiskLevel::open(self.controller.as_ref(), &self.serializer, &files)?;
        Ok(Arc::new(LevelHolder::new(
            id,
            Arc::new(level),
            files,
            self.controller.clone(),
        )))
    }

    /// Stops accepting runtime writes and new background passes.
    pub fn deactivate_object(&self) -> Result<()> {
        self.transition(ObjectState::Active, ObjectState::Deactivating)?;
        self.accepting_runtime.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Blocks until in-flight background passes finish, then performs a final
    /// synchronous dump of the in-memory level and goes INACTIVE.
    pub fn wait_object(&self) -> Result<()> {
        if self.object_state() != ObjectState::Deactivating {
            return Err(Error::InvalidState(
                "wait_object requires deactivate_object first".to_string(),
            ));
        }

        let mut busy = self.busy.lock().unwrap();
        while *busy > 0 {
            busy = self.busy_cond.wait(busy).unwrap();
        }
        drop(busy);

        self.dump()?;
        self.transition(ObjectState::Deactivating, ObjectState::Inactive)
    }

    // --- snapshot management ---

    pub(crate) fn snapshot(&self) -> Arc<MapHolder<K>> {
        self.holder.read().unwrap().clone()
    }

    /// Installs a new snapshot. Callers hold `swap_lock` across building the
    /// replacement from the current snapshot.
    pub(crate) fn install(&self, holder: Arc<MapHolder<K>>) {
        *self.holder.write().unwrap() = holder;
    }

    pub(crate) fn next_level_id(&self, index: u32, sub_index: Option<u64>) -> LevelId {
        LevelId {
            index,
            sub_index: sub_index
                .unwrap_or_else(|| self.sub_seq.fetch_add(1, Ordering::SeqCst)),
            uniq_index: self.uniq_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub(crate) fn begin_background(&self) -> BusyGuard<'_, K> {
        *self.busy.lock().unwrap() += 1;
        BusyGuard { map: self }
    }

    pub(crate) fn expire_threshold(&self) -> Option<u64> {
        match self.expire_before.load(Ordering::SeqCst) {
            0 => None,
            t => Some(t),
        }
    }

    /// Publishes the expiration threshold folded into the next dump/merge.
    pub fn set_expire_threshold(&self, min_access_time: u64) {
        self.expire_before.store(min_access_time, Ordering::SeqCst);
    }

    // --- dump triggering ---

    pub(crate) fn undumped_size(&self, snap: &MapHolder<K>) -> u64 {
        snap.rw_level.area_size() + snap.frozen.iter().map(|f| f.area_size()).sum::<u64>()
    }

    pub(crate) fn exchange_due(&self, snap: &MapHolder<K>) -> bool {
        if snap.rw_level.area_size() >= self.config.rwlevel_max_size {
            return true;
        }
        if self.undumped_size(snap) >= self.config.max_undumped_size {
            return true;
        }
        if snap.levels0_count() > self.config.max_levels0 {
            return true;
        }
        self.last_exchange.lock().unwrap().elapsed() >= self.config.max_dump_period
    }

    /// Atomically replaces the mutable level with a fresh empty one, pushing
    /// the frozen predecessor onto the dump queue. Returns whether an
    /// exchange happened; an empty mutable level is never exchanged.
    pub(crate) fn exchange_rw_level(&self, force: bool) -> bool {
        let _swap = self.swap_lock.lock().unwrap();
        let snap = self.snapshot();
        if snap.rw_level.is_empty() {
            return false;
        }
        if !force && !self.exchange_due(&snap) {
            return false;
        }

        let frozen = snap.rw_level.convert_to_read_level();
        let mut frozen_queue = Vec::with_capacity(snap.frozen.len() + 1);
        frozen_queue.push(frozen);
        frozen_queue.extend(snap.frozen.iter().cloned());

        self.install(Arc::new(MapHolder {
            rw_level: Arc::new(RwMemLevel::new()),
            frozen: frozen_queue,
            levels: snap.levels.clone(),
        }));
        *self.last_exchange.lock().unwrap() = Instant::now();
        self.frozen_signal.notify_one();

        tracing::debug!("Exchanged mutable level");
        true
    }

    fn signal_if_dump_due(&self) {
        let snap = self.snapshot();
        if self.exchange_due(&snap) || !snap.frozen.is_empty() {
            self.dump_signal.notify_one();
        }
    }

    // --- operation admission ---

    fn admit_read(&self) -> Result<()> {
        match self.object_state() {
            ObjectState::Active | ObjectState::Deactivating => Ok(()),
            _ => Err(Error::NotActive),
        }
    }

    fn admit_write(&self, priority: WritePriority) -> Result<()> {
        match self.object_state() {
            ObjectState::Inactive | ObjectState::Activating => return Err(Error::NotActive),
            ObjectState::Active => {}
            // Shutting down: runtime traffic is shed, background loaders may
            // finish (the final dump picks their writes up).
            ObjectState::Deactivating => {
                if priority == WritePriority::Runtime {
                    return Err(Error::Blocked);
                }
            }
        }
        if priority == WritePriority::Runtime && !self.accepting_runtime.load(Ordering::SeqCst) {
            return Err(Error::Blocked);
        }
        if self.config.mode == RuntimeMode::NonblockRuntime
            && priority == WritePriority::Runtime
            && self.undumped_size(&self.snapshot()) >= self.config.undumped_hard_cap()
        {
            return Err(Error::Blocked);
        }
        Ok(())
    }

    /// Best-effort estimate of the bytes this key already occupies in on-disk
    /// levels; becomes the new entry's `next_size`.
    fn deeper_size(&self, snap: &MapHolder<K>, key: &K) -> u64 {
        let mut total = 0;
        for holder in &snap.levels {
            match holder.level.check_profile(key) {
                Ok(check) if check.found() => total += check.size + ENTRY_OVERHEAD,
                Ok(_) => {}
                Err(_) => {} // unreadable level contributes nothing to the estimate
            }
        }
        total
    }
}

impl<K: StorageKey> ProfileStorage<K> for LevelProfileMap<K> {
    fn check_profile(&self, key: &K) -> Result<CheckProfileResult> {
        self.admit_read()?;
        let snap = self.snapshot();

        let check = snap.rw_level.check_profile(key)?;
        if check.found() {
            return Ok(check);
        }
        for frozen in &snap.frozen {
            let check = frozen.check_profile(key)?;
            if check.found() {
                return Ok(check);
            }
        }
        for holder in &snap.levels {
            let check = holder.level.check_profile(key)?;
            if check.found() {
                return Ok(check);
            }
        }
        Ok(CheckProfileResult::not_found())
    }

    fn get_profile(&self, key: &K) -> Result<GetProfileResult> {
        self.admit_read()?;
        let snap = self.snapshot();

        let result = snap.rw_level.get_profile(key)?;
        if result.found() {
            return Ok(result);
        }
        for frozen in &snap.frozen {
            let result = frozen.get_profile(key)?;
            if result.found() {
                return Ok(result);
            }
        }
        for holder in &snap.levels {
            let result = holder.level.get_profile(key)?;
            if result.found() {
                return Ok(result);
            }
        }
        Ok(GetProfileResult::not_found())
    }

    fn save_profile(
        &self,
        key: K,
        blob: Bytes,
        now: u64,
        priority: WritePriority,
    ) -> Result<Option<Bytes>> {
        self.admit_write(priority)?;

        loop {
            let snap = self.snapshot();
            let next_size = self.deeper_size(&snap, &key);
            match snap
                .rw_level
                .save_profile(key.clone(), blob.clone(), next_size, now)
            {
                Ok(prev) => {
                    self.signal_if_dump_due();
                    return Ok(prev);
                }
                // The level was exchanged out under us; retry on the fresh one.
                Err(Error::Frozen) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn remove_profile(&self, key: &K, now: u64, priority: WritePriority) -> Result<u64> {
        self.admit_write(priority)?;

        loop {
            let snap = self.snapshot();
            let next_size = self.deeper_size(&snap, key);
            match snap.rw_level.remove_profile(key, next_size, now) {
                Ok(freed) => {
                    self.signal_if_dump_due();
                    return Ok(freed);
                }
                Err(Error::Frozen) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn copy_keys(&self) -> Result<Vec<K>> {
        self.admit_read()?;
        let snap = self.snapshot();

        let mut inputs: Vec<MergeInput<KeyEntry<K>>> = Vec::new();
        inputs.push(snap.rw_level.key_iterator()?);
        for frozen in &snap.frozen {
            inputs.push(frozen.key_iterator()?);
        }
        for holder in &snap.levels {
            inputs.push(holder.level.key_iterator()?);
        }

        let merged = KeyMergeIterator::new(inputs)?;
        let mut keys = Vec::new();
        for packed in OperationPackIterator::new(merged) {
            let entry = packed?;
            if entry.operation != Operation::Erase {
                keys.push(entry.key);
            }
        }
        Ok(keys)
    }

    fn size(&self) -> u64 {
        let snap = self.snapshot();
        snap.rw_level.size()
            + snap.frozen.iter().map(|f| f.size()).sum::<u64>()
            + snap.levels.iter().map(|h| h.level.size()).sum::<u64>()
    }

    fn area_size(&self) -> u64 {
        let snap = self.snapshot();
        snap.rw_level.area_size()
            + snap.frozen.iter().map(|f| f.area_size()).sum::<u64>()
            + snap.levels.iter().map(|h| h.level.area_size()).sum::<u64>()
    }

    /// Forces an immediate synchronous exchange and dump of everything
    /// undumped, regardless of thresholds.
    fn dump(&self) -> Result<()> {
        self.exchange_rw_level(true);
        while dump::dump_frozen(self)? {}
        Ok(())
    }
}

pub(crate) struct BusyGuard<'a, K: StorageKey> {
    map: &'a LevelProfileMap<K>,
}

impl<K: StorageKey> Drop for BusyGuard<'_, K> {
    fn drop(&mut self) {
        let mut busy = self.map.busy.lock().unwrap();
        *busy -= 1;
        self.map.busy_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::io::PosixFileController;
    use crate::key::BytesKeySerializer;
    use crate::tmpfs::TempDir;
    use std::sync::atomic::AtomicUsize;

    fn open_inactive(config: StorageConfig) -> LevelProfileMap<Vec<u8>> {
        LevelProfileMap::open(
            config,
            Arc::new(BytesKeySerializer),
            Arc::new(PosixFileController::new()),
        )
        .expect("open failed")
    }

    fn open_active(config: StorageConfig) -> LevelProfileMap<Vec<u8>> {
        let map = open_inactive(config);
        map.activate_object(&NoProgress).expect("activation failed");
        map
    }

    fn save(map: &LevelProfileMap<Vec<u8>>, key: &[u8], value: &[u8], now: u64) {
        map.save_profile(
            key.to_vec(),
            Bytes::copy_from_slice(value),
            now,
            WritePriority::Runtime,
        )
        .expect("save failed");
    }

    #[test]
    fn test_insert_overwrite_remove_dump_scenario() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_active(StorageConfig::new(dir.path()));
        let now = unix_now();

        save(&map, b"abc", b"v1", now);
        let got = map.get_profile(&b"abc".to_vec()).expect("get failed");
        assert_eq!(got.operation, Operation::Insert);
        assert_eq!(got.blob, Some(Bytes::from_static(b"v1")));

        save(&map, b"abc", b"v2", now + 1);
        let got = map.get_profile(&b"abc".to_vec()).expect("get failed");
        assert_eq!(got.blob, Some(Bytes::from_static(b"v2")));

        map.remove_profile(&b"abc".to_vec(), now + 2, WritePriority::Runtime)
            .expect("remove failed");
        assert!(!map.get_profile(&b"abc".to_vec()).expect("get failed").present());

        map.dump().expect("dump failed");
        assert!(!map.get_profile(&b"abc".to_vec()).expect("get failed").present());
    }

    #[test]
    fn test_not_active_before_activation() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_inactive(StorageConfig::new(dir.path()));

        assert!(matches!(
            map.save_profile(
                b"k".to_vec(),
                Bytes::from_static(b"v"),
                1,
                WritePriority::Runtime
            ),
            Err(Error::NotActive)
        ));
        assert!(matches!(
            map.get_profile(&b"k".to_vec()),
            Err(Error::NotActive)
        ));
        assert!(matches!(map.copy_keys(), Err(Error::NotActive)));
    }

    #[test]
    fn test_runtime_writes_blocked_over_hard_cap() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_active(
            StorageConfig::new(dir.path())
                .mode(RuntimeMode::NonblockRuntime)
                .max_undumped_size(1),
        );
        let now = unix_now();

        save(&map, b"first", b"v", now);

        // The backlog now exceeds the hard cap: runtime traffic is shed,
        // background traffic still lands.
        assert!(matches!(
            map.save_profile(
                b"second".to_vec(),
                Bytes::from_static(b"v"),
                now,
                WritePriority::Runtime
            ),
            Err(Error::Blocked)
        ));
        map.save_profile(
            b"third".to_vec(),
            Bytes::from_static(b"v"),
            now,
            WritePriority::Background,
        )
        .expect("background save failed");
    }

    #[test]
    fn test_block_runtime_mode_never_sheds_on_load() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_active(
            StorageConfig::new(dir.path())
                .mode(RuntimeMode::BlockRuntime)
                .max_undumped_size(1),
        );
        let now = unix_now();

        save(&map, b"first", b"v", now);
        save(&map, b"second", b"v", now);
    }

    #[test]
    fn test_shutdown_lifecycle() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_active(StorageConfig::new(dir.path()));
        let now = unix_now();

        save(&map, b"k", b"v", now);
        map.deactivate_object().expect("deactivate failed");

        // Runtime writes are shed, reads still work, background writes land.
        assert!(matches!(
            map.save_profile(
                b"k2".to_vec(),
                Bytes::from_static(b"v"),
                now,
                WritePriority::Runtime
            ),
            Err(Error::Blocked)
        ));
        assert!(map.get_profile(&b"k".to_vec()).expect("get failed").present());
        map.save_profile(
            b"k3".to_vec(),
            Bytes::from_static(b"v"),
            now,
            WritePriority::Background,
        )
        .expect("background save failed");

        map.wait_object().expect("wait failed");
        assert_eq!(map.object_state(), ObjectState::Inactive);

        // The final dump persisted everything.
        let snap = map.snapshot();
        assert!(snap.rw_level.is_empty());
        assert!(snap.frozen.is_empty());
        assert_eq!(snap.levels.len(), 1);
        assert!(matches!(
            map.get_profile(&b"k".to_vec()),
            Err(Error::NotActive)
        ));
    }

    struct CountingProgress {
        posts: AtomicUsize,
        finished: AtomicUsize,
    }

    impl LoadingProgressCallback for CountingProgress {
        fn post_progress(&self, fraction: f64) {
            assert!((0.0..=1.0).contains(&fraction));
            self.posts.fetch_add(1, Ordering::SeqCst);
        }

        fn loading_is_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_reactivation_reloads_levels_with_progress() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let now = unix_now();

        {
            let map = open_active(StorageConfig::new(dir.path()));
            save(&map, b"a", b"1", now);
            map.dump().expect("dump failed");
            save(&map, b"b", b"2", now + 1);
            map.dump().expect("dump failed");
        }

        let map = open_inactive(StorageConfig::new(dir.path()));
        let progress = CountingProgress {
            posts: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        };
        map.activate_object(&progress).expect("activation failed");

        assert_eq!(progress.posts.load(Ordering::SeqCst), 2);
        assert_eq!(progress.finished.load(Ordering::SeqCst), 1);
        assert_eq!(map.snapshot().levels.len(), 2);
        assert_eq!(
            map.get_profile(&b"a".to_vec()).expect("get failed").blob,
            Some(Bytes::from_static(b"1"))
        );
        assert_eq!(
            map.get_profile(&b"b".to_vec()).expect("get failed").blob,
            Some(Bytes::from_static(b"2"))
        );

        // New dumps must not collide with the reloaded level names.
        save(&map, b"c", b"3", now + 2);
        map.dump().expect("dump failed");
        assert_eq!(map.snapshot().levels.len(), 3);
        let subs: Vec<u64> = map.snapshot().levels.iter().map(|h| h.id.sub_index).collect();
        assert!(subs.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_corrupt_level_skipped_at_activation() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let now = unix_now();

        {
            let map = open_active(StorageConfig::new(dir.path()));
            save(&map, b"good", b"1", now);
            map.dump().expect("dump failed");
            save(&map, b"bad", b"2", now + 1);
            map.dump().expect("dump failed");
        }

        // Corrupt the newer level's index.
        let newest_ix = {
            let map = open_active(StorageConfig::new(dir.path()));
            let path = map.snapshot().levels[0].files.index_path.clone();
            map.deactivate_object().expect("deactivate failed");
            map.wait_object().expect("wait failed");
            path
        };
        let mut raw = std::fs::read(&newest_ix).expect("read failed");
        let len = raw.len();
        raw[len / 2] ^= 0xFF;
        std::fs::write(&newest_ix, &raw).expect("write failed");

        let map = open_active(StorageConfig::new(dir.path()));
        // The corrupt level is gone from the set, the healthy one serves.
        assert_eq!(map.snapshot().levels.len(), 1);
        assert!(map.get_profile(&b"good".to_vec()).expect("get failed").present());
        assert!(!map.get_profile(&b"bad".to_vec()).expect("get failed").found());
    }

    #[test]
    fn test_copy_keys_excludes_erased() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_active(StorageConfig::new(dir.path()));
        let now = unix_now();

        save(&map, b"a", b"1", now);
        save(&map, b"b", b"2", now);
        map.dump().expect("dump failed");
        save(&map, b"c", b"3", now + 1);
        map.remove_profile(&b"b".to_vec(), now + 1, WritePriority::Runtime)
            .expect("remove failed");

        let mut keys = map.copy_keys().expect("copy_keys failed");
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_size_and_area_span_all_levels() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_active(StorageConfig::new(dir.path()));
        let now = unix_now();

        save(&map, b"a", b"1234", now);
        map.dump().expect("dump failed");
        save(&map, b"b", b"5678", now + 1);

        assert_eq!(map.size(), 2);
        assert_eq!(map.area_size(), 2 * (4 + ENTRY_OVERHEAD));
    }

    #[test]
    fn test_next_size_tracks_deeper_copies() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let map = open_active(StorageConfig::new(dir.path()));
        let now = unix_now();

        save(&map, b"k", b"0123456789", now);
        map.dump().expect("dump failed");

        // Overwrite lands in a fresh mutable level; its reclaimable estimate
        // covers the deeper copy.
        save(&map, b"k", b"x", now + 1);
        let snap = map.snapshot();
        assert_eq!(snap.rw_level.merge_free_size(), 10 + ENTRY_OVERHEAD);
    }
}
