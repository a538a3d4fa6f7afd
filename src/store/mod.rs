pub mod level;
pub mod map;

use bytes::Bytes;

use crate::error::Result;
use crate::profile::{CheckProfileResult, GetProfileResult, WritePriority};

/// Public contract of the leveled profile store. Point operations run on the
/// caller's thread and never wait for background compaction; writes may be
/// rejected with [`crate::Error::Blocked`] as a backpressure signal instead.
pub trait ProfileStorage<K>: Send + Sync {
    /// Existence/metadata probe without materializing the blob.
    fn check_profile(&self, key: &K) -> Result<CheckProfileResult>;

    /// Point lookup; the newest level holding the key wins.
    fn get_profile(&self, key: &K) -> Result<GetProfileResult>;

    /// Inserts or overwrites a profile; returns the previously visible blob
    /// in the mutable level, if any.
    fn save_profile(
        &self,
        key: K,
        blob: Bytes,
        now: u64,
        priority: WritePriority,
    ) -> Result<Option<Bytes>>;

    /// Writes a deletion tombstone; returns the freed blob size.
    fn remove_profile(&self, key: &K, now: u64, priority: WritePriority) -> Result<u64>;

    /// Best-effort snapshot of the live key set across all levels,
    /// deduplicated newest-wins and excluding erased keys.
    fn copy_keys(&self) -> Result<Vec<K>>;

    /// Total entry count across the current snapshot.
    fn size(&self) -> u64;

    /// Estimated physical footprint across the current snapshot.
    fn area_size(&self) -> u64;

    /// Forces an immediate synchronous dump of the in-memory level.
    fn dump(&self) -> Result<()>;
}
