//! Combining a run of on-disk levels into one.
//!
//! Run selection is oldest-first: merging old levels bounds write
//! amplification (young levels are rewritten less often) and the pack rule
//! keeps the logical contents unchanged whichever runs are chosen. A merge
//! whose run reaches the oldest level additionally discards tombstones and
//! expired inserts, since nothing deeper can be shadowed.

use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::key::StorageKey;
use crate::profile::Operation;
use crate::scheduler::Context;
use crate::store::level::disk::{self, DiskLevel};
use crate::store::level::iterator::{
    AccessTimeFilterIterator, MergeInput, MergeIterator, OperationPackIterator,
};
use crate::store::level::{EntryIter, LevelEntry, ReadLevel};

use super::snapshot::{LevelHolder, MapHolder};
use super::LevelProfileMap;

/// How many output entries between cooperative-stop probes.
const STOP_CHECK_INTERVAL: usize = 4096;

pub fn needs_merge<K: StorageKey>(map: &LevelProfileMap<K>) -> bool {
    select_run(&map.snapshot(), &map.config).is_some()
}

/// Picks the contiguous run of on-disk levels to merge, as a range into the
/// newest-first level array, or `None` when no merge is worthwhile. Corrupt
/// or already-pinned levels truncate the candidate suffix.
fn select_run<K: StorageKey>(snap: &MapHolder<K>, config: &StorageConfig) -> Option<Range<usize>> {
    let n = snap.levels.len();
    let mut start_min = 0;
    for (i, holder) in snap.levels.iter().enumerate() {
        if !holder.mergeable() {
            start_min = i + 1;
        }
    }
    let available = n - start_min;
    if available < 2 {
        return None;
    }

    // Count trigger: fold the oldest levels down until max_levels0 remain.
    if n > config.max_levels0 {
        let want = (n - config.max_levels0 + 1).max(2).min(available);
        return Some(n - want..n);
    }

    // Ratio trigger: enough of the on-disk area is reclaimable.
    if available >= config.merge.min_merge_levels {
        let suffix = &snap.levels[start_min..];
        let area: u64 = suffix.iter().map(|h| h.level.area_size()).sum();
        let free: u64 = suffix.iter().map(|h| h.level.merge_free_size()).sum();
        if area > 0 && free as f64 / area as f64 >= config.merge.merge_free_ratio {
            return Some(start_min..n);
        }
    }

    None
}

/// Pins the run's levels for the duration of the merge.
struct BackupGuard<K: StorageKey> {
    holders: Vec<Arc<LevelHolder<K>>>,
}

impl<K: StorageKey> BackupGuard<K> {
    fn pin(holders: &[Arc<LevelHolder<K>>]) -> Self {
        for holder in holders {
            holder.backup.store(true, Ordering::SeqCst);
        }
        Self {
            holders: holders.to_vec(),
        }
    }
}

impl<K: StorageKey> Drop for BackupGuard<K> {
    fn drop(&mut self) {
        for holder in &self.holders {
            holder.backup.store(false, Ordering::SeqCst);
        }
    }
}

/// Marks the owning level corrupt when its scan fails, so it disqualifies
/// itself from further compaction while point reads keep being served.
struct CorruptMarkIter<K: StorageKey> {
    inner: EntryIter<K>,
    holder: Arc<LevelHolder<K>>,
}

impl<K: StorageKey> Iterator for CorruptMarkIter<K> {
    type Item = Result<LevelEntry<K>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.holder.corrupt.store(true, Ordering::SeqCst);
                tracing::error!(
                    sub_index = self.holder.id.sub_index,
                    error = %e,
                    "Level scan failed, excluding level from compaction"
                );
                Some(Err(e))
            }
        }
    }
}

/// Runs one merge pass if the merge-worthiness check fires. A concurrent
/// pass, a cancelled pass, and an unworthy level set are all quiet no-ops.
pub fn merge<K: StorageKey>(map: &LevelProfileMap<K>, mut ctx: Option<&mut Context>) -> Result<()> {
    let _busy = map.begin_background();
    let _merge = match map.merge_lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => return Ok(()),
    };

    let snap = map.snapshot();
    let run = match select_run(&snap, &map.config) {
        Some(run) => run,
        None => return Ok(()),
    };
    let holders: Vec<Arc<LevelHolder<K>>> = snap.levels[run.clone()].to_vec();
    let is_bottom = run.end == snap.levels.len();
    let _backup = BackupGuard::pin(&holders);

    tracing::info!(
        input_levels = holders.len(),
        is_bottom = is_bottom,
        "Starting level merge"
    );

    // Inputs newest-first, matching the pack rule's tie-break.
    let mut inputs: Vec<MergeInput<LevelEntry<K>>> = Vec::with_capacity(holders.len());
    for holder in &holders {
        let inner = holder.level.iterator(map.config.rw_buffer_size)?;
        inputs.push(Box::new(CorruptMarkIter {
            inner,
            holder: holder.clone(),
        }));
    }
    let merged = MergeIterator::new(inputs)?;

    let threshold = map.expire_threshold().filter(|t| {
        holders
            .iter()
            .any(|holder| holder.level.min_access_time() < *t)
    });
    let filtered: EntryIter<K> = match threshold {
        Some(t) => Box::new(AccessTimeFilterIterator::new(merged, t)),
        None => Box::new(merged),
    };
    let packed = OperationPackIterator::new(filtered);

    let mut output: EntryIter<K> = Box::new(packed);
    if is_bottom {
        // Nothing deeper exists: tombstones and expired inserts are garbage,
        // and the deeper-size estimates of the survivors reset to zero.
        output = Box::new(output.filter_map(move |res| match res {
            Ok(mut entry) => {
                if entry.operation == Operation::Erase {
                    return None;
                }
                if matches!(threshold, Some(t) if entry.operation == Operation::Insert
                    && entry.access_time < t)
                {
                    return None;
                }
                entry.next_size = 0;
                Some(Ok(entry))
            }
            Err(e) => Some(Err(e)),
        }));
    }

    let mut produced = 0usize;
    let mut output = output.map(move |res| {
        produced += 1;
        if produced % STOP_CHECK_INTERVAL == 0 {
            if let Some(ctx) = ctx.as_deref_mut() {
                if ctx.stop_requested() {
                    return Err(Error::Cancelled);
                }
            }
        }
        res
    });

    let max_index = holders.iter().map(|h| h.id.index).max().unwrap_or(0);
    let id = map.next_level_id(max_index + 1, Some(holders[0].id.sub_index));
    let files = id.files(&map.config.dir, &map.config.prefix);

    let stats = match disk::write_level(
        map.controller.as_ref(),
        &map.serializer,
        &files,
        &mut output,
        map.config.rw_buffer_size,
    ) {
        Ok(stats) => stats,
        Err(Error::Cancelled) => {
            tracing::info!("Merge cancelled at chunk boundary");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let new_holder = match stats {
        Some(_) => Some(Arc::new(LevelHolder::new(
            id,
            Arc::new(DiskLevel::open(
                map.controller.as_ref(),
                &map.serializer,
                &files,
            )?),
            files,
            map.controller.clone(),
        ))),
        // Every entry cancelled or was garbage: the run merges to nothing.
        None => None,
    };

    // Commit: the run is still the oldest suffix, newer dumps only prepend.
    {
        let _swap = map.swap_lock.lock().unwrap();
        let cur = map.snapshot();
        let mut levels: Vec<Arc<LevelHolder<K>>> = cur
            .levels
            .iter()
            .filter(|h| !holders.iter().any(|r| Arc::ptr_eq(h, r)))
            .cloned()
            .collect();
        if let Some(holder) = &new_holder {
            levels.push(holder.clone());
        }
        map.install(Arc::new(MapHolder {
            rw_level: cur.rw_level.clone(),
            frozen: cur.frozen.clone(),
            levels,
        }));
    }
    for holder in &holders {
        holder.to_remove.store(true, Ordering::SeqCst);
    }

    tracing::info!(
        merged_levels = holders.len(),
        output_entries = new_holder.as_ref().map(|h| h.level.size()).unwrap_or(0),
        "Completed level merge"
    );
    Ok(())
}
