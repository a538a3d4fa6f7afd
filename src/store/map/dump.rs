//! Serializing a frozen in-memory level to a new on-disk level.

use std::sync::Arc;

use crate::error::Result;
use crate::key::StorageKey;
use crate::store::level::disk::{self, DiskLevel};
use crate::store::level::iterator::AccessTimeFilterIterator;
use crate::store::level::{EntryIter, ReadLevel};

use super::snapshot::{LevelHolder, MapHolder};
use super::LevelProfileMap;

/// Dumps the oldest frozen level, if any. Returns whether one was consumed.
///
/// The file I/O runs without any snapshot lock held; only the final commit
/// (drop the frozen level, prepend the new on-disk holder) takes the swap
/// lock. An entry stream that packs down to nothing installs the commit
/// without creating files.
pub fn dump_frozen<K: StorageKey>(map: &LevelProfileMap<K>) -> Result<bool> {
    let _busy = map.begin_background();
    let _dump = map.dump_lock.lock().unwrap();

    let frozen = match map.snapshot().frozen.last().cloned() {
        Some(frozen) => frozen,
        None => return Ok(false),
    };

    let id = map.next_level_id(0, None);
    let files = id.files(&map.config.dir, &map.config.prefix);

    let mut entries: EntryIter<K> = frozen.iterator(map.config.rw_buffer_size)?;
    if let Some(threshold) = map.expire_threshold() {
        if frozen.min_access_time() < threshold {
            entries = Box::new(AccessTimeFilterIterator::new(entries, threshold));
        }
    }

    let stats = disk::write_level(
        map.controller.as_ref(),
        &map.serializer,
        &files,
        &mut entries,
        map.config.rw_buffer_size,
    )?;

    let new_holder = match stats {
        Some(_) => {
            let level = DiskLevel::open(map.controller.as_ref(), &map.serializer, &files)?;
            Some(Arc::new(LevelHolder::new(
                id,
                Arc::new(level),
                files,
                map.controller.clone(),
            )))
        }
        None => None,
    };

    // Commit: rebuild from the current snapshot, which may have gained newer
    // frozen levels since the dump started.
    {
        let _swap = map.swap_lock.lock().unwrap();
        let cur = map.snapshot();
        let frozen_queue: Vec<_> = cur
            .frozen
            .iter()
            .filter(|f| !f.shares_core(&frozen))
            .cloned()
            .collect();
        let mut levels = Vec::with_capacity(cur.levels.len() + 1);
        if let Some(holder) = &new_holder {
            levels.push(holder.clone());
        }
        levels.extend(cur.levels.iter().cloned());
        map.install(Arc::new(MapHolder {
            rw_level: cur.rw_level.clone(),
            frozen: frozen_queue,
            levels,
        }));
    }

    match &new_holder {
        Some(holder) => {
            tracing::info!(
                sub_index = holder.id.sub_index,
                entries = holder.level.size(),
                area_size = holder.level.area_size(),
                "Dumped in-memory level"
            );
            map.merge_signal.notify_one();
        }
        None => {
            tracing::debug!("Dump produced no entries, frozen level discarded");
        }
    }

    Ok(true)
}
