//! Background task adapters driving the map's dump/merge/expire machinery.
//!
//! Each task is registered on the [`crate::scheduler::Scheduler`]; the dump
//! and merge tasks additionally wake on the map's notify signals so a write
//! that trips a threshold does not wait out the timer interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::Result;
use crate::key::StorageKey;
use crate::scheduler::{BackgroundTask, Context};
use crate::store::map::{dump, merge, unix_now, LevelProfileMap, ObjectState};

/// Swaps the mutable level out for a fresh one when a dump threshold trips.
pub struct ExchangeRwLevelTask<K: StorageKey> {
    map: Arc<LevelProfileMap<K>>,
}

impl<K: StorageKey> ExchangeRwLevelTask<K> {
    pub fn new(map: Arc<LevelProfileMap<K>>) -> Self {
        Self { map }
    }
}

#[async_trait::async_trait]
impl<K: StorageKey> BackgroundTask for ExchangeRwLevelTask<K> {
    fn name(&self) -> &'static str {
        "rw-level-exchange"
    }

    fn interval(&self) -> Duration {
        self.map.config.dump_check_interval
    }

    fn signal(&self) -> Option<Arc<Notify>> {
        Some(self.map.dump_signal.clone())
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.map.object_state() != ObjectState::Active {
            return Ok(());
        }
        self.map.exchange_rw_level(false);
        Ok(())
    }
}

/// Drains the frozen queue to new on-disk levels.
pub struct DumpMemLevelTask<K: StorageKey> {
    map: Arc<LevelProfileMap<K>>,
}

impl<K: StorageKey> DumpMemLevelTask<K> {
    pub fn new(map: Arc<LevelProfileMap<K>>) -> Self {
        Self { map }
    }
}

#[async_trait::async_trait]
impl<K: StorageKey> BackgroundTask for DumpMemLevelTask<K> {
    fn name(&self) -> &'static str {
        "mem-level-dump"
    }

    fn interval(&self) -> Duration {
        self.map.config.dump_check_interval
    }

    fn signal(&self) -> Option<Arc<Notify>> {
        Some(self.map.frozen_signal.clone())
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.map.object_state() != ObjectState::Active {
            return Ok(());
        }
        while dump::dump_frozen(&self.map)? {}
        Ok(())
    }
}

/// Merges on-disk levels when the merge-worthiness check fires.
pub struct MergeLevelTask<K: StorageKey> {
    map: Arc<LevelProfileMap<K>>,
}

impl<K: StorageKey> MergeLevelTask<K> {
    pub fn new(map: Arc<LevelProfileMap<K>>) -> Self {
        Self { map }
    }
}

#[async_trait::async_trait]
impl<K: StorageKey> BackgroundTask for MergeLevelTask<K> {
    fn name(&self) -> &'static str {
        "level-merge"
    }

    fn interval(&self) -> Duration {
        self.map.config.merge_interval
    }

    fn signal(&self) -> Option<Arc<Notify>> {
        Some(self.map.merge_signal.clone())
    }

    async fn execute(&self, mut ctx: Context) -> Result<()> {
        if self.map.object_state() != ObjectState::Active {
            return Ok(());
        }
        if merge::needs_merge(&self.map) {
            merge::merge(&self.map, Some(&mut ctx))?;
        }
        Ok(())
    }
}

/// Publishes the expiration threshold so the next dump/merge pass folds in
/// the access-time filter, then nudges the merge task.
pub struct ClearExpiredTask<K: StorageKey> {
    map: Arc<LevelProfileMap<K>>,
}

impl<K: StorageKey> ClearExpiredTask<K> {
    pub fn new(map: Arc<LevelProfileMap<K>>) -> Self {
        Self { map }
    }
}

#[async_trait::async_trait]
impl<K: StorageKey> BackgroundTask for ClearExpiredTask<K> {
    fn name(&self) -> &'static str {
        "clear-expired"
    }

    fn interval(&self) -> Duration {
        self.map.config.expire_check_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.map.object_state() != ObjectState::Active {
            return Ok(());
        }
        let expire_time = match self.map.config.expire_time {
            Some(expire_time) => expire_time,
            None => return Ok(()),
        };
        let threshold = unix_now().saturating_sub(expire_time.as_secs());
        self.map.set_expire_threshold(threshold);
        tracing::debug!(threshold = threshold, "Published expiration threshold");
        self.map.merge_signal.notify_one();
        Ok(())
    }
}
