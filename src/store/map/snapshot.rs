//! Copy-on-write snapshot of the level set.
//!
//! Readers clone an `Arc<MapHolder>` under a brief read lock and then work
//! lock-free against their private copy; writers (dump/merge commits) build a
//! brand-new holder and swap it in under a brief write lock. A superseded
//! on-disk level's files are unlinked only when the last snapshot referencing
//! it goes away, which the `Arc` chain plus the holder's `Drop` provide.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::io::FileController;
use crate::key::StorageKey;
use crate::store::level::disk::{DiskLevel, LevelFiles};
use crate::store::level::mem::{ReadMemLevel, RwMemLevel};

/// Total order on level age: higher `sub_index` is newer. A merge output
/// inherits the newest input's `sub_index` so it sorts exactly where the
/// replaced run sat; `index` counts merge generations and `uniq_index` only
/// disambiguates file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelId {
    pub index: u32,
    pub sub_index: u64,
    pub uniq_index: u64,
}

impl LevelId {
    pub fn file_stem(&self, prefix: &str) -> String {
        format!(
            "{}.{:06}.{:06}.{:010}",
            prefix, self.index, self.sub_index, self.uniq_index
        )
    }

    pub fn files(&self, dir: &PathBuf, prefix: &str) -> LevelFiles {
        let stem = self.file_stem(prefix);
        LevelFiles::new(
            dir.join(format!("{}.ix", stem)),
            dir.join(format!("{}.db", stem)),
        )
    }

    /// Parses `{prefix}.{index}.{sub}.{uniq}` from an index file stem.
    pub fn parse(prefix: &str, stem: &str) -> Option<Self> {
        let rest = stem.strip_prefix(prefix)?.strip_prefix('.')?;
        let mut parts = rest.split('.');
        let index = parts.next()?.parse().ok()?;
        let sub_index = parts.next()?.parse().ok()?;
        let uniq_index = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            index,
            sub_index,
            uniq_index,
        })
    }
}

/// One immutable on-disk level plus its lifecycle flags.
pub struct LevelHolder<K: StorageKey> {
    pub id: LevelId,
    pub level: Arc<DiskLevel<K>>,
    pub files: LevelFiles,
    /// Superseded by a merge; files are unlinked once the last snapshot drops.
    pub to_remove: AtomicBool,
    /// Pinned as a merge input; excluded from concurrent run selection.
    pub backup: AtomicBool,
    /// Failed an I/O during compaction; excluded from merges, still readable.
    pub corrupt: AtomicBool,
    controller: Arc<dyn FileController>,
}

impl<K: StorageKey> LevelHolder<K> {
    pub fn new(
        id: LevelId,
        level: Arc<DiskLevel<K>>,
        files: LevelFiles,
        controller: Arc<dyn FileController>,
    ) -> Self {
        Self {
            id,
            level,
            files,
            to_remove: AtomicBool::new(false),
            backup: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
            controller,
        }
    }

    pub fn mergeable(&self) -> bool {
        !self.corrupt.load(Ordering::SeqCst) && !self.backup.load(Ordering::SeqCst)
    }
}

impl<K: StorageKey> Drop for LevelHolder<K> {
    fn drop(&mut self) {
        if !self.to_remove.load(Ordering::SeqCst) {
            return;
        }
        for path in [&self.files.index_path, &self.files.body_path] {
            if let Err(e) = self.controller.remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to unlink superseded level file");
            }
        }
        tracing::debug!(
            index = self.id.index,
            sub_index = self.id.sub_index,
            "Unlinked superseded level"
        );
    }
}

/// The engine-wide snapshot: the single mutable level, exchanged-but-undumped
/// frozen levels (newest first), and on-disk levels (newest first).
pub struct MapHolder<K: StorageKey> {
    pub rw_level: Arc<RwMemLevel<K>>,
    pub frozen: Vec<ReadMemLevel<K>>,
    pub levels: Vec<Arc<LevelHolder<K>>>,
}

impl<K: StorageKey> MapHolder<K> {
    pub fn empty() -> Self {
        Self {
            rw_level: Arc::new(RwMemLevel::new()),
            frozen: Vec::new(),
            levels: Vec::new(),
        }
    }

    /// Number of never-merged dump levels currently on disk.
    pub fn levels0_count(&self) -> usize {
        self.levels.iter().filter(|h| h.id.index == 0).count()
    }
}
