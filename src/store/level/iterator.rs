//! Composable lazy sequences over levels.
//!
//! [`BaseMergeIterator`] interleaves N key-sorted inputs into one key-sorted
//! sequence; inputs are supplied newest level first, and for a key present in
//! several inputs all per-level states come out consecutively, newest first.
//! [`OperationPackIterator`] folds each such run into a single net entry, and
//! [`AccessTimeFilterIterator`] turns stale entries into tombstones ahead of
//! packing. None of these are restartable; each is consumed exactly once per
//! scan or compaction pass.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::key::StorageKey;
use crate::profile::Operation;
use crate::store::level::{KeyEntry, LevelEntry};

/// What the merge machinery needs from a sequence element.
pub trait MergeEntry<K>: Send + Sized {
    fn key(&self) -> &K;
    fn operation(&self) -> Operation;
    fn access_time(&self) -> u64;

    /// Rewrite this entry into a tombstone (blob dropped, if any).
    fn into_erased(self) -> Self;

    /// Deeper-level size estimate carried by this entry, if any.
    fn next_size_hint(&self) -> u64 {
        0
    }

    /// Produce the packed result of a same-key run: `self` is the newest
    /// entry, `operation`/`access_time` the folded net values,
    /// `oldest_next_size` the deepest entry's `next_size`.
    fn repacked(self, operation: Operation, access_time: u64, oldest_next_size: u64) -> Self;
}

impl<K: StorageKey> MergeEntry<K> for LevelEntry<K> {
    fn key(&self) -> &K {
        &self.key
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn access_time(&self) -> u64 {
        self.access_time
    }

    fn into_erased(mut self) -> Self {
        self.operation = Operation::Erase;
        self.blob = Bytes::new();
        self
    }

    fn next_size_hint(&self) -> u64 {
        self.next_size
    }

    fn repacked(mut self, operation: Operation, access_time: u64, oldest_next_size: u64) -> Self {
        self.operation = operation;
        self.access_time = access_time;
        // The oldest entry's deeper-than-itself estimate is the packed
        // level's deeper-than-run estimate.
        self.next_size = oldest_next_size;
        if operation == Operation::Erase {
            self.blob = Bytes::new();
        }
        self
    }
}

impl<K: StorageKey> MergeEntry<K> for KeyEntry<K> {
    fn key(&self) -> &K {
        &self.key
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn access_time(&self) -> u64 {
        self.access_time
    }

    fn into_erased(mut self) -> Self {
        self.operation = Operation::Erase;
        self
    }

    fn repacked(mut self, operation: Operation, access_time: u64, _oldest_next_size: u64) -> Self {
        self.operation = operation;
        self.access_time = access_time;
        self
    }
}

/// Boxed input sequence for the merge machinery.
pub type MergeInput<E> = Box<dyn Iterator<Item = Result<E>> + Send>;

struct HeapSlot<K, E> {
    entry: E,
    source: usize,
    input: MergeInput<E>,
    _marker: std::marker::PhantomData<K>,
}

impl<K: StorageKey, E: MergeEntry<K>> PartialEq for HeapSlot<K, E> {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key() == other.entry.key() && self.source == other.source
    }
}

impl<K: StorageKey, E: MergeEntry<K>> Eq for HeapSlot<K, E> {}

impl<K: StorageKey, E: MergeEntry<K>> PartialOrd for HeapSlot<K, E> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<K: StorageKey, E: MergeEntry<K>> Ord for HeapSlot<K, E> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: reverse both so the smallest key pops
        // first, and for equal keys the lowest source (newest level) wins.
        match self.entry.key().cmp(other.entry.key()) {
            CmpOrdering::Equal => self.source.cmp(&other.source).reverse(),
            other_order => other_order.reverse(),
        }
    }
}

/// N-way merge over key-sorted inputs, newest level first. Duplicate keys are
/// all yielded, consecutively, newest first; dropping duplicates is the
/// packer's job, not the merge's.
pub struct BaseMergeIterator<K: StorageKey, E: MergeEntry<K>> {
    heap: BinaryHeap<HeapSlot<K, E>>,
    stashed_error: Option<Error>,
}

/// Key+value merge.
pub type MergeIterator<K> = BaseMergeIterator<K, LevelEntry<K>>;

/// Key-only merge.
pub type KeyMergeIterator<K> = BaseMergeIterator<K, KeyEntry<K>>;

impl<K: StorageKey, E: MergeEntry<K>> BaseMergeIterator<K, E> {
    pub fn new(inputs: Vec<MergeInput<E>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (source, mut input) in inputs.into_iter().enumerate() {
            match input.next() {
                Some(Ok(entry)) => heap.push(HeapSlot {
                    entry,
                    source,
                    input,
                    _marker: std::marker::PhantomData,
                }),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        Ok(Self {
            heap,
            stashed_error: None,
        })
    }
}

impl<K: StorageKey, E: MergeEntry<K>> Iterator for BaseMergeIterator<K, E> {
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.stashed_error.take() {
            return Some(Err(e));
        }

        let mut slot = self.heap.pop()?;
        match slot.input.next() {
            Some(Ok(entry)) => {
                let out = std::mem::replace(&mut slot.entry, entry);
                self.heap.push(slot);
                Some(Ok(out))
            }
            // Surface the input failure on the following call; the popped
            // entry is still valid.
            Some(Err(e)) => {
                self.stashed_error = Some(e);
                Some(Ok(slot.entry))
            }
            None => Some(Ok(slot.entry)),
        }
    }
}

/// The compaction rule: fold the newest state (`high`) with the accumulated
/// state of everything older (`low`) into a net operation. `None` means the
/// pair cancels out entirely (an erase meeting the insert that created the
/// key: across the merged levels the key never existed).
pub fn pack_operations(high: Operation, low: Operation) -> Option<Operation> {
    use Operation::*;
    match (high, low) {
        (Insert, NotFound) | (Insert, Insert) => Some(Insert),
        (Insert, Erase) | (Insert, Rewrite) => Some(Rewrite),
        (Rewrite, Insert) => Some(Insert),
        (Rewrite, _) => Some(Rewrite),
        (Erase, Insert) => None,
        (Erase, _) => Some(Erase),
        (NotFound, low) => Some(low),
    }
}

/// Collapses each consecutive same-key run of a merge into one net entry:
/// operation folded per [`pack_operations`], access time the maximum over
/// the run, blob from the newest state. Runs that cancel out are skipped.
pub struct OperationPackIterator<K, E, I> {
    inner: I,
    lookahead: Option<E>,
    stashed_error: Option<Error>,
    _marker: std::marker::PhantomData<K>,
}

impl<K, E, I> OperationPackIterator<K, E, I>
where
    K: StorageKey,
    E: MergeEntry<K>,
    I: Iterator<Item = Result<E>>,
{
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            lookahead: None,
            stashed_error: None,
            _marker: std::marker::PhantomData,
        }
    }

    fn next_run(&mut self) -> Option<Result<Vec<E>>> {
        let first = match self.lookahead.take() {
            Some(entry) => entry,
            None => match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            },
        };

        let mut run = vec![first];
        loop {
            match self.inner.next() {
                None => break,
                Some(Err(e)) => {
                    self.stashed_error = Some(e);
                    break;
                }
                Some(Ok(entry)) => {
                    if entry.key() == run[0].key() {
                        run.push(entry);
                    } else {
                        self.lookahead = Some(entry);
                        break;
                    }
                }
            }
        }
        Some(Ok(run))
    }
}

/// Folds a newest-first run into its packed entry, or `None` if it cancels.
fn pack_run<K: StorageKey, E: MergeEntry<K>>(run: Vec<E>) -> Option<E> {
    let mut net = Operation::NotFound;
    let mut access_time = 0u64;
    for entry in run.iter().rev() {
        access_time = access_time.max(entry.access_time());
        net = match pack_operations(entry.operation(), net) {
            Some(op) => op,
            // A cancelled sub-chain leaves nothing underneath.
            None => Operation::NotFound,
        };
    }
    if net == Operation::NotFound {
        return None;
    }

    let oldest_next_size = run.last().map(|e| e.next_size_hint()).unwrap_or(0);
    let newest = run.into_iter().next().expect("run is never empty");
    Some(newest.repacked(net, access_time, oldest_next_size))
}

impl<K, E, I> Iterator for OperationPackIterator<K, E, I>
where
    K: StorageKey,
    E: MergeEntry<K>,
    I: Iterator<Item = Result<E>>,
{
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.stashed_error.take() {
                return Some(Err(e));
            }
            let run = match self.next_run()? {
                Ok(run) => run,
                Err(e) => return Some(Err(e)),
            };
            if let Some(packed) = pack_run(run) {
                return Some(Ok(packed));
            }
        }
    }
}

/// Rewrites entries whose access time predates `min_access_time` into
/// tombstones, so the next compaction physically reclaims them. `Insert`
/// entries pass through unchanged: a first write of a key in its level is
/// never pre-expired into a tombstone, which could cancel against deeper
/// history outside the pass.
pub struct AccessTimeFilterIterator<K, E, I> {
    inner: I,
    min_access_time: u64,
    _marker: std::marker::PhantomData<(K, E)>,
}

impl<K, E, I> AccessTimeFilterIterator<K, E, I>
where
    K: StorageKey,
    E: MergeEntry<K>,
    I: Iterator<Item = Result<E>>,
{
    pub fn new(inner: I, min_access_time: u64) -> Self {
        Self {
            inner,
            min_access_time,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K, E, I> Iterator for AccessTimeFilterIterator<K, E, I>
where
    K: StorageKey,
    E: MergeEntry<K>,
    I: Iterator<Item = Result<E>>,
{
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(entry) => {
                if entry.operation() != Operation::Insert
                    && entry.access_time() < self.min_access_time
                {
                    Some(Ok(entry.into_erased()))
                } else {
                    Some(Ok(entry))
                }
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &'static [u8], op: Operation, at: u64, blob: &'static [u8]) -> LevelEntry<Vec<u8>> {
        LevelEntry {
            key: key.to_vec(),
            operation: op,
            access_time: at,
            next_size: 0,
            blob: Bytes::from_static(blob),
        }
    }

    fn input(entries: Vec<LevelEntry<Vec<u8>>>) -> MergeInput<LevelEntry<Vec<u8>>> {
        Box::new(entries.into_iter().map(Ok))
    }

    fn collect<I: Iterator<Item = Result<LevelEntry<Vec<u8>>>>>(iter: I) -> Vec<LevelEntry<Vec<u8>>> {
        iter.collect::<Result<Vec<_>>>().expect("iteration failed")
    }

    #[test]
    fn test_merge_orders_by_key() {
        let merged = BaseMergeIterator::new(vec![
            input(vec![
                entry(b"b", Operation::Insert, 1, b"b0"),
                entry(b"d", Operation::Insert, 1, b"d0"),
            ]),
            input(vec![
                entry(b"a", Operation::Insert, 1, b"a1"),
                entry(b"c", Operation::Insert, 1, b"c1"),
            ]),
        ])
        .expect("merge failed");

        let keys: Vec<_> = collect(merged).into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_merge_duplicates_come_newest_first() {
        // Input 0 is the newest level.
        let merged = BaseMergeIterator::new(vec![
            input(vec![entry(b"k", Operation::Rewrite, 9, b"new")]),
            input(vec![entry(b"k", Operation::Insert, 3, b"old")]),
        ])
        .expect("merge failed");

        let entries = collect(merged);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].blob, Bytes::from_static(b"new"));
        assert_eq!(entries[1].blob, Bytes::from_static(b"old"));
    }

    #[test]
    fn test_pack_operations_table() {
        use Operation::*;
        assert_eq!(pack_operations(Insert, NotFound), Some(Insert));
        assert_eq!(pack_operations(Insert, Insert), Some(Insert));
        assert_eq!(pack_operations(Insert, Erase), Some(Rewrite));
        assert_eq!(pack_operations(Insert, Rewrite), Some(Rewrite));
        assert_eq!(pack_operations(Rewrite, Insert), Some(Insert));
        assert_eq!(pack_operations(Rewrite, Rewrite), Some(Rewrite));
        assert_eq!(pack_operations(Rewrite, Erase), Some(Rewrite));
        assert_eq!(pack_operations(Rewrite, NotFound), Some(Rewrite));
        assert_eq!(pack_operations(Erase, Erase), Some(Erase));
        assert_eq!(pack_operations(Erase, Rewrite), Some(Erase));
        assert_eq!(pack_operations(Erase, NotFound), Some(Erase));
        assert_eq!(pack_operations(Erase, Insert), None);
    }

    #[test]
    fn test_pack_newest_wins() {
        let merged = BaseMergeIterator::new(vec![
            input(vec![entry(b"k", Operation::Insert, 9, b"new")]),
            input(vec![entry(b"k", Operation::Insert, 3, b"old")]),
        ])
        .expect("merge failed");
        let packed = collect(OperationPackIterator::new(merged));

        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].operation, Operation::Insert);
        assert_eq!(packed[0].blob, Bytes::from_static(b"new"));
        assert_eq!(packed[0].access_time, 9);
    }

    #[test]
    fn test_pack_erase_over_insert_cancels() {
        let merged = BaseMergeIterator::new(vec![
            input(vec![entry(b"k", Operation::Erase, 9, b"")]),
            input(vec![
                entry(b"j", Operation::Insert, 2, b"keep"),
                entry(b"k", Operation::Insert, 3, b"gone"),
            ]),
        ])
        .expect("merge failed");
        let packed = collect(OperationPackIterator::new(merged));

        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].key, b"j".to_vec());
    }

    #[test]
    fn test_pack_erase_over_rewrite_keeps_tombstone() {
        let merged = BaseMergeIterator::new(vec![
            input(vec![entry(b"k", Operation::Erase, 9, b"")]),
            input(vec![entry(b"k", Operation::Rewrite, 3, b"old")]),
        ])
        .expect("merge failed");
        let packed = collect(OperationPackIterator::new(merged));

        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].operation, Operation::Erase);
        assert!(packed[0].blob.is_empty());
        assert_eq!(packed[0].access_time, 9);
    }

    #[test]
    fn test_pack_insert_over_erase_becomes_rewrite() {
        let merged = BaseMergeIterator::new(vec![
            input(vec![entry(b"k", Operation::Insert, 9, b"revived")]),
            input(vec![entry(b"k", Operation::Erase, 3, b"")]),
        ])
        .expect("merge failed");
        let packed = collect(OperationPackIterator::new(merged));

        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].operation, Operation::Rewrite);
        assert_eq!(packed[0].blob, Bytes::from_static(b"revived"));
    }

    #[test]
    fn test_pack_cancelled_chain_under_newer_insert() {
        // Newest to oldest: INSERT, ERASE, INSERT. The lower pair cancels;
        // the newest insert stands alone.
        let merged = BaseMergeIterator::new(vec![
            input(vec![entry(b"k", Operation::Insert, 9, b"v3")]),
            input(vec![entry(b"k", Operation::Erase, 5, b"")]),
            input(vec![entry(b"k", Operation::Insert, 1, b"v1")]),
        ])
        .expect("merge failed");
        let packed = collect(OperationPackIterator::new(merged));

        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].operation, Operation::Insert);
        assert_eq!(packed[0].blob, Bytes::from_static(b"v3"));
        assert_eq!(packed[0].access_time, 9);
    }

    #[test]
    fn test_pack_next_size_comes_from_oldest() {
        let mut newest = entry(b"k", Operation::Insert, 9, b"new");
        newest.next_size = 11;
        let mut oldest = entry(b"k", Operation::Insert, 3, b"old");
        oldest.next_size = 77;

        let merged =
            BaseMergeIterator::new(vec![input(vec![newest]), input(vec![oldest])]).expect("merge");
        let packed = collect(OperationPackIterator::new(merged));
        assert_eq!(packed[0].next_size, 77);
    }

    #[test]
    fn test_access_time_filter_rewrites_stale() {
        let entries = vec![
            Ok(entry(b"a", Operation::Rewrite, 10, b"stale")),
            Ok(entry(b"b", Operation::Rewrite, 90, b"fresh")),
            Ok(entry(b"c", Operation::Insert, 10, b"stale-insert")),
            Ok(entry(b"d", Operation::Erase, 10, b"")),
        ];
        let filtered: Vec<_> =
            collect(AccessTimeFilterIterator::new(entries.into_iter(), 50));

        assert_eq!(filtered[0].operation, Operation::Erase);
        assert!(filtered[0].blob.is_empty());
        assert_eq!(filtered[1].operation, Operation::Rewrite);
        // Inserts pass through untouched.
        assert_eq!(filtered[2].operation, Operation::Insert);
        assert_eq!(filtered[3].operation, Operation::Erase);
    }

    #[test]
    fn test_filter_then_pack_expires_rewritten_chain() {
        // A stale rewrite over its insert cancels out entirely once filtered.
        let newest = input(vec![entry(b"k", Operation::Rewrite, 10, b"stale")]);
        let oldest = input(vec![entry(b"k", Operation::Insert, 5, b"orig")]);

        let filtered_newest: MergeInput<LevelEntry<Vec<u8>>> =
            Box::new(AccessTimeFilterIterator::new(newest, 50));
        let filtered_oldest: MergeInput<LevelEntry<Vec<u8>>> =
            Box::new(AccessTimeFilterIterator::new(oldest, 50));

        let merged = BaseMergeIterator::new(vec![filtered_newest, filtered_oldest])
            .expect("merge failed");
        let packed = collect(OperationPackIterator::new(merged));
        assert!(packed.is_empty());
    }

    #[test]
    fn test_key_merge_iterator_tie_break() {
        let newest: MergeInput<KeyEntry<Vec<u8>>> = Box::new(
            vec![Ok(KeyEntry {
                key: b"k".to_vec(),
                operation: Operation::Rewrite,
                access_time: 9,
            })]
            .into_iter(),
        );
        let oldest: MergeInput<KeyEntry<Vec<u8>>> = Box::new(
            vec![Ok(KeyEntry {
                key: b"k".to_vec(),
                operation: Operation::Insert,
                access_time: 2,
            })]
            .into_iter(),
        );

        let merged: Vec<_> = KeyMergeIterator::new(vec![newest, oldest])
            .expect("merge failed")
            .collect::<Result<Vec<_>>>()
            .expect("iteration failed");
        assert_eq!(merged[0].access_time, 9);
        assert_eq!(merged[1].access_time, 2);
    }
}
