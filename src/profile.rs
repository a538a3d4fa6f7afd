//! Core value types shared by every level implementation.
//!
//! A profile is an opaque, reference-counted byte blob; the engine stores and
//! returns it without ever interpreting its contents. Each stored entry also
//! carries the operation that produced it, the last-touch timestamp, and a
//! reclaimable-size estimate used by the compaction heuristics.

use bytes::Bytes;

/// Fixed per-entry bookkeeping overhead used by area-size accounting,
/// covering the key slot, holder fields and container node.
pub const ENTRY_OVERHEAD: u64 = 64;

/// The action a level recorded for a key. Drives merge semantics: for a key
/// present in several levels, the per-level operations are folded into a
/// single net operation during compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Rewrite,
    Erase,
    NotFound,
}

impl Operation {
    pub fn as_u8(self) -> u8 {
        match self {
            Operation::Insert => 0,
            Operation::Rewrite => 1,
            Operation::Erase => 2,
            Operation::NotFound => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Operation::Insert),
            1 => Some(Operation::Rewrite),
            2 => Some(Operation::Erase),
            3 => Some(Operation::NotFound),
            _ => None,
        }
    }
}

/// One stored entry of the in-memory level.
///
/// Invariant: `operation == Erase` implies an empty blob (a tombstone is
/// retained in the map so the deletion stays visible across levels until a
/// merge discards it).
#[derive(Debug, Clone)]
pub struct ProfileHolder {
    pub operation: Operation,
    /// Last-touch timestamp, unix seconds. Drives expiration.
    pub access_time: u64,
    /// Bytes the same key occupied in deeper levels when this entry was
    /// written; lets the level estimate reclaimable space without touching
    /// those levels.
    pub next_size: u64,
    pub blob: Bytes,
}

impl ProfileHolder {
    /// Physical footprint of this entry within its level.
    pub fn area(&self) -> u64 {
        self.blob.len() as u64 + ENTRY_OVERHEAD
    }
}

/// Result of an existence/metadata probe; never materializes the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckProfileResult {
    pub operation: Operation,
    pub size: u64,
}

impl CheckProfileResult {
    pub fn not_found() -> Self {
        Self {
            operation: Operation::NotFound,
            size: 0,
        }
    }

    pub fn found(&self) -> bool {
        self.operation != Operation::NotFound
    }
}

/// Result of a point lookup.
#[derive(Debug, Clone)]
pub struct GetProfileResult {
    pub operation: Operation,
    pub access_time: u64,
    pub blob: Option<Bytes>,
}

impl GetProfileResult {
    pub fn not_found() -> Self {
        Self {
            operation: Operation::NotFound,
            access_time: 0,
            blob: None,
        }
    }

    pub fn found(&self) -> bool {
        self.operation != Operation::NotFound
    }

    /// Whether a caller observes a live profile: present and not erased.
    pub fn present(&self) -> bool {
        matches!(self.operation, Operation::Insert | Operation::Rewrite)
    }
}

/// Priority of a foreground write. `Runtime` writes are subject to
/// backpressure (`Error::Blocked`) while the map is shedding load or shutting
/// down; `Background` writes (loaders, migrations) are always admitted while
/// the map is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePriority {
    Runtime,
    Background,
}
