//! Object-store collaborator seams
//!
//! The typed stores, durable metadata, and keyspace structure are external
//! collaborators of the control plane; these traits capture exactly the
//! surface the migration job, redirect gate, and snapshot lifecycle call
//! into. [`memory::MemoryStore`] implements them for tests and embedded
//! callers.

use std::path::Path;

use bytes::Bytes;

use crate::error::Result;
use crate::migration::MigrationStatus;

pub mod memory;

pub use memory::{MemoryMeta, MemoryStore};

/// Cursor value a slot scan returns once the keyspace is exhausted.
pub const SCAN_END_CURSOR: &[u8] = b"0";

/// Type tag of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Hash,
    List,
    Set,
    ZSet,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::String => write!(f, "string"),
            DataType::Hash => write!(f, "hash"),
            DataType::List => write!(f, "list"),
            DataType::Set => write!(f, "set"),
            DataType::ZSet => write!(f, "zset"),
        }
    }
}

/// One key returned by a slot scan.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub key: Bytes,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub field: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMember {
    pub score: f64,
    pub member: Bytes,
}

/// Per-type object-store operations plus the slot scan and checkpoint.
///
/// TTLs are in milliseconds; `-1` means no expiry. Keys are addressed by
/// `(key, khash)` where `khash` is the routing hash the proxy layer derived
/// (tag-aware), matching how the engine placed the key.
pub trait SlotStore: Send + Sync {
    fn string_get_with_ttl(&self, key: &[u8], khash: u32) -> Result<Option<(Bytes, i64)>>;
    fn string_set(&self, key: &[u8], khash: u32, value: Bytes) -> Result<()>;

    /// Remaining TTL of any key's base metadata, `-1` when none.
    fn key_pttl(&self, key: &[u8], khash: u32) -> Result<i64>;
    fn set_key_pttl(&self, key: &[u8], khash: u32, ttl_ms: i64) -> Result<()>;

    /// Whether the key exists in this node's keyspace, any type.
    fn key_exists(&self, key: &[u8], khash: u32) -> Result<bool>;

    fn hash_get_all(&self, key: &[u8], khash: u32) -> Result<Vec<FieldValue>>;
    fn hash_set(&self, key: &[u8], khash: u32, field: Bytes, value: Bytes) -> Result<()>;

    fn list_len(&self, key: &[u8], khash: u32) -> Result<u64>;
    fn list_range(&self, key: &[u8], khash: u32, start: i64, stop: i64) -> Result<Vec<Bytes>>;
    fn list_rpush(&self, key: &[u8], khash: u32, values: &[Bytes]) -> Result<()>;

    fn set_members(&self, key: &[u8], khash: u32) -> Result<Vec<Bytes>>;
    fn set_add(&self, key: &[u8], khash: u32, members: &[Bytes]) -> Result<()>;

    /// Full range of a sorted set, ordered by (score, member).
    fn zset_range_all(&self, key: &[u8], khash: u32) -> Result<Vec<ScoreMember>>;
    fn zset_add(&self, key: &[u8], khash: u32, pairs: &[ScoreMember]) -> Result<()>;

    /// Body of a lua script registered under the reserved script slot,
    /// `None` for anything else.
    fn script_get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Delete the key if it holds a value of `data_type`. Returns whether
    /// anything was removed.
    fn delete(&self, data_type: DataType, key: &[u8], khash: u32) -> Result<bool>;

    /// Cursor-paged scan of one slot's keys. `cursor = None` starts from the
    /// beginning; the returned cursor equals [`SCAN_END_CURSOR`] when the
    /// slot is exhausted. Only the `"*"` pattern is supported.
    fn scan_by_slot(
        &self,
        slot: u32,
        cursor: Option<&[u8]>,
        limit: usize,
        pattern: &str,
    ) -> Result<(Bytes, Vec<ScanEntry>)>;

    /// Checkpoint engine state into `dir` (which exists and is empty).
    fn checkpoint(&self, dir: &Path) -> Result<()>;
}

/// Durable node metadata consumed by migration restart recognition and the
/// snapshot lifecycle.
pub trait MetaStore: Send + Sync {
    fn migrate_status(&self) -> MigrationStatus;
    fn set_migrate_status(&self, status: MigrationStatus);

    fn migrate_slot(&self) -> u64;
    fn set_migrate_slot(&self, slot: u64);

    fn update_index(&self) -> u64;
    fn set_update_index(&self, index: u64);

    /// Record the index of the snapshot being retained; returns the
    /// previously retained index (0 when none).
    fn set_snapshot_index(&self, index: u64) -> u64;

    fn checkpoint(&self, dir: &Path) -> Result<()>;
}

/// Migration marker on the key-space structure, consulted by local reads
/// while a slot is mid-migration.
pub trait KeyspaceMarker: Send + Sync {
    fn start_migrate(&self, slot: u32);
    fn clear_migrate(&self);
    fn migrating_slot(&self) -> Option<u32>;
}
