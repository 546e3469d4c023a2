//! In-memory store and metadata
//!
//! Reference implementation of the collaborator seams, used by tests and
//! embedded callers. Keys live in an ordered map so slot scans are
//! deterministic; each entry remembers the routing hash it was written
//! under, which is what drives `scan_by_slot`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::cluster::{fnv32, slot_for_hash, LUA_SCRIPT_SLOT};
use crate::error::{MagnetiteError, Result};
use crate::migration::MigrationStatus;

use super::{
    DataType, FieldValue, KeyspaceMarker, MetaStore, ScanEntry, ScoreMember, SlotStore,
    SCAN_END_CURSOR,
};

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    Hash(BTreeMap<Vec<u8>, Bytes>),
    List(Vec<Bytes>),
    Set(BTreeSet<Vec<u8>>),
    ZSet(BTreeMap<Vec<u8>, f64>),
}

impl Value {
    fn data_type(&self) -> DataType {
        match self {
            Value::Str(_) => DataType::String,
            Value::Hash(_) => DataType::Hash,
            Value::List(_) => DataType::List,
            Value::Set(_) => DataType::Set,
            Value::ZSet(_) => DataType::ZSet,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    khash: u32,
    /// Slot the entry scans under; `slot_for_hash(khash)` for data keys,
    /// the reserved script slot for script bodies.
    slot: u32,
    ttl_ms: i64,
    value: Value,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Entry>>,
    migrating: Mutex<Option<u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Register a lua script body under the reserved script slot.
    pub fn script_put(&self, key: &[u8], script: Bytes) {
        self.entries.write().insert(
            key.to_vec(),
            Entry {
                khash: fnv32(key),
                slot: LUA_SCRIPT_SLOT,
                ttl_ms: -1,
                value: Value::Str(script),
            },
        );
    }

    fn wrong_type(expected: DataType, actual: DataType) -> MagnetiteError {
        MagnetiteError::Store(format!(
            "operation against a {actual} key, expected {expected}"
        ))
    }

    fn with_entry<T>(
        &self,
        key: &[u8],
        expected: DataType,
        f: impl FnOnce(&Entry) -> T,
    ) -> Result<Option<T>> {
        let entries = self.entries.read();
        match entries.get(key) {
            None => Ok(None),
            Some(e) if e.value.data_type() != expected => {
                Err(Self::wrong_type(expected, e.value.data_type()))
            }
            Some(e) => Ok(Some(f(e))),
        }
    }

    fn upsert(
        &self,
        key: &[u8],
        khash: u32,
        expected: DataType,
        empty: Value,
        f: impl FnOnce(&mut Value),
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_vec()).or_insert(Entry {
            khash,
            slot: slot_for_hash(khash),
            ttl_ms: -1,
            value: empty,
        });
        if entry.value.data_type() != expected {
            return Err(Self::wrong_type(expected, entry.value.data_type()));
        }
        f(&mut entry.value);
        Ok(())
    }
}

impl SlotStore for MemoryStore {
    fn string_get_with_ttl(&self, key: &[u8], _khash: u32) -> Result<Option<(Bytes, i64)>> {
        self.with_entry(key, DataType::String, |e| match &e.value {
            Value::Str(v) => (v.clone(), e.ttl_ms),
            _ => unreachable!(),
        })
    }

    fn string_set(&self, key: &[u8], khash: u32, value: Bytes) -> Result<()> {
        self.entries.write().insert(
            key.to_vec(),
            Entry {
                khash,
                slot: slot_for_hash(khash),
                ttl_ms: -1,
                value: Value::Str(value),
            },
        );
        Ok(())
    }

    fn key_pttl(&self, key: &[u8], _khash: u32) -> Result<i64> {
        Ok(self.entries.read().get(key).map_or(-1, |e| e.ttl_ms))
    }

    fn set_key_pttl(&self, key: &[u8], _khash: u32, ttl_ms: i64) -> Result<()> {
        if let Some(e) = self.entries.write().get_mut(key) {
            e.ttl_ms = ttl_ms;
        }
        Ok(())
    }

    fn key_exists(&self, key: &[u8], _khash: u32) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn hash_get_all(&self, key: &[u8], _khash: u32) -> Result<Vec<FieldValue>> {
        Ok(self
            .with_entry(key, DataType::Hash, |e| match &e.value {
                Value::Hash(m) => m
                    .iter()
                    .map(|(f, v)| FieldValue {
                        field: Bytes::copy_from_slice(f),
                        value: v.clone(),
                    })
                    .collect(),
                _ => unreachable!(),
            })?
            .unwrap_or_default())
    }

    fn hash_set(&self, key: &[u8], khash: u32, field: Bytes, value: Bytes) -> Result<()> {
        self.upsert(
            key,
            khash,
            DataType::Hash,
            Value::Hash(BTreeMap::new()),
            |v| {
                if let Value::Hash(m) = v {
                    m.insert(field.to_vec(), value);
                }
            },
        )
    }

    fn list_len(&self, key: &[u8], _khash: u32) -> Result<u64> {
        Ok(self
            .with_entry(key, DataType::List, |e| match &e.value {
                Value::List(l) => l.len() as u64,
                _ => unreachable!(),
            })?
            .unwrap_or(0))
    }

    fn list_range(&self, key: &[u8], _khash: u32, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        Ok(self
            .with_entry(key, DataType::List, |e| match &e.value {
                Value::List(l) => {
                    let len = l.len() as i64;
                    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
                    let lo = norm(start) as usize;
                    let hi = (norm(stop) + 1).min(len) as usize;
                    if lo >= hi {
                        Vec::new()
                    } else {
                        l[lo..hi].to_vec()
                    }
                }
                _ => unreachable!(),
            })?
            .unwrap_or_default())
    }

    fn list_rpush(&self, key: &[u8], khash: u32, values: &[Bytes]) -> Result<()> {
        self.upsert(key, khash, DataType::List, Value::List(Vec::new()), |v| {
            if let Value::List(l) = v {
                l.extend_from_slice(values);
            }
        })
    }

    fn set_members(&self, key: &[u8], _khash: u32) -> Result<Vec<Bytes>> {
        Ok(self
            .with_entry(key, DataType::Set, |e| match &e.value {
                Value::Set(s) => s.iter().map(|m| Bytes::copy_from_slice(m)).collect(),
                _ => unreachable!(),
            })?
            .unwrap_or_default())
    }

    fn set_add(&self, key: &[u8], khash: u32, members: &[Bytes]) -> Result<()> {
        self.upsert(key, khash, DataType::Set, Value::Set(BTreeSet::new()), |v| {
            if let Value::Set(s) = v {
                for m in members {
                    s.insert(m.to_vec());
                }
            }
        })
    }

    fn zset_range_all(&self, key: &[u8], _khash: u32) -> Result<Vec<ScoreMember>> {
        Ok(self
            .with_entry(key, DataType::ZSet, |e| match &e.value {
                Value::ZSet(z) => {
                    let mut pairs: Vec<ScoreMember> = z
                        .iter()
                        .map(|(m, &score)| ScoreMember {
                            score,
                            member: Bytes::copy_from_slice(m),
                        })
                        .collect();
                    pairs.sort_by(|a, b| {
                        a.score
                            .partial_cmp(&b.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.member.cmp(&b.member))
                    });
                    pairs
                }
                _ => unreachable!(),
            })?
            .unwrap_or_default())
    }

    fn zset_add(&self, key: &[u8], khash: u32, pairs: &[ScoreMember]) -> Result<()> {
        self.upsert(
            key,
            khash,
            DataType::ZSet,
            Value::ZSet(BTreeMap::new()),
            |v| {
                if let Value::ZSet(z) = v {
                    for p in pairs {
                        z.insert(p.member.to_vec(), p.score);
                    }
                }
            },
        )
    }

    fn script_get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let entries = self.entries.read();
        Ok(entries.get(key).and_then(|e| match &e.value {
            Value::Str(v) if e.slot == LUA_SCRIPT_SLOT => Some(v.clone()),
            _ => None,
        }))
    }

    fn delete(&self, data_type: DataType, key: &[u8], _khash: u32) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(e) if e.value.data_type() == data_type => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn scan_by_slot(
        &self,
        slot: u32,
        cursor: Option<&[u8]>,
        limit: usize,
        _pattern: &str,
    ) -> Result<(Bytes, Vec<ScanEntry>)> {
        let entries = self.entries.read();
        let mut out = Vec::new();
        let start: Vec<u8> = cursor.map(|c| c.to_vec()).unwrap_or_default();
        for (key, entry) in entries.range(start..) {
            if out.len() == limit {
                return Ok((Bytes::copy_from_slice(key), out));
            }
            if entry.slot == slot {
                out.push(ScanEntry {
                    key: Bytes::copy_from_slice(key),
                    data_type: entry.value.data_type(),
                });
            }
        }
        Ok((Bytes::from_static(SCAN_END_CURSOR), out))
    }

    fn checkpoint(&self, dir: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct SerEntry {
            key: Vec<u8>,
            khash: u32,
            ttl_ms: i64,
            kind: String,
            payload: Vec<Vec<u8>>,
        }

        let entries = self.entries.read();
        let dump: Vec<SerEntry> = entries
            .iter()
            .map(|(key, e)| {
                let payload = match &e.value {
                    Value::Str(v) => vec![v.to_vec()],
                    Value::Hash(m) => m
                        .iter()
                        .flat_map(|(f, v)| [f.clone(), v.to_vec()])
                        .collect(),
                    Value::List(l) => l.iter().map(|v| v.to_vec()).collect(),
                    Value::Set(s) => s.iter().cloned().collect(),
                    Value::ZSet(z) => z
                        .iter()
                        .flat_map(|(m, s)| [m.clone(), s.to_string().into_bytes()])
                        .collect(),
                };
                SerEntry {
                    key: key.clone(),
                    khash: e.khash,
                    ttl_ms: e.ttl_ms,
                    kind: e.value.data_type().to_string(),
                    payload,
                }
            })
            .collect();
        let json = serde_json::to_vec(&dump)
            .map_err(|e| MagnetiteError::Checkpoint(e.to_string()))?;
        std::fs::write(dir.join("data.json"), json)?;
        Ok(())
    }
}

impl KeyspaceMarker for MemoryStore {
    fn start_migrate(&self, slot: u32) {
        *self.migrating.lock() = Some(slot);
    }

    fn clear_migrate(&self) {
        *self.migrating.lock() = None;
    }

    fn migrating_slot(&self) -> Option<u32> {
        *self.migrating.lock()
    }
}

/// In-memory durable metadata.
#[derive(Default)]
pub struct MemoryMeta {
    migrate_status: AtomicU8,
    migrate_slot: AtomicU64,
    update_index: AtomicU64,
    snapshot_index: AtomicU64,
}

impl MemoryMeta {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMeta {
    fn migrate_status(&self) -> MigrationStatus {
        MigrationStatus::from_code(self.migrate_status.load(Ordering::Acquire))
    }

    fn set_migrate_status(&self, status: MigrationStatus) {
        self.migrate_status.store(status.code(), Ordering::Release);
    }

    fn migrate_slot(&self) -> u64 {
        self.migrate_slot.load(Ordering::Acquire)
    }

    fn set_migrate_slot(&self, slot: u64) {
        self.migrate_slot.store(slot, Ordering::Release);
    }

    fn update_index(&self) -> u64 {
        self.update_index.load(Ordering::Acquire)
    }

    fn set_update_index(&self, index: u64) {
        self.update_index.store(index, Ordering::Release);
    }

    fn set_snapshot_index(&self, index: u64) -> u64 {
        self.snapshot_index.swap(index, Ordering::AcqRel)
    }

    fn checkpoint(&self, dir: &Path) -> Result<()> {
        let json = serde_json::json!({
            "migrate_status": self.migrate_status.load(Ordering::Acquire),
            "migrate_slot": self.migrate_slot.load(Ordering::Acquire),
            "update_index": self.update_index.load(Ordering::Acquire),
            "snapshot_index": self.snapshot_index.load(Ordering::Acquire),
        });
        std::fs::write(dir.join("meta.json"), json.to_string())?;
        Ok(())
    }
}
