//! Cluster keyspace partitioning

pub mod slot;

pub use slot::{
    fnv32, routing_hash, slot_for_hash, slot_for_key, tag_hash, LUA_SCRIPT_SLOT, TOTAL_SLOTS,
};
