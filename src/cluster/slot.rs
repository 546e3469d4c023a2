//! Hash slot calculation
//!
//! Keys are distributed across [`TOTAL_SLOTS`] hash slots by FNV-1a.
//! A key may carry a *hash tag* — the content between the first `{` and
//! the following `}` — in which case the tag alone is hashed, so that
//! related keys co-locate in one slot regardless of their full names.

/// Total number of hash slots in the cluster
pub const TOTAL_SLOTS: u32 = 1024;

/// Reserved pseudo-slot, outside the data range, under which lua script
/// bodies are kept so they can migrate like any other slot.
pub const LUA_SCRIPT_SLOT: u32 = 2048;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a over the raw key bytes
pub fn fnv32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Extract the hash tag from a key.
///
/// Returns the bytes between the first `{` and the following `}` when both
/// are present (an empty tag is returned as-is), otherwise the whole key.
pub fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(beg) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[beg + 1..].iter().position(|&b| b == b'}') {
            return &key[beg + 1..beg + 1 + end];
        }
    }
    key
}

/// Hash of the key's tag (or the key itself when untagged)
pub fn tag_hash(key: &[u8]) -> u32 {
    fnv32(extract_hash_tag(key))
}

pub fn slot_for_hash(khash: u32) -> u32 {
    khash % TOTAL_SLOTS
}

/// Slot of a key by its literal bytes, ignoring any hash tag
pub fn slot_for_key(key: &[u8]) -> u32 {
    slot_for_hash(fnv32(key))
}

/// Routing hash of a key relative to the slot being operated on.
///
/// When the key's literal hash lands in `slot`, routing uses that hash.
/// Otherwise the key is only in `slot` by virtue of a hash tag, and the
/// tag-derived hash is used for both lock selection and destination
/// routing. Returns `(hash, is_hash_tagged)`.
pub fn routing_hash(key: &[u8], slot: u32) -> (u32, bool) {
    let khash = fnv32(key);
    if slot_for_hash(khash) != slot {
        (tag_hash(key), true)
    } else {
        (khash, false)
    }
}
