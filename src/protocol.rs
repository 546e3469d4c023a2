//! Wire-value types and command classification
//!
//! The client-facing protocol parser lives outside this crate; what the
//! control plane needs is (a) a dynamic reply value to translate between
//! the destination's wire and the local one when proxying, (b) a seam to
//! write replies back to the local client, and (c) enough command
//! classification to pick lock modes and redirect exemptions.

use bytes::Bytes;

/// A decoded reply from a destination node.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Integer(i64),
    /// Simple status line, e.g. `OK`
    Status(String),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
}

/// Seam to the local client wire format. The server's connection layer
/// implements this; tests use a recording writer.
pub trait ReplyWriter {
    fn write_integer(&mut self, v: i64);
    fn write_status(&mut self, status: &str);
    /// `None` writes a nil bulk
    fn write_bulk(&mut self, value: Option<&[u8]>);
    fn write_array(&mut self, items: &[Reply]);
}

/// Translate a destination reply into the local wire format. Reply shapes
/// the local wire cannot express are rejected at decode time, so every
/// variant here maps cleanly.
pub fn write_reply(w: &mut dyn ReplyWriter, reply: &Reply) {
    match reply {
        Reply::Integer(v) => w.write_integer(*v),
        Reply::Status(s) => w.write_status(s),
        Reply::Bulk(b) => w.write_bulk(Some(b)),
        Reply::Nil => w.write_bulk(None),
        Reply::Array(items) => w.write_array(items),
    }
}

/// Commands that mutate the keyspace; these take the write side of a
/// key's stripe lock.
const WRITE_COMMANDS: &[&str] = &[
    "set", "setnx", "setex", "psetex", "getset", "getdel", "append", "setrange", "incr", "decr",
    "incrby", "decrby", "incrbyfloat", "mset", "del", "unlink", "expire", "pexpire", "expireat",
    "pexpireat", "persist", "rename", "hset", "hmset", "hsetnx", "hdel", "hincrby", "hincrbyfloat",
    "lpush", "rpush", "lpushx", "rpushx", "lpop", "rpop", "lset", "lrem", "linsert", "ltrim",
    "sadd", "srem", "spop", "smove", "zadd", "zrem", "zincrby", "zremrangebyscore",
    "zremrangebyrank", "zremrangebylex", "zpopmin", "zpopmax", "setbit", "kdel", "hclear",
    "lclear", "sclear", "zclear",
];

/// Commands never redirected mid-migration: multi-key read/write (their
/// keys may straddle slots), introspection, and the migration-control
/// verbs themselves (redirecting those would recurse).
const REDIRECT_EXEMPT: &[&str] = &[
    "mget",
    "mset",
    "info",
    "migrateslots",
    "migratestatus",
    "migrateend",
    "migrateslotsretry",
    "migrateretryend",
];

pub fn is_write_command(cmd: &str) -> bool {
    WRITE_COMMANDS.iter().any(|c| cmd.eq_ignore_ascii_case(c))
}

pub fn is_redirect_exempt(cmd: &str) -> bool {
    REDIRECT_EXEMPT.iter().any(|c| cmd.eq_ignore_ascii_case(c))
}
