//! Scriptable in-process destination for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{MagnetiteError, Result};
use crate::protocol::Reply;

use super::{Connector, DestinationConn};

/// Keyspace of a fake destination node, shared across its connections.
#[derive(Default)]
pub struct FakeDestState {
    pub strings: HashMap<Vec<u8>, Vec<u8>>,
    pub hashes: HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>,
    pub lists: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    pub sets: HashMap<Vec<u8>, HashSet<Vec<u8>>>,
    pub zsets: HashMap<Vec<u8>, BTreeMap<Vec<u8>, f64>>,
    pub ttls: HashMap<Vec<u8>, i64>,
    /// Script bodies registered via SCRIPT LOAD
    pub scripts: Vec<Vec<u8>>,
    /// Total mutating commands applied
    pub writes: u64,
    /// Commands that arrived wrapped in the routing script
    pub eval_calls: u64,
    /// Connections dialed
    pub dials: u64,
    /// Keys whose writes are rejected, to exercise failure accounting
    pub fail_keys: HashSet<Vec<u8>>,
}

impl FakeDestState {
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.sets.contains_key(key)
            || self.zsets.contains_key(key)
    }
}

fn apply(state: &mut FakeDestState, cmd: &str, args: &[Bytes]) -> Result<Reply> {
    let cmd = cmd.to_ascii_lowercase();
    if let Some(key) = args.first() {
        if state.fail_keys.contains(&key[..]) && cmd != "get" {
            return Err(MagnetiteError::Remote("ERR injected failure".to_string()));
        }
    }
    match cmd.as_str() {
        "set" => {
            state.strings.insert(args[0].to_vec(), args[1].to_vec());
            state.writes += 1;
            Ok(Reply::Status("OK".to_string()))
        }
        "setnx" => {
            if state.strings.contains_key(&args[0][..]) {
                Ok(Reply::Integer(0))
            } else {
                state.strings.insert(args[0].to_vec(), args[1].to_vec());
                state.writes += 1;
                Ok(Reply::Integer(1))
            }
        }
        "get" => Ok(state
            .strings
            .get(&args[0][..])
            .map(|v| Reply::Bulk(Bytes::copy_from_slice(v)))
            .unwrap_or(Reply::Nil)),
        "pexpire" => {
            let ms: i64 = std::str::from_utf8(&args[1])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| MagnetiteError::Remote("ERR bad expire".to_string()))?;
            if state.contains_key(&args[0]) {
                state.ttls.insert(args[0].to_vec(), ms);
                state.writes += 1;
                Ok(Reply::Integer(1))
            } else {
                Ok(Reply::Integer(0))
            }
        }
        "hmset" => {
            let hash = state.hashes.entry(args[0].to_vec()).or_default();
            for pair in args[1..].chunks(2) {
                hash.insert(pair[0].to_vec(), pair[1].to_vec());
            }
            state.writes += 1;
            Ok(Reply::Status("OK".to_string()))
        }
        "hget" => Ok(state
            .hashes
            .get(&args[0][..])
            .and_then(|h| h.get(&args[1][..]))
            .map(|v| Reply::Bulk(Bytes::copy_from_slice(v)))
            .unwrap_or(Reply::Nil)),
        "hset" => {
            let hash = state.hashes.entry(args[0].to_vec()).or_default();
            let fresh = hash.insert(args[1].to_vec(), args[2].to_vec()).is_none();
            state.writes += 1;
            Ok(Reply::Integer(i64::from(fresh)))
        }
        "rpush" => {
            let list = state.lists.entry(args[0].to_vec()).or_default();
            list.extend(args[1..].iter().map(|v| v.to_vec()));
            state.writes += 1;
            Ok(Reply::Integer(list.len() as i64))
        }
        "sadd" => {
            let set = state.sets.entry(args[0].to_vec()).or_default();
            let mut added = 0;
            for m in &args[1..] {
                if set.insert(m.to_vec()) {
                    added += 1;
                }
            }
            state.writes += 1;
            Ok(Reply::Integer(added))
        }
        "zadd" => {
            let zset = state.zsets.entry(args[0].to_vec()).or_default();
            let mut added = 0;
            for pair in args[1..].chunks(2) {
                let score: f64 = std::str::from_utf8(&pair[0])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| MagnetiteError::Remote("ERR bad score".to_string()))?;
                if zset.insert(pair[1].to_vec(), score).is_none() {
                    added += 1;
                }
            }
            state.writes += 1;
            Ok(Reply::Integer(added))
        }
        "script" => {
            if args.len() != 2 || !args[0].eq_ignore_ascii_case(b"load") {
                return Err(MagnetiteError::Remote(
                    "ERR unknown SCRIPT subcommand".to_string(),
                ));
            }
            state.scripts.push(args[1].to_vec());
            state.writes += 1;
            Ok(Reply::Bulk(Bytes::from_static(b"sha")))
        }
        "eval" => {
            // args: script, numkeys, cmd, key, rest...
            state.eval_calls += 1;
            let inner = std::str::from_utf8(&args[2])
                .map_err(|_| MagnetiteError::Remote("ERR bad eval command".to_string()))?
                .to_string();
            let inner_args = args[3..].to_vec();
            apply(state, &inner, &inner_args)
        }
        other => Err(MagnetiteError::Remote(format!(
            "ERR unknown command '{other}'"
        ))),
    }
}

pub struct FakeDestination {
    state: Arc<Mutex<FakeDestState>>,
}

#[async_trait]
impl DestinationConn for FakeDestination {
    async fn call(&mut self, cmd: &str, args: &[Bytes]) -> Result<Reply> {
        apply(&mut self.state.lock(), cmd, args)
    }
}

/// Connector whose connections all share one [`FakeDestState`].
#[derive(Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeDestState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<Mutex<FakeDestState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn DestinationConn>> {
        self.state.lock().dials += 1;
        Ok(Box::new(FakeDestination {
            state: Arc::clone(&self.state),
        }))
    }
}
