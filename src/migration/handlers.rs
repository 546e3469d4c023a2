//! Per-type key export
//!
//! Each data type has its own export shape: strings are one value, hashes
//! and sorted sets go over as field/score pairs, lists and sets as member
//! batches. Writes to the destination are capped at ten items per command
//! so a large collection never produces an oversized request.
//!
//! Retry passes deliberately differ per type. Strings re-send with SETNX
//! so an already-landed value is not clobbered, and hashes re-send field
//! by field behind an existence probe; the collection types re-run the
//! plain exporter, whose member-wise writes are idempotent anyway.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::cluster::LUA_SCRIPT_SLOT;
use crate::error::Result;
use crate::protocol::Reply;
use crate::remote::{call_routed, DestinationConn};
use crate::store::DataType;

use super::MigrationJob;

/// Destination writes per command when exporting collections
const EXPORT_BATCH: usize = 10;

pub(crate) enum ExportOutcome {
    /// Key vanished between scan and transfer
    Missing,
    /// Value landed on the destination; `apply_ttl` asks the driver to
    /// carry the source TTL over afterwards.
    Exported { apply_ttl: bool },
}

#[async_trait]
pub(crate) trait TypeHandler: Sync {
    async fn export(
        &self,
        job: &MigrationJob,
        key: &Bytes,
        khash: u32,
        tagged: bool,
        conn: &mut dyn DestinationConn,
        retry: bool,
    ) -> Result<ExportOutcome>;

    /// Replicated purge verb for this type
    fn purge_command(&self) -> &'static str;
}

pub(crate) fn handler_for(data_type: DataType) -> &'static dyn TypeHandler {
    match data_type {
        DataType::String => &StringHandler,
        DataType::Hash => &HashHandler,
        DataType::List => &ListHandler,
        DataType::Set => &SetHandler,
        DataType::ZSet => &ZSetHandler,
    }
}

struct StringHandler;

#[async_trait]
impl TypeHandler for StringHandler {
    async fn export(
        &self,
        job: &MigrationJob,
        key: &Bytes,
        khash: u32,
        tagged: bool,
        conn: &mut dyn DestinationConn,
        retry: bool,
    ) -> Result<ExportOutcome> {
        let Some((value, ttl_ms)) = job.store.string_get_with_ttl(key, khash)? else {
            return Ok(ExportOutcome::Missing);
        };
        if retry {
            // SETNX keeps a value the first pass already landed.
            let reply = call_routed(conn, tagged, "setnx", &[key.clone(), value]).await?;
            let fresh = matches!(reply, Reply::Integer(1));
            if fresh && !tagged && ttl_ms >= 0 {
                conn.call("pexpire", &[key.clone(), Bytes::from(ttl_ms.to_string())])
                    .await?;
            }
        } else {
            call_routed(conn, tagged, "set", &[key.clone(), value]).await?;
            // A TTL of 0 is still a pending expiry and must carry over.
            if ttl_ms >= 0 {
                call_routed(
                    conn,
                    tagged,
                    "pexpire",
                    &[key.clone(), Bytes::from(ttl_ms.to_string())],
                )
                .await?;
            }
        }
        Ok(ExportOutcome::Exported { apply_ttl: false })
    }

    fn purge_command(&self) -> &'static str {
        "kdel"
    }
}

struct HashHandler;

#[async_trait]
impl TypeHandler for HashHandler {
    async fn export(
        &self,
        job: &MigrationJob,
        key: &Bytes,
        khash: u32,
        tagged: bool,
        conn: &mut dyn DestinationConn,
        retry: bool,
    ) -> Result<ExportOutcome> {
        let fields = job.store.hash_get_all(key, khash)?;
        if fields.is_empty() {
            return Ok(ExportOutcome::Missing);
        }
        if retry && !tagged {
            // Field-wise probe so fields written by the first pass stay put.
            for fv in &fields {
                let existing = conn.call("hget", &[key.clone(), fv.field.clone()]).await?;
                if matches!(existing, Reply::Nil) {
                    conn.call(
                        "hset",
                        &[key.clone(), fv.field.clone(), fv.value.clone()],
                    )
                    .await?;
                }
            }
        } else {
            for batch in fields.chunks(EXPORT_BATCH) {
                let mut args = Vec::with_capacity(1 + batch.len() * 2);
                args.push(key.clone());
                for fv in batch {
                    args.push(fv.field.clone());
                    args.push(fv.value.clone());
                }
                call_routed(conn, tagged, "hmset", &args).await?;
            }
        }
        Ok(ExportOutcome::Exported { apply_ttl: true })
    }

    fn purge_command(&self) -> &'static str {
        "hclear"
    }
}

struct ListHandler;

#[async_trait]
impl TypeHandler for ListHandler {
    async fn export(
        &self,
        job: &MigrationJob,
        key: &Bytes,
        khash: u32,
        tagged: bool,
        conn: &mut dyn DestinationConn,
        _retry: bool,
    ) -> Result<ExportOutcome> {
        let len = job.store.list_len(key, khash)?;
        if len == 0 {
            return Ok(ExportOutcome::Missing);
        }
        let step = job.list_scan_step as i64;
        let mut start: i64 = 0;
        while start < len as i64 {
            let window = job.store.list_range(key, khash, start, start + step - 1)?;
            if window.is_empty() {
                break;
            }
            for batch in window.chunks(EXPORT_BATCH) {
                let mut args = Vec::with_capacity(1 + batch.len());
                args.push(key.clone());
                args.extend(batch.iter().cloned());
                call_routed(conn, tagged, "rpush", &args).await?;
            }
            start += step;
        }
        Ok(ExportOutcome::Exported { apply_ttl: true })
    }

    fn purge_command(&self) -> &'static str {
        "lclear"
    }
}

struct SetHandler;

#[async_trait]
impl TypeHandler for SetHandler {
    async fn export(
        &self,
        job: &MigrationJob,
        key: &Bytes,
        khash: u32,
        tagged: bool,
        conn: &mut dyn DestinationConn,
        _retry: bool,
    ) -> Result<ExportOutcome> {
        let members = job.store.set_members(key, khash)?;
        if members.is_empty() {
            return Ok(ExportOutcome::Missing);
        }
        for batch in members.chunks(EXPORT_BATCH) {
            let mut args = Vec::with_capacity(1 + batch.len());
            args.push(key.clone());
            args.extend(batch.iter().cloned());
            call_routed(conn, tagged, "sadd", &args).await?;
        }
        Ok(ExportOutcome::Exported { apply_ttl: true })
    }

    fn purge_command(&self) -> &'static str {
        "sclear"
    }
}

struct ZSetHandler;

#[async_trait]
impl TypeHandler for ZSetHandler {
    async fn export(
        &self,
        job: &MigrationJob,
        key: &Bytes,
        khash: u32,
        tagged: bool,
        conn: &mut dyn DestinationConn,
        _retry: bool,
    ) -> Result<ExportOutcome> {
        let pairs = job.store.zset_range_all(key, khash)?;
        if pairs.is_empty() {
            return Ok(ExportOutcome::Missing);
        }
        for batch in pairs.chunks(EXPORT_BATCH) {
            let mut args = Vec::with_capacity(1 + batch.len() * 2);
            args.push(key.clone());
            for pair in batch {
                args.push(Bytes::from(format!("{}", pair.score)));
                args.push(pair.member.clone());
            }
            call_routed(conn, tagged, "zadd", &args).await?;
        }
        Ok(ExportOutcome::Exported { apply_ttl: true })
    }

    fn purge_command(&self) -> &'static str {
        "zclear"
    }
}

/// Transfer one key: export its value, carry the TTL, replicate the purge
/// to this node's replicas, then delete locally. Caller holds the key's
/// write lock.
///
/// The reserved script slot is special: its keys are lua script bodies,
/// which are re-registered on the destination via SCRIPT LOAD and kept on
/// the source, with no TTL, purge, or delete.
pub(crate) async fn migrate_key(
    job: &MigrationJob,
    key: &Bytes,
    data_type: DataType,
    khash: u32,
    tagged: bool,
    conn: &mut dyn DestinationConn,
    retry: bool,
) -> Result<()> {
    if job.slot == LUA_SCRIPT_SLOT {
        let Some(script) = job.store.script_get(key)? else {
            return Ok(());
        };
        conn.call("script", &[Bytes::from_static(b"load"), script])
            .await?;
        return Ok(());
    }

    let handler = handler_for(data_type);
    match handler.export(job, key, khash, tagged, conn, retry).await? {
        ExportOutcome::Missing => return Ok(()),
        ExportOutcome::Exported { apply_ttl } => {
            if apply_ttl {
                let ttl_ms = job.store.key_pttl(key, khash)?;
                if ttl_ms >= 0 {
                    call_routed(
                        conn,
                        tagged,
                        "pexpire",
                        &[key.clone(), Bytes::from(ttl_ms.to_string())],
                    )
                    .await?;
                }
            }
        }
    }

    (job.replicate_delete)(
        job.slot,
        vec![
            Bytes::from_static(handler.purge_command().as_bytes()),
            key.clone(),
        ],
    )?;

    // Local delete failure is tolerated: the key is already safe on the
    // destination, and reads behind the migration marker redirect anyway.
    match job.store.delete(data_type, key, khash) {
        Ok(_) => {}
        Err(e) => {
            warn!(key = %String::from_utf8_lossy(key), error = %e, "local delete after transfer failed");
        }
    }
    Ok(())
}
