//! Page-by-page slot transfer
//!
//! Each page scans up to `workers * keys_per_worker` keys, splits them
//! into disjoint sub-ranges, and transfers the sub-ranges concurrently on
//! one destination connection per worker. A page is a barrier: the next
//! scan does not start until every worker of the current page has joined.
//!
//! Forward passes follow the scan cursor and stop on a short page or the
//! end sentinel. Retry passes rescan from the start each page (successes
//! delete their local key, so the remainder shrinks) and stop once a scan
//! comes back empty.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{MagnetiteError, Result};
use crate::store::{ScanEntry, SCAN_END_CURSOR};
use crate::task::panic_message;

use super::handlers::migrate_key;
use super::{IsMasterFn, MigrationJob};

async fn transfer_chunk(
    job: Arc<MigrationJob>,
    is_master: IsMasterFn,
    chunk: Vec<ScanEntry>,
    retry: bool,
) -> Result<u64> {
    if !is_master() {
        return Err(MagnetiteError::NotMaster);
    }
    let mut conn = job.pool.get().await?;
    let mut succeeded = 0u64;
    for entry in chunk {
        let (khash, tagged) = job.routing_hash(&entry.key);
        let _guard = job.locker.lock_write(khash).await;
        job.note_attempt();
        match migrate_key(
            &job,
            &entry.key,
            entry.data_type,
            khash,
            tagged,
            conn.as_mut(),
            retry,
        )
        .await
        {
            Ok(()) => succeeded += 1,
            Err(e) if e.is_job_fatal() => return Err(e),
            Err(e) => {
                job.note_failure();
                debug!(
                    key = %String::from_utf8_lossy(&entry.key),
                    error = %e,
                    "key transfer failed"
                );
            }
        }
    }
    Ok(succeeded)
}

/// Run a transfer pass over the job's slot until the keyspace is drained
/// or the job hits a fatal error.
pub async fn run_transfer(
    job: Arc<MigrationJob>,
    is_master: IsMasterFn,
    retry: bool,
    workers: usize,
    keys_per_worker: usize,
) -> Result<()> {
    let page_limit = workers * keys_per_worker;
    info!(slot = job.slot, to = %job.to, retry, "slot transfer starting");

    let mut cursor: Option<bytes::Bytes> = None;
    loop {
        if !is_master() {
            return Err(MagnetiteError::NotMaster);
        }
        let scan_from = if retry { None } else { cursor.as_deref() };
        let (next, entries) = job
            .store
            .scan_by_slot(job.slot, scan_from, page_limit, "*")?;
        let count = entries.len();
        debug!(slot = job.slot, keys = count, "transfer page scanned");

        if count == 0 {
            break;
        }

        let mut set: JoinSet<Result<u64>> = JoinSet::new();
        for chunk in entries.chunks(keys_per_worker) {
            set.spawn(transfer_chunk(
                Arc::clone(&job),
                Arc::clone(&is_master),
                chunk.to_vec(),
                retry,
            ));
        }

        let mut first_err: Option<MagnetiteError> = None;
        let mut page_succeeded = 0u64;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(n)) => page_succeeded += n,
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(MagnetiteError::TaskPanicked(panic_message(e)));
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if retry {
            // Every key in a non-empty page failed; rescanning would spin
            // on the same keys forever.
            if page_succeeded == 0 {
                return Err(MagnetiteError::Internal(
                    "retry pass made no progress".to_string(),
                ));
            }
            continue;
        }

        if count < page_limit || next.as_ref() == SCAN_END_CURSOR {
            break;
        }
        cursor = Some(next);
    }

    let (total, fails) = job.totals();
    info!(slot = job.slot, total, fails, retry, "slot transfer finished");
    Ok(())
}
