//! Slot migration state machine
//!
//! One slot migrates at a time per node. The job's lifecycle is
//! Prepare -> Process -> Finish (or Error); status only moves forward.
//! Transfer itself lives in [`runner`], per-type key export in
//! [`handlers`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;

use crate::cluster;
use crate::error::Result;
use crate::locker::ScopeLocker;
use crate::remote::ConnectionPool;
use crate::store::SlotStore;

pub mod handlers;
pub mod runner;

pub use runner::run_transfer;

/// Migration lifecycle status. Codes are persisted in node metadata, so
/// they are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum MigrationStatus {
    /// No migration in flight (also the terminal "acknowledged" state)
    Prepare = 0,
    /// Transfer running or awaiting the coordinator's "over"
    Process = 1,
    /// Transfer completed, awaiting the coordinator's "over"
    Finish = 2,
    /// Transfer aborted
    Error = 3,
}

impl MigrationStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => MigrationStatus::Process,
            2 => MigrationStatus::Finish,
            3 => MigrationStatus::Error,
            _ => MigrationStatus::Prepare,
        }
    }
}

/// Whether this node currently holds mastership of its slots. Sampled by
/// transfer workers between keys; losing mastership aborts the job.
pub type IsMasterFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Propagate a purge command for a migrated key to this node's replicas
/// before the key is deleted locally.
pub type ReplicateDeleteFn = Arc<dyn Fn(u32, Vec<Bytes>) -> Result<()> + Send + Sync>;

/// State of one slot migration.
pub struct MigrationJob {
    pub from: String,
    pub to: String,
    pub slot: u32,

    status: AtomicU8,
    active: AtomicBool,
    total: AtomicU64,
    fails: AtomicU64,
    begin_unix: u64,
    begin: Instant,
    elapsed_ms: AtomicU64,

    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) locker: ScopeLocker,
    pub(crate) store: Arc<dyn SlotStore>,
    pub(crate) replicate_delete: ReplicateDeleteFn,
    pub(crate) list_scan_step: usize,
}

impl MigrationJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from: String,
        to: String,
        slot: u32,
        pool: Arc<ConnectionPool>,
        lock_stripes: usize,
        store: Arc<dyn SlotStore>,
        replicate_delete: ReplicateDeleteFn,
        list_scan_step: usize,
    ) -> Self {
        let begin_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            from,
            to,
            slot,
            status: AtomicU8::new(MigrationStatus::Prepare.code()),
            active: AtomicBool::new(false),
            total: AtomicU64::new(0),
            fails: AtomicU64::new(0),
            begin_unix,
            begin: Instant::now(),
            elapsed_ms: AtomicU64::new(0),
            pool,
            locker: ScopeLocker::new(lock_stripes),
            store,
            replicate_delete,
            list_scan_step,
        }
    }

    pub fn status(&self) -> MigrationStatus {
        MigrationStatus::from_code(self.status.load(Ordering::Acquire))
    }

    /// Advance the status; lifecycle codes are ordered, so a stale writer
    /// can never move the job backwards.
    pub fn advance_status(&self, status: MigrationStatus) {
        self.status.fetch_max(status.code(), Ordering::AcqRel);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Freeze the elapsed time and mark the transfer no longer running.
    pub fn mark_done(&self) {
        self.elapsed_ms
            .store(self.begin.elapsed().as_millis() as u64, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }

    pub fn note_attempt(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_failure(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.fails.load(Ordering::Relaxed),
        )
    }

    /// Routing hash of a key relative to this job's slot.
    pub fn routing_hash(&self, key: &[u8]) -> (u32, bool) {
        cluster::routing_hash(key, self.slot)
    }

    pub fn info(&self) -> MigrationInfo {
        let (total, fails) = self.totals();
        let costs_ms = if self.is_active() {
            self.begin.elapsed().as_millis() as u64
        } else {
            self.elapsed_ms.load(Ordering::Acquire)
        };
        MigrationInfo {
            unixtime: self.begin_unix,
            costs_ms,
            from: self.from.clone(),
            to: self.to.clone(),
            slot_id: self.slot,
            status: self.status().code(),
            total,
            fails,
        }
    }

    /// JSON rendering of [`info`](Self::info) for the status verb.
    pub fn info_json(&self) -> String {
        serde_json::to_string(&self.info()).unwrap_or_else(|_| "{}".to_string())
    }
}

// The pool, store, and callbacks are opaque; show the identifying state.
impl fmt::Debug for MigrationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationJob")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("slot", &self.slot)
            .field("status", &self.status())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Point-in-time progress report of a migration job.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationInfo {
    pub unixtime: u64,
    pub costs_ms: u64,
    pub from: String,
    pub to: String,
    pub slot_id: u32,
    pub status: u8,
    pub total: u64,
    pub fails: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::FakeConnector;
    use crate::store::MemoryStore;

    pub(crate) fn test_job(slot: u32) -> MigrationJob {
        let pool = Arc::new(ConnectionPool::new(Arc::new(FakeConnector::new()), 4));
        MigrationJob::new(
            "127.0.0.1:7100".to_string(),
            "127.0.0.1:7200".to_string(),
            slot,
            pool,
            16,
            Arc::new(MemoryStore::new()),
            Arc::new(|_, _| Ok(())),
            5000,
        )
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for s in [
            MigrationStatus::Prepare,
            MigrationStatus::Process,
            MigrationStatus::Finish,
            MigrationStatus::Error,
        ] {
            assert_eq!(MigrationStatus::from_code(s.code()), s);
        }
        assert_eq!(MigrationStatus::from_code(200), MigrationStatus::Prepare);
    }

    #[tokio::test]
    async fn test_status_only_advances() {
        let job = test_job(7);
        job.advance_status(MigrationStatus::Process);
        job.advance_status(MigrationStatus::Finish);
        // A stale Process write must not regress Finish.
        job.advance_status(MigrationStatus::Process);
        assert_eq!(job.status(), MigrationStatus::Finish);
    }

    #[tokio::test]
    async fn test_info_reports_counters() {
        let job = test_job(42);
        job.note_attempt();
        job.note_attempt();
        job.note_failure();
        job.advance_status(MigrationStatus::Process);
        let info = job.info();
        assert_eq!(info.slot_id, 42);
        assert_eq!(info.total, 2);
        assert_eq!(info.fails, 1);
        assert_eq!(info.status, MigrationStatus::Process.code());
        assert!(info.unixtime > 0);

        let json = job.info_json();
        assert!(json.contains("\"slot_id\":42"));
        assert!(json.contains("\"costs_ms\""));
    }

    #[tokio::test]
    async fn test_job_debug_renders_identifying_state() {
        // Result<Arc<MigrationJob>, _> must be debug-printable for
        // assertions like unwrap_err.
        let job = test_job(7);
        job.advance_status(MigrationStatus::Process);
        let rendered = format!("{job:?}");
        assert!(rendered.contains("slot: 7"));
        assert!(rendered.contains("Process"));
        let as_result: std::result::Result<(), _> = Err(job);
        assert!(format!("{as_result:?}").contains("MigrationJob"));
    }

    #[tokio::test]
    async fn test_mark_done_freezes_elapsed() {
        let job = test_job(1);
        job.set_active();
        assert!(job.is_active());
        job.mark_done();
        assert!(!job.is_active());
        let a = job.info().costs_ms;
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(job.info().costs_ms, a);
    }
}
