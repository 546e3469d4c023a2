//! Node facade
//!
//! Ties the control plane together: the migration-control verbs, the
//! redirect-or-execute gate every keyed command passes through while a
//! slot is mid-migration, and the snapshot entry points. The facade owns
//! the single in-flight [`MigrationJob`] slot; the storage engine, node
//! metadata, and cluster role are injected collaborators.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::cluster::slot_for_hash;
use crate::config::Config;
use crate::error::{MagnetiteError, Result};
use crate::locker::{KeyGuard, ScopeLocker};
use crate::migration::{
    run_transfer, IsMasterFn, MigrationJob, MigrationStatus, ReplicateDeleteFn,
};
use crate::protocol::{is_redirect_exempt, is_write_command, write_reply, ReplyWriter};
use crate::remote::{ConnectionPool, Connector};
use crate::snapshot::{self, SnapshotDetail};
use crate::store::{KeyspaceMarker, MetaStore, SlotStore};
use crate::task::TaskRunner;

/// Builds a [`Connector`] for a destination address.
pub type ConnectorFactory = Box<dyn Fn(&str) -> Arc<dyn Connector> + Send + Sync>;

pub struct Node {
    config: Config,
    store: Arc<dyn SlotStore>,
    meta: Arc<dyn MetaStore>,
    keyspace: Arc<dyn KeyspaceMarker>,
    is_master: IsMasterFn,
    replicate_delete: ReplicateDeleteFn,
    connector_factory: ConnectorFactory,
    command_locker: ScopeLocker,
    migration: RwLock<Option<Arc<MigrationJob>>>,
    tasks: TaskRunner,
}

impl Node {
    pub fn new(
        config: Config,
        store: Arc<dyn SlotStore>,
        meta: Arc<dyn MetaStore>,
        keyspace: Arc<dyn KeyspaceMarker>,
        is_master: IsMasterFn,
        replicate_delete: ReplicateDeleteFn,
        connector_factory: ConnectorFactory,
    ) -> Result<Self> {
        config.validate()?;
        let command_locker = ScopeLocker::new(config.large_lock_stripes);
        Ok(Self {
            config,
            store,
            meta,
            keyspace,
            is_master,
            replicate_delete,
            connector_factory,
            command_locker,
            migration: RwLock::new(None),
            tasks: TaskRunner::new(),
        })
    }

    // ---------------------------------------------------------------------
    // Migration control verbs
    // ---------------------------------------------------------------------

    /// MIGRATESLOTS: begin the forward transfer of one slot.
    pub fn migrate_start(&self, from: &str, to: &str, slot: u32) -> Result<Arc<MigrationJob>> {
        self.start_inner(from, to, slot, false)
    }

    /// MIGRATESLOTSRETRY: begin a retry pass over a slot whose forward
    /// transfer left failures behind.
    pub fn migrate_start_retry(
        &self,
        from: &str,
        to: &str,
        slot: u32,
    ) -> Result<Arc<MigrationJob>> {
        self.start_inner(from, to, slot, true)
    }

    fn start_inner(&self, from: &str, to: &str, slot: u32, retry: bool) -> Result<Arc<MigrationJob>> {
        let mut current = self.migration.write();

        match current.as_ref() {
            Some(job) => {
                if job.status() == MigrationStatus::Process {
                    if job.slot != slot {
                        return Err(MagnetiteError::MigrateRunning);
                    }
                    // Re-issued start for the running slot is idempotent.
                    return Ok(Arc::clone(job));
                }
            }
            None => {
                // Restart recognition: durable metadata says a different
                // slot's migration never got its "over".
                if self.meta.migrate_status() == MigrationStatus::Process
                    && self.meta.migrate_slot() != u64::from(slot)
                {
                    return Err(MagnetiteError::MigrateRunning);
                }
            }
        }

        let connector = (self.connector_factory)(to);
        let pool = Arc::new(ConnectionPool::new(connector, self.config.max_idle_conns));
        let job = Arc::new(MigrationJob::new(
            from.to_string(),
            to.to_string(),
            slot,
            pool,
            self.config.normal_lock_stripes,
            Arc::clone(&self.store),
            Arc::clone(&self.replicate_delete),
            self.config.list_scan_step,
        ));

        self.keyspace.start_migrate(slot);
        self.meta.set_migrate_slot(u64::from(slot));
        self.meta.set_migrate_status(MigrationStatus::Process);

        if (self.is_master)() {
            job.set_active();
            job.advance_status(MigrationStatus::Process);
            let transfer = run_transfer(
                Arc::clone(&job),
                Arc::clone(&self.is_master),
                retry,
                self.config.migrate_workers,
                self.config.migrate_keys_per_worker,
            );
            let done_job = Arc::clone(&job);
            self.tasks.spawn(slot, transfer, move |outcome| {
                match outcome {
                    Ok(()) => done_job.advance_status(MigrationStatus::Finish),
                    Err(e) => {
                        error!(slot = done_job.slot, error = %e, "slot transfer aborted");
                        done_job.advance_status(MigrationStatus::Error);
                    }
                }
                done_job.mark_done();
            });
            info!(slot, from, to, retry, "migration started");
        } else {
            // Replicas only record the marker and durable status; the
            // master side drives the transfer.
            info!(slot, "migration recorded on replica");
        }

        *current = Some(Arc::clone(&job));
        Ok(job)
    }

    /// MIGRATESTATUS: JSON progress report of the current job, if any.
    pub fn migrate_status(&self) -> Option<String> {
        self.migration.read().as_ref().map(|job| job.info_json())
    }

    /// MIGRATEEND: the coordinator acknowledges the slot has moved. Clears
    /// the keyspace marker and durable status; the job object stays for
    /// status queries until a retry cycle ends.
    pub fn migrate_over(&self, slot: u64) -> Result<()> {
        let current = self.migration.write();
        let active_slot = match current.as_ref() {
            Some(job) => u64::from(job.slot),
            None => self.meta.migrate_slot(),
        };
        if active_slot != slot {
            return Err(MagnetiteError::SlotMismatch);
        }
        self.keyspace.clear_migrate();
        self.meta.set_migrate_status(MigrationStatus::Prepare);
        info!(slot, "migration acknowledged");
        Ok(())
    }

    /// MIGRATERETRYEND: like [`migrate_over`](Self::migrate_over), and
    /// additionally discards the job object.
    pub fn migrate_retry_over(&self, slot: u64) -> Result<()> {
        let mut current = self.migration.write();
        let active_slot = match current.as_ref() {
            Some(job) => u64::from(job.slot),
            None => self.meta.migrate_slot(),
        };
        if active_slot != slot {
            return Err(MagnetiteError::SlotMismatch);
        }
        self.keyspace.clear_migrate();
        self.meta.set_migrate_status(MigrationStatus::Prepare);
        *current = None;
        info!(slot, "migration retry acknowledged");
        Ok(())
    }

    pub fn migration(&self) -> Option<Arc<MigrationJob>> {
        self.migration.read().clone()
    }

    // ---------------------------------------------------------------------
    // Redirect gate
    // ---------------------------------------------------------------------

    /// Decide whether `cmd key` must be proxied to the migration
    /// destination. `khash` is the key's routing hash as the proxy layer
    /// derived it (tag-aware).
    ///
    /// When the key's slot is mid-migration the key's stripe lock on the
    /// job's pool is acquired (write mode for mutating verbs) and returned;
    /// holding it orders local execution against the transfer of that key.
    pub async fn check_redirect(
        &self,
        cmd: &str,
        key: &[u8],
        khash: u32,
    ) -> Result<(bool, Option<KeyGuard>)> {
        if key.is_empty() {
            return Ok((false, None));
        }
        let Some(job) = self.migration() else {
            return Ok((false, None));
        };
        if self.meta.migrate_status() == MigrationStatus::Prepare {
            // Migration already acknowledged; the marker is stale only in
            // the job object kept for status queries.
            return Ok((false, None));
        }
        if slot_for_hash(khash) != job.slot {
            return Ok((false, None));
        }
        if is_redirect_exempt(cmd) {
            return Ok((false, None));
        }
        let guard = job
            .locker
            .lock_for_command(khash, is_write_command(cmd))
            .await;
        // A key still present locally has not been transferred yet and is
        // served here; a missing key may already live on the destination.
        let redirect = !self.store.key_exists(key, khash).unwrap_or(false);
        Ok((redirect, Some(guard)))
    }

    /// Proxy one command to the migration destination and translate the
    /// reply onto the local client's wire.
    pub async fn redirect(
        &self,
        cmd: &str,
        args: &[Bytes],
        w: &mut dyn ReplyWriter,
    ) -> Result<()> {
        let job = self.migration().ok_or_else(|| {
            MagnetiteError::Internal("redirect without a migration in flight".to_string())
        })?;
        let mut conn = job.pool.get().await?;
        match conn.as_mut().call(cmd, args).await {
            Ok(reply) => {
                write_reply(w, &reply);
                Ok(())
            }
            Err(e) => {
                warn!(cmd, error = %e, "redirected command failed");
                Err(e)
            }
        }
    }

    /// Node-wide per-key command lock, independent of any migration.
    pub async fn lock_command(&self, khash: u32, is_write: bool) -> KeyGuard {
        self.command_locker.lock_for_command(khash, is_write).await
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Checkpoint the engine and metadata into a fresh snapshot directory,
    /// retiring the previously retained snapshot.
    pub fn do_snapshot(&self) -> Result<SnapshotDetail> {
        snapshot::do_snapshot(
            self.store.as_ref(),
            self.meta.as_ref(),
            &self.config.snapshot_path,
        )
    }

    /// Stream a snapshot directory to a peer.
    pub fn save_snapshot(&self, detail: &SnapshotDetail, w: &mut impl Write) -> Result<()> {
        snapshot::save_snapshot(&detail.dir, w)
    }

    /// Rebuild a received snapshot stream under the dbsync scratch
    /// directory. Returns the directory and the stream's update index.
    pub fn recover_from_snapshot(&self, r: &mut impl BufRead) -> Result<(PathBuf, u64)> {
        snapshot::recover_snapshot(r, &self.config.dbsync_path)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::cluster::{fnv32, slot_for_key, tag_hash};
    use crate::protocol::testutil::RecordingWriter;
    use crate::remote::mock::{FakeConnector, FakeDestState};
    use crate::remote::DestinationConn;
    use crate::store::{MemoryMeta, MemoryStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Harness {
        node: Node,
        store: Arc<MemoryStore>,
        meta: Arc<MemoryMeta>,
        dest: Arc<Mutex<FakeDestState>>,
    }

    fn harness_with_master(is_master: IsMasterFn) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let store = Arc::new(MemoryStore::new());
        let meta = Arc::new(MemoryMeta::new());
        let connector = Arc::new(FakeConnector::new());
        let dest = connector.state();
        let factory: ConnectorFactory = Box::new(move |_addr| {
            let c: Arc<dyn crate::remote::Connector> = connector.clone();
            c
        });
        let node = Node::new(
            Config::default(),
            store.clone(),
            meta.clone(),
            store.clone(),
            is_master,
            Arc::new(|_, _| Ok(())),
            factory,
        )
        .unwrap();
        Harness {
            node,
            store,
            meta,
            dest,
        }
    }

    fn harness() -> Harness {
        harness_with_master(Arc::new(|| true))
    }

    async fn wait_done(job: &MigrationJob) {
        for _ in 0..200 {
            if !job.is_active() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transfer did not finish");
    }

    /// Connector whose dials never complete, pinning a job in Process.
    struct StalledConnector;

    #[async_trait]
    impl crate::remote::Connector for StalledConnector {
        async fn connect(&self) -> Result<Box<dyn DestinationConn>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_forward_migration_end_to_end() {
        let h = harness();
        let key = b"foo";
        let slot = slot_for_key(key);
        h.store
            .string_set(key, fnv32(key), Bytes::from_static(b"v"))
            .unwrap();
        h.store.set_key_pttl(key, fnv32(key), 60_000).unwrap();

        let job = h
            .node
            .migrate_start("127.0.0.1:7100", "127.0.0.1:7200", slot)
            .unwrap();
        wait_done(&job).await;

        assert_eq!(job.status(), MigrationStatus::Finish);
        assert_eq!(job.totals(), (1, 0));
        {
            let dest = h.dest.lock();
            assert_eq!(dest.strings.get(&key[..]).map(|v| &v[..]), Some(&b"v"[..]));
            assert_eq!(dest.ttls.get(&key[..]), Some(&60_000));
        }
        assert!(!h.store.key_exists(key, fnv32(key)).unwrap());
        assert_eq!(h.store.migrating_slot(), Some(slot));
        assert_eq!(h.meta.migrate_status(), MigrationStatus::Process);

        // The moved key now redirects; the coordinator's "over" stops it.
        let (redirect, guard) = h.node.check_redirect("get", key, fnv32(key)).await.unwrap();
        assert!(redirect);
        assert!(guard.is_some());
        drop(guard);

        h.node.migrate_over(u64::from(slot)).unwrap();
        assert_eq!(h.store.migrating_slot(), None);
        assert_eq!(h.meta.migrate_status(), MigrationStatus::Prepare);
        let (redirect, guard) = h.node.check_redirect("get", key, fnv32(key)).await.unwrap();
        assert!(!redirect);
        assert!(guard.is_none());
    }

    #[tokio::test]
    async fn test_retry_pass_does_not_clobber_destination() {
        let h = harness();
        let key = b"foo";
        let slot = slot_for_key(key);
        // Destination already holds the value from the first pass; the
        // source kept its stale copy because the local delete was lost.
        h.dest
            .lock()
            .strings
            .insert(key.to_vec(), b"landed".to_vec());
        h.store
            .string_set(key, fnv32(key), Bytes::from_static(b"stale"))
            .unwrap();

        let job = h
            .node
            .migrate_start_retry("127.0.0.1:7100", "127.0.0.1:7200", slot)
            .unwrap();
        wait_done(&job).await;

        assert_eq!(job.status(), MigrationStatus::Finish);
        let dest = h.dest.lock();
        assert_eq!(
            dest.strings.get(&key[..]).map(|v| &v[..]),
            Some(&b"landed"[..])
        );
        // The conditional write no-oped, so nothing was written.
        assert_eq!(dest.writes, 0);

        drop(dest);
        h.node.migrate_retry_over(u64::from(slot)).unwrap();
        assert!(h.node.migration().is_none());
    }

    #[tokio::test]
    async fn test_tagged_keys_travel_with_their_tag_slot() {
        let h = harness();
        let key = b"{user}:profile";
        let tag_slot = slot_for_key(b"user");
        assert_ne!(slot_for_key(key), tag_slot);
        h.store
            .string_set(key, tag_hash(key), Bytes::from_static(b"v"))
            .unwrap();

        let job = h
            .node
            .migrate_start("127.0.0.1:7100", "127.0.0.1:7200", tag_slot)
            .unwrap();
        wait_done(&job).await;

        assert_eq!(job.status(), MigrationStatus::Finish);
        let dest = h.dest.lock();
        assert!(dest.eval_calls >= 1, "tagged key must route through eval");
        assert_eq!(dest.strings.get(&key[..]).map(|v| &v[..]), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn test_conflicting_start_rejected_same_slot_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let meta = Arc::new(MemoryMeta::new());
        let factory: ConnectorFactory = Box::new(|_| {
            let c: Arc<dyn crate::remote::Connector> = Arc::new(StalledConnector);
            c
        });
        let node = Node::new(
            Config::default(),
            store.clone(),
            meta.clone(),
            store.clone(),
            Arc::new(|| true),
            Arc::new(|_, _| Ok(())),
            factory,
        )
        .unwrap();

        let key = b"foo";
        let slot = slot_for_key(key);
        store
            .string_set(key, fnv32(key), Bytes::from_static(b"v"))
            .unwrap();

        let job = node.migrate_start("a", "b", slot).unwrap();
        assert_eq!(job.status(), MigrationStatus::Process);

        let err = node.migrate_start("a", "b", (slot + 1) % 1024).unwrap_err();
        assert!(matches!(err, MagnetiteError::MigrateRunning));

        let again = node.migrate_start("a", "b", slot).unwrap();
        assert!(Arc::ptr_eq(&job, &again));
    }

    #[tokio::test]
    async fn test_replica_records_marker_without_transferring() {
        let h = harness_with_master(Arc::new(|| false));
        let key = b"foo";
        let slot = slot_for_key(key);
        h.store
            .string_set(key, fnv32(key), Bytes::from_static(b"v"))
            .unwrap();

        let job = h.node.migrate_start("a", "b", slot).unwrap();
        assert!(!job.is_active());
        assert_eq!(job.status(), MigrationStatus::Prepare);
        assert_eq!(h.store.migrating_slot(), Some(slot));
        assert_eq!(h.meta.migrate_status(), MigrationStatus::Process);
        // Nothing moved.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.store.key_exists(key, fnv32(key)).unwrap());
    }

    #[tokio::test]
    async fn test_losing_mastership_errors_the_job() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        // Master for the start call, replica from then on.
        let h = harness_with_master(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst) == 0
        }));
        let key = b"foo";
        let slot = slot_for_key(key);
        h.store
            .string_set(key, fnv32(key), Bytes::from_static(b"v"))
            .unwrap();

        let job = h.node.migrate_start("a", "b", slot).unwrap();
        wait_done(&job).await;
        assert_eq!(job.status(), MigrationStatus::Error);
    }

    #[tokio::test]
    async fn test_over_rejects_wrong_slot() {
        let h = harness();
        let key = b"foo";
        let slot = slot_for_key(key);
        let job = h.node.migrate_start("a", "b", slot).unwrap();
        wait_done(&job).await;

        let err = h.node.migrate_over(u64::from(slot) + 1).unwrap_err();
        assert!(matches!(err, MagnetiteError::SlotMismatch));
        h.node.migrate_over(u64::from(slot)).unwrap();
    }

    #[tokio::test]
    async fn test_redirect_exempt_verbs_pass_through() {
        let h = harness();
        let key = b"foo";
        let slot = slot_for_key(key);
        let job = h.node.migrate_start("a", "b", slot).unwrap();
        wait_done(&job).await;

        for cmd in ["mget", "mset", "info", "migratestatus"] {
            let (redirect, guard) = h.node.check_redirect(cmd, key, fnv32(key)).await.unwrap();
            assert!(!redirect, "{cmd} must never redirect");
            assert!(guard.is_none());
        }
    }

    #[tokio::test]
    async fn test_other_slots_unaffected_by_migration() {
        let h = harness();
        let slot = slot_for_key(b"foo");
        let other = b"bar";
        assert_ne!(slot_for_key(other), slot);
        h.store
            .string_set(other, fnv32(other), Bytes::from_static(b"v"))
            .unwrap();

        let job = h.node.migrate_start("a", "b", slot).unwrap();
        wait_done(&job).await;

        assert!(h.store.key_exists(other, fnv32(other)).unwrap());
        let (redirect, guard) = h
            .node
            .check_redirect("get", other, fnv32(other))
            .await
            .unwrap();
        assert!(!redirect);
        assert!(guard.is_none());
    }

    #[tokio::test]
    async fn test_redirect_proxies_and_translates_reply() {
        let h = harness();
        let key = b"foo";
        let slot = slot_for_key(key);
        h.dest.lock().strings.insert(key.to_vec(), b"moved".to_vec());
        let job = h.node.migrate_start("a", "b", slot).unwrap();
        wait_done(&job).await;

        let mut w = RecordingWriter::default();
        h.node
            .redirect("get", &[Bytes::from_static(key)], &mut w)
            .await
            .unwrap();
        assert_eq!(
            w.replies,
            vec![crate::protocol::Reply::Bulk(Bytes::from_static(b"moved"))]
        );
    }

    #[tokio::test]
    async fn test_migrate_status_reports_json() {
        let h = harness();
        assert!(h.node.migrate_status().is_none());
        let key = b"foo";
        let slot = slot_for_key(key);
        let job = h.node.migrate_start("a", "b", slot).unwrap();
        wait_done(&job).await;
        let status = h.node.migrate_status().unwrap();
        assert!(status.contains(&format!("\"slot_id\":{slot}")));
    }
}
