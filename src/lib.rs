//! # Magnetite
//!
//! Node-local control plane for a clustered, Redis-compatible key-value
//! store. The cluster coordinator decides *which* slots move *where*;
//! this crate is what runs on each node to make that happen:
//!
//! - **Slot migration**: a one-at-a-time state machine that scans a hash
//!   slot's keys, transfers them type by type to the destination node,
//!   and replicates the purges to local replicas ([`migration`]).
//! - **Redirect gate**: while a slot is mid-migration, keyed commands are
//!   either served locally or proxied to the destination, ordered against
//!   the transfer by striped per-key locks ([`facade`], [`locker`]).
//! - **Snapshots**: engine checkpoints framed onto a byte stream for full
//!   resync of a lagging peer ([`snapshot`]).
//!
//! The storage engine, durable node metadata, and cluster role are
//! injected behind the traits in [`store`], so the control plane itself
//! stays engine-agnostic.

pub mod cluster;
pub mod config;
pub mod error;
pub mod facade;
pub mod locker;
pub mod migration;
pub mod protocol;
pub mod remote;
pub mod snapshot;
pub mod store;
pub mod task;

pub use config::Config;
pub use error::{MagnetiteError, Result};
pub use facade::Node;
pub use migration::{MigrationInfo, MigrationJob, MigrationStatus};
