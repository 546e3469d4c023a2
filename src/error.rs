//! Error types for Magnetite
//!
//! One crate-wide error enum covering the control surface, migration
//! transfer, redirect proxying, and snapshot framing. Uses `thiserror`
//! for ergonomic error definitions.

use std::io;
use thiserror::Error;

/// Main error type for Magnetite operations
#[derive(Error, Debug)]
pub enum MagnetiteError {
    /// A migration for another slot is already in flight on this node
    #[error("ERR migrate task is running")]
    MigrateRunning,

    /// An "over" call named a slot other than the one in progress
    #[error("ERR migrate slot id not match")]
    SlotMismatch,

    /// This node lost (or never had) mastership of the migrating slot
    #[error("migrate error: server is not master")]
    NotMaster,

    /// A background task panicked; recovered at the task boundary
    #[error("background task panicked: {0}")]
    TaskPanicked(String),

    /// Snapshot stream header is malformed
    #[error("snapshot header error: {0}")]
    SnapshotHeader(String),

    /// Declared snapshot file size does not match the bytes transferred
    #[error("snapshot file '{name}' size mismatch: expected {expected}, got {actual}")]
    SnapshotSize {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Checkpoint operation error
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Protocol parsing or encoding error on an outbound connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The destination replied with an error
    #[error("remote error: {0}")]
    Remote(String),

    /// Outbound connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Underlying object-store error
    #[error("store error: {0}")]
    Store(String),

    /// Configuration validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for Magnetite operations
pub type Result<T> = std::result::Result<T, MagnetiteError>;

impl MagnetiteError {
    /// True for errors that terminate a migration job rather than a
    /// single key transfer.
    #[cold]
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            MagnetiteError::NotMaster | MagnetiteError::TaskPanicked(_)
        )
    }
}
