//! Background task supervision
//!
//! Migration transfers run detached from the control connection that
//! started them. [`TaskRunner`] spawns the work on the runtime, isolates
//! panics at the task boundary, and delivers the terminal outcome to a
//! completion callback exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinError;
use tracing::error;

use crate::error::{MagnetiteError, Result};

/// Render a join error's panic payload, if any.
pub(crate) fn panic_message(e: JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        }
        Err(join) => join.to_string(),
    }
}

#[derive(Default)]
pub struct TaskRunner {
    next_id: AtomicU64,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` for `slot` and invoke `on_done` with its outcome. A
    /// panic inside the future is caught and delivered as
    /// [`MagnetiteError::TaskPanicked`]. Returns the task id.
    pub fn spawn<F, C>(&self, slot: u32, fut: F, on_done: C) -> u64
    where
        F: Future<Output = Result<()>> + Send + 'static,
        C: FnOnce(Result<()>) + Send + 'static,
    {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::spawn(async move {
            // Inner spawn so an unwind surfaces as a JoinError instead of
            // tearing down this supervisor.
            let outcome = match tokio::spawn(fut).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let msg = panic_message(e);
                    error!(task_id, slot, panic = %msg, "background task panicked");
                    Err(MagnetiteError::TaskPanicked(msg))
                }
                Err(e) => Err(MagnetiteError::TaskPanicked(e.to_string())),
            };
            on_done(outcome);
        });
        task_id
    }
}
