//! Striped per-key read/write locks
//!
//! A [`ScopeLocker`] owns a fixed, power-of-two array of independent
//! RW locks; a key hash selects its stripe by mask. Distinct keys may
//! alias to one stripe and serialize even though logically independent —
//! an accepted memory/contention trade-off, tuned via the stripe count.
//!
//! Acquisitions hand out owned guards, so release is guaranteed on every
//! exit path (return, error, panic unwind) and a guard may be held across
//! await points or handed to a caller.

use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Scoped acquisition of one stripe. Dropping the guard releases the lock.
pub enum KeyGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

pub struct ScopeLocker {
    mask: u32,
    stripes: Vec<Arc<RwLock<()>>>,
}

impl ScopeLocker {
    /// Create a locker with `stripes` stripes. Panics unless `stripes` is a
    /// non-zero power of two (mask indexing requires it).
    pub fn new(stripes: usize) -> Self {
        assert!(
            stripes.is_power_of_two(),
            "stripe count must be a power of two, got {stripes}"
        );
        Self {
            mask: (stripes - 1) as u32,
            stripes: (0..stripes).map(|_| Arc::new(RwLock::new(()))).collect(),
        }
    }

    fn stripe(&self, khash: u32) -> Arc<RwLock<()>> {
        self.stripes[(khash & self.mask) as usize].clone()
    }

    /// Shared acquisition of the key's stripe
    pub async fn lock_read(&self, khash: u32) -> KeyGuard {
        KeyGuard::Read(self.stripe(khash).read_owned().await)
    }

    /// Exclusive acquisition of the key's stripe
    pub async fn lock_write(&self, khash: u32) -> KeyGuard {
        KeyGuard::Write(self.stripe(khash).write_owned().await)
    }

    /// Acquire in the mode the command needs: exclusive for writes,
    /// shared for reads.
    pub async fn lock_for_command(&self, khash: u32, is_write: bool) -> KeyGuard {
        if is_write {
            self.lock_write(khash).await
        } else {
            self.lock_read(khash).await
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}
