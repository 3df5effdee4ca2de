//! In-process serialization of writers to the same ref.
//!
//! The compare-and-swap in [`GitClient::compare_and_swap_ref`] is what keeps
//! refs consistent; this registry only stops two local writers from building
//! commits against the same tip and having one of them lose the race.
//!
//! [`GitClient::compare_and_swap_ref`]: super::GitClient::compare_and_swap_ref

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::debug;

#[derive(Default)]
struct Inner {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Registry of refs currently being written, keyed by `repo path + ref name`.
#[derive(Clone, Default)]
pub struct RefLocks {
    inner: Arc<Inner>,
}

/// Releases its ref when dropped.
pub struct RefLockGuard {
    inner: Arc<Inner>,
    key: String,
}

impl RefLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, or until `deadline` passes.
    ///
    /// Returns `None` on timeout.
    pub fn acquire(&self, key: &str, deadline: Option<Instant>) -> Option<RefLockGuard> {
        let mut held = self
            .inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while held.contains(key) {
            held = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(key, "timed out waiting for ref lock");
                        return None;
                    }
                    self.inner
                        .released
                        .wait_timeout(held, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
                None => self
                    .inner
                    .released
                    .wait(held)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
        held.insert(key.to_string());
        debug!(key, "ref lock acquired");
        Some(RefLockGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
        })
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Option<RefLockGuard> {
        let mut held = self
            .inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(RefLockGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.inner
            .held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

impl Drop for RefLockGuard {
    fn drop(&mut self) {
        let mut held = self
            .inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
        self.inner.released.notify_all();
    }
}
