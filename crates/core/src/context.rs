//! Deadline and cancellation carried by every long-running operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::ReconcileError;

/// Optional deadline plus a shared cancellation flag.
///
/// Cloning shares the flag, so a caller can keep one clone and cancel the
/// operation running on another thread.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl OperationContext {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::default(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::default(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`ReconcileError::Cancelled`] if the caller gave up.
    ///
    /// `phase` names what was about to run and ends up in the error message.
    pub fn check(&self, phase: &str) -> Result<(), ReconcileError> {
        if self.is_cancelled() {
            return Err(ReconcileError::Cancelled(format!("cancelled before {}", phase)));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ReconcileError::Cancelled(format!(
                    "deadline exceeded before {}",
                    phase
                )));
            }
        }
        Ok(())
    }
}
