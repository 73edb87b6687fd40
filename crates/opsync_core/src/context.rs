//! Caller-supplied cancellation and deadlines.

use crate::error::{OplogError, OplogResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation scope of one call into the operation log.
///
/// The log checks the context before reading and again right before the
/// commit point of a mutating call. A call that observes an expired or
/// cancelled context returns [`OplogError::Timeout`] or
/// [`OplogError::Cancelled`] without applying anything.
///
/// Clones share the cancellation flag, so a transport can keep one clone and
/// cancel the call running on another thread.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    /// A context that never expires and is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels the call and every clone of this context.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails if the context was cancelled or its deadline passed.
    pub fn check(&self) -> OplogResult<()> {
        if self.is_cancelled() {
            return Err(OplogError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(OplogError::Timeout),
            _ => Ok(()),
        }
    }
}
