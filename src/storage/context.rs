//! Operation Context
//!
//! Every storage call receives an [`OpContext`]: a cancellation flag plus an
//! optional deadline. The dispatcher cancels the context when it stops
//! waiting for an operation, and engines poll [`OpContext::check`] so that
//! abandoned work stops early instead of running to completion unobserved.
//!
//! ```text
//! connection root ──child(10s)──> operation ctx ──check()──> engine
//!        │                              ▲
//!        └── cancel() on disconnect ────┘ (inherited)
//! ```

use crate::storage::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation and deadline bookkeeping for one storage call.
///
/// Cloning is cheap and all clones share the same cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancelled: Arc<AtomicBool>,
    /// Flags of every ancestor, root first
    ancestors: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A root context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::default()
        }
    }

    /// Derives a context that expires `timeout` from now, or at the parent's
    /// deadline if that comes first. Cancelling any ancestor cancels the
    /// child; cancelling the child leaves its ancestors untouched.
    pub fn child(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let mut ancestors = Vec::with_capacity(self.ancestors.len() + 1);
        ancestors.extend(self.ancestors.iter().cloned());
        ancestors.push(Arc::clone(&self.cancelled));
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            ancestors,
            deadline: Some(self.deadline.map_or(own, |d| d.min(own))),
        }
    }

    /// Returns a guard that cancels this context when dropped.
    ///
    /// Hold it across an await so that dropping the awaiting future also
    /// stops the work it was waiting on.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Signals every holder of this context to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self
                .ancestors
                .iter()
                .any(|flag| flag.load(Ordering::Acquire))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns an error if the operation should be abandoned.
    #[inline]
    pub fn check(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StorageError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Cancels its [`OpContext`] on drop. See [`OpContext::cancel_on_drop`].
#[derive(Debug)]
#[must_use = "the context is cancelled as soon as the guard is dropped"]
pub struct CancelOnDrop {
    cancelled: Arc<AtomicBool>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
