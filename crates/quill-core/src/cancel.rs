//! Cooperative cancellation for pipeline stages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle for cooperative cancellation of a run.
///
/// `CancelFlag` provides a thread-safe mechanism for signaling that a run
/// should stop. It can be cloned and shared across threads, and any clone
/// can trigger cancellation, which is visible to all other clones.
///
/// Blocking engine code checks the flag at stage boundaries and bails out
/// with [`crate::Error::Aborted`].
///
/// # Example
///
/// ```
/// use quill_core::cancel::CancelFlag;
///
/// let flag = CancelFlag::new();
/// let clone = flag.clone();
///
/// assert!(!flag.is_cancelled());
///
/// clone.cancel();
///
/// assert!(flag.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelFlag {
    /// Shared cancellation flag.
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Create a new cancellation flag.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation.
    ///
    /// Cooperative: stages poll `is_cancelled()` and return early once
    /// it reads true.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Clear the flag before starting a new run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }

    /// Return `Err(Aborted)` if cancellation has been requested.
    ///
    /// Convenience for stage-boundary checks in blocking code.
    pub fn bail_if_cancelled(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Aborted)
        } else {
            Ok(())
        }
    }
}
