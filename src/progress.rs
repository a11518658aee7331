use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CabError, Result};

/// A handle for requesting cancellation of long-running cabinet operations.
///
/// The token is polled between 32 KiB chunks during extraction and saving.
/// Once cancelled, the running operation fails with [`CabError::Cancelled`],
/// any partially written temporary file is removed, and the original cabinet
/// is left untouched.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that never fires unless [`cancel`](Self::cancel) is
    /// called on it or one of its clones.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Requests cancellation of every operation holding a clone of this
    /// token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CabError::Cancelled)
        } else {
            Ok(())
        }
    }
}
