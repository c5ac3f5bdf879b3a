//! Cancellation context threaded through a verification run.
//!
//! A run polls [`Cx::checkpoint`] at least once per page visited and once per
//! downlink descended. Cancellation aborts with
//! [`VerifyError::Interrupted`], which is never classified as corruption.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use btcheck_error::{Result, VerifyError};

/// Shared cancellation flag. Cloning yields a handle to the same flag, so a
/// controlling thread can keep one clone and cancel a run in progress.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the run's next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Poll for cancellation.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(VerifyError::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_until_cancelled() {
        let cx = Cx::new();
        assert!(cx.checkpoint().is_ok());

        let handle = cx.clone();
        handle.cancel();
        assert!(cx.is_cancelled());
        assert!(matches!(cx.checkpoint(), Err(VerifyError::Interrupted)));
    }
}
