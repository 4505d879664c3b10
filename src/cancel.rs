//! Cooperative cancellation, polled by the Streamer and Builder between
//! blocks. Never preemptive: a cancelled token only takes effect the next
//! time something checks it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shareable flag that callers flip to request a dump stop cleanly.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the token cancelled. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` if the token has been cancelled.
    pub fn check(&self) -> Result<(), crate::error::Error> {
        if self.is_cancelled() {
            Err(crate::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent_and_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        clone.cancel();
        assert!(matches!(token.check(), Err(crate::error::Error::Cancelled)));
    }
}
