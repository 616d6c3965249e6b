//! Cooperative cancellation for blocking platform operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{PlatformError, PlatformResult};

const SLICE: Duration = Duration::from_millis(50);

/// Cloneable flag the caller trips when the host is shutting down.
///
/// Every polling loop in the crate checks the flag between attempts and
/// fails with [`PlatformError::Cancelled`] once it is set.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    tripped: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Creates an untripped signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of all operations observing this signal.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`Self::trip`] has been called.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Fails with [`PlatformError::Cancelled`] when tripped.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Cancelled`] naming `operation`.
    pub fn check(&self, operation: &str) -> PlatformResult<()> {
        if self.is_tripped() {
            return Err(PlatformError::Cancelled {
                operation: operation.to_owned(),
            });
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early to report cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Cancelled`] if the signal trips while
    /// sleeping.
    pub fn sleep(&self, duration: Duration, operation: &str) -> PlatformResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check(operation)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            thread::sleep(remaining.min(SLICE));
        }
    }
}
