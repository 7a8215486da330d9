//! Interrupt handling.
//!
//! The signal handler only raises a flag. The probe loop checks it at every
//! point where it waits, then stops and prints its own summary, so the
//! statistics never leave the loop's thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

/// Granularity of interruptible waits
pub const POLL_SLICE: Duration = Duration::from_millis(50);

/// Stand-in for "never" when a wait would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `start + wait`, saturating instead of panicking on overflow.
pub fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Shared cancellation flag, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes SIGINT / SIGTERM / SIGHUP to a new flag.
    ///
    /// Can be called once per process.
    pub fn install() -> Result<Self> {
        let interrupt = Self::new();
        let handle = interrupt.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received");
            handle.raise();
        })
        .context("failed to install interrupt handler")?;
        Ok(interrupt)
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`. Returns false if cut short by the flag.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = deadline_after(Instant::now(), duration);
        loop {
            if self.is_raised() {
                return false;
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(POLL_SLICE));
        }
    }
}
