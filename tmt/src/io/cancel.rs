//! Process-wide cancellation flag driven by SIGINT/SIGTERM.
//!
//! The first signal marks the run as interrupted: the running subprocess is
//! killed, the current step stays `todo`, and finish still runs. A second
//! signal exits immediately.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

use crate::error;
use crate::exit_codes;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU8 = AtomicU8::new(0);

/// Install the signal handler. Call once at startup.
pub fn install_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        let count = SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
        INTERRUPTED.store(true, Ordering::SeqCst);
        if count > 1 {
            eprintln!("interrupted again, exiting immediately");
            std::process::exit(exit_codes::INTERRUPTED);
        }
        warn!("interrupt received, stopping after cleanup");
    })
    .context("install signal handler")
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Return an interruption error if a signal has been received.
pub fn check() -> Result<()> {
    if is_interrupted() {
        return Err(error::interrupted());
    }
    Ok(())
}

/// Sleep for `duration`, waking early with an error when interrupted.
pub fn sleep(duration: Duration) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        check()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        std::thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}

/// Clear the flag so cleanup (finish) can run its own subprocesses.
///
/// Returns whether the flag was set.
pub fn suspend() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Re-arm the flag after cleanup when it was set before.
pub fn restore(was_interrupted: bool) {
    if was_interrupted {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
}
