//! Termination signal handling.
//!
//! The handler only raises a flag. Children share our process group, so a
//! Ctrl-C also stops whatever tool is running; the resulting command failure
//! or the next [`check`] unwinds the build through the session's single
//! cleanup pass.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::{BuildError, BuildResult};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Register the SIGINT/SIGTERM handler. Safe to call more than once.
pub fn install() {
    let result = ctrlc::set_handler(|| {
        if !INTERRUPTED.swap(true, Ordering::SeqCst) {
            eprintln!("\n[!] Interrupt received, cleaning up...");
        }
    });
    if let Err(e) = result {
        // Already registered by an earlier build in this process.
        if !matches!(e, ctrlc::Error::MultipleHandlers) {
            warn!("failed to install interrupt handler: {}", e);
        }
    }
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail with [`BuildError::Interrupted`] once a signal has arrived.
pub fn check() -> BuildResult<()> {
    if is_interrupted() {
        Err(BuildError::Interrupted)
    } else {
        Ok(())
    }
}
