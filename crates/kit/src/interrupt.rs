//! Operator interrupts as a pipeline failure.
//!
//! The signals are caught into a flag instead of killing the process, so the
//! pipeline notices at its next step boundary and unwinds like any other
//! failure. Children in the foreground process group receive the same
//! signal, which ends the step in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::eyre::Context;
use color_eyre::Result;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

/// Exit code reported for an interrupted run.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// A flag that is never raised by a signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag raised by SIGINT, SIGTERM or SIGHUP.
    pub fn install() -> Result<Self> {
        let r = Self::new();
        for sig in [SIGINT, SIGTERM, SIGHUP] {
            signal_hook::flag::register(sig, Arc::clone(&r.0))
                .with_context(|| format!("Registering handler for signal {sig}"))?;
        }
        Ok(r)
    }

    #[cfg(test)]
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
