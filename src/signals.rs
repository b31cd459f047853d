//! Signal handling
//!
//! Handlers only set atomic flags; the control loop polls them between
//! steps and never has driver state touched from signal context. The
//! SIGSEGV handler is the one exception: it prints a diagnostic with
//! async-signal-safe calls and aborts.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};

use crate::error::{ControlError, Result};

/// Flags set by signal delivery, polled by the control loop
pub(crate) struct SignalFlags {
    /// SIGHUP: reload the config between cycles
    hup: Arc<AtomicBool>,
    /// SIGINT/SIGTERM: shut down cleanly
    term: Arc<AtomicBool>,
    /// SIGUSR1: log the current temperatures
    usr1: Arc<AtomicBool>,
    /// SIGUSR2: tolerate driver errors for one cycle (resume)
    usr2: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Register all handlers
    pub(crate) fn install() -> Result<Self> {
        let flags = Self {
            hup: Arc::new(AtomicBool::new(false)),
            term: Arc::new(AtomicBool::new(false)),
            usr1: Arc::new(AtomicBool::new(false)),
            usr2: Arc::new(AtomicBool::new(false)),
        };
        for (signal, flag) in [
            (SIGHUP, &flags.hup),
            (SIGINT, &flags.term),
            (SIGTERM, &flags.term),
            (SIGUSR1, &flags.usr1),
            (SIGUSR2, &flags.usr2),
        ] {
            signal_hook::flag::register(signal, Arc::clone(flag))
                .map_err(|e| ControlError::System(format!("sigaction: {e}")))?;
        }
        install_segv_handler()?;
        Ok(flags)
    }

    /// Consume a pending reload request
    pub(crate) fn take_hup(&self) -> bool {
        self.hup.swap(false, Ordering::SeqCst)
    }

    /// Whether shutdown was requested
    pub(crate) fn term_requested(&self) -> bool {
        self.term.load(Ordering::SeqCst)
    }

    /// Consume a pending temperature report request
    pub(crate) fn take_usr1(&self) -> bool {
        self.usr1.swap(false, Ordering::SeqCst)
    }

    /// Consume a pending one-cycle error grace request
    pub(crate) fn take_usr2(&self) -> bool {
        self.usr2.swap(false, Ordering::SeqCst)
    }
}

/// Diagnostic printed on a segfault before aborting
extern "C" fn on_segv(_: nix::libc::c_int) {
    const MSG: &[u8] = b"Segmentation fault. Please enable core dumps with \
\"ulimit -c unlimited\", trigger this error again and attach the core file \
to a bug report. Thanks.\n";
    // SAFETY: write(2) and abort(3) are async-signal-safe
    unsafe {
        let _ = nix::libc::write(2, MSG.as_ptr().cast(), MSG.len());
        nix::libc::abort();
    }
}

/// Catch SIGSEGV for the diagnostic; signal-hook refuses to register it
fn install_segv_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_segv),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only calls async-signal-safe functions
    unsafe { sigaction(Signal::SIGSEGV, &action) }
        .map(|_| ())
        .map_err(|e| ControlError::System(format!("sigaction: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[serial_test::serial]
    #[test]
    fn flags_latch_and_clear() {
        let flags = SignalFlags::install().unwrap();
        assert!(!flags.take_hup());
        // SAFETY: raising a handled signal in-process is the documented
        // way to test handlers
        unsafe {
            let _ = nix::libc::raise(SIGHUP);
            let _ = nix::libc::raise(SIGUSR1);
            let _ = nix::libc::raise(SIGUSR2);
        }
        assert!(flags.take_hup());
        assert!(!flags.take_hup());
        assert!(flags.take_usr1());
        assert!(flags.take_usr2());
        assert!(!flags.term_requested());
    }
}
