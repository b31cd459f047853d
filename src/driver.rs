//! Common state machine and error tolerance policy for all drivers

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::error::Result;

/// Whether consistency violations are fatal (cleared by `-D`)
static SANITY_CHECKS: AtomicBool = AtomicBool::new(true);

/// One-cycle grace period for driver errors, set after SIGUSR2 (resume)
static TOLERATE_ERRORS: AtomicBool = AtomicBool::new(false);

/// Whether the hardware is assumed sane after resume (`-z`)
static RESUME_IS_SAFE: AtomicBool = AtomicBool::new(false);

/// Whether sanity checks are enabled
pub(crate) fn sanity_checks() -> bool {
    SANITY_CHECKS.load(Ordering::Relaxed)
}

/// Enable or disable sanity checks
pub(crate) fn set_sanity_checks(on: bool) {
    SANITY_CHECKS.store(on, Ordering::Relaxed);
}

/// Whether driver errors are currently tolerated unconditionally
pub(crate) fn tolerate_errors() -> bool {
    TOLERATE_ERRORS.load(Ordering::Relaxed)
}

/// Set or clear the one-cycle error grace period
pub(crate) fn set_tolerate_errors(on: bool) {
    TOLERATE_ERRORS.store(on, Ordering::Relaxed);
}

/// Whether resume is assumed safe for fan control hardware
pub(crate) fn resume_is_safe() -> bool {
    RESUME_IS_SAFE.load(Ordering::Relaxed)
}

/// Declare resume safe, silencing the suspend workaround hints
pub(crate) fn set_resume_is_safe(on: bool) {
    RESUME_IS_SAFE.store(on, Ordering::Relaxed);
}

/// State shared by every driver: unavailable -> available -> initialized
#[derive(Debug)]
pub(crate) struct DriverCommon {
    /// Device file path, `None` until resolved by `lookup()`
    path: Option<PathBuf>,
    /// Whether absence of this driver must not kill the daemon
    optional: bool,
    /// Consecutive I/O errors to tolerate before giving up
    max_errors: u32,
    /// Consecutive failed operations so far
    pub(crate) errors: u32,
    /// Whether the one-shot hardware handshake succeeded
    initialized: bool,
}

impl DriverCommon {
    /// New driver state; `path` is `Some` for fixed-path drivers
    pub(crate) fn new(path: Option<PathBuf>, optional: bool, max_errors: u32) -> Self {
        Self {
            path,
            optional,
            max_errors,
            errors: 0,
            initialized: false,
        }
    }
}

/// Capability shared by sensor and fan drivers
///
/// Implementors provide `lookup()` (resolve the device path, possibly by
/// scanning sysfs) and `init()` (the one-shot hardware handshake); the
/// provided methods implement the lifecycle and the error budget.
pub(crate) trait Driver {
    /// Shared driver state
    fn common(&self) -> &DriverCommon;

    /// Shared driver state, mutable
    fn common_mut(&mut self) -> &mut DriverCommon;

    /// Resolve the device path
    fn lookup(&mut self) -> Result<PathBuf>;

    /// One-shot hardware handshake, called once the path is resolved
    fn init(&mut self) -> Result<()>;

    /// Driver kind for log messages
    fn type_name(&self) -> &'static str;

    /// Consecutive failed operations
    fn errors(&self) -> u32 {
        self.common().errors
    }

    /// Error budget; at least 1 while errors are tolerated after resume
    fn max_errors(&self) -> u32 {
        self.common().max_errors.max(u32::from(tolerate_errors()))
    }

    /// Whether absence of this driver is acceptable
    fn optional(&self) -> bool {
        self.common().optional
    }

    /// Whether the device path has been resolved
    fn available(&self) -> bool {
        self.common().path.is_some()
    }

    /// Whether the hardware handshake has run
    fn initialized(&self) -> bool {
        self.common().initialized
    }

    /// Resolved device path
    fn path(&self) -> &Path {
        #[expect(clippy::expect_used)] // only called after lookup succeeded
        self.common().path.as_deref().expect("driver path not resolved")
    }

    /// Resolved path for log messages, or the driver kind before resolution
    fn describe(&self) -> String {
        self.common().path.as_ref().map_or_else(
            || self.type_name().to_owned(),
            |p| p.display().to_string(),
        )
    }

    /// Forget the resolved path so the next cycle re-runs `lookup()`
    fn set_unavailable(&mut self) {
        let common = self.common_mut();
        common.path = None;
        common.initialized = false;
    }

    /// Run `lookup()` and `init()` as needed; idempotent once initialized
    fn ensure_ready(&mut self) -> Result<()> {
        if !self.available() {
            let path = self.lookup()?;
            self.common_mut().path = Some(path);
        }
        if !self.initialized() {
            self.init()?;
            let common = self.common_mut();
            common.initialized = true;
        }
        Ok(())
    }

    /// Attempt initialization, swallowing tolerable I/O errors
    ///
    /// A hard lookup failure leaves the driver unavailable; it is retried
    /// on the next cycle.
    fn try_init(&mut self) -> Result<()> {
        self.common_mut().errors += 1;
        match self.ensure_ready() {
            Ok(()) => {
                self.common_mut().errors = 0;
                Ok(())
            }
            Err(e) if e.is_io() && self.io_tolerated() => {
                let level = if self.optional() {
                    log::Level::Debug
                } else {
                    log::Level::Info
                };
                log::log!(
                    level,
                    "Ignoring error while initializing {}: {e}",
                    self.type_name()
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The tolerance policy applied to recognized I/O errors
    fn io_tolerated(&self) -> bool {
        self.optional()
            || tolerate_errors()
            || self.errors() < self.max_errors()
            || !sanity_checks()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ControlError;

    /// Driver whose init fails a scripted number of times
    struct FlakyDriver {
        common: DriverCommon,
        fail_inits: u32,
        init_calls: u32,
    }

    impl FlakyDriver {
        fn new(optional: bool, max_errors: u32, fail_inits: u32) -> Self {
            Self {
                common: DriverCommon::new(Some(PathBuf::from("/dev/null")), optional, max_errors),
                fail_inits,
                init_calls: 0,
            }
        }
    }

    impl Driver for FlakyDriver {
        fn common(&self) -> &DriverCommon {
            &self.common
        }

        fn common_mut(&mut self) -> &mut DriverCommon {
            &mut self.common
        }

        fn lookup(&mut self) -> Result<PathBuf> {
            Ok(PathBuf::from("/dev/null"))
        }

        fn init(&mut self) -> Result<()> {
            self.init_calls += 1;
            if self.init_calls <= self.fail_inits {
                Err(ControlError::io(
                    "init".to_owned(),
                    std::io::Error::from_raw_os_error(nix::libc::ENOENT),
                ))
            } else {
                Ok(())
            }
        }

        fn type_name(&self) -> &'static str {
            "flaky test driver"
        }
    }

    #[serial_test::serial]
    #[test]
    fn init_error_fatal_without_budget() {
        set_sanity_checks(true);
        set_tolerate_errors(false);
        let mut d = FlakyDriver::new(false, 0, 1);
        assert!(d.try_init().is_err());
        assert!(!d.initialized());
    }

    #[serial_test::serial]
    #[test]
    fn optional_driver_swallows_init_error() {
        set_tolerate_errors(false);
        let mut d = FlakyDriver::new(true, 0, 1);
        d.try_init().unwrap();
        assert!(!d.initialized());
        // next attempt succeeds and resets the error counter
        d.try_init().unwrap();
        assert!(d.initialized());
        assert_eq!(d.errors(), 0);
    }

    #[serial_test::serial]
    #[test]
    fn error_budget_is_consumed_then_promoted() {
        set_sanity_checks(true);
        set_tolerate_errors(false);
        let mut d = FlakyDriver::new(false, 3, u32::MAX);
        // errors 1 and 2 stay under the budget of 3
        d.try_init().unwrap();
        d.try_init().unwrap();
        assert_eq!(d.errors(), 2);
        // the third consecutive error exhausts it
        assert!(d.try_init().is_err());
    }

    #[serial_test::serial]
    #[test]
    fn tolerate_errors_grace_period() {
        set_tolerate_errors(true);
        let mut d = FlakyDriver::new(false, 0, 1);
        d.try_init().unwrap();
        set_tolerate_errors(false);
        d.try_init().unwrap();
        assert!(d.initialized());
    }

    #[serial_test::serial]
    #[test]
    fn try_init_is_idempotent() {
        set_tolerate_errors(false);
        let mut d = FlakyDriver::new(false, 0, 0);
        d.try_init().unwrap();
        d.try_init().unwrap();
        assert_eq!(d.init_calls, 1);
    }
}
