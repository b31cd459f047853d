//! Fan drivers

mod hwmon;
mod tpacpi;

use std::{fs, path::Path};

pub(crate) use hwmon::HwmonFan;
pub(crate) use tpacpi::TpacpiFan;

use crate::{
    driver::Driver,
    error::{ControlError, Result},
    level::Level,
};

/// Write a fan command string to a control file
pub(crate) fn write_command(path: &Path, command: &str) -> Result<()> {
    fs::write(path, format!("{command}\n")).map_err(|e| {
        if e.raw_os_error() == Some(nix::libc::EPERM) {
            ControlError::System(format!(
                "No permission to write to {path:?}. Is the thinkpad_acpi \
                 module loaded with fan_control=1?"
            ))
        } else {
            ControlError::io(format!("Writing {command:?} to {path:?}"), e)
        }
    })
}

/// A driver accepting fan-speed commands
pub(crate) trait Fan: Driver {
    /// Write the level's command; may assume `ensure_ready` ran
    fn set_speed_raw(&mut self, level: &Level) -> Result<()>;

    /// Keep the hardware watchdog alive while the level is unchanged
    fn ping_raw(&mut self, level: &Level) -> Result<()> {
        let _ = level;
        Ok(())
    }

    /// Reject level tables this fan kind cannot drive
    fn check_levels(&self, levels: &[Level]) -> Result<()>;

    /// Last command written, if any
    fn current_speed(&self) -> Option<&str>;

    /// Robust speed write, applying the driver error policy
    ///
    /// Tolerable errors are skipped silently since the next cycle retries.
    fn set_speed(&mut self, level: &Level) -> Result<()> {
        self.common_mut().errors += 1;
        let res = self.ensure_ready().and_then(|()| self.set_speed_raw(level));
        match res {
            Ok(()) => {
                self.common_mut().errors = 0;
                Ok(())
            }
            Err(e) if e.is_io() && self.io_tolerated() => {
                log::debug!("{}: ignoring fan error: {e}", self.describe());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Robust watchdog ping, applying the driver error policy
    fn ping_watchdog_and_depulse(&mut self, level: &Level) -> Result<()> {
        self.common_mut().errors += 1;
        let res = self.ensure_ready().and_then(|()| self.ping_raw(level));
        match res {
            Ok(()) => {
                self.common_mut().errors = 0;
                Ok(())
            }
            Err(e) if e.is_io() && self.io_tolerated() => {
                log::debug!("{}: ignoring fan error: {e}", self.describe());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
