//! Fan driver for the thinkpad_acpi fan interface
//!
//! Supports the fan watchdog and depulsing, an old remedy for audible
//! pulsing oscillation on worn-out fans.

use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use super::{Fan, write_command};
use crate::{
    driver::{Driver, DriverCommon, sanity_checks},
    error::{ControlError, Result},
    level::Level,
    sysfs,
};

/// thinkpad_acpi watchdog countdown written at init
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(120);

/// Fan controlled through `/proc/acpi/ibm/fan`
#[derive(Debug)]
pub(crate) struct TpacpiFan {
    /// Shared driver state
    common: DriverCommon,
    /// Configured fan file path
    configured_path: PathBuf,
    /// `level:` value captured at init, restored on drop
    initial_state: Option<String>,
    /// Last command written
    current_speed: Option<String>,
    /// Watchdog countdown the kernel reverts control after
    watchdog: Duration,
    /// Disengage duration per watchdog tick; 0 disables depulsing
    depulse: Duration,
    /// Loop sleep time, subtracted from the watchdog deadline
    sleeptime: Duration,
    /// When the watchdog was last reset by a write
    last_watchdog_ping: Option<Instant>,
}

impl TpacpiFan {
    /// New driver for the given fan file
    pub(crate) fn new(
        path: PathBuf,
        depulse: Duration,
        sleeptime: Duration,
        optional: bool,
        max_errors: u32,
    ) -> Self {
        Self {
            common: DriverCommon::new(None, optional, max_errors),
            configured_path: path,
            initial_state: None,
            current_speed: None,
            watchdog: WATCHDOG_TIMEOUT,
            depulse,
            sleeptime,
            last_watchdog_ping: None,
        }
    }

    /// Whether the watchdog deadline is close enough to need a refresh
    fn watchdog_due(&self) -> bool {
        self.last_watchdog_ping.is_none_or(|last| {
            last + self.watchdog.saturating_sub(self.sleeptime) <= Instant::now()
        })
    }
}

impl Driver for TpacpiFan {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn lookup(&mut self) -> Result<PathBuf> {
        sysfs::ensure_file(&self.configured_path)?;
        Ok(self.configured_path.clone())
    }

    /// Verify level control is supported, capture the initial level and
    /// arm the watchdog
    fn init(&mut self) -> Result<()> {
        let content = sysfs::read_string(self.path())?;
        let mut ctrl_supported = false;
        for line in content.lines() {
            if self.initial_state.is_none() && line.starts_with("level:") {
                self.initial_state = line.split_ascii_whitespace().last().map(ToOwned::to_owned);
                log::debug!(
                    "{}: Saved initial state: {}.",
                    self.describe(),
                    self.initial_state.as_deref().unwrap_or_default()
                );
            } else if line.starts_with("commands:") && line.contains("level <level>") {
                ctrl_supported = true;
            }
        }
        if !ctrl_supported {
            return Err(ControlError::System(format!(
                "{}: Fan does not support level commands. Is the thinkpad_acpi \
                 module loaded with fan_control=1?",
                self.describe()
            )));
        }
        if self.initial_state.is_none() {
            return Err(ControlError::System(format!(
                "{}: Failed to read initial state.",
                self.describe()
            )));
        }
        write_command(
            self.path(),
            &format!("watchdog {}", self.watchdog.as_secs()),
        )
    }

    fn type_name(&self) -> &'static str {
        "tpacpi fan driver"
    }
}

impl Fan for TpacpiFan {
    fn set_speed_raw(&mut self, level: &Level) -> Result<()> {
        write_command(self.path(), level.speed().str())?;
        self.current_speed = Some(level.speed().str().to_owned());
        self.last_watchdog_ping = Some(Instant::now());
        Ok(())
    }

    /// Depulse if configured, otherwise rewrite the level before the
    /// watchdog countdown can return control to the firmware
    fn ping_raw(&mut self, level: &Level) -> Result<()> {
        if self.depulse > Duration::ZERO && level.speed().str() != "level disengaged" {
            write_command(self.path(), "level disengaged")?;
            thread::sleep(self.depulse);
            self.set_speed_raw(level)
        } else if self.watchdog_due() {
            log::debug!("Watchdog ping");
            self.set_speed_raw(level)
        } else {
            Ok(())
        }
    }

    fn check_levels(&self, levels: &[Level]) -> Result<()> {
        if !sanity_checks() {
            return Ok(());
        }
        for level in levels {
            let speed = level.speed();
            if speed.is_ordered() && !speed.is_named() && !(0..=7).contains(&speed.num()) {
                return Err(ControlError::Config(format!(
                    "Fan level {} is not supported by thinkpad_acpi; \
                     only levels 0-7, auto and disengaged are.",
                    speed.num()
                )));
            }
        }
        Ok(())
    }

    fn current_speed(&self) -> Option<&str> {
        self.current_speed.as_deref()
    }
}

impl Drop for TpacpiFan {
    /// Hand control back the way it was found
    fn drop(&mut self) {
        if !self.initialized() {
            return;
        }
        if let Some(initial) = self.initial_state.take() {
            log::debug!("{}: Restoring initial state: {initial}.", self.describe());
            if let Err(e) = write_command(self.path(), &format!("level {initial}")) {
                log::error!("Resetting fan control: {e}");
            }
        }
    }
}
