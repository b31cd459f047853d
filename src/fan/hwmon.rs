//! Fan driver for sysfs PWM interfaces

use std::path::PathBuf;

use super::Fan;
use crate::{
    driver::{Driver, DriverCommon, resume_is_safe, sanity_checks},
    error::{ControlError, Result},
    hwmon::{HwmonFile, HwmonInterface},
    level::Level,
    sysfs,
};

/// Maximum PWM duty cycle value
const PWM_MAX: i32 = 255;

/// Fan controlled through a `pwmN` file, with `pwmN_enable` as the
/// manual/automatic mode selector
#[derive(Debug)]
pub(crate) struct HwmonFan {
    /// Shared driver state
    common: DriverCommon,
    /// Where to find the pwm file
    iface: HwmonInterface,
    /// Enable selector value captured at init, restored on drop
    initial_state: Option<String>,
    /// Last command written
    current_speed: Option<String>,
}

impl HwmonFan {
    /// Fan at a concrete `pwmN` path
    pub(crate) fn direct(path: PathBuf, optional: bool, max_errors: u32) -> Self {
        Self {
            common: DriverCommon::new(None, optional, max_errors),
            iface: HwmonInterface::new(path, None, None, HwmonFile::Pwm),
            initial_state: None,
            current_speed: None,
        }
    }

    /// Fan found by scanning below a base path
    pub(crate) fn search(
        base_path: PathBuf,
        name: Option<String>,
        index: Option<u32>,
        optional: bool,
        max_errors: u32,
    ) -> Self {
        Self {
            common: DriverCommon::new(None, optional, max_errors),
            iface: HwmonInterface::new(base_path, name, index, HwmonFile::Pwm),
            initial_state: None,
            current_speed: None,
        }
    }

    /// `pwmN_enable` path next to the pwm value file
    fn enable_path(&self) -> Result<PathBuf> {
        let path = self.path();
        let fname = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| ControlError::Bug(format!("Unusable pwm path {path:?}")))?;
        Ok(path.with_file_name(format!("{fname}_enable")))
    }
}

impl Driver for HwmonFan {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn lookup(&mut self) -> Result<PathBuf> {
        self.iface.lookup()
    }

    /// Capture the current enable mode, then take manual control
    fn init(&mut self) -> Result<()> {
        let enable = self.enable_path()?;
        if self.initial_state.is_none() {
            self.initial_state = Some(sysfs::read_line(&enable)?);
            log::debug!(
                "{}: Saved initial state: {}.",
                self.describe(),
                self.initial_state.as_deref().unwrap_or_default()
            );
        }
        sysfs::write_value(&enable, 1)
    }

    fn type_name(&self) -> &'static str {
        "hwmon fan driver"
    }
}

impl Fan for HwmonFan {
    fn set_speed_raw(&mut self, level: &Level) -> Result<()> {
        let num = level.speed().num();
        match sysfs::write_value(self.path(), num) {
            Err(e) if e.errno() == Some(nix::libc::EINVAL) => {
                // The kernel reverted to automatic control, e.g. after
                // waking up from suspend: re-initialize and try once more
                self.init()?;
                sysfs::write_value(self.path(), num)?;
                log::warn!(
                    "{}: Userspace fan control had to be re-initialized.",
                    self.describe()
                );
                if !resume_is_safe() {
                    log::warn!(
                        "Please arrange for a SIGUSR2 to be sent after resuming from suspend."
                    );
                }
            }
            other => other?,
        }
        self.current_speed = Some(level.speed().str().to_owned());
        Ok(())
    }

    fn check_levels(&self, levels: &[Level]) -> Result<()> {
        if levels
            .iter()
            .any(|l| l.speed().num() == crate::level::NAMED_SPEED_NUM)
        {
            return Err(ControlError::Config(
                "A pwm fan cannot use named levels like \"auto\"".to_owned(),
            ));
        }
        if !sanity_checks() {
            return Ok(());
        }
        let max_num = levels
            .iter()
            .map(|l| l.speed().num())
            .filter(|&n| n != crate::level::STRING_ONLY_NUM)
            .max();
        match max_num {
            Some(n) if n >= PWM_MAX => Ok(()),
            Some(n) => Err(ControlError::Config(format!(
                "You're using a PWM fan, but your highest fan level is only {n}. \
                 Enable DANGEROUS mode if you're really sure you never need to \
                 max out your fan"
            ))),
            None => Err(ControlError::Config(
                "A pwm fan needs numeric fan levels".to_owned(),
            )),
        }
    }

    fn current_speed(&self) -> Option<&str> {
        self.current_speed.as_deref()
    }
}

impl Drop for HwmonFan {
    /// Hand the enable selector back the way it was found
    fn drop(&mut self) {
        if !self.initialized() {
            return;
        }
        let Ok(enable) = self.enable_path() else {
            return;
        };
        if let Some(initial) = self.initial_state.take() {
            log::debug!("{}: Restoring initial state: {initial}.", self.describe());
            if let Err(e) = sysfs::write_value(&enable, initial) {
                log::error!("Resetting fan control: {e}");
            }
        }
    }
}
