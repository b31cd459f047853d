//! Sensor driver for disk temperatures via S.M.A.R.T.
//!
//! Shells out to `smartctl` for the temperature attribute and to `hdparm`
//! for the drive power state, so a sleeping disk is not spun up when the
//! do-not-disturb flag is set.

use std::{
    io::BufRead as _,
    path::PathBuf,
    process::{Command, Stdio},
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use super::Sensor;
use crate::{
    driver::{Driver, DriverCommon},
    error::{ControlError, Result},
    temp_state::{TempRef, TempState},
};

/// Do Not Disturb disk: don't get the temperature from a sleeping disk
static DND_DISK: AtomicBool = AtomicBool::new(false);

/// Set the process-wide do-not-disturb-disks flag (`-d`)
pub(crate) fn set_dnd_disk(on: bool) {
    DND_DISK.store(on, Ordering::Relaxed);
}

/// Drive power state as reported by `hdparm -C`
#[derive(Debug, Copy, Clone, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum DriveState {
    /// Active or idle
    #[strum(serialize = "active/idle")]
    ActiveIdle,
    /// Spun down
    Standby,
    /// Power saving sleep
    Sleeping,
    /// State line missing or unrecognized
    Unknown,
}

impl DriveState {
    /// Whether reading S.M.A.R.T. data would spin the drive up
    fn is_asleep(self) -> bool {
        matches!(self, Self::Standby | Self::Sleeping)
    }
}

/// S.M.A.R.T. attributes known to carry the drive temperature
const TEMP_ATTRIBS_ID_NAMES: [(u16, &str); 2] = [
    (194, "Temperature_Celsius"),
    (190, "Airflow_Temperature_Ce"),
];

/// One row of `smartctl -A` output
struct SmartAttribLog {
    /// Attribute id
    id: u16,
    /// Attribute name
    name: String,
    /// Raw attribute value
    value: i32,
}

impl FromStr for SmartAttribLog {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let tokens: Vec<_> = s.split_ascii_whitespace().collect();
        if tokens.len() < 10 {
            return Err("Not enough columns");
        }
        Ok(Self {
            id: tokens[0].parse().map_err(|_| "Unable to parse attribute id")?,
            name: tokens[1].to_owned(),
            value: tokens[9]
                .parse()
                .map_err(|_| "Unable to parse attribute value")?,
        })
    }
}

impl SmartAttribLog {
    /// Temperature carried by this attribute, if it is one of the known ones
    fn temp(&self) -> Option<i32> {
        TEMP_ATTRIBS_ID_NAMES
            .iter()
            .any(|(id, name)| self.id == *id && self.name == *name)
            .then_some(self.value)
    }
}

/// Disk temperature sensor reading the S.M.A.R.T. temperature attribute
#[derive(Debug)]
pub(crate) struct AtasmartSensor {
    /// Shared driver state
    common: DriverCommon,
    /// Configured disk device path
    configured_path: PathBuf,
    /// Added to the reading
    correction: i32,
    /// Cursor into the shared temperature state
    temp_ref: TempRef,
}

impl AtasmartSensor {
    /// New driver for the given disk device
    pub(crate) fn new(path: PathBuf, optional: bool, correction: i32, max_errors: u32) -> Self {
        Self {
            common: DriverCommon::new(Some(path.clone()), optional, max_errors),
            configured_path: path,
            correction,
            temp_ref: TempRef::default(),
        }
    }

    /// Run a probing command against the disk and return its stdout lines
    fn run_probe(&self, cmd: &str, arg: &str) -> Result<Vec<String>> {
        let dev = self.configured_path.to_str().ok_or_else(|| {
            ControlError::Config(format!("Invalid device path {:?}", self.configured_path))
        })?;
        let output = Command::new(cmd)
            .args([arg, dev])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .env("LANG", "C")
            .output()
            .map_err(|e| ControlError::io(format!("Failed to run {cmd} for {dev}"), e))?;
        if !output.status.success() {
            return Err(ControlError::System(format!(
                "{cmd} failed with code {} for {dev}",
                output.status
            )));
        }
        Ok(output.stdout.lines().map_while(std::result::Result::ok).collect())
    }

    /// Drive power state via `hdparm -C`
    fn drive_state(&self) -> Result<DriveState> {
        let lines = self.run_probe("hdparm", "-C")?;
        Ok(lines
            .iter()
            .find_map(|l| l.trim_start().strip_prefix("drive state is:"))
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DriveState::Unknown))
    }

    /// Temperature via `smartctl -A`
    fn smart_temp(&self) -> Result<i32> {
        let lines = self.run_probe("smartctl", "-A")?;
        lines
            .iter()
            .find_map(|l| l.parse::<SmartAttribLog>().ok().and_then(|a| a.temp()))
            .ok_or_else(|| {
                ControlError::System(format!(
                    "{:?}: no S.M.A.R.T. temperature attribute found",
                    self.configured_path
                ))
            })
    }
}

impl Driver for AtasmartSensor {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn lookup(&mut self) -> Result<PathBuf> {
        Ok(self.configured_path.clone())
    }

    fn init(&mut self) -> Result<()> {
        if self.configured_path.exists() {
            Ok(())
        } else {
            Err(ControlError::DriverInit(format!(
                "{:?}: no such device",
                self.configured_path
            )))
        }
    }

    fn type_name(&self) -> &'static str {
        "atasmart sensor driver"
    }
}

impl Sensor for AtasmartSensor {
    fn num_temps(&self) -> usize {
        1
    }

    fn temp_ref_mut(&mut self) -> &mut TempRef {
        &mut self.temp_ref
    }

    fn correction(&self) -> &[i32] {
        std::slice::from_ref(&self.correction)
    }

    fn read_raw(&mut self, ts: &mut TempState) -> Result<()> {
        if DND_DISK.load(Ordering::Relaxed) {
            let state = self.drive_state()?;
            if state.is_asleep() {
                // Don't spin the disk up; it can't overheat while asleep
                log::debug!("{}: drive state is {state}, not probing", self.describe());
                ts.add_temp(&mut self.temp_ref, 0);
                return Ok(());
            }
        }
        let temp = self.smart_temp()? + self.correction;
        ts.add_temp(&mut self.temp_ref, temp);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tests::FakeCommand;

    /// Plausible `smartctl -A` output with attribute 194
    const SMARTCTL_OUTPUT: &str = "smartctl 7.4 2023-08-01 r5530 [x86_64-linux] (local build)

=== START OF READ SMART DATA SECTION ===
ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      UPDATED  WHEN_FAILED RAW_VALUE
  9 Power_On_Hours          0x0012   100   100   000    Old_age   Always       -       1723
194 Temperature_Celsius     0x0002   171   171   000    Old_age   Always       -       35 (Min/Max 13/45)
";

    /// State plus an initialized sensor on a fake device path
    fn setup() -> (TempState, AtasmartSensor) {
        let mut ts = TempState::new(1, 0.5, Duration::from_secs(5));
        let mut sensor = AtasmartSensor::new(PathBuf::from("/dev/null"), false, 0, 0);
        sensor.assign_slots(&mut ts);
        (ts, sensor)
    }

    #[serial_test::serial]
    #[test]
    fn reads_temperature_attribute() {
        set_dnd_disk(false);
        let _smartctl = FakeCommand::shadow("smartctl", SMARTCTL_OUTPUT, 0);
        let (mut ts, mut sensor) = setup();
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[35]);
    }

    #[serial_test::serial]
    #[test]
    fn sleeping_disk_is_not_disturbed() {
        set_dnd_disk(true);
        let _hdparm =
            FakeCommand::shadow("hdparm", "\n/dev/null:\n drive state is:  standby", 0);
        let (mut ts, mut sensor) = setup();
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[0]);
        set_dnd_disk(false);
    }

    #[serial_test::serial]
    #[test]
    fn active_disk_is_probed_despite_dnd() {
        set_dnd_disk(true);
        let _hdparm =
            FakeCommand::shadow("hdparm", "\n/dev/null:\n drive state is:  active/idle", 0);
        let _smartctl = FakeCommand::shadow("smartctl", SMARTCTL_OUTPUT, 0);
        let (mut ts, mut sensor) = setup();
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[35]);
        set_dnd_disk(false);
    }

    #[serial_test::serial]
    #[test]
    fn smartctl_failure_propagates_without_budget() {
        set_dnd_disk(false);
        crate::driver::set_sanity_checks(true);
        crate::driver::set_tolerate_errors(false);
        let _smartctl = FakeCommand::shadow("smartctl", "", 1);
        let (mut ts, mut sensor) = setup();
        ts.start_cycle();
        assert!(sensor.read_temps(&mut ts).is_err());
    }

    #[test]
    fn missing_device_fails_init() {
        let mut sensor = AtasmartSensor::new(PathBuf::from("/dev/_no_such_disk"), false, 0, 0);
        assert!(sensor.init().is_err());
    }

    #[test]
    fn attrib_log_parsing() {
        let log: SmartAttribLog =
            "194 Temperature_Celsius     0x0002   171   171   000    Old_age   Always       -       35"
                .parse()
                .unwrap();
        assert_eq!(log.temp(), Some(35));
        let other: SmartAttribLog =
            "  9 Power_On_Hours          0x0012   100   100   000    Old_age   Always       -       1723"
                .parse()
                .unwrap();
        assert_eq!(other.temp(), None);
    }
}
