//! Sensor driver for the thinkpad_acpi thermal interface

use std::path::PathBuf;

use super::Sensor;
use crate::{
    driver::{Driver, DriverCommon},
    error::{ControlError, Result},
    sysfs,
    temp_state::{TempRef, TempState},
};

/// Line prefix of the thermal file
const TEMPERATURES_PREFIX: &str = "temperatures:";

/// Reads `/proc/acpi/ibm/thermal`: one line of whitespace-separated
/// degrees Celsius, optionally filtered by position
#[derive(Debug)]
pub(crate) struct TpacpiSensor {
    /// Shared driver state
    common: DriverCommon,
    /// Configured thermal file path
    configured_path: PathBuf,
    /// Positions to use, in file order; `None` selects all
    indices: Option<Vec<usize>>,
    /// Which file positions are in use, sized at init
    in_use: Vec<bool>,
    /// Added component-wise to the selected readings
    correction: Vec<i32>,
    /// Temperature count; fixed up at init when no indices are given
    num_temps: usize,
    /// Cursor into the shared temperature state
    temp_ref: TempRef,
}

impl TpacpiSensor {
    /// New driver for the given thermal file
    pub(crate) fn new(
        path: PathBuf,
        indices: Option<Vec<usize>>,
        correction: Vec<i32>,
        optional: bool,
        max_errors: u32,
    ) -> Result<Self> {
        if optional && indices.is_none() {
            return Err(ControlError::Config(format!(
                "{path:?}: An optional tpacpi sensor needs an `indices' list, \
                 since its temperature count must be known without the hardware"
            )));
        }
        let num_temps = indices.as_ref().map_or(0, Vec::len);
        Ok(Self {
            common: DriverCommon::new(Some(path.clone()), optional, max_errors),
            configured_path: path,
            indices,
            in_use: Vec::new(),
            correction,
            num_temps,
            temp_ref: TempRef::default(),
        })
    }

    /// Check and zero-pad the correction vector once the count is known
    fn fixup_correction(&mut self) -> Result<()> {
        if self.correction.len() > self.num_temps {
            return Err(ControlError::Config(format!(
                "Sensor {:?} has {} temperatures, but you have {} correction values for it.",
                self.configured_path,
                self.num_temps,
                self.correction.len()
            )));
        }
        if self.correction.len() < self.num_temps {
            if !self.correction.is_empty() {
                log::warn!(
                    "Sensor {:?} has {} temperatures, but you have {} correction values for it.",
                    self.configured_path,
                    self.num_temps,
                    self.correction.len()
                );
            }
            self.correction.resize(self.num_temps, 0);
        }
        Ok(())
    }

    /// Parse the values of a `temperatures:` line
    fn parse_line(path: &std::path::Path, content: &str) -> Result<Vec<i32>> {
        let values = content
            .strip_prefix(TEMPERATURES_PREFIX)
            .ok_or_else(|| ControlError::System(format!("{path:?}: Unknown file format.")))?;
        Ok(values
            .split_ascii_whitespace()
            .map_while(|v| v.parse().ok())
            .collect())
    }
}

impl Driver for TpacpiSensor {
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

    /// Count the reported temperatures once and build the position filter
    fn init(&mut self) -> Result<()> {
        let line = sysfs::read_line(self.path())?;
        let count = Self::parse_line(&self.configured_path, &line)?.len();

        if let Some(indices) = &self.indices {
            if let Some(bad) = indices.iter().find(|&&i| i >= count) {
                return Err(ControlError::Config(format!(
                    "Config selects temperature input {bad} in {:?}, but there are only {count}.",
                    self.configured_path
                )));
            }
            self.in_use = vec![false; count];
            for &i in indices {
                self.in_use[i] = true;
            }
        } else {
            self.in_use = vec![true; count];
            self.num_temps = count;
        }
        self.fixup_correction()
    }

    fn type_name(&self) -> &'static str {
        "tpacpi sensor driver"
    }
}

impl Sensor for TpacpiSensor {
    fn num_temps(&self) -> usize {
        self.num_temps
    }

    fn temp_ref_mut(&mut self) -> &mut TempRef {
        &mut self.temp_ref
    }

    fn correction(&self) -> &[i32] {
        &self.correction
    }

    fn read_raw(&mut self, ts: &mut TempState) -> Result<()> {
        let line = sysfs::read_line(self.path())?;
        let values = Self::parse_line(&self.configured_path, &line)?;
        let mut cidx = 0;
        for (i, value) in values.iter().enumerate() {
            if self.in_use.get(i).copied().unwrap_or(false) {
                let correction = self.correction.get(cidx).copied().unwrap_or(0);
                ts.add_temp(&mut self.temp_ref, value + correction);
                cidx += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{fs, time::Duration};

    use super::*;

    /// Fake thermal file with the kernel's tab-separated format
    fn thermal_file(values: &str) -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        fs::write(f.path(), format!("temperatures:\t{values}\n")).unwrap();
        f
    }

    #[serial_test::serial]
    #[test]
    fn counts_temperatures_at_init() {
        let f = thermal_file("47 50 44 52 0 -128 0 0");
        let mut sensor =
            TpacpiSensor::new(f.path().to_owned(), None, Vec::new(), false, 0).unwrap();
        sensor.try_init().unwrap();
        assert_eq!(sensor.num_temps(), 8);
    }

    #[serial_test::serial]
    #[test]
    fn reads_all_temperatures() {
        let f = thermal_file("47 50 44");
        let mut ts = TempState::new(3, 0.5, Duration::from_secs(5));
        let mut sensor =
            TpacpiSensor::new(f.path().to_owned(), None, Vec::new(), false, 0).unwrap();
        sensor.try_init().unwrap();
        sensor.assign_slots(&mut ts);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[47, 50, 44]);
    }

    #[serial_test::serial]
    #[test]
    fn index_filter_selects_positions() {
        let f = thermal_file("47 50 44 52");
        let mut ts = TempState::new(2, 0.5, Duration::from_secs(5));
        let mut sensor = TpacpiSensor::new(
            f.path().to_owned(),
            Some(vec![0, 3]),
            vec![1, -2],
            false,
            0,
        )
        .unwrap();
        sensor.try_init().unwrap();
        sensor.assign_slots(&mut ts);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[48, 50]);
    }

    #[serial_test::serial]
    #[test]
    fn out_of_range_index_rejected() {
        crate::driver::set_sanity_checks(true);
        crate::driver::set_tolerate_errors(false);
        let f = thermal_file("47 50");
        let mut sensor =
            TpacpiSensor::new(f.path().to_owned(), Some(vec![5]), Vec::new(), false, 0).unwrap();
        assert!(sensor.try_init().is_err());
    }

    #[serial_test::serial]
    #[test]
    fn wrong_format_rejected() {
        crate::driver::set_sanity_checks(true);
        crate::driver::set_tolerate_errors(false);
        let f = tempfile::NamedTempFile::new().unwrap();
        fs::write(f.path(), "cpu temp: 47\n").unwrap();
        let mut sensor =
            TpacpiSensor::new(f.path().to_owned(), None, Vec::new(), false, 0).unwrap();
        assert!(sensor.try_init().is_err());
    }

    #[test]
    fn optional_without_indices_rejected() {
        let err = TpacpiSensor::new(PathBuf::from("/proc/acpi/ibm/thermal"), None, Vec::new(), true, 0);
        assert!(err.is_err());
    }

    #[serial_test::serial]
    #[test]
    fn excess_correction_rejected() {
        crate::driver::set_sanity_checks(true);
        crate::driver::set_tolerate_errors(false);
        let f = thermal_file("47 50");
        let mut sensor =
            TpacpiSensor::new(f.path().to_owned(), None, vec![0, 0, 0], false, 0).unwrap();
        assert!(sensor.try_init().is_err());
    }

    #[serial_test::serial]
    #[test]
    fn shrunken_file_underfills_cursor() {
        // A vanished temperature must leave the cycle incomplete so the
        // control loop can detect the lost sensor
        let f = thermal_file("47 50 44");
        let mut ts = TempState::new(3, 0.5, Duration::from_secs(5));
        let mut sensor =
            TpacpiSensor::new(f.path().to_owned(), None, Vec::new(), false, 0).unwrap();
        sensor.try_init().unwrap();
        sensor.assign_slots(&mut ts);
        fs::write(f.path(), "temperatures:\t47 50\n").unwrap();
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert!(!ts.cycle_complete());
    }
}
