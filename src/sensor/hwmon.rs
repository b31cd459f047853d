//! Sensor driver for kernel hwmon temperature inputs

use std::path::PathBuf;

use super::Sensor;
use crate::{
    driver::{Driver, DriverCommon},
    error::Result,
    hwmon::{HwmonFile, HwmonInterface},
    sysfs,
    temp_state::{TempRef, TempState},
};

/// One `tempN_input` file; multi-index config entries expand to one
/// driver per index at parse time
#[derive(Debug)]
pub(crate) struct HwmonSensor {
    /// Shared driver state
    common: DriverCommon,
    /// Where to find the input file
    iface: HwmonInterface,
    /// Added to the raw reading
    correction: i32,
    /// Cursor into the shared temperature state
    temp_ref: TempRef,
}

impl HwmonSensor {
    /// Sensor at a concrete `tempN_input` path
    pub(crate) fn direct(path: PathBuf, optional: bool, correction: i32, max_errors: u32) -> Self {
        Self {
            common: DriverCommon::new(None, optional, max_errors),
            iface: HwmonInterface::new(path, None, None, HwmonFile::TempInput),
            correction,
            temp_ref: TempRef::default(),
        }
    }

    /// Sensor found by scanning below a base path
    pub(crate) fn search(
        base_path: PathBuf,
        name: Option<String>,
        index: Option<u32>,
        optional: bool,
        correction: i32,
        max_errors: u32,
    ) -> Self {
        Self {
            common: DriverCommon::new(None, optional, max_errors),
            iface: HwmonInterface::new(base_path, name, index, HwmonFile::TempInput),
            correction,
            temp_ref: TempRef::default(),
        }
    }
}

impl Driver for HwmonSensor {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn lookup(&mut self) -> Result<PathBuf> {
        self.iface.lookup()
    }

    fn init(&mut self) -> Result<()> {
        // Verify the file reads and parses before the loop relies on it
        sysfs::read_value::<i64>(self.path()).map(|_| ())
    }

    fn type_name(&self) -> &'static str {
        "hwmon sensor driver"
    }
}

impl Sensor for HwmonSensor {
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
        let milli: i64 = sysfs::read_value(self.path())?;
        #[expect(clippy::cast_possible_truncation)] // milli-degrees / 1000 fits easily
        let temp = (milli / 1000) as i32 + self.correction;
        ts.add_temp(&mut self.temp_ref, temp);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{io::Write as _, time::Duration};

    use super::*;

    /// Driver reading from a temp file, slots assigned
    fn setup(content: &str, correction: i32) -> (tempfile::NamedTempFile, TempState, HwmonSensor) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        let mut ts = TempState::new(1, 0.5, Duration::from_secs(5));
        let mut sensor = HwmonSensor::direct(f.path().to_owned(), false, correction, 0);
        sensor.assign_slots(&mut ts);
        (f, ts, sensor)
    }

    #[serial_test::serial]
    #[test]
    fn reads_milli_degrees() {
        let (_f, mut ts, mut sensor) = setup("54321\n", 0);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[54]);
        assert!(sensor.initialized());
    }

    #[serial_test::serial]
    #[test]
    fn applies_correction() {
        let (_f, mut ts, mut sensor) = setup("50000\n", -5);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[45]);
    }

    #[serial_test::serial]
    #[test]
    fn missing_file_fails_init() {
        crate::driver::set_sanity_checks(true);
        crate::driver::set_tolerate_errors(false);
        let mut ts = TempState::new(1, 0.5, Duration::from_secs(5));
        let mut sensor =
            HwmonSensor::direct(PathBuf::from("/nonexistent/temp1_input"), false, 0, 0);
        sensor.assign_slots(&mut ts);
        assert!(sensor.try_init().is_err());
        assert!(!sensor.available());
    }

    #[serial_test::serial]
    #[test]
    fn garbage_content_is_io_error() {
        crate::driver::set_sanity_checks(true);
        crate::driver::set_tolerate_errors(false);
        let (_f, mut ts, mut sensor) = setup("not a number\n", 0);
        ts.start_cycle();
        assert!(sensor.read_temps(&mut ts).is_err());
    }
}
