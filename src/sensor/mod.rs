//! Temperature sensor drivers

mod atasmart;
mod hwmon;
#[cfg(feature = "libsensors")]
mod libsensors;
#[cfg(feature = "nvml")]
mod nvml;
mod tpacpi;

pub(crate) use atasmart::{AtasmartSensor, set_dnd_disk};
pub(crate) use hwmon::HwmonSensor;
#[cfg(feature = "libsensors")]
pub(crate) use libsensors::{LibsensorsHandle, LibsensorsInterface, LibsensorsSensor};
#[cfg(feature = "nvml")]
pub(crate) use nvml::NvmlSensor;
pub(crate) use tpacpi::TpacpiSensor;

use crate::{
    driver::{Driver, tolerate_errors},
    error::Result,
    temp_state::{TempRef, TempState, UNAVAILABLE_TEMP},
};

/// A driver producing a fixed number of temperatures per read
///
/// `read_temps` restarts the sensor's cursor and then performs exactly
/// `num_temps` add/skip operations on it, either from the hardware or from
/// the skip policy when a tolerable I/O error occurred.
pub(crate) trait Sensor: Driver {
    /// Number of temperatures this sensor reports per cycle
    fn num_temps(&self) -> usize;

    /// The sensor's cursor into the shared temperature state
    fn temp_ref_mut(&mut self) -> &mut TempRef;

    /// Correction values added to this sensor's readings
    fn correction(&self) -> &[i32] {
        &[]
    }

    /// Read from the hardware into the cursor; may assume `ensure_ready` ran
    fn read_raw(&mut self, ts: &mut TempState) -> Result<()>;

    /// Hook run before each read, before lifecycle handling
    fn pre_cycle(&mut self) {}

    /// Claim this sensor's slot range of the temperature state
    fn assign_slots(&mut self, ts: &mut TempState) {
        *self.temp_ref_mut() = ts.slots(self.num_temps());
    }

    /// One robust read cycle, applying the driver error policy
    fn read_temps(&mut self, ts: &mut TempState) -> Result<()> {
        self.pre_cycle();
        self.temp_ref_mut().restart();
        self.common_mut().errors += 1;
        let res = self.ensure_ready().and_then(|()| self.read_raw(ts));
        match res {
            Ok(()) => {
                self.common_mut().errors = 0;
                Ok(())
            }
            Err(e) if e.is_io() && self.io_tolerated() => {
                self.skip_cycle(ts, &e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fill the unconsumed slots of a failed cycle
    ///
    /// An optional sensor advertises its slots as unavailable so they stop
    /// contributing to the maximum; any other tolerated failure keeps the
    /// previous readings.
    fn skip_cycle(&mut self, ts: &mut TempState, reason: &str) {
        if self.optional() {
            log::info!("{}: sensor unavailable: {reason}", self.describe());
            while self.temp_ref_mut().remaining() > 0 {
                ts.add_temp(self.temp_ref_mut(), UNAVAILABLE_TEMP);
            }
        } else {
            if tolerate_errors() {
                log::info!("{}: read error on wakeup: {reason}", self.describe());
            } else {
                log::info!(
                    "Ignoring error {}/{} on {}: {reason}",
                    self.errors(),
                    self.max_errors(),
                    self.describe()
                );
            }
            while self.temp_ref_mut().remaining() > 0 {
                ts.skip_temp(self.temp_ref_mut());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use super::*;
    use crate::{
        driver::{DriverCommon, set_tolerate_errors},
        error::ControlError,
    };

    /// Two-slot sensor that fails on demand
    struct TwoSlotSensor {
        common: DriverCommon,
        temp_ref: TempRef,
        fail: bool,
    }

    impl TwoSlotSensor {
        fn new(optional: bool) -> Self {
            Self {
                common: DriverCommon::new(Some(PathBuf::from("/dev/null")), optional, 0),
                temp_ref: TempRef::default(),
                fail: false,
            }
        }
    }

    impl Driver for TwoSlotSensor {
        fn common(&self) -> &DriverCommon {
            &self.common
        }

        fn common_mut(&mut self) -> &mut DriverCommon {
            &mut self.common
        }

        fn lookup(&mut self) -> crate::error::Result<PathBuf> {
            Ok(PathBuf::from("/dev/null"))
        }

        fn init(&mut self) -> crate::error::Result<()> {
            Ok(())
        }

        fn type_name(&self) -> &'static str {
            "test sensor"
        }
    }

    impl Sensor for TwoSlotSensor {
        fn num_temps(&self) -> usize {
            2
        }

        fn temp_ref_mut(&mut self) -> &mut TempRef {
            &mut self.temp_ref
        }

        fn read_raw(&mut self, ts: &mut TempState) -> crate::error::Result<()> {
            if self.fail {
                return Err(ControlError::io(
                    "read".to_owned(),
                    std::io::Error::from_raw_os_error(nix::libc::EIO),
                ));
            }
            ts.add_temp(&mut self.temp_ref, 40);
            ts.add_temp(&mut self.temp_ref, 50);
            Ok(())
        }
    }

    /// State plus a sensor with assigned slots
    fn setup(optional: bool) -> (TempState, TwoSlotSensor) {
        let mut ts = TempState::new(2, 0.5, Duration::from_secs(5));
        let mut sensor = TwoSlotSensor::new(optional);
        sensor.assign_slots(&mut ts);
        (ts, sensor)
    }

    #[serial_test::serial]
    #[test]
    fn good_read_fills_all_slots() {
        set_tolerate_errors(false);
        let (mut ts, mut sensor) = setup(false);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[40, 50]);
        assert!(ts.cycle_complete());
    }

    #[serial_test::serial]
    #[test]
    fn optional_failure_marks_slots_unavailable() {
        set_tolerate_errors(false);
        let (mut ts, mut sensor) = setup(true);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        sensor.fail = true;
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        assert_eq!(ts.temps(), &[UNAVAILABLE_TEMP, UNAVAILABLE_TEMP]);
        assert!(ts.cycle_complete());
    }

    #[serial_test::serial]
    #[test]
    fn tolerated_failure_keeps_previous_readings() {
        let (mut ts, mut sensor) = setup(false);
        set_tolerate_errors(false);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        sensor.fail = true;
        set_tolerate_errors(true);
        ts.start_cycle();
        sensor.read_temps(&mut ts).unwrap();
        set_tolerate_errors(false);
        assert_eq!(ts.temps(), &[40, 50]);
        assert!(ts.cycle_complete());
    }

    #[serial_test::serial]
    #[test]
    fn exhausted_budget_propagates() {
        crate::driver::set_sanity_checks(true);
        set_tolerate_errors(false);
        let (mut ts, mut sensor) = setup(false);
        sensor.fail = true;
        ts.start_cycle();
        assert!(sensor.read_temps(&mut ts).is_err());
    }
}
