//! Sensor driver for lm-sensors chips via libsensors
//!
//! libsensors keeps process-wide state and does not notice kernel modules
//! loaded after `sensors_init`, so all clients share one interface: when
//! any client loses its features, the library state is torn down and every
//! client re-resolves its chip on the next cycle.

use std::{cell::RefCell, path::PathBuf, rc::Rc};

use lm_sensors::{LMSensors, value::Value};

use super::Sensor;
use crate::{
    driver::{Driver, DriverCommon},
    error::{ControlError, Result},
    temp_state::{TempRef, TempState},
};

/// Closest integer value to zero Kelvin
const MIN_CELSIUS_TEMP: i32 = -273;

/// Shared handle to the process-wide libsensors state
pub(crate) type LibsensorsHandle = Rc<RefCell<LibsensorsInterface>>;

/// Lazily initialized owner of the libsensors library state
pub(crate) struct LibsensorsInterface {
    /// Library state, `None` until first use and after teardown
    sensors: Option<LMSensors>,
    /// Bumped on teardown so clients know to re-resolve their chips
    epoch: u64,
}

impl LibsensorsInterface {
    /// New shared handle; the library is initialized on first lookup
    pub(crate) fn new_handle() -> LibsensorsHandle {
        Rc::new(RefCell::new(Self {
            sensors: None,
            epoch: 0,
        }))
    }

    /// Current teardown epoch
    fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Initialize the library if needed
    fn ensure_init(&mut self) -> Result<()> {
        if self.sensors.is_none() {
            let sensors = lm_sensors::Initializer::default().initialize().map_err(|e| {
                ControlError::System(format!("Failed to initialize LM sensors driver: {e}"))
            })?;
            log::debug!("Initialized LM sensors.");
            self.sensors = Some(sensors);
        }
        Ok(())
    }

    /// Drop the library state and force every client to re-lookup
    fn teardown(&mut self) {
        self.sensors = None;
        self.epoch += 1;
    }

    /// Resolve a chip and verify its features, returning the chip path
    ///
    /// A failed feature lookup tears the shared state down before the
    /// error propagates.
    fn lookup_client_features(
        &mut self,
        chip_name: &str,
        feature_names: &[String],
    ) -> Result<PathBuf> {
        self.ensure_init()?;
        let res = self.find_features(chip_name, feature_names);
        if res.is_err() {
            self.teardown();
        }
        res
    }

    /// Worker for [`Self::lookup_client_features`]
    fn find_features(&self, chip_name: &str, feature_names: &[String]) -> Result<PathBuf> {
        let sensors = self.sensors()?;
        let chip = sensors
            .chip_iter(None)
            .find(|c| c.name().is_ok_and(|n| n == chip_name))
            .ok_or_else(|| {
                ControlError::System(format!("LM sensors chip '{chip_name}' was not found"))
            })?;
        for feature_name in feature_names {
            let feature = chip
                .feature_iter()
                .find(|f| {
                    f.label().is_ok_and(|l| l == *feature_name)
                })
                .ok_or_else(|| {
                    ControlError::System(format!(
                        "LM sensors chip '{chip_name}' does not have the feature '{feature_name}'"
                    ))
                })?;
            let has_temp_input = feature
                .sub_feature_iter()
                .any(|sf| matches!(sf.value(), Ok(Value::TemperatureInput(_))));
            if !has_temp_input {
                return Err(ControlError::System(format!(
                    "LM sensors feature '{feature_name}' of the chip '{chip_name}' \
                     does not have a temperature input sensor"
                )));
            }
            log::debug!(
                "Initialized LM sensors temperature input of feature '{feature_name}' \
                 of chip '{chip_name}'."
            );
        }
        Ok(chip
            .path()
            .map_or_else(|| PathBuf::from(chip_name), PathBuf::from))
    }

    /// Read one temperature per feature, in feature order
    fn get_temps(&mut self, chip_name: &str, feature_names: &[String]) -> Result<Vec<f64>> {
        let sensors = self.sensors()?;
        let chip = sensors
            .chip_iter(None)
            .find(|c| c.name().is_ok_and(|n| n == chip_name))
            .ok_or_else(|| {
                ControlError::System(format!("LM sensors chip '{chip_name}' was not found"))
            })?;
        let mut temps = Vec::with_capacity(feature_names.len());
        for feature_name in feature_names {
            let value = chip
                .feature_iter()
                .filter(|f| f.label().is_ok_and(|l| l == *feature_name))
                .flat_map(|f| f.sub_feature_iter())
                .find_map(|sf| match sf.value() {
                    Ok(Value::TemperatureInput(v)) => Some(v),
                    _ => None,
                })
                .ok_or_else(|| {
                    ControlError::System(format!(
                        "temperature input value of feature '{feature_name}' of chip \
                         '{chip_name}' is unavailable"
                    ))
                })?;
            temps.push(value);
        }
        Ok(temps)
    }

    /// The initialized library state
    fn sensors(&self) -> Result<&LMSensors> {
        self.sensors
            .as_ref()
            .ok_or_else(|| ControlError::Bug("libsensors used before init".to_owned()))
    }
}

/// One configured lm-sensors chip with its selected features
pub(crate) struct LibsensorsSensor {
    /// Shared driver state
    common: DriverCommon,
    /// Shared library state
    handle: LibsensorsHandle,
    /// Chip name as printed by `sensors`
    chip_name: String,
    /// Feature labels to read, in order
    feature_names: Vec<String>,
    /// Added component-wise to the readings
    correction: Vec<i32>,
    /// Interface epoch this driver resolved its chip against
    epoch: u64,
    /// Cursor into the shared temperature state
    temp_ref: TempRef,
}

impl LibsensorsSensor {
    /// New driver for the given chip and feature labels
    pub(crate) fn new(
        handle: LibsensorsHandle,
        chip_name: String,
        feature_names: Vec<String>,
        mut correction: Vec<i32>,
        optional: bool,
        max_errors: u32,
    ) -> Result<Self> {
        if feature_names.is_empty() {
            return Err(ControlError::Config(format!(
                "LM sensors chip '{chip_name}' needs at least one feature id"
            )));
        }
        if correction.len() > feature_names.len() {
            return Err(ControlError::Config(format!(
                "Sensor {chip_name} has {} temperatures, but you have {} correction values for it.",
                feature_names.len(),
                correction.len()
            )));
        }
        correction.resize(feature_names.len(), 0);
        Ok(Self {
            common: DriverCommon::new(None, optional, max_errors),
            handle,
            chip_name,
            feature_names,
            correction,
            epoch: 0,
            temp_ref: TempRef::default(),
        })
    }
}

impl Driver for LibsensorsSensor {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn lookup(&mut self) -> Result<PathBuf> {
        let path = self
            .handle
            .borrow_mut()
            .lookup_client_features(&self.chip_name, &self.feature_names)?;
        self.epoch = self.handle.borrow().epoch();
        Ok(path)
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "libsensors driver"
    }
}

impl Sensor for LibsensorsSensor {
    fn num_temps(&self) -> usize {
        self.feature_names.len()
    }

    fn temp_ref_mut(&mut self) -> &mut TempRef {
        &mut self.temp_ref
    }

    fn correction(&self) -> &[i32] {
        &self.correction
    }

    /// Re-lookup after the shared state was torn down by any client
    fn pre_cycle(&mut self) {
        if self.available() && self.handle.borrow().epoch() != self.epoch {
            self.set_unavailable();
        }
    }

    fn read_raw(&mut self, ts: &mut TempState) -> Result<()> {
        let temps = self
            .handle
            .borrow_mut()
            .get_temps(&self.chip_name, &self.feature_names)?;
        for (value, correction) in temps.iter().zip(self.correction.iter()) {
            #[expect(clippy::cast_possible_truncation)] // validated right below
            let temp = *value as i32 + correction;
            if temp < MIN_CELSIUS_TEMP {
                return Err(ControlError::System(format!(
                    "Invalid temperature on chip '{}': {temp}",
                    self.chip_name
                )));
            }
            ts.add_temp(&mut self.temp_ref, temp);
        }
        Ok(())
    }
}
