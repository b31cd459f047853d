//! Sensor driver for nVidia GPUs via the NVML management library
//!
//! nvml-wrapper resolves `libnvidia-ml.so.1` at runtime; the library
//! handle stays inside this module.

use std::path::PathBuf;

use nvml_wrapper::{Nvml, enum_wrappers::device::TemperatureSensor};

use super::Sensor;
use crate::{
    driver::{Driver, DriverCommon},
    error::{ControlError, Result},
    temp_state::{TempRef, TempState},
};

/// GPU temperature sensor addressed by PCI bus id (e.g. `0000:01:00.0`)
pub(crate) struct NvmlSensor {
    /// Shared driver state
    common: DriverCommon,
    /// PCI bus id of the GPU
    bus_id: String,
    /// Added to the reading
    correction: i32,
    /// Library handle, populated at init
    nvml: Option<Nvml>,
    /// Cursor into the shared temperature state
    temp_ref: TempRef,
}

impl NvmlSensor {
    /// New driver for the GPU at the given PCI bus id
    pub(crate) fn new(bus_id: String, optional: bool, correction: i32, max_errors: u32) -> Self {
        Self {
            common: DriverCommon::new(Some(PathBuf::from(&bus_id)), optional, max_errors),
            bus_id,
            correction,
            nvml: None,
            temp_ref: TempRef::default(),
        }
    }

    /// Library handle, available once init ran
    fn nvml(&self) -> Result<&Nvml> {
        self.nvml
            .as_ref()
            .ok_or_else(|| ControlError::Bug("NVML used before init".to_owned()))
    }
}

impl Driver for NvmlSensor {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn lookup(&mut self) -> Result<PathBuf> {
        Ok(PathBuf::from(&self.bus_id))
    }

    fn init(&mut self) -> Result<()> {
        let nvml = Nvml::init().map_err(|e| {
            ControlError::DriverInit(format!("Failed to initialize NVML driver: {e}"))
        })?;
        let name = {
            let device = nvml.device_by_pci_bus_id(self.bus_id.as_str()).map_err(|e| {
                ControlError::System(format!("Failed to open PCI device {}: {e}", self.bus_id))
            })?;
            device.name().unwrap_or_else(|_| "unknown GPU".to_owned())
        };
        log::debug!("Initialized NVML sensor on {name} at PCI {}.", self.bus_id);
        self.nvml = Some(nvml);
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "nvml sensor driver"
    }
}

impl Sensor for NvmlSensor {
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
        let temp = self
            .nvml()?
            .device_by_pci_bus_id(self.bus_id.as_str())
            .and_then(|d| d.temperature(TemperatureSensor::Gpu))
            .map_err(|e| {
                ControlError::System(format!(
                    "Failed to read GPU temperature at PCI {}: {e}",
                    self.bus_id
                ))
            })?;
        #[expect(clippy::cast_possible_wrap)] // GPU temperatures are far below i32::MAX
        let temp = temp as i32 + self.correction;
        ts.add_temp(&mut self.temp_ref, temp);
        Ok(())
    }
}
