//! YAML config file loading
//!
//! Deserializes the raw document shape with serde, then builds and
//! validates the typed [`Config`]. Sensor and fan entries are tagged by
//! which key they carry (`hwmon`, `tpacpi`, `atasmart`, `nvml`, `chip`).

use std::{fs, path::{Path, PathBuf}};

use serde::Deserialize;

use crate::{
    cl::Settings,
    config::{Config, FanConfig},
    error::{ControlError, Result},
    fan::{Fan, HwmonFan, TpacpiFan},
    level::{Level, Speed},
    sensor::{AtasmartSensor, HwmonSensor, Sensor, TpacpiSensor},
};
#[cfg(feature = "libsensors")]
use crate::sensor::{LibsensorsHandle, LibsensorsInterface, LibsensorsSensor};

/// Raw top-level document
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    /// Sensor entries, in declaration order
    sensors: Vec<RawSensor>,
    /// Fan entries, optionally with inline levels
    fans: Vec<RawFan>,
    /// Level table shared by all fans without inline levels
    levels: Option<Vec<RawLevel>>,
}

/// Raw sensor entry; exactly one of the tag keys must be present
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSensor {
    /// hwmon path: a `tempN_input` file or a search base
    hwmon: Option<PathBuf>,
    /// thinkpad_acpi thermal file
    tpacpi: Option<PathBuf>,
    /// Disk device path probed via S.M.A.R.T.
    atasmart: Option<PathBuf>,
    /// PCI bus id of an nVidia GPU
    nvml: Option<String>,
    /// lm-sensors chip name
    chip: Option<String>,
    /// Chip name to match below an hwmon search base
    name: Option<String>,
    /// hwmon file indices or tpacpi temperature positions
    indices: Option<Vec<u32>>,
    /// Feature labels of a `chip` entry
    ids: Option<Vec<String>>,
    /// Correction values added to the readings
    correction: Option<Vec<i32>>,
    /// Whether the daemon may run without this sensor
    #[serde(default)]
    optional: bool,
    /// Consecutive I/O errors to tolerate
    max_errors: Option<u32>,
}

/// Raw fan entry; exactly one of the tag keys must be present
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFan {
    /// thinkpad_acpi fan file
    tpacpi: Option<PathBuf>,
    /// hwmon path: a `pwmN` file or a search base
    hwmon: Option<PathBuf>,
    /// Chip name to match below an hwmon search base
    name: Option<String>,
    /// pwm file indices below the search base
    indices: Option<Vec<u32>>,
    /// Whether the daemon may run without this fan
    #[serde(default)]
    optional: bool,
    /// Consecutive I/O errors to tolerate
    max_errors: Option<u32>,
    /// Level table for this entry's fans only
    levels: Option<Vec<RawLevel>>,
}

/// Raw level entry: positional tuple or keyed mapping
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLevel {
    /// `[speed, lower, upper]`
    Tuple(RawSpeedScalar, i32, i32),
    /// `speed:` with `lower_limit:`/`upper_limit:`
    Keyed {
        /// Fan speed, scalar or one per fan
        speed: RawSpeed,
        /// Step-down limit(s)
        lower_limit: Option<RawLimits>,
        /// Step-up limit(s)
        upper_limit: Option<RawLimits>,
    },
}

/// A single speed value
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSpeedScalar {
    /// Numeric level
    Num(i32),
    /// Level string, e.g. `"level auto"`
    Str(String),
}

/// Scalar speed or per-fan speed sequence
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSpeed {
    /// Same speed for every fan
    Scalar(RawSpeedScalar),
    /// One speed per fan, in fan declaration order
    PerFan(Vec<RawSpeedScalar>),
}

/// Scalar limit (simple level) or per-temperature list (complex level)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLimits {
    /// Compared against the hottest reading
    Scalar(i32),
    /// Compared per temperature slot
    List(Vec<RawLimit>),
}

/// One limit list entry
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLimit {
    /// Temperature in degrees Celsius
    Num(i32),
    /// `_` marks a slot as unused in this row
    Padding(String),
}

impl RawSpeedScalar {
    /// Normalize into a [`Speed`]
    fn to_speed(&self) -> Result<Speed> {
        match self {
            Self::Num(n) => Ok(Speed::from_num(*n)),
            Self::Str(s) => Speed::from_string(s),
        }
    }
}

impl RawLimit {
    /// Concrete limit value; padding becomes the MAX sentinel
    fn value(&self) -> Result<i32> {
        match self {
            Self::Num(n) if *n == i32::MIN => Err(ControlError::Config(format!(
                "{n} is not a valid temperature limit"
            ))),
            Self::Num(n) => Ok(*n),
            Self::Padding(s) if s == "_" => Ok(i32::MAX),
            Self::Padding(s) => Err(ControlError::Config(format!(
                "{s} is not a valid temperature limit"
            ))),
        }
    }
}

/// A level entry normalized for assignment to fans
struct LevelEntry {
    /// One speed per fan, or a single speed for all of them
    speeds: Vec<Speed>,
    /// The entry's band
    limits: EntryLimits,
}

/// Normalized limits of one level entry
enum EntryLimits {
    /// Scalar limits
    Simple {
        /// Step-down limit
        lower: i32,
        /// Step-up limit
        upper: i32,
    },
    /// Per-temperature limits
    Complex {
        /// Step-down limits
        lower: Vec<i32>,
        /// Step-up limits
        upper: Vec<i32>,
    },
}

/// Normalize one raw level entry
fn build_entry(raw: &RawLevel) -> Result<LevelEntry> {
    match raw {
        RawLevel::Tuple(speed, lower, upper) => Ok(LevelEntry {
            speeds: vec![speed.to_speed()?],
            limits: EntryLimits::Simple {
                lower: *lower,
                upper: *upper,
            },
        }),
        RawLevel::Keyed {
            speed,
            lower_limit,
            upper_limit,
        } => {
            let speeds = match speed {
                RawSpeed::Scalar(s) => vec![s.to_speed()?],
                RawSpeed::PerFan(list) => list
                    .iter()
                    .map(RawSpeedScalar::to_speed)
                    .collect::<Result<_>>()?,
            };
            let limits = build_limits(lower_limit.as_ref(), upper_limit.as_ref())?;
            Ok(LevelEntry { speeds, limits })
        }
    }
}

/// Normalize a keyed entry's limits, filling missing sides with sentinels
fn build_limits(
    lower: Option<&RawLimits>,
    upper: Option<&RawLimits>,
) -> Result<EntryLimits> {
    match (lower, upper) {
        (None, None) => Err(ControlError::Config(
            "A fan level needs a lower or upper limit".to_owned(),
        )),
        (Some(RawLimits::Scalar(l)), Some(RawLimits::Scalar(u))) => Ok(EntryLimits::Simple {
            lower: *l,
            upper: *u,
        }),
        (Some(RawLimits::Scalar(l)), None) => Ok(EntryLimits::Simple {
            lower: *l,
            upper: i32::MAX,
        }),
        (None, Some(RawLimits::Scalar(u))) => Ok(EntryLimits::Simple {
            lower: i32::MIN,
            upper: *u,
        }),
        (Some(RawLimits::List(l)), Some(RawLimits::List(u))) => Ok(EntryLimits::Complex {
            lower: limit_values(l)?,
            upper: limit_values(u)?,
        }),
        (Some(RawLimits::List(l)), None) => {
            let lower = limit_values(l)?;
            let upper = vec![i32::MAX; lower.len()];
            Ok(EntryLimits::Complex { lower, upper })
        }
        (None, Some(RawLimits::List(u))) => {
            let upper = limit_values(u)?;
            let lower = vec![i32::MIN; upper.len()];
            Ok(EntryLimits::Complex { lower, upper })
        }
        _ => Err(ControlError::Config(
            "Lower and upper limits must either both be scalars or both be lists".to_owned(),
        )),
    }
}

/// Concretize a limit list
fn limit_values(list: &[RawLimit]) -> Result<Vec<i32>> {
    list.iter().map(RawLimit::value).collect()
}

/// Assign a level list to a group of fans, in declaration order
fn assign_levels(fans: Vec<Box<dyn Fan>>, raws: &[RawLevel]) -> Result<Vec<FanConfig>> {
    let num_fans = fans.len();
    let mut tables: Vec<Vec<Level>> = (0..num_fans).map(|_| Vec::new()).collect();
    for raw in raws {
        let LevelEntry { mut speeds, limits } = build_entry(raw)?;
        if speeds.len() == 1 {
            #[expect(clippy::unwrap_used)] // length checked just above
            let only = speeds.pop().unwrap();
            speeds = vec![only; num_fans];
        } else if speeds.len() != num_fans {
            return Err(ControlError::Config(format!(
                "Number of speed entries ({}) doesn't match number of fans ({num_fans})",
                speeds.len()
            )));
        }
        for (table, speed) in tables.iter_mut().zip(speeds) {
            let level = match &limits {
                EntryLimits::Simple { lower, upper } => Level::simple(speed, *lower, *upper)?,
                EntryLimits::Complex { lower, upper } => {
                    Level::complex(speed, lower.clone(), upper.clone())?
                }
            };
            table.push(level);
        }
    }
    fans.into_iter()
        .zip(tables)
        .map(|(fan, levels)| FanConfig::new(fan, levels))
        .collect()
}

/// Build the drivers of one fan entry; hwmon indices expand to one
/// driver per index
fn build_fans(raw: &RawFan, settings: &Settings) -> Result<Vec<Box<dyn Fan>>> {
    let max_errors = raw.max_errors.unwrap_or(0);
    match (&raw.tpacpi, &raw.hwmon) {
        (Some(path), None) => {
            if raw.name.is_some() || raw.indices.is_some() {
                return Err(ControlError::Config(
                    "tpacpi fan entries take neither `name' nor `indices'".to_owned(),
                ));
            }
            Ok(vec![Box::new(TpacpiFan::new(
                path.clone(),
                settings.depulse,
                settings.sleeptime,
                raw.optional,
                max_errors,
            ))])
        }
        (None, Some(base)) => match &raw.indices {
            Some(indices) => Ok(indices
                .iter()
                .map(|&i| {
                    Box::new(HwmonFan::search(
                        base.clone(),
                        raw.name.clone(),
                        Some(i),
                        raw.optional,
                        max_errors,
                    )) as Box<dyn Fan>
                })
                .collect()),
            None if raw.name.is_some() => Err(ControlError::Config(format!(
                "{base:?}: an hwmon fan with `name' needs an `indices' list"
            ))),
            None => Ok(vec![Box::new(HwmonFan::direct(
                base.clone(),
                raw.optional,
                max_errors,
            ))]),
        },
        _ => Err(ControlError::Config(
            "A fan entry must have exactly one of `tpacpi' or `hwmon'".to_owned(),
        )),
    }
}

/// Build the drivers of one sensor entry; hwmon indices expand to one
/// driver per index
fn build_sensors(
    raw: &RawSensor,
    #[cfg(feature = "libsensors")] ls_handle: &mut Option<LibsensorsHandle>,
) -> Result<Vec<Box<dyn Sensor>>> {
    let max_errors = raw.max_errors.unwrap_or(0);
    let tags = [
        raw.hwmon.is_some(),
        raw.tpacpi.is_some(),
        raw.atasmart.is_some(),
        raw.nvml.is_some(),
        raw.chip.is_some(),
    ];
    if tags.iter().filter(|t| **t).count() != 1 {
        return Err(ControlError::Config(
            "A sensor entry must have exactly one of `hwmon', `tpacpi', \
             `atasmart', `nvml' or `chip'"
                .to_owned(),
        ));
    }
    if raw.ids.is_some() && raw.chip.is_none() {
        return Err(ControlError::Config(
            "`ids' is only valid on `chip' sensor entries".to_owned(),
        ));
    }

    if let Some(base) = &raw.hwmon {
        return match &raw.indices {
            Some(indices) => {
                let correction = raw.correction.clone().unwrap_or_default();
                if !correction.is_empty() && correction.len() != indices.len() {
                    return Err(ControlError::Config(format!(
                        "Sensor {base:?} has {} temperatures, but you have {} \
                         correction values for it.",
                        indices.len(),
                        correction.len()
                    )));
                }
                Ok(indices
                    .iter()
                    .enumerate()
                    .map(|(i, &index)| {
                        Box::new(HwmonSensor::search(
                            base.clone(),
                            raw.name.clone(),
                            Some(index),
                            raw.optional,
                            correction.get(i).copied().unwrap_or(0),
                            max_errors,
                        )) as Box<dyn Sensor>
                    })
                    .collect())
            }
            None if raw.name.is_some() => Err(ControlError::Config(format!(
                "{base:?}: an hwmon sensor with `name' needs an `indices' list"
            ))),
            None => Ok(vec![Box::new(HwmonSensor::direct(
                base.clone(),
                raw.optional,
                single_correction(raw)?,
                max_errors,
            ))]),
        };
    }

    if let Some(path) = &raw.tpacpi {
        let indices = raw
            .indices
            .as_ref()
            .map(|v| v.iter().map(|&i| i as usize).collect());
        let sensor = TpacpiSensor::new(
            path.clone(),
            indices,
            raw.correction.clone().unwrap_or_default(),
            raw.optional,
            max_errors,
        )?;
        return Ok(vec![Box::new(sensor)]);
    }

    if let Some(path) = &raw.atasmart {
        return Ok(vec![Box::new(AtasmartSensor::new(
            path.clone(),
            raw.optional,
            single_correction(raw)?,
            max_errors,
        ))]);
    }

    if let Some(bus_id) = &raw.nvml {
        #[cfg(feature = "nvml")]
        {
            return Ok(vec![Box::new(crate::sensor::NvmlSensor::new(
                bus_id.clone(),
                raw.optional,
                single_correction(raw)?,
                max_errors,
            ))]);
        }
        #[cfg(not(feature = "nvml"))]
        {
            return Err(ControlError::Config(format!(
                "{bus_id}: NVML support is not compiled in. Rebuild with the \
                 `nvml' feature or contact your distribution's package maintainer."
            )));
        }
    }

    if let Some(chip) = &raw.chip {
        #[cfg(feature = "libsensors")]
        {
            let handle = ls_handle
                .get_or_insert_with(LibsensorsInterface::new_handle)
                .clone();
            let sensor = LibsensorsSensor::new(
                handle,
                chip.clone(),
                raw.ids.clone().unwrap_or_default(),
                raw.correction.clone().unwrap_or_default(),
                raw.optional,
                max_errors,
            )?;
            return Ok(vec![Box::new(sensor)]);
        }
        #[cfg(not(feature = "libsensors"))]
        {
            return Err(ControlError::Config(format!(
                "{chip}: LM sensors support is not compiled in. Rebuild with the \
                 `libsensors' feature or contact your distribution's package maintainer."
            )));
        }
    }

    Err(ControlError::Bug("unreachable sensor tag".to_owned()))
}

/// Correction value for single-temperature sensors
fn single_correction(raw: &RawSensor) -> Result<i32> {
    let correction = raw.correction.as_deref().unwrap_or_default();
    if correction.len() > 1 {
        return Err(ControlError::Config(format!(
            "Sensor has 1 temperature, but you have {} correction values for it.",
            correction.len()
        )));
    }
    Ok(correction.first().copied().unwrap_or(0))
}

/// Load, build and validate a config file
pub(crate) fn load(path: &Path, settings: &Settings) -> Result<Config> {
    let text = fs::read_to_string(path)
        .map_err(|e| ControlError::io(format!("Failed to read config file {path:?}"), e))?;
    let raw: RawDocument = serde_yaml::from_str(&text).map_err(|source| ControlError::Yaml {
        path: path.to_owned(),
        source,
    })?;

    #[cfg(feature = "libsensors")]
    let mut ls_handle: Option<LibsensorsHandle> = None;
    let mut sensors: Vec<Box<dyn Sensor>> = Vec::new();
    for raw_sensor in &raw.sensors {
        sensors.extend(build_sensors(
            raw_sensor,
            #[cfg(feature = "libsensors")]
            &mut ls_handle,
        )?);
    }

    let mut fan_configs: Vec<FanConfig> = Vec::new();
    let mut pending: Vec<Box<dyn Fan>> = Vec::new();
    for raw_fan in &raw.fans {
        let fans = build_fans(raw_fan, settings)?;
        if let Some(levels) = &raw_fan.levels {
            fan_configs.extend(assign_levels(fans, levels)?);
        } else {
            pending.extend(fans);
        }
    }
    if let Some(levels) = &raw.levels {
        if !fan_configs.is_empty() {
            return Err(ControlError::Config(
                "Cannot have a separate `levels:' section when some fan already \
                 has specific levels assigned"
                    .to_owned(),
            ));
        }
        fan_configs = assign_levels(pending, levels)?;
    } else if !pending.is_empty() {
        return Err(ControlError::Config("Missing `levels:' entry".to_owned()));
    }

    Config::new(
        sensors,
        fan_configs,
        settings.bias_level,
        settings.sleeptime,
    )
}
