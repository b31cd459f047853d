//! Runtime configuration: sensors, fans and their level tables

pub(crate) mod yaml;

use std::time::Duration;

use itertools::Itertools as _;

use crate::{
    driver::{Driver as _, sanity_checks},
    error::{ControlError, Result, conf_fail},
    fan::Fan,
    level::Level,
    sensor::Sensor,
    temp_state::TempState,
};

/// First-level upper limit above which a simple config draws a warning
const DANGER_ZONE: i32 = 48;

/// How a fan level cursor moved during a cycle
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Adjustment {
    /// Stepped to a higher level
    Raised,
    /// Stepped to a lower level
    Lowered,
    /// Stayed and pinged the watchdog
    Held,
}

/// One fan bound to its ordered level table, with the level cursor
pub(crate) struct FanConfig {
    /// The controlled fan
    fan: Box<dyn Fan>,
    /// Levels, ascending by speed
    levels: Vec<Level>,
    /// Index of the currently applied level
    cur: usize,
}

impl FanConfig {
    /// Bind a fan to its levels, enforcing the table consistency rules
    pub(crate) fn new(fan: Box<dyn Fan>, levels: Vec<Level>) -> Result<Self> {
        if levels.is_empty() {
            return Err(ControlError::Config("No fan levels specified.".to_owned()));
        }

        // Levels must be strictly ascending by speed; named and
        // string-only speeds are exempt from the ordering
        for (a, b) in levels
            .iter()
            .filter(|l| l.speed().is_ordered())
            .map(|l| l.speed().num())
            .tuple_windows()
        {
            if a >= b {
                conf_fail("Fan levels are not ordered correctly")?;
            }
        }

        for (prev, next) in levels.iter().tuple_windows() {
            if prev.limit_len() != next.limit_len() {
                conf_fail("Inconsistent limit length")?;
            }
            // Consecutive bands must overlap: no temperature may fall
            // into a gap between one level's upper and the next's lower
            for ((_, prev_u), (next_l, _)) in
                prev.band_pairs().iter().zip(next.band_pairs().iter())
            {
                if *next_l == i32::MIN || *next_l == i32::MAX || *prev_u == i32::MAX {
                    continue;
                }
                if prev_u < next_l {
                    conf_fail("LOWER limit doesn't overlap with previous UPPER limit")?;
                }
            }
        }

        #[expect(clippy::unwrap_used)] // emptiness checked above
        let first = levels.first().unwrap();
        if first
            .band_pairs()
            .iter()
            .any(|(l, _)| *l > 0 && *l != i32::MAX)
        {
            conf_fail(
                "The LOWER limit of the first fan level cannot contain any values greater than 0!",
            )?;
        }

        fan.check_levels(&levels)?;

        Ok(Self {
            fan,
            levels,
            cur: 0,
        })
    }

    /// Move the cursor to match the temperatures and command the fan
    #[expect(clippy::indexing_slicing)] // cur stays within the non-empty table
    pub(crate) fn adjust(&mut self, ts: &TempState) -> Result<Adjustment> {
        let last = self.levels.len() - 1;
        if self.cur < last && self.levels[self.cur].insufficient_for(ts) {
            while self.cur < last && self.levels[self.cur].insufficient_for(ts) {
                self.cur += 1;
            }
            self.log_transition(ts);
            self.fan.set_speed(&self.levels[self.cur])?;
            Ok(Adjustment::Raised)
        } else if self.cur > 0 && self.levels[self.cur].excessive_for(ts) {
            while self.cur > 0 && self.levels[self.cur].excessive_for(ts) {
                self.cur -= 1;
            }
            self.log_transition(ts);
            self.fan.set_speed(&self.levels[self.cur])?;
            Ok(Adjustment::Lowered)
        } else {
            self.fan.ping_watchdog_and_depulse(&self.levels[self.cur])?;
            Ok(Adjustment::Held)
        }
    }

    /// Debug log for a level change
    #[expect(clippy::indexing_slicing)] // cur stays within the non-empty table
    fn log_transition(&self, ts: &TempState) {
        log::debug!(
            "tmax={} (was {}), switching {} to {}",
            ts.tmax().value,
            ts.last_tmax(),
            self.fan.describe(),
            self.levels[self.cur].speed().str()
        );
    }

    /// The level the cursor points at
    #[expect(clippy::indexing_slicing)] // cur stays within the non-empty table
    pub(crate) fn cur_level(&self) -> &Level {
        &self.levels[self.cur]
    }

    /// The level table
    pub(crate) fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// The controlled fan
    pub(crate) fn fan_mut(&mut self) -> &mut dyn Fan {
        self.fan.as_mut()
    }

    /// Largest limit vector length in the table
    fn max_limit_len(&self) -> usize {
        self.levels.iter().map(Level::limit_len).max().unwrap_or(0)
    }
}

/// Everything the control loop works on, built once per start or reload
pub(crate) struct Config {
    /// Sensors in declaration order
    sensors: Vec<Box<dyn Sensor>>,
    /// Fans with their level tables
    fan_configs: Vec<FanConfig>,
    /// Shared temperature state, slots assigned per sensor
    temp_state: TempState,
}

impl Config {
    /// Assemble and validate a configuration
    ///
    /// Sensors are initialized here since their temperature counts size
    /// the temperature state; fans initialize lazily in the control loop
    /// so a reload attempt cannot disturb the running fan.
    pub(crate) fn new(
        mut sensors: Vec<Box<dyn Sensor>>,
        fan_configs: Vec<FanConfig>,
        bias_level: f32,
        sleeptime: Duration,
    ) -> Result<Self> {
        if sensors.is_empty() {
            return Err(ControlError::Config("No sensors configured.".to_owned()));
        }
        if fan_configs.is_empty() {
            return Err(ControlError::Config("No fans configured.".to_owned()));
        }

        for sensor in &mut sensors {
            sensor.try_init()?;
        }
        let num_temps: usize = sensors.iter().map(|s| s.num_temps()).sum();
        for sensor in &sensors {
            if sensor.num_temps() == 0 {
                conf_fail(format!(
                    "{}: sensor reports no temperatures",
                    sensor.describe()
                ))?;
            }
        }

        for fc in &fan_configs {
            if fc.max_limit_len() > num_temps {
                conf_fail(
                    "You have configured more temperature limits than sensors. \
                     That doesn't make sense",
                )?;
            }
            if sanity_checks() {
                if let Some(upper) = Self::danger_zone(fc, &sensors, num_temps) {
                    log::warn!(
                        "You're using simple temperature limits without correction \
                         values, and your fan will only start at {upper} °C. This can \
                         be dangerous for your hard drive."
                    );
                }
            }
        }

        let mut temp_state = TempState::new(num_temps, bias_level, sleeptime);
        for sensor in &mut sensors {
            sensor.assign_slots(&mut temp_state);
        }
        debug_assert_eq!(temp_state.refd_temps(), temp_state.len());

        Ok(Self {
            sensors,
            fan_configs,
            temp_state,
        })
    }

    /// Simple single-temperature table that keeps the fan off into hot
    /// territory, with no correction values to compensate
    ///
    /// Returns the first level's upper limit when it is worth a warning.
    fn danger_zone(
        fc: &FanConfig,
        sensors: &[Box<dyn Sensor>],
        num_temps: usize,
    ) -> Option<i32> {
        if num_temps != 1 {
            return None;
        }
        if sensors
            .iter()
            .any(|s| s.correction().iter().any(|&c| c != 0))
        {
            return None;
        }
        let first = fc.levels().first()?;
        let (_, upper) = first.band_pairs().first().copied()?;
        (first.is_simple() && upper != i32::MAX && upper > DANGER_ZONE).then_some(upper)
    }

    /// Initialize all fans; a no-op for already initialized ones
    pub(crate) fn init_fans(&mut self) -> Result<()> {
        for fc in &mut self.fan_configs {
            fc.fan_mut().try_init()?;
        }
        Ok(())
    }

    /// Begin a measurement cycle
    pub(crate) fn start_cycle(&mut self) {
        self.temp_state.start_cycle();
    }

    /// Read every sensor, in declaration order
    pub(crate) fn read_all(&mut self) -> Result<()> {
        let Self {
            sensors,
            temp_state,
            ..
        } = self;
        for sensor in sensors {
            sensor.read_temps(temp_state)?;
        }
        Ok(())
    }

    /// Adjust every fan to the current temperatures
    ///
    /// A step down snaps the adaptive sleep time back to its configured
    /// value.
    pub(crate) fn adjust_fans(&mut self) -> Result<()> {
        let Self {
            fan_configs,
            temp_state,
            ..
        } = self;
        for fc in fan_configs {
            if fc.adjust(temp_state)? == Adjustment::Lowered {
                temp_state.reset_sleeptime();
            }
        }
        Ok(())
    }

    /// Shared temperature state
    pub(crate) fn temp_state(&self) -> &TempState {
        &self.temp_state
    }

    /// Fans with their level tables
    pub(crate) fn fan_configs(&self) -> &[FanConfig] {
        &self.fan_configs
    }
}
