//! Fan levels: a temperature band mapped to a fan command

use crate::{
    driver::sanity_checks,
    error::{ControlError, Result, conf_fail},
    temp_state::TempState,
};

/// Legacy numeric alias for the thinkpad "disengaged" command
pub(crate) const DISENGAGED_NUM: i32 = 127;

/// Canonical number for named speeds ("level auto", "level disengaged")
pub(crate) const NAMED_SPEED_NUM: i32 = i32::MIN;

/// Canonical number for opaque speed strings only tpacpi fans can write
pub(crate) const STRING_ONLY_NUM: i32 = i32::MAX;

/// A fan speed in both of its representations
///
/// The string is the thinkpad_acpi wire format ("level 3", "level auto");
/// the number orders levels and is what pwm fans write.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Speed {
    /// tpacpi wire format
    string: String,
    /// Canonical number, with [`NAMED_SPEED_NUM`]/[`STRING_ONLY_NUM`] sentinels
    num: i32,
}

impl Speed {
    /// Normalize a numeric speed; 127 is the legacy disengaged alias
    pub(crate) fn from_num(num: i32) -> Self {
        let string = if num == DISENGAGED_NUM {
            "level disengaged".to_owned()
        } else {
            format!("level {num}")
        };
        Self { string, num }
    }

    /// Normalize a speed string
    ///
    /// "level auto"/"level disengaged" get the named sentinel, "level N"
    /// and bare digits are numeric, anything else is a string-only speed
    /// (rejected while sanity checks are on).
    pub(crate) fn from_string(s: &str) -> Result<Self> {
        if s == "level auto" || s == "level disengaged" {
            return Ok(Self {
                string: s.to_owned(),
                num: NAMED_SPEED_NUM,
            });
        }
        if let Some(num) = s.strip_prefix("level ").and_then(|r| r.parse().ok()) {
            return Ok(Self {
                string: s.to_owned(),
                num,
            });
        }
        if let Ok(num) = s.parse::<i32>() {
            return Ok(Self {
                string: format!("level {num}"),
                num,
            });
        }
        let msg = format!("Unrecognized fan level string: {s}");
        if sanity_checks() {
            return Err(ControlError::Config(msg));
        }
        log::warn!("{msg}");
        Ok(Self {
            string: s.to_owned(),
            num: STRING_ONLY_NUM,
        })
    }

    /// tpacpi wire format
    pub(crate) fn str(&self) -> &str {
        &self.string
    }

    /// Canonical number
    pub(crate) fn num(&self) -> i32 {
        self.num
    }

    /// Whether this is one of the named thinkpad speeds
    pub(crate) fn is_named(&self) -> bool {
        self.num == NAMED_SPEED_NUM || self.string == "level disengaged"
    }

    /// Whether the number takes part in the level ordering check
    pub(crate) fn is_ordered(&self) -> bool {
        self.num != NAMED_SPEED_NUM && self.num != STRING_ONLY_NUM
    }
}

/// Temperature band of a level
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Limits {
    /// Compared against the hottest biased reading only
    Simple {
        /// Step down below this
        lower: i32,
        /// Step up at or above this
        upper: i32,
    },
    /// Compared element-wise against the biased readings
    Complex {
        /// Step down when all readings are below these
        lower: Vec<i32>,
        /// Step up when any reading reaches these
        upper: Vec<i32>,
    },
}

/// One fan level: a speed and the temperature band it covers
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Level {
    /// Fan command for this level
    speed: Speed,
    /// Temperature band
    limits: Limits,
}

impl Level {
    /// Build a simple level, compared against the maximum only
    pub(crate) fn simple(speed: Speed, lower: i32, upper: i32) -> Result<Self> {
        let level = Self {
            speed,
            limits: Limits::Simple { lower, upper },
        };
        level.check_band()?;
        Ok(level)
    }

    /// Build a complex level, compared per temperature slot
    pub(crate) fn complex(speed: Speed, lower: Vec<i32>, upper: Vec<i32>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(ControlError::Config(
                "Inconsistent limit length".to_owned(),
            ));
        }
        let level = Self {
            speed,
            limits: Limits::Complex { lower, upper },
        };
        level.check_band()?;
        Ok(level)
    }

    /// Reject bands where a real lower limit is not below its upper limit
    fn check_band(&self) -> Result<()> {
        for (l, u) in self.band_pairs() {
            // Sentinel entries (padding and first/last level fills) are exempt
            if l == i32::MIN || l == i32::MAX || u == i32::MAX {
                continue;
            }
            if l >= u {
                conf_fail(
                    "Your LOWER limit is not lesser than your UPPER limit. \
                     That doesn't make sense.",
                )?;
            }
        }
        Ok(())
    }

    /// (lower, upper) pairs of this level's band
    pub(crate) fn band_pairs(&self) -> Vec<(i32, i32)> {
        match &self.limits {
            Limits::Simple { lower, upper } => vec![(*lower, *upper)],
            Limits::Complex { lower, upper } => {
                lower.iter().copied().zip(upper.iter().copied()).collect()
            }
        }
    }

    /// Number of band entries (1 for simple levels)
    pub(crate) fn limit_len(&self) -> usize {
        match &self.limits {
            Limits::Simple { .. } => 1,
            Limits::Complex { lower, .. } => lower.len(),
        }
    }

    /// Whether this level only compares against the hottest reading
    pub(crate) fn is_simple(&self) -> bool {
        matches!(self.limits, Limits::Simple { .. })
    }

    /// Fan command of this level
    pub(crate) fn speed(&self) -> &Speed {
        &self.speed
    }

    /// This level no longer suffices: some reading reached its upper limit
    pub(crate) fn insufficient_for(&self, ts: &TempState) -> bool {
        match &self.limits {
            Limits::Simple { upper, .. } => ts.tmax().value >= *upper,
            Limits::Complex { upper, .. } => ts
                .biased_temps()
                .iter()
                .zip(upper.iter())
                .any(|(t, u)| t >= u),
        }
    }

    /// Cooled below this level: every compared reading is under its lower limit
    pub(crate) fn excessive_for(&self, ts: &TempState) -> bool {
        match &self.limits {
            Limits::Simple { lower, .. } => ts.tmax().value < *lower,
            Limits::Complex { lower, .. } => ts
                .biased_temps()
                .iter()
                .zip(lower.iter())
                .all(|(t, l)| t < l),
        }
    }
}
