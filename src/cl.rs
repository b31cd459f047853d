//! Command line interface

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    driver::sanity_checks,
    error::{ControlError, Result},
};

/// Default config file location
const CONFIG_DEFAULT: &str = "/etc/stepfancontrol.yaml";

/// Longest accepted cycle sleep time, in seconds
const MAX_SLEEPTIME: i64 = 15;

/// Stepped fan control daemon command line arguments
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Args {
    /// Stay in the foreground, do not daemonize.
    #[arg(short = 'n', long)]
    pub foreground: bool,

    /// Be quiet: only log warnings and errors.
    #[arg(short, long)]
    pub quiet: bool,

    /// Be verbose: also log debug output.
    #[arg(short, long)]
    pub verbose: bool,

    /// DANGEROUS mode: disable all sanity checks. May result in undefined
    /// behavior of the controlled hardware.
    #[arg(short = 'D', long)]
    pub danger: bool,

    /// Assume the fan hardware is left in a sane state after resuming
    /// from suspend.
    #[arg(short = 'z', long)]
    pub resume_safe: bool,

    /// Do not disturb sleeping disks: report 0 °C instead of spinning
    /// them up for a temperature reading.
    #[arg(short = 'd', long)]
    pub dnd_disk: bool,

    /// Config file path.
    #[arg(short, long, default_value = CONFIG_DEFAULT)]
    pub config: PathBuf,

    /// Maximum seconds to sleep between cycles (0-15).
    #[arg(short, long, default_value_t = 5, allow_hyphen_values = true)]
    pub sleeptime: i64,

    /// Bias multiplier for sudden temperature rises (-10 to 30, divided
    /// by 10).
    #[arg(short, long, default_value_t = 5.0, allow_hyphen_values = true)]
    pub bias: f32,

    /// Depulse duration in seconds (0-10): briefly disengage the fan
    /// every watchdog tick to break audible pulsing.
    #[arg(
        short = 'p',
        long,
        num_args = 0..=1,
        default_missing_value = "0.5",
        allow_hyphen_values = true
    )]
    pub depulse: Option<f32>,
}

/// Validated control loop tuning derived from the command line
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    /// Cycle sleep time
    pub sleeptime: Duration,
    /// Bias multiplier applied to sudden temperature jumps
    pub bias_level: f32,
    /// Depulse duration; zero disables depulsing
    pub depulse: Duration,
}

/// Report a questionable flag value
///
/// Fatal while sanity checks are on, a warning otherwise.
fn arg_fail(msg: String) -> Result<()> {
    if sanity_checks() {
        Err(ControlError::Invocation(msg))
    } else {
        log::warn!("{msg}");
        Ok(())
    }
}

impl Args {
    /// Range-check the tuning flags
    ///
    /// Must run after the sanity flag has been applied, since out-of-range
    /// values are only warnings in DANGEROUS mode.
    pub(crate) fn validate(&self) -> Result<Settings> {
        if self.sleeptime < 0 {
            return Err(ControlError::Invocation(
                "Negative sleep time? Seriously?".to_owned(),
            ));
        }
        if self.sleeptime > MAX_SLEEPTIME {
            arg_fail(format!(
                "{} seconds of not realizing that your fan is off may be quite \
                 dangerous!",
                self.sleeptime
            ))?;
        } else if self.sleeptime < 1 {
            arg_fail(format!(
                "A sleep time of {} seconds doesn't make much sense.",
                self.sleeptime
            ))?;
        }

        if !(-10.0..=30.0).contains(&self.bias) {
            arg_fail("bias must be between -10 and 30!".to_owned())?;
        }

        let depulse = self.depulse.unwrap_or(0.0);
        if depulse < 0.0 {
            return Err(ControlError::Invocation(format!(
                "invalid argument to option -p: {depulse}"
            )));
        }
        if depulse > 10.0 {
            arg_fail(format!("invalid argument to option -p: {depulse}"))?;
        }

        #[expect(clippy::cast_sign_loss)] // negative values rejected above
        let sleeptime = Duration::from_secs(self.sleeptime as u64);
        Ok(Settings {
            sleeptime,
            bias_level: self.bias / 10.0,
            depulse: Duration::from_secs_f32(depulse.clamp(0.0, 10.0)),
        })
    }

    /// Log level selected by the verbosity flags
    pub(crate) fn log_level(&self) -> log::Level {
        if self.quiet {
            log::Level::Warn
        } else if self.verbose {
            log::Level::Debug
        } else {
            log::Level::Info
        }
    }
}
