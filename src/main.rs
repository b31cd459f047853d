//! Stepped fan control according to hardware temperature
//!
//! Reads temperatures from heterogeneous sources and keeps the hottest
//! reading inside a configured fan level's temperature band, stepping the
//! fan command up or down as the temperatures move.

use std::{
    path::Path,
    process::ExitCode,
    thread,
    time::Duration,
};

use clap::Parser as _;

mod cl;
mod config;
mod driver;
mod error;
mod fan;
mod hwmon;
mod level;
mod pidfile;
mod sensor;
mod signals;
mod sysfs;
mod temp_state;
#[cfg(test)]
mod tests;

use crate::{
    cl::{Args, Settings},
    config::Config,
    driver::{sanity_checks, set_resume_is_safe, set_sanity_checks, set_tolerate_errors},
    error::{ControlError, Result},
    pidfile::PidFile,
    signals::SignalFlags,
};

/// Pidfile location
const PID_FILE: &str = "/var/run/stepfancontrol.pid";

/// Why the control loop returned
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LoopExit {
    /// SIGHUP: reload the config and re-enter the loop
    Reload,
    /// SIGINT/SIGTERM: clean shutdown
    Shutdown,
}

/// One measurement and adjustment cycle
fn run_cycle(config: &mut Config) -> Result<()> {
    config.start_cycle();
    config.read_all()?;
    if !config.temp_state().cycle_complete() {
        let msg = "A sensor has vanished! Exiting since there's no safe way to continue.";
        if sanity_checks() {
            return Err(ControlError::System(msg.to_owned()));
        }
        log::warn!("{msg}");
    }
    config.adjust_fans()
}

/// Cycle until a signal asks for reload or shutdown
fn run_loop(config: &mut Config, signals: &SignalFlags) -> Result<LoopExit> {
    loop {
        // A SIGUSR2 (resume from suspend) grants exactly one cycle of
        // unconditional error tolerance
        set_tolerate_errors(signals.take_usr2());
        run_cycle(config)?;
        thread::sleep(config.temp_state().tmp_sleeptime());
        set_tolerate_errors(false);

        if signals.take_usr1() {
            log::info!("{}", config.temp_state().report());
        }
        if signals.term_requested() {
            return Ok(LoopExit::Shutdown);
        }
        if signals.take_hup() {
            return Ok(LoopExit::Reload);
        }
    }
}

/// Attempt a config reload, keeping the old config on failure
///
/// The new config is built first; only a successful build replaces (and
/// thereby drops) the old one, so a broken edit cannot stop the fans.
fn reload_config(config: &mut Config, path: &Path, settings: &Settings) -> bool {
    log::info!("Received SIGHUP: reloading config...");
    match config::yaml::load(path, settings) {
        Ok(new_config) => {
            *config = new_config;
            true
        }
        Err(e) => {
            log::error!("{e}");
            log::warn!("Error reloading config. Keeping old one.");
            false
        }
    }
}

/// Signal-driven outer loop around the control loop
fn run_daemon(args: &Args, settings: &Settings) -> Result<()> {
    let signals = SignalFlags::install()?;
    let mut config = config::yaml::load(&args.config, settings)?;
    loop {
        config.init_fans()?;
        match run_loop(&mut config, &signals)? {
            LoopExit::Reload => {
                reload_config(&mut config, &args.config, settings);
            }
            LoopExit::Shutdown => break,
        }
    }
    log::info!("Cleaning up and resetting fan control.");
    Ok(())
}

/// Validate, claim the pidfile, daemonize and run
fn run(args: &Args) -> anyhow::Result<()> {
    let settings = args.validate()?;
    if settings.depulse > Duration::ZERO {
        log::info!(
            "Disengaging the fan controller for {:?} after every sleep of {:?}",
            settings.depulse,
            settings.sleeptime
        );
    }

    let pidfile_path = Path::new(PID_FILE);
    let _pidfile = PidFile::claim(pidfile_path, args.foreground)?;
    if !args.foreground {
        daemonize::Daemonize::new()
            .pid_file(pidfile_path)
            .working_directory("/")
            .start()
            .map_err(|e| ControlError::System(format!("Failed to daemonize: {e}")))?;
    }

    run_daemon(args, &settings)?;
    Ok(())
}

/// Map a failure to its stable exit code
fn exit_for(e: &anyhow::Error) -> ExitCode {
    log::error!("{e:#}");
    let code = e
        .downcast_ref::<ControlError>()
        .map_or(2, ControlError::exit_code);
    if code == 2 {
        log::error!("This is probably a bug. Please consider reporting it. Thanks.");
    }
    ExitCode::from(code)
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code: u8 = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                clap::error::ErrorKind::UnknownArgument => 3,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    set_sanity_checks(!args.danger);
    set_resume_is_safe(args.resume_safe);
    sensor::set_dnd_disk(args.dnd_disk);

    if let Err(e) = simple_logger::init_with_level(args.log_level()) {
        eprintln!("Failed to init logger: {e}");
        return ExitCode::from(2);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => exit_for(&e),
    }
}
