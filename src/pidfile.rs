//! Pidfile handling

use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use crate::{
    driver::sanity_checks,
    error::{ControlError, Result},
};

/// Removes the pidfile when dropped
pub(crate) struct PidFile {
    /// Pidfile location
    path: PathBuf,
}

impl PidFile {
    /// Claim the pidfile, refusing a stale one while sanity checks are on
    ///
    /// `write_pid` is false when daemonizing, since the forked child
    /// writes its own pid.
    pub(crate) fn claim(path: &Path, write_pid: bool) -> Result<Self> {
        if path.exists() {
            let msg = format!(
                "{path:?} already exists. Either the daemon is already running, \
                 or it was killed by SIGKILL. If you're sure it is not running, \
                 delete {path:?} manually."
            );
            if sanity_checks() {
                return Err(ControlError::System(msg));
            }
            log::warn!("{msg}");
        }
        if write_pid {
            fs::write(path, format!("{}\n", process::id()))
                .map_err(|e| ControlError::io(format!("Failed to write {path:?}"), e))?;
        }
        Ok(Self {
            path: path.to_owned(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::driver::set_sanity_checks;

    #[serial_test::serial]
    #[test]
    fn claim_writes_and_drop_removes() {
        set_sanity_checks(true);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let pidfile = PidFile::claim(&path, true).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), process::id());
        drop(pidfile);
        assert!(!path.exists());
    }

    #[serial_test::serial]
    #[test]
    fn stale_pidfile_refused_when_sane() {
        set_sanity_checks(true);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "1234\n").unwrap();
        assert!(PidFile::claim(&path, true).is_err());
        set_sanity_checks(false);
        assert!(PidFile::claim(&path, true).is_ok());
        set_sanity_checks(true);
    }
}
