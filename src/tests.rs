//! Test fixtures

#![allow(clippy::unwrap_used)]

use std::{env, ffi::OsString, fs, iter, os::unix::fs::PermissionsExt as _};

/// Environment variable holding the executable search path
const PATH_KEY: &str = "PATH";

/// Fake executable shadowing a real command for the duration of a test
///
/// Writes a one-off shell script with the canned output baked in as a
/// heredoc, and puts its scratch directory at the front of PATH. Dropping
/// the fixture restores the PATH value seen at creation, so nested
/// fixtures unwind correctly as long as they are dropped in reverse
/// order, which is what plain `let` bindings give.
pub(crate) struct FakeCommand {
    /// Scratch directory holding the script; removed on drop
    _dir: tempfile::TempDir,
    /// PATH value before this command was shadowed
    saved_path: OsString,
}

impl FakeCommand {
    /// Shadow `name` with a script printing `stdout` and exiting with `status`
    pub(crate) fn shadow(name: &str, stdout: &str, status: u8) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join(name);
        fs::write(
            &script_path,
            format!("#!/bin/sh\ncat <<'FAKE_OUTPUT'\n{stdout}\nFAKE_OUTPUT\nexit {status}\n"),
        )
        .unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&script_path, perms).unwrap();

        let saved_path = env::var_os(PATH_KEY).unwrap();
        let shadowed =
            env::join_paths(iter::once(dir.path().to_owned()).chain(env::split_paths(&saved_path)))
                .unwrap();
        // SAFETY: tests touching PATH run under the serial_test lock
        unsafe {
            env::set_var(PATH_KEY, &shadowed);
        }

        Self {
            _dir: dir,
            saved_path,
        }
    }
}

impl Drop for FakeCommand {
    fn drop(&mut self) {
        // SAFETY: tests touching PATH run under the serial_test lock
        unsafe {
            env::set_var(PATH_KEY, &self.saved_path);
        }
    }
}
