//! Error taxonomy, grouped by how the daemon reacts to each class

use std::{io, path::PathBuf};

/// Result alias for fallible daemon operations
pub(crate) type Result<T> = std::result::Result<T, ControlError>;

/// Errors ordered from "user fixable" to "should never happen"
#[derive(thiserror::Error, Debug)]
pub(crate) enum ControlError {
    /// Bad command line usage
    #[error("{0}")]
    Invocation(String),

    /// Config file consistency violation
    #[error("{0}")]
    Config(String),

    /// Config file failed to parse
    #[error("{path:?}: {source}")]
    Yaml {
        /// Config file path
        path: PathBuf,
        /// Parser error with location
        #[source]
        source: serde_yaml::Error,
    },

    /// A system call that was expected to succeed failed
    #[error("{0}")]
    System(String),

    /// Kernel file I/O fluctuation, tolerable up to a driver's error budget
    #[error("{msg}: {source}")]
    Io {
        /// What was being attempted, including the file path
        msg: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Hardware not present or wrong kernel module
    #[error("{0}")]
    DriverInit(String),

    /// Internal invariant violated
    #[error("{0}")]
    Bug(String),
}

/// Report a config consistency violation
///
/// Fatal while sanity checks are on, a warning otherwise.
pub(crate) fn conf_fail(msg: impl Into<String>) -> Result<()> {
    let msg = msg.into();
    if crate::driver::sanity_checks() {
        Err(ControlError::Config(msg))
    } else {
        log::warn!("{msg}");
        Ok(())
    }
}

impl ControlError {
    /// Build an I/O error with context message
    pub(crate) fn io(msg: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            msg: msg.into(),
            source,
        }
    }

    /// Whether this is a recognized I/O failure the driver tolerance policy applies to
    pub(crate) fn is_io(&self) -> bool {
        matches!(
            self,
            Self::System(_) | Self::Io { .. } | Self::DriverInit(_)
        )
    }

    /// OS errno of the underlying I/O failure, if any
    pub(crate) fn errno(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Stable process exit code for this error class
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            Self::Bug(_) => 2,
            _ => 1,
        }
    }
}
