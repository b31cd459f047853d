//! Helpers to manipulate sysfs and procfs files

use std::{fmt, fs, path::Path, str::FromStr};

use crate::error::{ControlError, Result};

/// Read a whole file as a trimmed string
pub(crate) fn read_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim_end().to_owned())
        .map_err(|e| ControlError::io(format!("Failed to read {path:?}"), e))
}

/// Read the first line of a file, trimmed
pub(crate) fn read_line(path: &Path) -> Result<String> {
    let content = read_string(path)?;
    Ok(content.lines().next().unwrap_or_default().to_owned())
}

/// Read and parse a single value from a file
pub(crate) fn read_value<T>(path: &Path) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    let s = read_string(path)?;
    s.parse::<T>().map_err(|e| {
        ControlError::io(
            format!("Failed to parse {s:?} from {path:?}"),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

/// Write a value to a file, with trailing newline
pub(crate) fn write_value<T>(path: &Path, val: T) -> Result<()>
where
    T: fmt::Display,
{
    fs::write(path, format!("{val}\n"))
        .map_err(|e| ControlError::io(format!("Failed to write {val} to {path:?}"), e))
}

/// Ensure path points at an existing file
pub(crate) fn ensure_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ControlError::DriverInit(format!(
            "{path:?} missing or not a file"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn value_roundtrip() {
        let f = tempfile::NamedTempFile::new().unwrap();
        write_value(f.path(), 42_u8).unwrap();
        assert_eq!(read_value::<u8>(f.path()).unwrap(), 42);
    }

    #[test]
    fn parse_failure_is_io_class() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"bogus\n").unwrap();
        let err = read_value::<i32>(f.path()).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn first_line_only() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"2\nmore\n").unwrap();
        assert_eq!(read_line(f.path()).unwrap(), "2");
    }

    #[test]
    fn missing_file_detected() {
        assert!(ensure_file(Path::new("/nonexistent/file")).is_err());
    }
}
