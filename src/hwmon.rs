//! Path resolution for devices under the sysfs hwmon class
//!
//! A config entry may point directly at a value file, at a base directory
//! plus a chip name, or at a base directory plus a file index. The latter
//! two require scanning, since hwmon numbering changes across boots.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::{ControlError, Result},
    sysfs,
};

/// Deepest directory level searched when matching a chip name
const MAX_NAME_DEPTH: u8 = 5;

/// Deepest directory level searched when matching a file index
const MAX_INDEX_DEPTH: u8 = 3;

/// Which hwmon value file a driver is interested in
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum HwmonFile {
    /// `tempN_input` (sensors)
    TempInput,
    /// `pwmN` (fans)
    Pwm,
}

impl HwmonFile {
    /// File name for the given index
    fn filename(self, index: u32) -> String {
        match self {
            Self::TempInput => format!("temp{index}_input"),
            Self::Pwm => format!("pwm{index}"),
        }
    }
}

/// Lazily resolvable location of one hwmon value file
#[derive(Debug, Clone)]
pub(crate) struct HwmonInterface {
    /// Configured path: either the value file itself or a search base
    base_path: PathBuf,
    /// Chip name to match against `name` files, if any
    name: Option<String>,
    /// Value file index to search for, if any
    index: Option<u32>,
    /// File kind searched for by index
    kind: HwmonFile,
}

impl HwmonInterface {
    /// Describe a hwmon location; resolution happens in [`Self::lookup`]
    pub(crate) fn new(
        base_path: PathBuf,
        name: Option<String>,
        index: Option<u32>,
        kind: HwmonFile,
    ) -> Self {
        Self {
            base_path,
            name,
            index,
            kind,
        }
    }

    /// Resolve to the concrete value file
    pub(crate) fn lookup(&self) -> Result<PathBuf> {
        let mut path = self.base_path.clone();
        if let Some(name) = &self.name {
            path = find_hwmon_by_name(&path, name)?;
        }
        if let Some(index) = self.index {
            path = find_hwmon_by_index(&path, index, self.kind)?;
        }
        sysfs::ensure_file(&path)?;
        Ok(path)
    }
}

/// Find the one directory below `path` whose chip name matches
fn find_hwmon_by_name(path: &Path, name: &str) -> Result<PathBuf> {
    let mut found = Vec::new();
    collect_hwmons_by_name(path, name, 1, &mut found);
    match found.len() {
        0 => Err(ControlError::DriverInit(format!(
            "{path:?}: Could not find an hwmon with name {name:?}"
        ))),
        1 => {
            #[expect(clippy::unwrap_used)] // length checked just above
            Ok(found.into_iter().next().unwrap())
        }
        _ => Err(ControlError::DriverInit(format!(
            "{path:?}: Found multiple hwmons with this name: {found:?}"
        ))),
    }
}

/// Recursive worker for [`find_hwmon_by_name`]
fn collect_hwmons_by_name(path: &Path, name: &str, depth: u8, found: &mut Vec<PathBuf>) {
    if let Ok(chip_name) = sysfs::read_line(&path.join("name")) {
        if chip_name == name {
            found.push(path.to_owned());
            return;
        }
    }
    if depth >= MAX_NAME_DEPTH {
        return;
    }
    let Ok(entries) = fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        // "subsystem" links back up and would make the scan cyclic
        if entry.file_name() == "subsystem" {
            continue;
        }
        let subdir = entry.path();
        if subdir.is_dir() {
            collect_hwmons_by_name(&subdir, name, depth + 1, found);
        }
    }
}

/// Find the value file with the given index at or below `path`
fn find_hwmon_by_index(path: &Path, index: u32, kind: HwmonFile) -> Result<PathBuf> {
    find_hwmon_by_index_(path, index, kind, 0).ok_or_else(|| {
        ControlError::DriverInit(format!(
            "Could not find {} at {path:?}",
            kind.filename(index)
        ))
    })
}

/// Recursive worker for [`find_hwmon_by_index`]
fn find_hwmon_by_index_(path: &Path, index: u32, kind: HwmonFile, depth: u8) -> Option<PathBuf> {
    let candidate = path.join(kind.filename(index));
    if candidate.is_file() {
        return Some(candidate);
    }
    if depth >= MAX_INDEX_DEPTH {
        return None;
    }
    // The value files may sit one hwmon or device directory further down
    let entries = fs::read_dir(path).ok()?;
    for entry in entries.flatten() {
        let fname = entry.file_name();
        let is_hwmon_dir = fname
            .to_str()
            .is_some_and(|f| f.starts_with("hwmon") || f == "device");
        if !is_hwmon_dir {
            continue;
        }
        let subdir = entry.path();
        if !subdir.is_dir() {
            continue;
        }
        if let Some(found) = find_hwmon_by_index_(&subdir, index, kind, depth + 1) {
            return Some(found);
        }
    }
    None
}
