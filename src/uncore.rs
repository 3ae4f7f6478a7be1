//! Uncore Sysfs Reader.
//!
//! Stateless reads of one of five uncore-frequency attributes per
//! (package, die), formatted as
//! `<base>/package_<PP>_die_<DD>/<type>_freq_khz`.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_BASE: &str = "/sys/devices/system/cpu/intel_uncore_frequency";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UncoreAttr {
    InitialMax,
    InitialMin,
    Max,
    Min,
    Current,
}

impl fmt::Display for UncoreAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UncoreAttr::InitialMax => "initial_max",
            UncoreAttr::InitialMin => "initial_min",
            UncoreAttr::Max => "max",
            UncoreAttr::Min => "min",
            UncoreAttr::Current => "current",
        };
        f.write_str(s)
    }
}

pub fn read_uncore_freq_mhz(package_id: u32, die_id: u32, attr: UncoreAttr) -> Result<f64> {
    read_uncore_freq_mhz_from(Path::new(DEFAULT_BASE), package_id, die_id, attr)
}

pub(crate) fn read_uncore_freq_mhz_from(
    base: &Path,
    package_id: u32,
    die_id: u32,
    attr: UncoreAttr,
) -> Result<f64> {
    let path = base
        .join(format!("package_{package_id:02}_die_{die_id:02}"))
        .join(format!("{attr}_freq_khz"));
    let text = fs::read_to_string(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    let khz: f64 = text
        .trim_end_matches('\n')
        .parse()
        .map_err(|_| Error::parse(format!("{}", path.display()), text.clone()))?;
    Ok(khz * 1e-3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_converts_to_mhz() {
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("package_00_die_01");
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("current_freq_khz"), "2400000\n").unwrap();

        let mhz = read_uncore_freq_mhz_from(dir.path(), 0, 1, UncoreAttr::Current).unwrap();
        assert!((mhz - 2400.0).abs() < 1e-9);
    }

    #[test]
    fn missing_file_is_distinct_from_bad_content() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_uncore_freq_mhz_from(dir.path(), 0, 0, UncoreAttr::Min),
            Err(Error::Io { .. })
        ));

        let zone = dir.path().join("package_00_die_00");
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("min_freq_khz"), "not-a-number").unwrap();
        assert!(matches!(
            read_uncore_freq_mhz_from(dir.path(), 0, 0, UncoreAttr::Min),
            Err(Error::Parse { .. })
        ));
    }
}
