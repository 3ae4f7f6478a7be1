//! CPU-Frequency Reader.
//!
//! Stateless read of `<base>/cpu<N>/cpufreq/scaling_cur_freq`, parsed as kHz
//! and converted to MHz.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_BASE: &str = "/sys/devices/system/cpu";

pub fn read_cpu_freq_mhz(cpu_id: u32) -> Result<f64> {
    read_cpu_freq_mhz_from(Path::new(DEFAULT_BASE), cpu_id)
}

pub(crate) fn read_cpu_freq_mhz_from(base: &Path, cpu_id: u32) -> Result<f64> {
    let path = base.join(format!("cpu{cpu_id}/cpufreq/scaling_cur_freq"));
    let text = fs::read_to_string(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    let khz: f64 = text
        .trim()
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
        let cpufreq = dir.path().join("cpu3/cpufreq");
        fs::create_dir_all(&cpufreq).unwrap();
        fs::write(cpufreq.join("scaling_cur_freq"), "2100000\n").unwrap();

        let mhz = read_cpu_freq_mhz_from(dir.path(), 3).unwrap();
        assert!((mhz - 2100.0).abs() < 1e-9);
    }
}
