//! RAPL Store.
//!
//! Discovers the `intel-rapl` powercap zone tree as a strict arena, keeps a timestamped energy sample per package zone and its
//! `dram` subzone, and derives wrap-safe power in watts. Grounded on the
//! sysfs-walking shape of the RAPL probes in
//! `TheElectronWill/cpu-energy-consumption-comparative-analysis` and
//! `alumet-dev/alumet`'s `plugin-rapl`, adapted from perf-event/MSR energy
//! sources to the powercap sysfs tree this crate actually reads.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::time::{system_clock, Clock};

const DEFAULT_BASE: &str = "/sys/devices/virtual/powercap/intel-rapl";
const DEFAULT_MODULES_PATH: &str = "/proc/modules";

#[derive(Clone, Copy, Debug)]
pub struct ZoneSample {
    pub value_uj: f64,
    pub timestamp: Instant,
}

#[derive(Clone, Debug)]
pub struct RaplZone {
    pub name: String,
    pub path: PathBuf,
    pub children: Vec<usize>,
    pub sample: Option<ZoneSample>,
}

pub struct RaplStore {
    zones: Mutex<Vec<RaplZone>>,
    /// package_id -> arena index of the package-<n> zone.
    packages: BTreeMap<u32, usize>,
    /// package_id -> arena index of its `dram` subzone, if exposed.
    dram: BTreeMap<u32, usize>,
    clock: Arc<dyn Clock>,
}

impl RaplStore {
    pub fn new() -> Result<Self> {
        Self::new_with(Path::new(DEFAULT_BASE), system_clock())
    }

    pub(crate) fn new_with(base: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut zones = Vec::new();
        let mut packages = BTreeMap::new();
        let mut dram = BTreeMap::new();

        let mut top_dirs: Vec<(u32, PathBuf)> = Vec::new();
        for entry in read_dir(base)? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(n) = strip_zone_index(&path, "intel-rapl:") else {
                continue;
            };
            top_dirs.push((n, path));
        }
        top_dirs.sort_by_key(|(n, _)| *n);

        for (dir_index, path) in top_dirs {
            let name = read_name(&path)?;
            let Some(pkg_n) = name.strip_prefix("package-") else {
                continue;
            };
            let pkg_n: u32 = pkg_n
                .parse()
                .map_err(|_| Error::parse(format!("{}: zone name", path.display()), name.clone()))?;
            if pkg_n != dir_index {
                return Err(Error::parse(
                    format!("{}: package index mismatch", path.display()),
                    format!("name={name} dir=intel-rapl:{dir_index}"),
                ));
            }

            let pkg_handle = zones.len();
            zones.push(RaplZone {
                name: name.clone(),
                path: path.clone(),
                children: Vec::new(),
                sample: None,
            });
            packages.insert(pkg_n, pkg_handle);

            for sub_entry in read_dir(&path)? {
                let sub_path = sub_entry.path();
                if !sub_path.is_dir() {
                    continue;
                }
                let prefix = format!("intel-rapl:{dir_index}:");
                let Some(_sub_n) = strip_zone_index(&sub_path, &prefix) else {
                    continue;
                };
                let sub_name = read_name(&sub_path)?;
                let sub_handle = zones.len();
                zones.push(RaplZone {
                    name: sub_name.clone(),
                    path: sub_path.clone(),
                    children: Vec::new(),
                    sample: None,
                });
                zones[pkg_handle].children.push(sub_handle);
                if sub_name == "dram" {
                    dram.insert(pkg_n, sub_handle);
                }
            }
        }

        if packages.is_empty() {
            return Err(Error::io(
                format!("no package zones found under {}", base.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no intel-rapl package zones"),
            ));
        }

        let store = Self {
            zones: Mutex::new(zones),
            packages,
            dram,
            clock,
        };

        for &pkg in store.packages.keys().collect::<Vec<_>>() {
            let handle = store.packages[&pkg];
            store.capture_sample(handle)?;
            if let Some(&dram_handle) = store.dram.get(&pkg) {
                store.capture_sample(dram_handle)?;
            }
        }

        Ok(store)
    }

    pub fn package_ids(&self) -> Vec<u32> {
        self.packages.keys().copied().collect()
    }

    fn zone_handle(&self, package_id: u32) -> Result<usize> {
        self.packages
            .get(&package_id)
            .copied()
            .ok_or(Error::ModuleNotInitialized { module: "rapl" })
    }

    fn dram_handle(&self, package_id: u32) -> Result<usize> {
        self.dram
            .get(&package_id)
            .copied()
            .ok_or(Error::ModuleNotInitialized { module: "rapl" })
    }

    fn zone_path(&self, handle: usize) -> PathBuf {
        self.zones.lock().unwrap()[handle].path.clone()
    }

    /// Reads one zone attribute file. Captures the timestamp *before*
    /// opening the file so the (timestamp, value) pair is as tight as
    /// possible around the actual read.
    fn read_attr(&self, handle: usize, file_name: &str) -> Result<ZoneSample> {
        let path = self.zone_path(handle).join(file_name);
        let timestamp = self.clock.now();
        let text = fs::read_to_string(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        let value_uj: f64 = text
            .trim()
            .parse()
            .map_err(|_| Error::parse(format!("{}", path.display()), text.clone()))?;
        Ok(ZoneSample {
            value_uj,
            timestamp,
        })
    }

    fn capture_sample(&self, handle: usize) -> Result<()> {
        let sample = self.read_attr(handle, "energy_uj")?;
        self.zones.lock().unwrap()[handle].sample = Some(sample);
        Ok(())
    }

    /// Re-reads `energy_uj` for a package (and its dram subzone, when
    /// present) and commits the new cached sample.
    pub fn update_package(&self, package_id: u32) -> Result<()> {
        let handle = self.zone_handle(package_id)?;
        self.capture_sample(handle)?;
        if let Ok(dram_handle) = self.dram_handle(package_id) {
            self.capture_sample(dram_handle)?;
        }
        Ok(())
    }

    /// Wrap-safe power derivation between the cached sample and a freshly
    /// read one.
    fn power_watts(&self, handle: usize) -> Result<f64> {
        let previous = self.zones.lock().unwrap()[handle]
            .sample
            .ok_or(Error::ModuleNotInitialized { module: "rapl" })?;
        let current = self.read_attr(handle, "energy_uj")?;

        let delta_t = current.timestamp.saturating_duration_since(previous.timestamp).as_secs_f64();
        if delta_t <= 0.0 {
            return Err(Error::ZeroReference {
                context: "rapl power derivation: zero elapsed time".into(),
            });
        }

        let energy_uj = if current.value_uj >= previous.value_uj {
            current.value_uj - previous.value_uj
        } else {
            let max = self.read_attr(handle, "max_energy_range_uj")?;
            max.value_uj + current.value_uj - previous.value_uj
        };

        self.zones.lock().unwrap()[handle].sample = Some(current);
        Ok(1e-6 * energy_uj / delta_t)
    }

    pub fn package_power_watts(&self, package_id: u32) -> Result<f64> {
        self.power_watts(self.zone_handle(package_id)?)
    }

    pub fn dram_power_watts(&self, package_id: u32) -> Result<f64> {
        self.power_watts(self.dram_handle(package_id)?)
    }

    /// Reads `constraint_0_max_power_uw` once on demand and converts to watts.
    pub fn package_tdp_watts(&self, package_id: u32) -> Result<f64> {
        let handle = self.zone_handle(package_id)?;
        let path = self.zone_path(handle).join("constraint_0_max_power_uw");
        let text = fs::read_to_string(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        let uw: f64 = text
            .trim()
            .parse()
            .map_err(|_| Error::parse(format!("{}", path.display()), text.clone()))?;
        Ok(uw * 1e-6)
    }
}

fn read_dir(path: &Path) -> Result<Vec<fs::DirEntry>> {
    let entries = fs::read_dir(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    entries
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::io(format!("reading {}", path.display()), e))
}

fn read_name(zone_dir: &Path) -> Result<String> {
    let path = zone_dir.join("name");
    let text = fs::read_to_string(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    Ok(text.trim().to_string())
}

/// Extracts `<n>` from a directory named `<prefix><n>`, rejecting anything
/// with leading zeros or non-numeric suffixes.
fn strip_zone_index(path: &Path, prefix: &str) -> Option<u32> {
    let file_name = path.file_name()?.to_str()?;
    let suffix = file_name.strip_prefix(prefix)?;
    if suffix.is_empty() || (suffix.len() > 1 && suffix.starts_with('0')) {
        return None;
    }
    suffix.parse().ok()
}

/// Module-presence probe: true iff `rapl`, `intel_rapl_msr`, and
/// `intel_rapl_common` each appear at the start of some line.
pub fn rapl_modules_loaded() -> Result<bool> {
    rapl_modules_loaded_from(Path::new(DEFAULT_MODULES_PATH))
}

pub(crate) fn rapl_modules_loaded_from(path: &Path) -> Result<bool> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    let tokens: Vec<&str> = text
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect();
    let want = ["rapl", "intel_rapl_msr", "intel_rapl_common"];
    Ok(want.iter().all(|w| tokens.contains(w)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fake::FakeClock;
    use std::time::Duration;

    fn write_zone(base: &Path, dir: &str, name: &str, energy_uj: &str, max_uj: Option<&str>) {
        let zone_dir = base.join(dir);
        fs::create_dir_all(&zone_dir).unwrap();
        fs::write(zone_dir.join("name"), name).unwrap();
        fs::write(zone_dir.join("energy_uj"), energy_uj).unwrap();
        if let Some(max_uj) = max_uj {
            fs::write(zone_dir.join("max_energy_range_uj"), max_uj).unwrap();
        }
    }

    #[test]
    fn discovers_package_and_dram_zones() {
        let dir = tempfile::tempdir().unwrap();
        write_zone(dir.path(), "intel-rapl:0", "package-0", "4000000", Some("4000000"));
        write_zone(
            dir.path(),
            "intel-rapl:0/intel-rapl:0:0",
            "dram",
            "1000000",
            Some("2000000"),
        );

        let clock = FakeClock::new();
        let store = RaplStore::new_with(dir.path(), clock.clone()).unwrap();
        assert_eq!(store.package_ids(), vec![0]);

        clock.advance(Duration::from_secs(1));
        assert!(
            store.dram_power_watts(0).is_ok(),
            "dram subzone must have been captured at construction"
        );
    }

    #[test]
    fn rejects_package_index_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_zone(dir.path(), "intel-rapl:0", "package-1", "0", Some("1"));
        assert!(RaplStore::new_with(dir.path(), system_clock()).is_err());
    }

    #[test]
    fn power_watts_handles_counter_wrap() {
        let dir = tempfile::tempdir().unwrap();
        write_zone(dir.path(), "intel-rapl:0", "package-0", "4000000", Some("4000000"));
        let clock = FakeClock::new();
        let store = RaplStore::new_with(dir.path(), clock.clone()).unwrap();

        fs::write(dir.path().join("intel-rapl:0/energy_uj"), "1000000").unwrap();
        clock.advance(Duration::from_secs(1));

        let watts = store.package_power_watts(0).unwrap();
        assert!((watts - 1.0).abs() < 1e-9);
    }

    #[test]
    fn power_is_never_negative_across_wrap() {
        let dir = tempfile::tempdir().unwrap();
        write_zone(dir.path(), "intel-rapl:0", "package-0", "100", Some("1000"));
        let clock = FakeClock::new();
        let store = RaplStore::new_with(dir.path(), clock.clone()).unwrap();

        fs::write(dir.path().join("intel-rapl:0/energy_uj"), "50").unwrap();
        clock.advance(Duration::from_millis(500));
        let watts = store.package_power_watts(0).unwrap();
        assert!(watts >= 0.0);
    }

    #[test]
    fn module_presence_requires_all_three_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let modules = dir.path().join("modules");
        fs::write(&modules, "rapl 1 0 - Live 0x0\nintel_rapl_msr 1 0 - Live 0x0\n").unwrap();
        assert!(!rapl_modules_loaded_from(&modules).unwrap());

        fs::write(
            &modules,
            "rapl 1 0 - Live 0x0\nintel_rapl_msr 1 0 - Live 0x0\nintel_rapl_common 1 0 - Live 0x0\n",
        )
        .unwrap();
        assert!(rapl_modules_loaded_from(&modules).unwrap());
    }
}
