//! Topology Probe.
//!
//! Parses `/proc/cpuinfo` into one [`CpuRecord`] per logical CPU and derives
//! the package→dies map and the sorted package-id list. Shape follows
//! `cpuinfo`-style parsers in the corpus (block-per-CPU, `key : value`
//! lines), simplified to the handful of fields the rest of the crate needs.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const HOST_PROC_ENV: &str = "HOST_PROC";
const DEFAULT_PROC: &str = "/proc";
const DEFAULT_CPU_SYSFS: &str = "/sys/devices/system/cpu";

#[derive(Clone, Debug)]
pub struct CpuRecord {
    pub cpu_id: u32,
    pub vendor: String,
    pub family: String,
    pub model: u32,
    pub core_id: u32,
    pub package_id: u32,
    pub die_id: u32,
    pub flags: BTreeSet<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Topology {
    pub cpus: BTreeMap<u32, CpuRecord>,
    pub package_ids: Vec<u32>,
    pub package_dies: BTreeMap<u32, Vec<u32>>,
}

impl Topology {
    /// Probes the live host, honoring a `HOST_PROC` override for tests.
    pub fn probe() -> Result<Self> {
        let proc_dir = env::var(HOST_PROC_ENV).unwrap_or_else(|_| DEFAULT_PROC.to_string());
        Self::probe_from(Path::new(&proc_dir), Path::new(DEFAULT_CPU_SYSFS))
    }

    pub(crate) fn probe_from(proc_dir: &Path, cpu_sysfs_base: &Path) -> Result<Self> {
        let cpuinfo_path = proc_dir.join("cpuinfo");
        let text = fs::read_to_string(&cpuinfo_path)
            .map_err(|e| Error::io(format!("reading {}", cpuinfo_path.display()), e))?;

        let blocks = parse_cpuinfo(&text, &cpuinfo_path)?;
        if blocks.is_empty() {
            return Err(Error::parse(
                format!("{}: no CPU blocks found", cpuinfo_path.display()),
                text,
            ));
        }

        let mut cpus = BTreeMap::new();
        for block in blocks {
            let die_id = read_die_id(cpu_sysfs_base, block.processor);
            let record = CpuRecord {
                cpu_id: block.processor,
                vendor: block.vendor_id,
                family: block.cpu_family,
                model: block.model,
                core_id: block.core_id,
                package_id: block.physical_id,
                die_id,
                flags: block.flags,
            };
            cpus.insert(record.cpu_id, record);
        }

        let mut package_dies: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for record in cpus.values() {
            package_dies
                .entry(record.package_id)
                .or_default()
                .insert(record.die_id);
        }

        let package_ids: Vec<u32> = package_dies.keys().copied().collect();
        let package_dies = package_dies
            .into_iter()
            .map(|(pkg, dies)| (pkg, dies.into_iter().collect()))
            .collect();

        Ok(Topology {
            cpus,
            package_ids,
            package_dies,
        })
    }

    pub fn model(&self) -> Option<u32> {
        self.cpus.values().next().map(|c| c.model)
    }

    pub fn cpu_ids(&self) -> Vec<u32> {
        self.cpus.keys().copied().collect()
    }

    pub fn package_die_ids(&self, package_id: u32) -> Option<&[u32]> {
        self.package_dies.get(&package_id).map(Vec::as_slice)
    }
}

struct CpuBlock {
    processor: u32,
    vendor_id: String,
    cpu_family: String,
    model: u32,
    physical_id: u32,
    core_id: u32,
    flags: BTreeSet<String>,
}

/// Splits `/proc/cpuinfo` into one block per blank-line-separated record and
/// extracts the fields the topology probe needs. A non-numeric `physical id`
/// or `core id` is fatal; a missing field defaults to `0`.
fn parse_cpuinfo(text: &str, path: &Path) -> Result<Vec<CpuBlock>> {
    let mut blocks = Vec::new();

    for raw_block in text.split("\n\n") {
        if raw_block.trim().is_empty() {
            continue;
        }

        let mut processor = None;
        let mut vendor_id = String::new();
        let mut cpu_family = String::new();
        let mut model = 0u32;
        let mut physical_id = 0u32;
        let mut core_id = 0u32;
        let mut flags = BTreeSet::new();

        for line in raw_block.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "processor" => {
                    processor = Some(value.parse::<u32>().map_err(|_| {
                        Error::parse(format!("{}: `processor`", path.display()), value)
                    })?)
                }
                "vendor_id" => vendor_id = value.to_string(),
                "cpu family" => cpu_family = value.to_string(),
                "model" => {
                    model = value
                        .parse()
                        .map_err(|_| Error::parse(format!("{}: `model`", path.display()), value))?
                }
                "physical id" => {
                    physical_id = value.parse().map_err(|_| {
                        Error::parse(format!("{}: `physical id`", path.display()), value)
                    })?
                }
                "core id" => {
                    core_id = value.parse().map_err(|_| {
                        Error::parse(format!("{}: `core id`", path.display()), value)
                    })?
                }
                "flags" | "Features" => {
                    flags = value.split_whitespace().map(str::to_string).collect();
                }
                _ => {}
            }
        }

        let Some(processor) = processor else {
            continue;
        };

        blocks.push(CpuBlock {
            processor,
            vendor_id,
            cpu_family,
            model,
            physical_id,
            core_id,
            flags,
        });
    }

    Ok(blocks)
}

/// Reads `topology/die_id` for one CPU. Matching `turbostat`'s own
/// compatibility behavior on older kernels, a missing or unparsable file is
/// not an error: the die id just defaults to zero.
fn read_die_id(cpu_sysfs_base: &Path, cpu_id: u32) -> u32 {
    let path: PathBuf = cpu_sysfs_base.join(format!("cpu{cpu_id}/topology/die_id"));
    fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_cpuinfo(dir: &Path, contents: &str) {
        fs::write(dir.join("cpuinfo"), contents).unwrap();
    }

    fn two_cpu_fixture() -> &'static str {
        "processor\t: 0\n\
         vendor_id\t: GenuineIntel\n\
         cpu family\t: 6\n\
         model\t\t: 143\n\
         physical id\t: 0\n\
         core id\t\t: 0\n\
         flags\t\t: fpu vme de pse\n\
         \n\
         processor\t: 1\n\
         vendor_id\t: GenuineIntel\n\
         cpu family\t: 6\n\
         model\t\t: 143\n\
         physical id\t: 0\n\
         core id\t\t: 1\n\
         flags\t\t: fpu vme de pse\n"
    }

    #[test]
    fn probes_two_cpus_same_package() {
        let dir = tempfile::tempdir().unwrap();
        write_cpuinfo(dir.path(), two_cpu_fixture());
        let sysfs = tempfile::tempdir().unwrap();

        let topo = Topology::probe_from(dir.path(), sysfs.path()).unwrap();
        assert_eq!(topo.cpu_ids(), vec![0, 1]);
        assert_eq!(topo.package_ids, vec![0]);
        assert_eq!(topo.model(), Some(143));
        assert_eq!(topo.cpus[&0].die_id, 0, "missing die_id file defaults to 0");
    }

    #[test]
    fn die_id_is_read_when_present() {
        let dir = tempfile::tempdir().unwrap();
        write_cpuinfo(dir.path(), two_cpu_fixture());
        let sysfs = tempfile::tempdir().unwrap();
        let topo_dir = sysfs.path().join("cpu0/topology");
        fs::create_dir_all(&topo_dir).unwrap();
        fs::write(topo_dir.join("die_id"), "2\n").unwrap();

        let topo = Topology::probe_from(dir.path(), sysfs.path()).unwrap();
        assert_eq!(topo.cpus[&0].die_id, 2);
        assert_eq!(topo.package_dies[&0], vec![0, 2]);
    }

    #[test]
    fn empty_cpuinfo_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_cpuinfo(dir.path(), "");
        let sysfs = tempfile::tempdir().unwrap();
        assert!(Topology::probe_from(dir.path(), sysfs.path()).is_err());
    }

    #[test]
    fn bad_physical_id_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_cpuinfo(
            dir.path(),
            "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\nmodel\t\t: 1\nphysical id\t: x\ncore id\t\t: 0\n",
        );
        let sysfs = tempfile::tempdir().unwrap();
        assert!(Topology::probe_from(dir.path(), sysfs.path()).is_err());
    }
}
