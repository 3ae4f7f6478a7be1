//! Builder/Facade.
//!
//! `Builder::build` is the single entry point: it probes topology, gates on
//! vendor/family, resolves the CPU-id filter, brings up the MSR/RAPL
//! sub-stores (accumulating failures instead of aborting after the first
//! one), and caches the bus clock. [`PowerTelemetry`] is the façade itself —
//! every public getter routes through it and fails with
//! [`Error::ModuleNotInitialized`] when its owning sub-store never came up.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;

use crate::capability;
use crate::cpufreq;
use crate::cpuid;
use crate::error::{Error, MultiErrorBuilder, Result};
use crate::msr::{self, MsrStore};
use crate::perf::{self, Placement};
use crate::rapl::RaplStore;
use crate::topology::Topology;
use crate::turbo::{self, MaxTurboEntry};
use crate::uncore::{self, UncoreAttr};

const MSR_TEMPERATURE_TARGET: u64 = 0x1A2;
const IA32_THERM_STATUS: u64 = 0x19C;
const MSR_PLATFORM_INFO: u64 = 0xCE;
const UNCORE_PERF_STATUS: u64 = 0x621;

const EVENT_C01: &str = "CPU_CLK_UNHALTED.C01";
const EVENT_C02: &str = "CPU_CLK_UNHALTED.C02";
const EVENT_C0_WAIT: &str = "CPU_CLK_UNHALTED.C0_WAIT";
const EVENT_THREAD_REF: &str = "CPU_CLK_UNHALTED.THREAD";

/// At most one of `included`/`excluded` may be set; an unset filter means
/// "every CPU topology discovered".
#[derive(Clone, Debug, Default)]
pub struct CpuFilter {
    pub included: Option<Vec<u32>>,
    pub excluded: Option<Vec<u32>>,
}

impl CpuFilter {
    fn resolve(&self, topology: &Topology) -> Result<Vec<u32>> {
        if self.included.is_some() && self.excluded.is_some() {
            return Err(Error::parse(
                "cpu filter",
                "at most one of included/excluded may be set",
            ));
        }

        let all_ids = topology.cpu_ids();
        let universe = all_ids.len() as u32;

        let in_bounds = |id: u32| -> Result<()> {
            if id < universe {
                Ok(())
            } else {
                Err(Error::OutOfBounds {
                    context: "cpu filter".to_string(),
                    offset: id as u64,
                })
            }
        };

        if let Some(included) = &self.included {
            for &id in included {
                in_bounds(id)?;
            }
            return Ok(included.clone());
        }

        if let Some(excluded) = &self.excluded {
            for &id in excluded {
                in_bounds(id)?;
            }
            return Ok(all_ids.into_iter().filter(|id| !excluded.contains(id)).collect());
        }

        Ok(all_ids)
    }
}

/// Accumulates the options `Builder::build` consumes. Everything is
/// optional; a bare `Builder::new().build()` probes the live host with no
/// CPU filter and no msr read timeout.
#[derive(Clone, Debug, Default)]
pub struct Builder {
    cpu_filter: CpuFilter,
    msr_timeout: Option<Duration>,
    perf_event_bundle: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu_ids_included(mut self, ids: Vec<u32>) -> Self {
        self.cpu_filter.included = Some(ids);
        self
    }

    pub fn cpu_ids_excluded(mut self, ids: Vec<u32>) -> Self {
        self.cpu_filter.excluded = Some(ids);
        self
    }

    pub fn msr_timeout(mut self, timeout: Duration) -> Self {
        self.msr_timeout = Some(timeout);
        self
    }

    /// Supplies the perf JSON event bundle.
    /// Without it, perf-backed metrics fail with `ModuleNotInitialized`.
    pub fn perf_event_bundle(mut self, bundle_json: String) -> Self {
        self.perf_event_bundle = Some(bundle_json);
        self
    }

    /// Probes the host and brings up every sub-store. Fails only on the
    /// vendor/family gate;
    /// a sub-store that fails to initialize is left `None` and every later
    /// call into it raises `Error::ModuleNotInitialized` instead of failing
    /// the whole build.
    pub fn build(self) -> Result<PowerTelemetry> {
        let topology = Topology::probe()?;
        let model = topology.model().ok_or_else(|| {
            Error::parse("topology probe", "no CPU records discovered")
        })?;

        let vendor_ok = topology
            .cpus
            .values()
            .next()
            .map(|c| c.vendor == "GenuineIntel" && c.family == "6")
            .unwrap_or(false);
        if !vendor_ok {
            return Err(Error::MetricNotSupported {
                metric: "facade",
                model,
            });
        }

        let cpu_ids = self.cpu_filter.resolve(&topology)?;

        let mut errors = MultiErrorBuilder::new();

        let msr = errors.push_result(MsrStore::new_with(
            std::path::Path::new("/dev/cpu"),
            Some(&cpu_ids),
            self.msr_timeout,
            crate::time::system_clock(),
        ));

        let rapl = errors.push_result(RaplStore::new());

        let any_cpu = cpu_ids.first().copied().unwrap_or(0);
        let bus_clock = errors.push_result(capability::bus_clock(model, msr.as_ref(), any_cpu));

        let init_errors = errors.finish();
        if let Some(e) = &init_errors {
            warn!("power telemetry facade initialized with partial sub-store failures: {e}");
        }

        Ok(PowerTelemetry {
            topology,
            model,
            msr,
            rapl,
            perf: perf::PerfStore::new(),
            perf_event_bundle: self.perf_event_bundle,
            bus_clock,
            init_errors,
        })
    }
}

/// Façade over every power-telemetry sub-store for one host.
pub struct PowerTelemetry {
    topology: Topology,
    model: u32,
    msr: Option<MsrStore>,
    rapl: Option<RaplStore>,
    perf: perf::PerfStore,
    perf_event_bundle: Option<String>,
    bus_clock: Option<f64>,
    init_errors: Option<Error>,
}

impl PowerTelemetry {
    /// Errors accumulated while bringing up sub-stores at construction
    /// time, if any. A `Some` here does not mean the facade is unusable —
    /// only that some metrics will raise `ModuleNotInitialized`.
    pub fn init_errors(&self) -> Option<&Error> {
        self.init_errors.as_ref()
    }

    fn msr(&self) -> Result<&MsrStore> {
        self.msr.as_ref().ok_or(Error::ModuleNotInitialized { module: "msr" })
    }

    fn rapl(&self) -> Result<&RaplStore> {
        self.rapl.as_ref().ok_or(Error::ModuleNotInitialized { module: "rapl" })
    }

    fn bus_clock(&self) -> Result<f64> {
        self.bus_clock.ok_or(Error::MetricNotSupported {
            metric: "bus_clock",
            model: self.model,
        })
    }

    // ---- topology passthroughs ----

    pub fn package_ids(&self) -> Vec<u32> {
        self.topology.package_ids.clone()
    }

    pub fn package_die_ids(&self, package_id: u32) -> Result<Vec<u32>> {
        self.topology
            .package_die_ids(package_id)
            .map(|ids| ids.to_vec())
            .ok_or(Error::ModuleNotInitialized { module: "topology" })
    }

    pub fn cpu_package_id(&self, cpu_id: u32) -> Result<u32> {
        self.topology
            .cpus
            .get(&cpu_id)
            .map(|c| c.package_id)
            .ok_or(Error::ModuleNotInitialized { module: "topology" })
    }

    pub fn cpu_core_id(&self, cpu_id: u32) -> Result<u32> {
        self.topology
            .cpus
            .get(&cpu_id)
            .map(|c| c.core_id)
            .ok_or(Error::ModuleNotInitialized { module: "topology" })
    }

    pub fn is_flag_supported(&self, cpu_id: u32, flag: &str) -> Result<bool> {
        self.topology
            .cpus
            .get(&cpu_id)
            .map(|c| c.flags.contains(flag))
            .ok_or(Error::ModuleNotInitialized { module: "topology" })
    }

    // ---- msr/rapl passthroughs ----

    pub fn msr_cpu_ids(&self) -> Result<Vec<u32>> {
        Ok(self.msr()?.cpu_ids())
    }

    pub fn rapl_package_ids(&self) -> Result<Vec<u32>> {
        Ok(self.rapl()?.package_ids())
    }

    pub fn perf_cpu_ids(&self) -> Vec<u32> {
        self.perf.active_cpu_ids()
    }

    /// Re-reads the fixed MSR offset set for one CPU, committing the new
    /// snapshot the façade's residency/busy-frequency getters read from.
    pub fn update_per_cpu_metrics(&self, cpu_id: u32) -> Result<()> {
        self.msr()?.update(cpu_id)
    }

    /// Convenience batch form of [`Self::update_per_cpu_metrics`]: updates
    /// every listed CPU, continuing past a per-CPU failure and aggregating
    /// them into one `Error::Multi`.
    pub fn update_per_cpu_metrics_all(&self, cpu_ids: &[u32]) -> Result<()> {
        let msr = self.msr()?;
        let mut errors = MultiErrorBuilder::new();
        for &cpu_id in cpu_ids {
            if let Err(e) = msr.update(cpu_id) {
                errors.push(e);
            }
        }
        match errors.finish() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- derived per-CPU metrics ----

    pub fn cpu_frequency_mhz(&self, cpu_id: u32) -> Result<f64> {
        cpufreq::read_cpu_freq_mhz(cpu_id)
    }

    pub fn cpu_c0_residency_percent(&self, cpu_id: u32) -> Result<f64> {
        let snap = self.msr()?.snapshot(cpu_id)?;
        let tsc = snap.delta(msr::IA32_TIME_STAMP_COUNTER);
        if tsc == 0 {
            return Err(Error::ZeroReference {
                context: "cpu_c0_residency_percent".to_string(),
            });
        }
        Ok(100.0 * snap.delta(msr::IA32_MPERF) as f64 / tsc as f64)
    }

    pub fn cpu_c1_residency_percent(&self, cpu_id: u32) -> Result<f64> {
        capability::check_base_freq_temp_c1_c6(self.model, "cpu_c1_residency_percent")?;
        let snap = self.msr()?.snapshot(cpu_id)?;
        let tsc = snap.delta(msr::IA32_TIME_STAMP_COUNTER);
        if tsc == 0 {
            return Err(Error::ZeroReference {
                context: "cpu_c1_residency_percent".to_string(),
            });
        }
        let other = snap.delta(msr::IA32_MPERF)
            + snap.delta(msr::C3_RESIDENCY)
            + snap.delta(msr::C6_RESIDENCY)
            + snap.delta(msr::C7_RESIDENCY);
        let c1 = tsc.saturating_sub(other);
        Ok(100.0 * c1 as f64 / tsc as f64)
    }

    fn cx_residency_percent(&self, cpu_id: u32, offset: u64) -> Result<f64> {
        let snap = self.msr()?.snapshot(cpu_id)?;
        let tsc = snap.delta(msr::IA32_TIME_STAMP_COUNTER);
        if tsc == 0 {
            return Err(Error::ZeroReference {
                context: "cx_residency_percent".to_string(),
            });
        }
        Ok(100.0 * snap.delta(offset) as f64 / tsc as f64)
    }

    pub fn cpu_c3_residency_percent(&self, cpu_id: u32) -> Result<f64> {
        capability::check_c3(self.model, "cpu_c3_residency_percent")?;
        self.cx_residency_percent(cpu_id, msr::C3_RESIDENCY)
    }

    pub fn cpu_c6_residency_percent(&self, cpu_id: u32) -> Result<f64> {
        capability::check_base_freq_temp_c1_c6(self.model, "cpu_c6_residency_percent")?;
        self.cx_residency_percent(cpu_id, msr::C6_RESIDENCY)
    }

    pub fn cpu_c7_residency_percent(&self, cpu_id: u32) -> Result<f64> {
        capability::check_c7(self.model, "cpu_c7_residency_percent")?;
        self.cx_residency_percent(cpu_id, msr::C7_RESIDENCY)
    }

    /// `Δtsc · 1e-6 · (Δaperf/Δmperf) / Δt_seconds`: the TSC tick rate
    /// `Δtsc/Δt` stands in for the nominal frequency, not the bus clock.
    pub fn cpu_busy_frequency_mhz(&self, cpu_id: u32) -> Result<f64> {
        let snap = self.msr()?.snapshot(cpu_id)?;
        let mperf = snap.delta(msr::IA32_MPERF);
        let delta_t_seconds = snap.elapsed.as_nanos() as f64 / 1e9;
        if mperf == 0 || delta_t_seconds <= 0.0 {
            return Err(Error::ZeroReference {
                context: "cpu_busy_frequency_mhz".to_string(),
            });
        }
        let tsc = snap.delta(msr::IA32_TIME_STAMP_COUNTER) as f64;
        let aperf = snap.delta(msr::IA32_APERF) as f64;
        Ok(tsc * 1e-6 * (aperf / mperf as f64) / delta_t_seconds)
    }

    pub fn cpu_temperature_c(&self, cpu_id: u32) -> Result<i64> {
        capability::check_base_freq_temp_c1_c6(self.model, "cpu_temperature_c")?;
        let msr = self.msr()?;
        let target = msr.read_offset(cpu_id, MSR_TEMPERATURE_TARGET)?;
        let status = msr.read_offset(cpu_id, IA32_THERM_STATUS)?;
        let tcc_activation_temp = ((target >> 16) & 0xFF) as i64;
        let digital_readout = ((status >> 16) & 0x7F) as i64;
        Ok(tcc_activation_temp - digital_readout)
    }

    /// `MSR_PLATFORM_INFO` bits [15:8] × bus clock, truncated to `u64`.
    pub fn cpu_base_frequency_mhz(&self, cpu_id: u32) -> Result<u64> {
        capability::check_base_freq_temp_c1_c6(self.model, "cpu_base_frequency_mhz")?;
        let bus_clock = self.bus_clock()?;
        let raw = self.msr()?.read_offset(cpu_id, MSR_PLATFORM_INFO)?;
        let ratio = ((raw >> 8) & 0xFF) as f64;
        Ok((ratio * bus_clock) as u64)
    }

    pub fn max_turbo_freq_list(&self, cpu_id: u32) -> Result<Vec<MaxTurboEntry>> {
        let bus_clock = self.bus_clock()?;
        let msr = self.msr()?;
        turbo::max_turbo_entries(self.model, msr, cpu_id, bus_clock, cpuid::is_hybrid())
    }

    // ---- uncore frequency ----

    pub fn current_uncore_frequency_mhz(&self, package_id: u32, die_id: u32) -> Result<f64> {
        match uncore::read_uncore_freq_mhz(package_id, die_id, UncoreAttr::Current) {
            Ok(mhz) => Ok(mhz),
            Err(sysfs_err) => {
                let any_cpu = self.any_cpu_in(package_id, die_id)?;
                self.msr()?
                    .read_offset(any_cpu, UNCORE_PERF_STATUS)
                    .map(|raw| (raw & 0x7F) as f64 * 100.0)
                    .map_err(|_| sysfs_err)
            }
        }
    }

    pub fn initial_uncore_frequency_min_mhz(&self, package_id: u32, die_id: u32) -> Result<f64> {
        uncore::read_uncore_freq_mhz(package_id, die_id, UncoreAttr::InitialMin)
    }

    pub fn initial_uncore_frequency_max_mhz(&self, package_id: u32, die_id: u32) -> Result<f64> {
        uncore::read_uncore_freq_mhz(package_id, die_id, UncoreAttr::InitialMax)
    }

    pub fn customized_uncore_frequency_min_mhz(&self, package_id: u32, die_id: u32) -> Result<f64> {
        uncore::read_uncore_freq_mhz(package_id, die_id, UncoreAttr::Min)
    }

    pub fn customized_uncore_frequency_max_mhz(&self, package_id: u32, die_id: u32) -> Result<f64> {
        uncore::read_uncore_freq_mhz(package_id, die_id, UncoreAttr::Max)
    }

    fn any_cpu_in(&self, package_id: u32, die_id: u32) -> Result<u32> {
        self.topology
            .cpus
            .values()
            .find(|c| c.package_id == package_id && c.die_id == die_id)
            .map(|c| c.cpu_id)
            .ok_or(Error::ModuleNotInitialized { module: "topology" })
    }

    // ---- rapl power/energy ----

    pub fn current_package_power_consumption_watts(&self, package_id: u32) -> Result<f64> {
        self.rapl()?.package_power_watts(package_id)
    }

    pub fn current_dram_power_consumption_watts(&self, package_id: u32) -> Result<f64> {
        self.rapl()?.dram_power_watts(package_id)
    }

    pub fn package_thermal_design_power_watts(&self, package_id: u32) -> Result<f64> {
        self.rapl()?.package_tdp_watts(package_id)
    }

    // ---- perf ----

    /// Resolves `event_names` against the configured JSON bundle, opens (or
    /// reuses) a counter group per CPU in `placement`, and returns the
    /// scaled value of every event on every CPU it's active on.
    pub fn read_perf_events(
        &self,
        event_names: &[String],
        placement: &Placement,
    ) -> Result<HashMap<(u32, String), u64>> {
        capability::is_perf_allowed(self.model)
            .then_some(())
            .ok_or(Error::MetricNotSupported {
                metric: "perf",
                model: self.model,
            })?;

        let bundle = self
            .perf_event_bundle
            .as_deref()
            .ok_or(Error::ModuleNotInitialized { module: "perf" })?;
        let resolved = perf::resolve_events(bundle, event_names)?;
        self.perf.activate(&resolved, placement)?;
        self.perf.read_scaled()
    }

    pub fn deactivate_perf_events(&self) -> Result<()> {
        self.perf.deactivate()
    }

    /// One C0 substate (`C01`, `C02`, or `C0_WAIT`) as a percentage of the
    /// unhalted reference clock: `scaled(substate)/scaled(reference) * 100`.
    pub fn cpu_c0_substate_percent(&self, cpu_id: u32, substate: C0Substate) -> Result<f64> {
        let values = self.read_perf_events(
            &[substate.event_name().to_string(), EVENT_THREAD_REF.to_string()],
            &Placement::SingleCore(cpu_id),
        )?;

        let reference = values
            .get(&(cpu_id, EVENT_THREAD_REF.to_string()))
            .copied()
            .ok_or(Error::ZeroReference {
                context: "cpu_c0_substate_percent: reference event missing".to_string(),
            })?;
        if reference == 0 {
            return Err(Error::ZeroReference {
                context: "cpu_c0_substate_percent".to_string(),
            });
        }

        let scaled = values
            .get(&(cpu_id, substate.event_name().to_string()))
            .copied()
            .unwrap_or(0);
        Ok(100.0 * scaled as f64 / reference as f64)
    }
}

/// The three C0 substates the facade exposes as a single percent getter
/// parameterized on substate, instead of three near-identical methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum C0Substate {
    C01,
    C02,
    C0Wait,
}

impl C0Substate {
    fn event_name(self) -> &'static str {
        match self {
            C0Substate::C01 => EVENT_C01,
            C0Substate::C02 => EVENT_C02,
            C0Substate::C0Wait => EVENT_C0_WAIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology_with_two_cpus() -> Topology {
        use crate::topology::CpuRecord;
        use std::collections::{BTreeMap, BTreeSet};

        let mut cpus = BTreeMap::new();
        for id in 0..2u32 {
            cpus.insert(
                id,
                CpuRecord {
                    cpu_id: id,
                    vendor: "GenuineIntel".to_string(),
                    family: "6".to_string(),
                    model: 0x8F,
                    core_id: id,
                    package_id: 0,
                    die_id: 0,
                    flags: BTreeSet::new(),
                },
            );
        }
        Topology {
            cpus,
            package_ids: vec![0],
            package_dies: BTreeMap::from([(0, vec![0])]),
        }
    }

    #[test]
    fn cpu_filter_defaults_to_every_cpu() {
        let topo = topology_with_two_cpus();
        let filter = CpuFilter::default();
        assert_eq!(filter.resolve(&topo).unwrap(), vec![0, 1]);
    }

    #[test]
    fn cpu_filter_rejects_both_included_and_excluded() {
        let topo = topology_with_two_cpus();
        let filter = CpuFilter {
            included: Some(vec![0]),
            excluded: Some(vec![1]),
        };
        assert!(filter.resolve(&topo).is_err());
    }

    #[test]
    fn cpu_filter_excluded_is_checked_against_the_cpu_count() {
        let topo = topology_with_two_cpus();
        let filter = CpuFilter {
            included: None,
            excluded: Some(vec![5]),
        };
        assert!(matches!(filter.resolve(&topo), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn cpu_filter_excluded_removes_listed_ids() {
        let topo = topology_with_two_cpus();
        let filter = CpuFilter {
            included: None,
            excluded: Some(vec![0]),
        };
        assert_eq!(filter.resolve(&topo).unwrap(), vec![1]);
    }

    #[test]
    fn c0_substate_event_names_are_distinct() {
        assert_ne!(C0Substate::C01.event_name(), C0Substate::C02.event_name());
        assert_ne!(C0Substate::C02.event_name(), C0Substate::C0Wait.event_name());
    }
}

#[cfg(test)]
mod residency_proptests {
    use proptest::prelude::*;

    // Mirrors cpu_c0_residency_percent's formula directly: mperf delta can
    // never exceed the tsc delta it's measured against, so the residency
    // percentage it yields is always bounded to [0, 100].
    proptest! {
        #[test]
        fn c0_residency_percent_stays_in_bounds(tsc in 1u64..u64::MAX, frac in 0.0..1.0f64) {
            let mperf = (tsc as f64 * frac) as u64;
            let residency = 100.0 * mperf as f64 / tsc as f64;
            prop_assert!((0.0..=100.0).contains(&residency));
        }

        // Mirrors cx_residency_percent's formula: the c-state delta is
        // saturating-subtracted from a larger-or-equal tsc delta, so the
        // quotient it drives is also always bounded to [0, 100].
        #[test]
        fn cx_residency_percent_stays_in_bounds(tsc in 1u64..u64::MAX, frac in 0.0..1.0f64) {
            let cx = (tsc as f64 * frac) as u64;
            let residency = 100.0 * cx as f64 / tsc as f64;
            prop_assert!((0.0..=100.0).contains(&residency));
        }
    }
}
