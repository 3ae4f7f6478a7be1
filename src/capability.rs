//! Capability Tables.
//!
//! Static per-metric CPU-model support sets, bus-clock selection, and the
//! perf-allowed whitelist. Model numbers are the standard Intel family-6
//! `model` field values (as read from `/proc/cpuinfo` / `CPUID.1.EAX`).

use std::collections::HashSet;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::msr::MsrStore;

// Nehalem through ArrowLake/LunarLake client+server, plus the Atom lines
// that expose base frequency, temperature, C1 and C6 residency.
const BASE_FREQ_TEMP_C1_C6: &[u32] = &[
    0x1A, 0x1E, 0x1F, 0x2E, // Nehalem / Nehalem-EX
    0x25, 0x2C, 0x2F, // Westmere
    0x2A, 0x2D, // Sandy Bridge / Sandy Bridge-E
    0x3A, 0x3E, // Ivy Bridge / Ivy Bridge-E
    0x3C, 0x3F, 0x45, 0x46, // Haswell
    0x3D, 0x47, 0x4F, 0x56, // Broadwell
    0x4E, 0x5E, 0x8E, 0x9E, 0xA5, 0xA6, // Skylake / Kaby Lake / Comet Lake
    0x55, // Skylake-X / Cascade Lake / Cooper Lake
    0x6A, 0x6C, // Ice Lake-SP/D
    0x7D, 0x7E, 0xA7, // Ice Lake / Rocket Lake
    0x8C, 0x8D, // Tiger Lake
    0x97, 0x9A, 0xBA, 0xBF, // Alder Lake
    0xB7, 0xBA, 0xBE, 0xBF, // Raptor Lake
    0xAC, 0xAD, // Meteor Lake
    0xC6, 0xBD, // Arrow Lake / Lunar Lake
    0x8F, 0xCF, // Sapphire Rapids X / Emerald Rapids X
    0x1C, 0x26, 0x27, 0x35, 0x36, // Bonnell / Saltwell Atom
    0x37, 0x4A, 0x4D, 0x5A, 0x5D, // Silvermont
    0x4C, // Airmont
    0x5C, 0x5F, // Goldmont / Goldmont-D
    0x7A, // Goldmont Plus
    0x86, 0x96, 0x9C, // Tremont
    0xBE, // Gracemont (Alder Lake-N)
];

// Older generations through Skylake/Cometlake (including Skylake-X/Cascade
// Lake/Cooper Lake), plus Airmont/Goldmont/Goldmont Plus.
const C3_CAPABLE: &[u32] = &[
    0x1A, 0x1E, 0x1F, 0x2E, 0x25, 0x2C, 0x2F, 0x2A, 0x2D, 0x3A, 0x3E, 0x3C, 0x3F, 0x45, 0x46, 0x3D,
    0x47, 0x4F, 0x56, 0x4E, 0x5E, 0x55, 0x8E, 0x9E, 0xA5, 0xA6, 0x4C, 0x5C, 0x5F, 0x7A,
];

// Sandy Bridge onward on client parts, plus the listed Atom/Tremont/Gracemont.
const C7_CAPABLE: &[u32] = &[
    0x2A, 0x2D, 0x3A, 0x3C, 0x3D, 0x45, 0x46, 0x47, 0x3E, 0x4E, 0x5E, 0x8E, 0x9E, 0xA5, 0xA6, 0x8C,
    0x8D, 0x97, 0x9A, 0xBA, 0xBF, 0xB7, 0xBE, 0xAC, 0xAD, 0xC6, 0xBD, 0x7A, 0x86, 0x96, 0x9C, 0xBE,
];

// Conservative perf-allowed whitelist. Hybrid client models (Alder Lake,
// Raptor Lake, Meteor Lake, Lunar Lake, Arrow Lake) are deliberately left
// out pending hybrid-aware perf support — do not
// widen this list without that work landing first.
const PERF_ALLOWED: &[u32] = &[0x8F, 0xCF]; // Sapphire Rapids X, Emerald Rapids X

const SILVERMONT_BUS_CLOCKS: [f64; 5] = [83.3, 100.0, 133.3, 116.7, 80.0];
const AIRMONT_BUS_CLOCKS: [f64; 9] = [83.3, 100.0, 133.3, 116.7, 80.0, 93.3, 90.0, 88.9, 87.5];

const MSR_FSB_FREQ: u64 = 0xCD;

fn set(models: &'static [u32]) -> &'static HashSet<u32> {
    static BASE: LazyLock<HashSet<u32>> =
        LazyLock::new(|| BASE_FREQ_TEMP_C1_C6.iter().copied().collect());
    static C3: LazyLock<HashSet<u32>> = LazyLock::new(|| C3_CAPABLE.iter().copied().collect());
    static C7: LazyLock<HashSet<u32>> = LazyLock::new(|| C7_CAPABLE.iter().copied().collect());
    static PERF: LazyLock<HashSet<u32>> = LazyLock::new(|| PERF_ALLOWED.iter().copied().collect());

    if std::ptr::eq(models, BASE_FREQ_TEMP_C1_C6) {
        &BASE
    } else if std::ptr::eq(models, C3_CAPABLE) {
        &C3
    } else if std::ptr::eq(models, C7_CAPABLE) {
        &C7
    } else {
        &PERF
    }
}

fn require(models: &'static [u32], model: u32, metric: &'static str) -> Result<()> {
    if set(models).contains(&model) {
        Ok(())
    } else {
        Err(Error::MetricNotSupported { metric, model })
    }
}

pub fn check_base_freq_temp_c1_c6(model: u32, metric: &'static str) -> Result<()> {
    require(BASE_FREQ_TEMP_C1_C6, model, metric)
}

pub fn check_c3(model: u32, metric: &'static str) -> Result<()> {
    require(C3_CAPABLE, model, metric)
}

pub fn check_c7(model: u32, metric: &'static str) -> Result<()> {
    require(C7_CAPABLE, model, metric)
}

pub fn is_perf_allowed(model: u32) -> bool {
    set(PERF_ALLOWED).contains(&model)
}

/// Models whose turbo-ratio-limit-1 MSR is a per-bucket group-size vector
/// rather than a ratio table.
const GROUP_LIMIT_MODELS: &[u32] = &[0x3D, 0x47, 0x4F, 0x56, 0x4E, 0x5E, 0x8E, 0x9E, 0x55];

pub fn supports_group_limits(model: u32) -> bool {
    GROUP_LIMIT_MODELS.contains(&model)
}

/// Selects the bus clock (MHz) for base-frequency / turbo-ratio math.
/// Silvermont and Airmont read a table out of `MSR_FSB_FREQ`; everything
/// else is either fixed at 100 or 133 MHz.
pub fn bus_clock(model: u32, msr: Option<&MsrStore>, any_cpu: u32) -> Result<f64> {
    match model {
        // Silvermont family.
        0x37 | 0x4A | 0x4D | 0x5A | 0x5D => {
            let msr = msr.ok_or(Error::ModuleNotInitialized { module: "msr" })?;
            let raw = msr.read_offset(any_cpu, MSR_FSB_FREQ)?;
            let idx = (raw & 0x7) as usize;
            SILVERMONT_BUS_CLOCKS
                .get(idx)
                .copied()
                .ok_or(Error::MetricNotSupported {
                    metric: "bus_clock",
                    model,
                })
        }
        // Airmont.
        0x4C => {
            let msr = msr.ok_or(Error::ModuleNotInitialized { module: "msr" })?;
            let raw = msr.read_offset(any_cpu, MSR_FSB_FREQ)?;
            let idx = (raw & 0xF) as usize;
            AIRMONT_BUS_CLOCKS
                .get(idx)
                .copied()
                .ok_or(Error::MetricNotSupported {
                    metric: "bus_clock",
                    model,
                })
        }
        // Atom/Bonnell/Saltwell/Goldmont/Tremont/Gracemont and mainline
        // client/server parts: fixed 100 MHz bus clock.
        0x1C | 0x26 | 0x27 | 0x35 | 0x36 | 0x5C | 0x5F | 0x7A | 0x86 | 0x96 | 0x9C | 0xBE => {
            Ok(100.0)
        }
        // Nehalem / Nehalem-EX / Westmere: 133 MHz bus clock.
        0x1A | 0x1E | 0x1F | 0x2E | 0x25 | 0x2C | 0x2F => Ok(133.0),
        m if BASE_FREQ_TEMP_C1_C6.contains(&m) => Ok(100.0),
        _ => Err(Error::MetricNotSupported {
            metric: "bus_clock",
            model,
        }),
    }
}
