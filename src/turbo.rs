//! Turbo-Ratio Decoder.
//!
//! Each decoder is a small pure function `(msr_value, bus_clock) -> Vec<MaxTurboEntry>`,
//! kept independently testable from the CPU-family predicates that decide
//! which decoders apply to a given model.
//! [`max_turbo_entries`] is the dispatcher the facade calls; it owns the MSR
//! reads and picks the matching decoder(s).

use crate::capability;
use crate::error::Result;
use crate::msr::MsrStore;

pub const MSR_TURBO_RATIO_LIMIT: u64 = 0x1AD;
pub const MSR_TURBO_RATIO_LIMIT1: u64 = 0x1AE;
pub const MSR_TURBO_RATIO_LIMIT2: u64 = 0x1AF;
pub const MSR_ATOM_CORE_TURBO_RATIOS: u64 = 0x66C;
pub const MSR_SECONDARY_TURBO_RATIO_LIMIT: u64 = 0x650;

const DEFAULT_GROUP_SIZES: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaxTurboEntry {
    pub max_freq_mhz: u64,
    pub active_cores: u32,
    pub secondary: bool,
}

fn freq_mhz(ratio: u8, bus_clock: f64) -> u64 {
    (ratio as f64 * bus_clock).round() as u64
}

/// Haswell-X `MSR_TURBO_RATIO_LIMIT2`: two ratio bytes at bits [15:8] and
/// [7:0], active-core counts 18 and 17. Zero-ratio entries are dropped.
pub fn decode_haswell_x(msr_value: u64, bus_clock: f64) -> Vec<MaxTurboEntry> {
    let byte15_8 = ((msr_value >> 8) & 0xFF) as u8;
    let byte7_0 = (msr_value & 0xFF) as u8;
    [(byte15_8, 18u32), (byte7_0, 17u32)]
        .into_iter()
        .filter(|(ratio, _)| *ratio != 0)
        .map(|(ratio, cores)| MaxTurboEntry {
            max_freq_mhz: freq_mhz(ratio, bus_clock),
            active_cores: cores,
            secondary: false,
        })
        .collect()
}

/// Ivybridge/Haswell-X `MSR_TURBO_RATIO_LIMIT1`: eight ratio bytes,
/// active-core counts 16 down to 9. Zero-ratio entries are dropped.
pub fn decode_ivybridge(msr_value: u64, bus_clock: f64) -> Vec<MaxTurboEntry> {
    (0..8)
        .map(|i| {
            let ratio = ((msr_value >> (i * 8)) & 0xFF) as u8;
            (ratio, 16 - i as u32)
        })
        .filter(|(ratio, _)| *ratio != 0)
        .map(|(ratio, cores)| MaxTurboEntry {
            max_freq_mhz: freq_mhz(ratio, bus_clock),
            active_cores: cores,
            secondary: false,
        })
        .collect()
}

/// General `MSR_TURBO_RATIO_LIMIT`: eight ratio bytes paired with a
/// group-size vector (either the model's `MSR_TURBO_RATIO_LIMIT1` value when
/// the model supports group limits, or the default `0x0807060504030201`).
/// Zero-ratio entries are dropped; `secondary` is stamped on every entry so
/// callers can tag a repeat pass over `MSR_SECONDARY_TURBO_RATIO_LIMIT`.
pub fn decode_general(
    msr_value: u64,
    group_sizes_msr: Option<u64>,
    bus_clock: f64,
    secondary: bool,
) -> Vec<MaxTurboEntry> {
    let mut group_sizes = DEFAULT_GROUP_SIZES;
    if let Some(raw) = group_sizes_msr {
        for (i, slot) in group_sizes.iter_mut().enumerate() {
            *slot = ((raw >> (i * 8)) & 0xFF) as u8;
        }
    }

    let mut cumulative_cores: u32 = 0;
    let mut entries = Vec::with_capacity(8);
    for i in 0..8 {
        let ratio = ((msr_value >> (i * 8)) & 0xFF) as u8;
        cumulative_cores += group_sizes[i] as u32;
        if ratio == 0 {
            continue;
        }
        entries.push(MaxTurboEntry {
            max_freq_mhz: freq_mhz(ratio, bus_clock),
            active_cores: cumulative_cores,
            secondary,
        });
    }
    entries
}

/// Atom/Silvermont-family `MSR_ATOM_CORE_TURBO_RATIOS`: four 6-bit fields at
/// bits [29:24], [21:16], [13:8], [5:0], active-core counts 4 down to 1.
pub fn decode_atom(msr_value: u64, bus_clock: f64) -> Vec<MaxTurboEntry> {
    [(29, 4u32), (21, 3), (13, 2), (5, 1)]
        .into_iter()
        .map(|(hi_bit, cores)| {
            let ratio = ((msr_value >> (hi_bit - 5)) & 0x3F) as u8;
            (ratio, cores)
        })
        .filter(|(ratio, _)| *ratio != 0)
        .map(|(ratio, cores)| MaxTurboEntry {
            max_freq_mhz: freq_mhz(ratio, bus_clock),
            active_cores: cores,
            secondary: false,
        })
        .collect()
}

/// Knights-Landing/Mill `MSR_TURBO_RATIO_LIMIT`: bucket 0 is a 9-bit ratio
/// and cores pair, buckets 1..6 accumulate deltas from six 8-bit slots.
/// Buckets are output from 6 down to 0, skipping a bucket whose ratio equals
/// the immediately-lower bucket's ratio, and (per the zero-ratio rule shared
/// with every other decoder here) any bucket whose own ratio is zero. A
/// literal all-zero MSR is the one exception: it still yields the single
/// degenerate bucket-0 entry rather than an empty list.
pub fn decode_knl(msr_value: u64, bus_clock: f64) -> Vec<MaxTurboEntry> {
    let mut cores = [0u32; 7];
    let mut ratio = [0u8; 7];

    cores[0] = ((msr_value & 0xFF) >> 1) as u32;
    ratio[0] = ((msr_value >> 8) & 0xFF) as u8;

    for bucket in 1..=6 {
        let slot = ((msr_value >> (8 * (bucket + 1))) & 0xFF) as u8;
        let delta_cores = slot & 0x1F;
        let delta_ratio = slot >> 5;
        cores[bucket] = cores[bucket - 1] + delta_cores as u32;
        ratio[bucket] = ratio[bucket - 1].saturating_sub(delta_ratio);
    }

    let mut entries = Vec::new();
    for bucket in (0..=6).rev() {
        if bucket != 0 && ratio[bucket] == ratio[bucket - 1] {
            continue;
        }
        if ratio[bucket] == 0 {
            continue;
        }
        entries.push(MaxTurboEntry {
            max_freq_mhz: freq_mhz(ratio[bucket], bus_clock),
            active_cores: cores[bucket],
            secondary: false,
        });
    }

    if msr_value == 0 && entries.is_empty() {
        entries.push(MaxTurboEntry {
            max_freq_mhz: freq_mhz(ratio[0], bus_clock),
            active_cores: cores[0],
            secondary: false,
        });
    }

    entries
}

// Models whose turbo-ratio-limit layout does not fit the general decoder.
const HASWELL_X_MODELS: &[u32] = &[0x3F];
const IVYBRIDGE_HASWELL_X_MODELS: &[u32] = &[0x3E];
const ATOM_SILVERMONT_MODELS: &[u32] = &[0x37, 0x4A, 0x4D, 0x5A, 0x5D, 0x4C];
const KNL_MODELS: &[u32] = &[0x57, 0x85];

/// Picks the decoder matching `model`, reads the MSRs it needs through
/// `msr`, and for hybrid parts also decodes
/// `MSR_SECONDARY_TURBO_RATIO_LIMIT` as a second, `secondary = true` pass
/// over the general decoder.
pub fn max_turbo_entries(model: u32, msr: &MsrStore, any_cpu: u32, bus_clock: f64, hybrid: bool) -> Result<Vec<MaxTurboEntry>> {
    if ATOM_SILVERMONT_MODELS.contains(&model) {
        let raw = msr.read_offset(any_cpu, MSR_ATOM_CORE_TURBO_RATIOS)?;
        return Ok(decode_atom(raw, bus_clock));
    }
    if KNL_MODELS.contains(&model) {
        let raw = msr.read_offset(any_cpu, MSR_TURBO_RATIO_LIMIT)?;
        return Ok(decode_knl(raw, bus_clock));
    }
    if HASWELL_X_MODELS.contains(&model) {
        let raw = msr.read_offset(any_cpu, MSR_TURBO_RATIO_LIMIT2)?;
        return Ok(decode_haswell_x(raw, bus_clock));
    }
    if IVYBRIDGE_HASWELL_X_MODELS.contains(&model) {
        let raw = msr.read_offset(any_cpu, MSR_TURBO_RATIO_LIMIT1)?;
        return Ok(decode_ivybridge(raw, bus_clock));
    }

    let primary_raw = msr.read_offset(any_cpu, MSR_TURBO_RATIO_LIMIT)?;
    let group_sizes_msr = if capability::supports_group_limits(model) {
        Some(msr.read_offset(any_cpu, MSR_TURBO_RATIO_LIMIT1)?)
    } else {
        None
    };
    let mut entries = decode_general(primary_raw, group_sizes_msr, bus_clock, false);

    if hybrid {
        if let Ok(secondary_raw) = msr.read_offset(any_cpu, MSR_SECONDARY_TURBO_RATIO_LIMIT) {
            entries.extend(decode_general(secondary_raw, group_sizes_msr, bus_clock, true));
        }
    }

    Ok(entries)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alder_lake_hybrid_general_decode() {
        let msr = 0x1716151413121110u64;
        let bus_clock = 100.0;

        let primary = decode_general(msr, None, bus_clock, false);
        assert_eq!(primary.len(), 8);
        for (i, entry) in primary.iter().enumerate() {
            assert!(!entry.secondary);
            assert_eq!(entry.active_cores as usize, i + 1);
        }
        assert_eq!(primary[0].max_freq_mhz, 1600);
        assert_eq!(primary[7].max_freq_mhz, 2300);

        let secondary = decode_general(msr, None, bus_clock, true);
        assert_eq!(secondary.len(), 8);
        for (p, s) in primary.iter().zip(secondary.iter()) {
            assert_eq!(p.max_freq_mhz, s.max_freq_mhz);
            assert_eq!(p.active_cores, s.active_cores);
            assert!(s.secondary);
        }
    }

    #[test]
    fn zero_ratio_entries_are_dropped() {
        let msr = 0x00000000000000FFu64; // only the lowest byte is non-zero
        let entries = decode_general(msr, None, 100.0, false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].active_cores, 1);
    }

    #[test]
    fn haswell_x_maps_cores_18_and_17() {
        let msr = 0x1E1Cu64; // byte[15:8]=0x1E, byte[7:0]=0x1C
        let entries = decode_haswell_x(msr, 100.0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].active_cores, 18);
        assert_eq!(entries[1].active_cores, 17);
    }

    #[test]
    fn knl_never_emits_zero_ratio_except_the_all_zero_case() {
        let entries = decode_knl(0, 100.0);
        // Every bucket decodes to ratio 0, so the normal loop drops them
        // all; the degenerate fallback then emits the single bucket-0 entry.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].max_freq_mhz, 0);
    }

    #[test]
    fn dispatcher_runs_hybrid_secondary_pass_for_general_models() {
        use std::fs;
        use crate::time::system_clock;

        let dir = tempfile::tempdir().unwrap();
        let cpu_dir = dir.path().join("0");
        fs::create_dir_all(&cpu_dir).unwrap();
        let mut buf = vec![0u8; 0x660];
        buf[MSR_TURBO_RATIO_LIMIT as usize..MSR_TURBO_RATIO_LIMIT as usize + 8]
            .copy_from_slice(&0x1716151413121110u64.to_le_bytes());
        buf[MSR_SECONDARY_TURBO_RATIO_LIMIT as usize..MSR_SECONDARY_TURBO_RATIO_LIMIT as usize + 8]
            .copy_from_slice(&0x1716151413121110u64.to_le_bytes());
        fs::write(cpu_dir.join("msr"), &buf).unwrap();

        let store = MsrStore::new_with(dir.path(), Some(&[0]), None, system_clock()).unwrap();
        // Alder Lake (0x97) is neither Haswell-X, Ivybridge, Atom, nor KNL,
        // so it falls through to the general decoder with a hybrid pass.
        let entries = max_turbo_entries(0x97, &store, 0, 100.0, true).unwrap();
        assert_eq!(entries.len(), 16);
        assert_eq!(entries.iter().filter(|e| e.secondary).count(), 8);
    }

    #[test]
    fn atom_decodes_four_6bit_fields() {
        // cores 4..1 ratios: 0x3F, 0x01, 0x00 (dropped), 0x02
        let msr = (0x3Fu64 << 24) | (0x01u64 << 16) | (0x00u64 << 8) | 0x02u64;
        let entries = decode_atom(msr, 100.0);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.max_freq_mhz != 0));
        assert!(!entries.iter().any(|e| e.active_cores == 2));
    }
}
