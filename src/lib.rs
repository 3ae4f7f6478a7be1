//! Unified reader for Intel x86-64 processor power-management telemetry.
//!
//! This crate ties together the handful of host-local sources that expose
//! power and frequency state on a modern Intel server or client —
//! `/dev/cpu/<N>/msr`, the `intel-rapl` powercap sysfs tree, the
//! `intel_uncore_frequency` and `cpufreq` sysfs trees, and
//! `perf_event_open` C0-substate counters — behind one façade,
//! [`facade::PowerTelemetry`], built with [`facade::Builder`].
//!
//! ## Example
//!
//! ```no_run
//! use powertelemetry::facade::Builder;
//!
//! let telemetry = Builder::new().build()?;
//! for &package_id in &telemetry.package_ids() {
//!     let watts = telemetry.current_package_power_consumption_watts(package_id)?;
//!     println!("package {package_id}: {watts:.2} W");
//! }
//! # Ok::<(), powertelemetry::error::Error>(())
//! ```
//!
//! ## Scope
//!
//! Every sub-store is read-only and host-local: this crate never writes an
//! MSR, never adjusts a powercap constraint, and never ships telemetry off
//! the machine it runs on. A sub-store that fails to initialize (module not
//! loaded, file missing, permission denied) does not fail the whole build;
//! it leaves that corner of the façade raising
//! [`error::Error::ModuleNotInitialized`] instead.

pub mod capability;
pub mod cpufreq;
pub mod cpuid;
pub mod error;
pub mod facade;
pub mod msr;
pub mod perf;
pub mod rapl;
pub mod time;
pub mod topology;
pub mod turbo;
pub mod uncore;
