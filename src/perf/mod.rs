//! Perf Subsystem.
//!
//! Sits on top of the `perf-event-open` crate's [`Counter`]/[`CounterGroup`]
//! ioctl bindings; this module owns event-name resolution, CPU placement,
//! fd-budget checking, and the group-scheduled activate/read/deactivate
//! lifecycle.

pub mod json;

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;

use perf_event_open::config::{Cpu, Opts, Proc};
use perf_event_open::count::group::CounterGroup;
use perf_event_open::count::Counter;
use perf_event_open::event::raw::Raw;

use crate::error::{Error, MultiErrorBuilder, Result};
pub use json::{resolve as resolve_events, ResolvedEvent};

const PROC_FILE_MAX: &str = "/proc/sys/fs/file-max";

/// Where a group of counters should be opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    SingleCore(u32),
    MultiCore(Vec<u32>),
}

impl Placement {
    pub fn for_cpus(cpu_ids: &[u32]) -> Self {
        match cpu_ids {
            [only] => Placement::SingleCore(*only),
            many => Placement::MultiCore(many.to_vec()),
        }
    }

    fn cpu_ids(&self) -> Vec<u32> {
        match self {
            Placement::SingleCore(cpu) => vec![*cpu],
            Placement::MultiCore(cpus) => cpus.clone(),
        }
    }
}

fn to_raw(event: &ResolvedEvent) -> Raw {
    Raw {
        config: event.config,
        config1: event.config1,
        config2: event.config2,
        config3: 0,
    }
}

fn group_opts() -> Opts {
    let mut opts = Opts::default();
    opts.stat_format.time_enabled = true;
    opts.stat_format.time_running = true;
    opts.stat_format.siblings = true;
    opts
}

/// Checks `events.len() * cpu_ids.len()` file descriptors against both the
/// kernel-wide cap (`/proc/sys/fs/file-max`) and the process's soft
/// `RLIMIT_NOFILE`, whichever is tighter.
pub fn check_fd_budget(event_count: usize, cpu_count: usize) -> Result<()> {
    let required = event_count as u128 * cpu_count as u128;

    let file_max: u128 = fs::read_to_string(PROC_FILE_MAX)
        .map_err(|e| Error::io(format!("reading {PROC_FILE_MAX}"), e))?
        .trim()
        .parse()
        .map_err(|_| Error::parse(PROC_FILE_MAX, "non-numeric file-max"))?;

    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlimit` is a plain-old-data struct sized and aligned as the
    // kernel expects; `getrlimit` only writes through the pointer we pass.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlimit) };
    if rc != 0 {
        return Err(Error::io(
            "getrlimit(RLIMIT_NOFILE)",
            std::io::Error::last_os_error(),
        ));
    }

    let limit = file_max.min(rlimit.rlim_cur as u128);
    if required > limit {
        return Err(Error::FdBudgetExceeded { required, limit });
    }
    Ok(())
}

struct ActiveGroup {
    group: CounterGroup,
    event_names: Vec<String>,
}

/// Owns every currently-activated perf counter group, one per CPU.
#[derive(Default)]
pub struct PerfStore {
    active: Mutex<HashMap<u32, ActiveGroup>>,
}

// SAFETY: `perf_event_open::count::group::CounterGroup` holds its siblings as
// `Rc<Counter>` so that a *caller* can't smuggle a sibling handle out via
// `siblings()` and touch it from another thread concurrently with the
// leader. Here no `CounterGroup`/`Counter` reference, sibling `Rc`, or clone
// of one ever leaves `PerfStore` — every access (activate, read, deactivate)
// happens entirely inside the `active` mutex's critical section, so at most
// one thread ever touches a given group's `Rc` refcounts at a time. That
// makes sharing and sending `PerfStore` itself sound even though its
// contents are not.
unsafe impl Send for PerfStore {}
unsafe impl Sync for PerfStore {}

impl PerfStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens and enables one counter group per CPU in `placement`, the
    /// group leader being `events[0]` and the rest added as siblings.
    ///
    /// A CPU already holding an active group is left untouched. Partial
    /// failure (a sibling that fails to open, or a group that fails to
    /// enable) does not roll the group back: whatever opened is kept in the
    /// store so [`PerfStore::deactivate`] can still close it, and every
    /// failure along the way is aggregated into the returned error.
    pub fn activate(&self, events: &[ResolvedEvent], placement: &Placement) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let cpu_ids = placement.cpu_ids();
        check_fd_budget(events.len(), cpu_ids.len())?;

        let mut errors = MultiErrorBuilder::new();
        let mut active = self.active.lock().expect("perf store mutex poisoned");

        for cpu_id in cpu_ids {
            if active.contains_key(&cpu_id) {
                continue;
            }

            let leader = match Counter::new(to_raw(&events[0]), (Proc::ALL, Cpu(cpu_id)), group_opts()) {
                Ok(counter) => counter,
                Err(e) => {
                    errors.push(Error::io(
                        format!("opening leader `{}` on cpu {cpu_id}", events[0].name),
                        e,
                    ));
                    continue;
                }
            };

            let mut names = vec![events[0].name.clone()];
            let mut group = CounterGroup::from(leader);
            for event in &events[1..] {
                match group.add(to_raw(event), &perf_event_open::config::sibling::Opts::default()) {
                    Ok(_) => names.push(event.name.clone()),
                    Err(e) => errors.push(Error::io(
                        format!("adding sibling `{}` on cpu {cpu_id}", event.name),
                        e,
                    )),
                }
            }

            if let Err(e) = group.enable() {
                errors.push(Error::io(format!("enabling perf group on cpu {cpu_id}"), e));
            }

            active.insert(cpu_id, ActiveGroup { group, event_names: names });
        }

        match errors.finish() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reads every active group, scaling each member's raw count by
    /// `time_running`/`time_enabled`: `raw` when the group ran the whole
    /// interval, `raw * enabled / running` otherwise via `u128` to avoid
    /// overflow in the intermediate product, and `raw` unscaled if `running`
    /// is zero. The scaled value itself must still fit in `u64`; a scale
    /// factor large enough to push it past `u64::MAX` fails the read instead
    /// of silently truncating.
    ///
    /// Groups are read one at a time rather than fanned out across threads:
    /// `CounterGroup` keeps its siblings as `Rc<Counter>` specifically so a
    /// single group is never touched from more than one thread at once (see
    /// the `unsafe impl Sync for PerfStore` note above), so per-group
    /// parallelism would have to clone those `Rc`s across a thread boundary,
    /// which is exactly what the library's own type forbids. The first
    /// failing group still fails the whole batch, preserving spec batch
    /// semantics without needing a worker pool here.
    pub fn read_scaled(&self) -> Result<HashMap<(u32, String), u64>> {
        let active = self.active.lock().expect("perf store mutex poisoned");
        if active.is_empty() {
            return Ok(HashMap::new());
        }

        let mut values = HashMap::new();
        for (&cpu_id, group) in active.iter() {
            let stat = group
                .group
                .leader()
                .stat()
                .map_err(|e| Error::io(format!("reading perf group on cpu {cpu_id}"), e))?;

            let enabled = stat.time_enabled.unwrap_or(0) as u128;
            let running = stat.time_running.unwrap_or(0) as u128;
            let scale = |event_name: &str, raw: u64| -> Result<u64> {
                let scaled: u128 = if running == 0 || running == enabled {
                    raw as u128
                } else {
                    (raw as u128 * enabled) / running
                };
                scaled.try_into().map_err(|_| Error::parse(
                    format!("scaling perf event `{event_name}` on cpu {cpu_id}"),
                    scaled.to_string(),
                ))
            };

            values.insert(
                (cpu_id, group.event_names[0].clone()),
                scale(&group.event_names[0], stat.count)?,
            );
            for (name, sibling) in group.event_names[1..].iter().zip(stat.siblings.iter()) {
                values.insert((cpu_id, name.clone()), scale(name, sibling.count)?);
            }
        }
        Ok(values)
    }

    /// Disables and drops every active group. Idempotent: a store with no
    /// active groups returns `Ok(())` without doing any work. Aggregates
    /// the names of any groups that failed to disable cleanly.
    pub fn deactivate(&self) -> Result<()> {
        let mut active = self.active.lock().expect("perf store mutex poisoned");
        if active.is_empty() {
            return Ok(());
        }

        let mut errors = MultiErrorBuilder::new();
        for (cpu_id, group) in active.drain() {
            if let Err(e) = group.group.disable() {
                errors.push(Error::io(format!("disabling perf group on cpu {cpu_id}"), e));
            }
        }

        match errors.finish() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().expect("perf store mutex poisoned").is_empty()
    }

    /// CPUs currently holding an active counter group, sorted ascending.
    pub fn active_cpu_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .active
            .lock()
            .expect("perf store mutex poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_picks_single_vs_multi_core() {
        assert_eq!(Placement::for_cpus(&[3]), Placement::SingleCore(3));
        assert_eq!(Placement::for_cpus(&[1, 2]), Placement::MultiCore(vec![1, 2]));
    }

    #[test]
    fn fd_budget_rejects_absurd_requirements() {
        // No real system exposes anywhere near u128::MAX/2 file descriptors;
        // this must fail regardless of the host's actual limits.
        let err = check_fd_budget(usize::MAX, usize::MAX);
        assert!(err.is_err());
    }

    #[test]
    fn scaled_value_accounts_for_enabled_vs_running_time() {
        // scaled(C02) = 200 for raw=100, enabled=2000, running=1000.
        let raw = 100u64;
        let enabled = 2000u128;
        let running = 1000u128;
        let scaled = (raw as u128 * enabled) / running;
        assert_eq!(scaled, 200);
    }

    #[test]
    fn scaled_value_overflowing_u64_is_rejected() {
        // A scale factor large enough to push the product past u64::MAX
        // must fail rather than silently truncate.
        let raw = u64::MAX;
        let enabled = 2u128;
        let running = 1u128;
        let scaled: u128 = (raw as u128 * enabled) / running;
        assert!(u64::try_from(scaled).is_err());
    }

    #[test]
    fn deactivate_on_empty_store_is_a_no_op() {
        let store = PerfStore::new();
        assert!(store.is_empty());
        assert!(store.deactivate().is_ok());
    }
}
