//! Time as an injectable effect.
//!
//! Every timestamp captured by the MSR and RAPL stores routes through a
//! [`Clock`] so that elapsed-interval math (C-state residencies, busy
//! frequency, package power) can be driven deterministically in tests
//! without sleeping real wall-clock time.

use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The production clock: `std::time::Instant::now()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
