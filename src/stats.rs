//! Scheduling accounting.
//!
//! Tick-granularity counters mirroring what the timer handler observes:
//! where timer ticks were spent and how many context switches happened.
//! Counters are atomics so a debugger or shell thread can snapshot them
//! without entering the scheduler's critical section.

use portable_atomic::{AtomicU64, Ordering};

pub struct Stats {
    timer_ticks: AtomicU64,
    idle_ticks: AtomicU64,
    kernel_ticks: AtomicU64,
    context_switches: AtomicU64,
}

impl Stats {
    pub const fn new() -> Stats {
        Stats {
            timer_ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            kernel_ticks: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_tick(&self, idle: bool) {
        self.timer_ticks.fetch_add(1, Ordering::Relaxed);
        if idle {
            self.idle_ticks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.kernel_ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            timer_ticks: self.timer_ticks.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            kernel_ticks: self.kernel_ticks.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub timer_ticks: u64,
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub context_switches: u64,
}
