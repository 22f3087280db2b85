//! Multi-level feedback queue scheduling policy.
//!
//! When `KernelConfig::mlfqs` is set, thread priorities are derived
//! rather than assigned: each thread's priority follows its `nice` bias
//! and an exponentially decaying estimate of the CPU time it has been
//! getting (`recent_cpu`), itself scaled by the system-wide `load_avg`.
//! Donation is disabled in this mode. All arithmetic is 17.14 fixed
//! point; the update cadence lives in the timer handler.

use crate::fixed_point::Fixed;
use crate::interrupt::IntrGuard;
use crate::kernel::{Kernel, KERNEL};
use crate::list::List;
use crate::thread::{outranks, RunLink, NICE_MAX, NICE_MIN, PRI_MAX, PRI_MIN};

/// `priority = PRI_MAX - recent_cpu/4 - nice*2`, clamped to the
/// priority range. The division truncates toward zero.
pub(crate) fn priority_for(recent_cpu: Fixed, nice: i8) -> u8 {
    let raw = PRI_MAX as i32 - (recent_cpu / 4).to_int() - nice as i32 * 2;
    raw.clamp(PRI_MIN as i32, PRI_MAX as i32) as u8
}

/// `load_avg = (59/60)·load_avg + (1/60)·ready_threads`.
pub(crate) fn next_load_avg(load_avg: Fixed, ready_threads: i32) -> Fixed {
    Fixed::from_ratio(59, 60) * load_avg + Fixed::from_ratio(1, 60) * ready_threads
}

/// `recent_cpu = (2·load_avg)/(2·load_avg + 1)·recent_cpu + nice`.
pub(crate) fn decay_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: i8) -> Fixed {
    let twice = load_avg * 2;
    let coefficient = twice / (twice + 1);
    coefficient * recent_cpu + nice as i32
}

impl Kernel {
    /// Fold the current ready-thread count into the load average. Runs
    /// once per second, from the timer handler.
    pub(crate) fn refresh_load_avg(&mut self) {
        self.load_avg = next_load_avg(self.load_avg, self.ready_thread_count());
    }

    /// Decay every thread's `recent_cpu`. Runs once per second, right
    /// after the load average moves.
    pub(crate) fn refresh_recent_cpu(&mut self) {
        let load_avg = self.load_avg;
        let mut cursor = self.table.all.front();
        while let Some(tid) = cursor {
            cursor = self.table.all.next(&self.table.arena, tid);
            let thread = self.table.arena.thread_mut(tid);
            thread.recent_cpu = decay_recent_cpu(thread.recent_cpu, load_avg, thread.nice);
        }
    }

    /// Re-derive every thread's priority and restore the ready queue's
    /// ordering. Runs every fourth tick in MLFQS mode.
    pub(crate) fn refresh_priorities(&mut self) {
        let idle = self.idle;
        let mut cursor = self.table.all.front();
        while let Some(tid) = cursor {
            cursor = self.table.all.next(&self.table.arena, tid);
            if Some(tid) == idle {
                continue;
            }
            let thread = self.table.arena.thread_mut(tid);
            let priority = priority_for(thread.recent_cpu, thread.nice);
            thread.base_priority = priority;
            thread.effective_priority = priority;
        }
        // Recomputation may have reordered priorities out from under the
        // ready queue; rebuild it. Relative order among equals survives.
        let mut rebuilt: List<RunLink> = List::new();
        while let Some(tid) = self.ready.pop_front(&mut self.table.arena) {
            rebuilt.insert_ordered(&mut self.table.arena, tid, outranks);
        }
        self.ready = rebuilt;
    }

    /// Set the running thread's niceness, clamped to `[NICE_MIN,
    /// NICE_MAX]`. In MLFQS mode the priority is recomputed at once and
    /// the caller yields if it is no longer on top.
    pub fn set_nice(&mut self, nice: i8) {
        let nice = nice.clamp(NICE_MIN, NICE_MAX);
        let old = self.intr.disable();
        let tid = self.current_tid();
        self.table.arena.thread_mut(tid).nice = nice;
        if self.cfg.mlfqs {
            let thread = self.table.arena.thread_mut(tid);
            let priority = priority_for(thread.recent_cpu, nice);
            thread.base_priority = priority;
            thread.effective_priority = priority;
        }
        self.intr.set_level(old);
        self.check_should_yield();
    }

    /// The running thread's niceness.
    pub fn nice(&self) -> i8 {
        self.current_thread().nice
    }

    /// 100 times the running thread's `recent_cpu`, rounded to nearest.
    pub fn recent_cpu_100(&self) -> i32 {
        let _guard = IntrGuard::new(&self.intr);
        (self.current_thread().recent_cpu * 100).to_int_nearest()
    }

    /// 100 times the system load average, rounded to nearest.
    pub fn load_avg_100(&self) -> i32 {
        let _guard = IntrGuard::new(&self.intr);
        (self.load_avg * 100).to_int_nearest()
    }
}

/// Facade over the global kernel.
pub fn set_nice(nice: i8) {
    unsafe { KERNEL.get().set_nice(nice) }
}

pub fn get_nice() -> i8 {
    unsafe { KERNEL.get().nice() }
}

pub fn get_recent_cpu() -> i32 {
    unsafe { KERNEL.get().recent_cpu_100() }
}

pub fn get_load_avg() -> i32 {
    unsafe { KERNEL.get().load_avg_100() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::thread::{Tid, PRI_DEFAULT};

    fn mlfqs_config() -> KernelConfig {
        KernelConfig {
            mlfqs: true,
            ..KernelConfig::DEFAULT
        }
    }

    fn booted_mlfqs() -> (Kernel, Tid) {
        let mut kernel = Kernel::new(mlfqs_config());
        let main = kernel.init().unwrap();
        kernel.start().unwrap();
        (kernel, main)
    }

    #[test]
    fn test_fresh_thread_gets_pri_max() {
        assert_eq!(priority_for(Fixed::ZERO, 0), PRI_MAX);
    }

    #[test]
    fn test_priority_falls_with_recent_cpu_and_nice() {
        assert_eq!(priority_for(Fixed::from_int(8), 0), PRI_MAX - 2);
        assert_eq!(priority_for(Fixed::ZERO, 5), PRI_MAX - 10);
        assert_eq!(priority_for(Fixed::ZERO, -5), PRI_MAX);
    }

    #[test]
    fn test_priority_clamps_to_range() {
        assert_eq!(priority_for(Fixed::from_int(1000), NICE_MAX), PRI_MIN);
        assert_eq!(priority_for(Fixed::ZERO, NICE_MIN), PRI_MAX);
    }

    #[test]
    fn test_load_avg_moves_toward_ready_count() {
        let mut load = Fixed::ZERO;
        for _ in 0..120 {
            load = next_load_avg(load, 2);
        }
        // After two minutes of steady load the average is close to 2.
        assert_eq!(load.to_int_nearest(), 2);
        assert!(load < Fixed::from_int(2));
    }

    #[test]
    fn test_recent_cpu_decays_toward_nice() {
        let load = Fixed::from_int(1);
        let mut recent = Fixed::from_int(30);
        for _ in 0..200 {
            recent = decay_recent_cpu(recent, load, 0);
        }
        assert_eq!(recent.to_int_nearest(), 0);
    }

    #[test]
    fn test_set_nice_reprioritizes_current() {
        let (mut kernel, main) = booted_mlfqs();
        assert_eq!(kernel.thread_priority(main), Some(PRI_MAX));
        kernel.set_nice(10);
        assert_eq!(kernel.nice(), 10);
        assert_eq!(kernel.thread_priority(main), Some(PRI_MAX - 20));
    }

    #[test]
    fn test_set_nice_clamps() {
        let (mut kernel, _) = booted_mlfqs();
        kernel.set_nice(99);
        assert_eq!(kernel.nice(), NICE_MAX);
        kernel.set_nice(-99);
        assert_eq!(kernel.nice(), NICE_MIN);
    }

    #[test]
    fn test_set_priority_is_ignored_under_mlfqs() {
        let (mut kernel, main) = booted_mlfqs();
        let before = kernel.thread_priority(main);
        kernel.set_priority(PRI_DEFAULT);
        assert_eq!(kernel.thread_priority(main), before);
    }

    #[test]
    fn test_running_thread_accumulates_recent_cpu() {
        let (mut kernel, _) = booted_mlfqs();
        assert_eq!(kernel.recent_cpu_100(), 0);
        kernel.tick();
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.recent_cpu_100(), 300);
    }

    #[test]
    fn test_priority_recomputes_every_fourth_tick() {
        let (mut kernel, main) = booted_mlfqs();
        assert_eq!(kernel.thread_priority(main), Some(PRI_MAX));
        for _ in 0..4 {
            kernel.tick();
        }
        // recent_cpu reached 4, so priority dropped by one step.
        assert_eq!(kernel.thread_priority(main), Some(PRI_MAX - 1));
    }

    #[test]
    fn test_mlfqs_ignores_creation_priority() {
        let (mut kernel, _) = booted_mlfqs();
        fn noop(_aux: usize) {}
        let t = kernel.create("derived", 5, noop, 0).unwrap();
        // Priority comes from the creator's nice/recent_cpu, not the
        // argument.
        assert_eq!(kernel.thread_priority(t), Some(PRI_MAX));
    }
}
