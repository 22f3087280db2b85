//! Tick bookkeeping: the timer interrupt handler and the alarm queue.
//!
//! The embedding kernel's timer driver calls [`tick`] once per period at
//! the configured frequency. Sleeping threads wait on an intrusive queue
//! ordered by wake tick, so the handler only ever inspects the queue's
//! prefix. The handler itself never blocks, never allocates, and never
//! takes a lock; when it decides the running thread should stop, it
//! raises the deferred-yield flag and the yield happens on the way out.

use crate::interrupt::IntrGuard;
use crate::kernel::{Kernel, KERNEL};
use crate::thread::wakes_earlier;
use log::trace;

impl Kernel {
    /// Timer ticks since the scheduler started.
    pub fn ticks(&self) -> u64 {
        let _guard = IntrGuard::new(&self.intr);
        self.ticks
    }

    /// Ticks elapsed since `then`, a value previously returned by
    /// [`Kernel::ticks`].
    pub fn elapsed(&self, then: u64) -> u64 {
        self.ticks() - then
    }

    /// Block the running thread for at least `duration` ticks. A zero or
    /// negative duration returns immediately. Interrupts must be on:
    /// with them off the wakeup tick could never fire.
    pub fn sleep(&mut self, duration: i64) {
        if duration <= 0 {
            return;
        }
        assert!(
            !self.intr.in_handler(),
            "sleeping inside the interrupt handler"
        );
        assert!(self.intr.enabled(), "sleeping with interrupts disabled");
        let old = self.intr.disable();
        let tid = self.current_tid();
        let wake_tick = self.ticks + duration as u64;
        self.table.arena.thread_mut(tid).wake_tick = wake_tick;
        self.sleepers
            .insert_ordered(&mut self.table.arena, tid, wakes_earlier);
        trace!("{} sleeping until tick {}", tid, wake_tick);
        self.block();
        // Every path out restores the caller's interrupt level.
        self.intr.set_level(old);
    }

    /// Sleep for `num / denom` seconds, rounded down to whole ticks.
    /// Sub-tick requests return immediately; the tick is the finest
    /// grain this scheduler can see.
    pub fn sleep_duration(&mut self, num: i64, denom: i32) {
        let ticks = num * self.cfg.frequency as i64 / denom as i64;
        self.sleep(ticks);
    }

    /// The timer interrupt handler. Call once per timer period.
    pub fn tick(&mut self) {
        assert!(self.started, "timer tick before start");
        let prev_level = self.intr.enter_handler();

        self.ticks += 1;
        self.slice_used += 1;

        let current = self.current_tid();
        let idle = self.idle == Some(current);
        self.stats.record_tick(idle);
        if !idle {
            let thread = self.table.arena.thread_mut(current);
            thread.recent_cpu = thread.recent_cpu + 1;
        }

        // The queue is wake-ordered: stop at the first future deadline.
        while let Some(front) = self.sleepers.front() {
            if self.table.arena.thread(front).wake_tick > self.ticks {
                break;
            }
            self.sleepers.remove(&mut self.table.arena, front);
            trace!("tick {} wakes {}", self.ticks, front);
            self.unblock(front);
        }

        if self.ticks % self.cfg.frequency as u64 == 0 {
            self.refresh_load_avg();
            self.refresh_recent_cpu();
        }
        if self.cfg.mlfqs && self.ticks % 4 == 0 {
            self.refresh_priorities();
        }

        if let Some(top) = self.ready.front() {
            let current_priority = self.table.arena.thread(current).effective_priority;
            if self.table.arena.thread(top).effective_priority > current_priority {
                self.intr.request_yield();
            }
        }
        if self.slice_used >= self.cfg.time_slice {
            self.intr.request_yield();
        }

        self.intr.leave_handler(prev_level);

        // Deferred preemption runs on "interrupt return".
        if self.intr.take_yield_request() {
            self.yield_now();
        }
    }
}

/// Facade over the global kernel.
pub fn ticks() -> u64 {
    unsafe { KERNEL.get().ticks() }
}

pub fn elapsed(then: u64) -> u64 {
    unsafe { KERNEL.get().elapsed(then) }
}

pub fn sleep(duration: i64) {
    unsafe { KERNEL.get().sleep(duration) }
}

pub fn sleep_duration(num: i64, denom: i32) {
    unsafe { KERNEL.get().sleep_duration(num, denom) }
}

pub fn tick() {
    unsafe { KERNEL.get().tick() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::thread::{ThreadStatus, Tid, PRI_DEFAULT};

    fn noop(_aux: usize) {}

    fn booted() -> (Kernel, Tid) {
        let mut kernel = Kernel::new(KernelConfig::DEFAULT);
        let main = kernel.init().unwrap();
        kernel.start().unwrap();
        (kernel, main)
    }

    #[test]
    fn test_ticks_advance() {
        let (mut kernel, _) = booted();
        assert_eq!(kernel.ticks(), 0);
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.ticks(), 2);
        assert_eq!(kernel.elapsed(1), 1);
    }

    #[test]
    fn test_sleep_zero_is_a_no_op() {
        let (mut kernel, main) = booted();
        kernel.sleep(0);
        kernel.sleep(-5);
        assert_eq!(kernel.current_tid(), main);
        assert_eq!(kernel.thread_status(main), Some(ThreadStatus::Running));
    }

    #[test]
    fn test_sleep_blocks_until_deadline() {
        let (mut kernel, main) = booted();
        kernel.sleep(3);
        // main is asleep; idle took over.
        assert_eq!(kernel.current, kernel.idle);
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.thread_status(main), Some(ThreadStatus::Blocked));
        kernel.tick();
        // Woken at its exact tick and scheduled over idle.
        assert_eq!(kernel.current_tid(), main);
    }

    #[test]
    fn test_slice_expiry_round_robins_peers() {
        let (mut kernel, main) = booted();
        let peer = kernel.create("peer", PRI_DEFAULT, noop, 0).unwrap();
        for _ in 0..KernelConfig::DEFAULT.time_slice {
            assert_eq!(kernel.current_tid(), main);
            kernel.tick();
        }
        // Slice expired; the equal-priority peer gets the processor.
        assert_eq!(kernel.current_tid(), peer);
    }

    #[test]
    fn test_sub_tick_duration_returns_immediately() {
        let (mut kernel, main) = booted();
        // 1 ms at 100 Hz is less than a tick.
        kernel.sleep_duration(1, 1000);
        assert_eq!(kernel.current_tid(), main);
        // 50 ms is five ticks.
        kernel.sleep_duration(50, 1000);
        assert_eq!(kernel.current, kernel.idle);
        for _ in 0..5 {
            kernel.tick();
        }
        assert_eq!(kernel.current_tid(), main);
    }

    #[test]
    fn test_tick_accounting_buckets() {
        let (mut kernel, _) = booted();
        kernel.tick();
        kernel.sleep(10);
        kernel.tick();
        kernel.tick();
        let stats = kernel.stats();
        assert_eq!(stats.timer_ticks, 3);
        assert_eq!(stats.kernel_ticks, 1);
        assert_eq!(stats.idle_ticks, 2);
    }

    #[test]
    #[should_panic(expected = "interrupts disabled")]
    fn test_sleep_with_interrupts_off_is_fatal() {
        let (mut kernel, _) = booted();
        let _old = kernel.intr.disable();
        kernel.sleep(1);
    }
}
