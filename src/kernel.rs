//! The thread table, ready queue, and scheduler core.
//!
//! All scheduler state lives in one [`Kernel`] value so embedders (and
//! tests) can hold isolated instances; the [`KERNEL`] singleton carries
//! the live instance of a real system. Threads move between a priority-
//! ordered ready queue, the sleep queue, and per-primitive waiter lists;
//! selection always takes the highest effective priority and falls back
//! to the idle thread.

use crate::context;
use crate::error::{KernelError, KernelResult};
use crate::fixed_point::Fixed;
use crate::interrupt::IntrGate;
use crate::list::List;
use crate::stats::Stats;
use crate::sync::{recompute_effective, LockTable};
use crate::thread::{
    outranks, RunLink, SleepLink, ThreadEntry, ThreadStatus, ThreadTable, Tid, PRI_DEFAULT,
    PRI_MAX,
};
use core::cell::UnsafeCell;
use log::{debug, info, trace};

/// Scheduler configuration, fixed before [`Kernel::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Timer interrupt frequency in Hz.
    pub frequency: u32,
    /// Scheduling quantum in ticks.
    pub time_slice: u32,
    /// Bound on the lock chain walked during priority donation.
    pub donation_depth: u32,
    /// Use the multi-level feedback queue scheduler: priorities are
    /// derived from `nice` and `recent_cpu`, and donation is disabled.
    pub mlfqs: bool,
}

impl KernelConfig {
    pub const DEFAULT: KernelConfig = KernelConfig {
        frequency: 100,
        time_slice: 4,
        donation_depth: 8,
        mlfqs: false,
    };
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub struct Kernel {
    pub(crate) table: ThreadTable,
    pub(crate) ready: List<RunLink>,
    pub(crate) sleepers: List<SleepLink>,
    pub(crate) locks: LockTable,
    pub(crate) intr: IntrGate,
    pub(crate) stats: Stats,
    pub(crate) cfg: KernelConfig,
    pub(crate) current: Option<Tid>,
    pub(crate) idle: Option<Tid>,
    pub(crate) ticks: u64,
    pub(crate) slice_used: u32,
    pub(crate) load_avg: Fixed,
    pub(crate) started: bool,
}

impl Kernel {
    pub const fn new(cfg: KernelConfig) -> Kernel {
        Kernel {
            table: ThreadTable::new(),
            ready: List::new(),
            sleepers: List::new(),
            locks: LockTable::new(),
            intr: IntrGate::new(),
            stats: Stats::new(),
            cfg,
            current: None,
            idle: None,
            ticks: 0,
            slice_used: 0,
            load_avg: Fixed::ZERO,
            started: false,
        }
    }

    /// Replace the configuration. Only legal before `init`.
    pub fn set_config(&mut self, cfg: KernelConfig) {
        assert!(self.current.is_none(), "configuration is fixed after init");
        self.cfg = cfg;
    }

    pub fn config(&self) -> KernelConfig {
        self.cfg
    }

    /// Adopt the calling context as the `main` thread. Must run before
    /// any other operation; returns `main`'s tid.
    pub fn init(&mut self) -> KernelResult<Tid> {
        if self.current.is_some() {
            return Err(KernelError::AlreadyStarted);
        }
        let tid = self.table.register("main", PRI_DEFAULT)?;
        self.table.arena.thread_mut(tid).status = ThreadStatus::Running;
        self.current = Some(tid);
        info!("thread system initialized, main is {}", tid);
        Ok(tid)
    }

    /// Spawn the idle thread and open the interrupt gate. The timer
    /// driver may start delivering ticks once this returns.
    pub fn start(&mut self) -> KernelResult<()> {
        if self.current.is_none() {
            return Err(KernelError::NotInitialized);
        }
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        let idle = self.table.register("idle", crate::thread::PRI_MIN)?;
        {
            let thread = self.table.arena.thread_mut(idle);
            thread.entry = Some((idle_entry, 0));
            if let Some(hooks) = context::hooks() {
                thread.saved_stack = (hooks.prepare)(idle, idle_entry, 0);
            }
        }
        self.idle = Some(idle);
        self.started = true;
        self.intr.enable();
        info!("scheduler started, idle is {}", idle);
        Ok(())
    }

    /// Create a new thread running `entry(aux)` and make it ready. The
    /// caller yields at once if the new thread outranks it.
    ///
    /// `priority` must lie in `[PRI_MIN, PRI_MAX]`; anything else is a
    /// fatal assertion, not a clamp.
    pub fn create(
        &mut self,
        name: &str,
        priority: u8,
        entry: ThreadEntry,
        aux: usize,
    ) -> KernelResult<Tid> {
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);
        if self.current.is_none() {
            return Err(KernelError::NotInitialized);
        }
        let old = self.intr.disable();
        let result = self.table.register(name, priority);
        let tid = match result {
            Ok(tid) => tid,
            Err(e) => {
                self.intr.set_level(old);
                return Err(e);
            }
        };
        let (creator_nice, creator_recent) = {
            let creator = self.current_thread();
            (creator.nice, creator.recent_cpu)
        };
        {
            let thread = self.table.arena.thread_mut(tid);
            thread.entry = Some((entry, aux));
            if self.cfg.mlfqs {
                // Derived scheduling state is inherited from the creator;
                // the priority argument is superseded at the next recompute.
                thread.nice = creator_nice;
                thread.recent_cpu = creator_recent;
                let derived = crate::mlfqs::priority_for(creator_recent, creator_nice);
                thread.base_priority = derived;
                thread.effective_priority = derived;
            }
            if let Some(hooks) = context::hooks() {
                thread.saved_stack = (hooks.prepare)(tid, entry, aux);
            }
        }
        debug!(
            "created thread {} ({}) priority {}",
            tid,
            self.table.arena.thread(tid).name(),
            self.table.arena.thread(tid).effective_priority
        );
        self.unblock(tid);
        self.intr.set_level(old);
        self.check_should_yield();
        Ok(tid)
    }

    /// Put the running thread to sleep. The caller must have masked
    /// interrupts and arranged for some later `unblock`.
    pub fn block(&mut self) {
        assert!(
            !self.intr.in_handler(),
            "blocking inside the interrupt handler"
        );
        assert!(
            !self.intr.enabled(),
            "blocking with interrupts enabled"
        );
        let tid = self.current_tid();
        self.table.arena.thread_mut(tid).status = ThreadStatus::Blocked;
        trace!("block {}", tid);
        self.schedule_next();
    }

    /// Make a blocked thread ready. Does not preempt; callers that want
    /// preemption follow up with [`Kernel::check_should_yield`].
    pub fn unblock(&mut self, tid: Tid) {
        let old = self.intr.disable();
        {
            let thread = self.table.arena.thread(tid);
            if thread.status != ThreadStatus::Blocked {
                panic!(
                    "unblocking thread {} ({}) in state {:?}",
                    tid,
                    thread.name(),
                    thread.status
                );
            }
        }
        self.table.arena.thread_mut(tid).status = ThreadStatus::Ready;
        self.ready.insert_ordered(&mut self.table.arena, tid, outranks);
        trace!("unblock {}", tid);
        self.intr.set_level(old);
    }

    /// Voluntarily hand the processor to the highest-priority ready
    /// thread, re-queueing the caller behind its priority peers.
    pub fn yield_now(&mut self) {
        assert!(
            !self.intr.in_handler(),
            "yielding inside the interrupt handler; use the deferred flag"
        );
        let old = self.intr.disable();
        let tid = self.current_tid();
        if Some(tid) == self.idle {
            // The idle thread parks instead of entering the ready queue.
            self.table.arena.thread_mut(tid).status = ThreadStatus::Blocked;
        } else {
            self.table.arena.thread_mut(tid).status = ThreadStatus::Ready;
            self.ready.insert_ordered(&mut self.table.arena, tid, outranks);
        }
        self.schedule_next();
        self.intr.set_level(old);
    }

    /// Terminate the running thread. Its slot is reclaimed by the next
    /// scheduling event. With a real context switch registered this
    /// never returns to the caller.
    pub fn exit(&mut self) {
        assert!(
            !self.intr.in_handler(),
            "exiting inside the interrupt handler"
        );
        let old = self.intr.disable();
        let tid = self.current_tid();
        assert!(Some(tid) != self.idle, "idle thread cannot exit");
        // A dying thread must not take held locks to the grave.
        debug_assert!(self.table.arena.thread(tid).held_locks.is_empty());
        debug!("exit {} ({})", tid, self.table.arena.thread(tid).name());
        self.table.unregister(tid);
        self.table.arena.thread_mut(tid).status = ThreadStatus::Dying;
        self.schedule_next();
        self.intr.set_level(old);
    }

    /// Set the running thread's base priority and recompute the
    /// effective priority against outstanding donations. Yields if the
    /// change leaves the caller outranked. Ignored under MLFQS, where
    /// priorities are derived.
    ///
    /// `priority` outside `[PRI_MIN, PRI_MAX]` is a fatal assertion.
    pub fn set_priority(&mut self, priority: u8) {
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);
        if self.cfg.mlfqs {
            return;
        }
        let old = self.intr.disable();
        let tid = self.current_tid();
        self.table.arena.thread_mut(tid).base_priority = priority;
        recompute_effective(&mut self.table, &self.locks, tid);
        self.intr.set_level(old);
        self.check_should_yield();
    }

    /// The running thread's effective priority.
    pub fn priority(&self) -> u8 {
        self.current_thread().effective_priority
    }

    /// Yield (or, in handler context, request a deferred yield) if some
    /// ready thread outranks the running one.
    pub fn check_should_yield(&mut self) {
        let (Some(cur), Some(top)) = (self.current, self.ready.front()) else {
            return;
        };
        let outranked = self.table.arena.thread(top).effective_priority
            > self.table.arena.thread(cur).effective_priority;
        if !outranked {
            return;
        }
        if self.intr.in_handler() {
            self.intr.request_yield();
        } else {
            self.yield_now();
        }
    }

    /// Run `f` over every live thread with interrupts masked.
    pub fn foreach(&self, mut f: impl FnMut(&crate::thread::Thread)) {
        let _guard = crate::interrupt::IntrGuard::new(&self.intr);
        for tid in self.table.all.iter(&self.table.arena) {
            f(self.table.arena.thread(tid));
        }
    }

    pub fn current_tid(&self) -> Tid {
        match self.current {
            Some(tid) => tid,
            None => panic!("no running thread; kernel not initialized"),
        }
    }

    pub(crate) fn current_thread(&self) -> &crate::thread::Thread {
        let thread = self.table.arena.thread(self.current_tid());
        thread.check_magic();
        thread
    }

    /// Name of the running thread.
    pub fn current_name(&self) -> &str {
        self.current_thread().name()
    }

    pub fn live_threads(&self) -> usize {
        self.table.all.len()
    }

    /// Status of an arbitrary thread, if it is still live.
    pub fn thread_status(&self, tid: Tid) -> Option<ThreadStatus> {
        self.table.arena.get(tid).map(|t| t.status())
    }

    /// Effective priority of an arbitrary thread, if it is still live.
    pub fn thread_priority(&self, tid: Tid) -> Option<u8> {
        self.table.arena.get(tid).map(|t| t.effective_priority())
    }

    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot()
    }

    /// Count of threads that are running or ready, the idle thread
    /// excluded. This is the MLFQS load sample.
    pub(crate) fn ready_thread_count(&self) -> i32 {
        let mut count = self.ready.len() as i32;
        if self.current != self.idle {
            count += 1;
        }
        count
    }

    /// Pick and dispatch the next thread. The caller has already moved
    /// the running thread to its new state and masked interrupts.
    pub(crate) fn schedule_next(&mut self) {
        debug_assert!(!self.intr.enabled());
        let prev = self.current_tid();
        debug_assert!(self.table.arena.thread(prev).status != ThreadStatus::Running);

        // Reclaim threads that died at an earlier scheduling event.
        loop {
            let arena = &self.table.arena;
            let victim = arena
                .tids()
                .find(|&t| t != prev && arena.thread(t).status == ThreadStatus::Dying);
            match victim {
                Some(t) => {
                    let thread = self.table.arena.remove(t);
                    trace!("reclaimed {} ({})", t, thread.name());
                }
                None => break,
            }
        }

        let next = match self.ready.pop_front(&mut self.table.arena) {
            Some(tid) => tid,
            None => match self.idle {
                Some(idle) => idle,
                None => panic!("no runnable thread and no idle thread"),
            },
        };

        self.table.arena.thread_mut(next).status = ThreadStatus::Running;
        self.current = Some(next);
        self.slice_used = 0;
        if next == prev {
            return;
        }
        self.stats.record_context_switch();
        trace!("switch {} -> {}", prev, next);
        if let Some(hooks) = context::hooks() {
            let next_stack = self.table.arena.thread(next).saved_stack;
            let prev_thread = self.table.arena.thread_mut(prev);
            (hooks.switch)(&mut prev_thread.saved_stack, next_stack);
        }
    }
}

fn idle_entry(_aux: usize) {
    loop {
        core::hint::spin_loop();
    }
}

/// Cell holding the live kernel of a real embedding.
pub struct KernelCell(UnsafeCell<Kernel>);

unsafe impl Sync for KernelCell {}

impl KernelCell {
    pub const fn new() -> KernelCell {
        KernelCell(UnsafeCell::new(Kernel::new(KernelConfig::DEFAULT)))
    }

    /// # Safety
    /// Returns a mutable reference to the kernel. The caller must be on
    /// the single processor this crate assumes and must not hold another
    /// reference obtained from this cell.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Kernel {
        &mut *self.0.get()
    }
}

impl Default for KernelCell {
    fn default() -> Self {
        Self::new()
    }
}

pub static KERNEL: KernelCell = KernelCell::new();

/// Configure and initialize the global kernel; returns `main`'s tid.
pub fn init(cfg: KernelConfig) -> Tid {
    unsafe {
        let kernel = KERNEL.get();
        kernel.set_config(cfg);
        match kernel.init() {
            Ok(tid) => tid,
            Err(e) => panic!("init failed: {}", e.as_str()),
        }
    }
}

/// Start the global kernel's scheduler.
pub fn start() {
    unsafe {
        if let Err(e) = KERNEL.get().start() {
            panic!("start failed: {}", e.as_str());
        }
    }
}

/// Create a thread in the global kernel.
pub fn spawn(name: &str, priority: u8, entry: ThreadEntry, aux: usize) -> KernelResult<Tid> {
    unsafe { KERNEL.get().create(name, priority, entry, aux) }
}

/// Yield the processor from the running thread.
pub fn yield_now() {
    unsafe { KERNEL.get().yield_now() }
}

/// Terminate the running thread.
pub fn exit() -> ! {
    unsafe { KERNEL.get().exit() }
    unreachable!("an exited thread cannot be scheduled again");
}

/// Set the running thread's base priority.
pub fn set_priority(priority: u8) {
    unsafe { KERNEL.get().set_priority(priority) }
}

/// The running thread's effective priority.
pub fn get_priority() -> u8 {
    unsafe { KERNEL.get().priority() }
}
