//! Synchronization primitives: counting semaphore, lock with priority
//! donation, and condition variable.
//!
//! Waiter queues are intrusive lists threaded through the same link slot
//! as the ready queue; a thread is on at most one of the two at any
//! time. Queues are kept in priority order on insert, but priorities
//! keep moving while threads wait (donation), so every dequeue re-scans
//! for the *currently* highest-priority waiter instead of trusting the
//! insertion order.
//!
//! A semaphore `up` with waiters hands its count directly to the chosen
//! waiter rather than bumping `value` and letting threads race for it,
//! so a release always reaches the highest-priority waiter. Locks hand
//! over ownership the same way, and `cond_signal` moves its chosen
//! waiter straight onto the lock's waiter queue (the signaler still
//! holds the lock, so the woken thread could not run before the release
//! anyway).
//!
//! Locks live in a fixed kernel table and are addressed by small copyable
//! handles. Blocked threads record the table slot they are waiting on,
//! which is what lets donation walk holder chains.

use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kernel, KERNEL};
use crate::list::List;
use crate::thread::{outranks, Arena, RunLink, ThreadStatus, ThreadTable, Tid};
use log::trace;

/// Upper bound on concurrently existing locks.
pub const MAX_LOCKS: usize = 64;

/// A counting semaphore. The value lives with the caller; all operations
/// go through the kernel, which owns the waiter bookkeeping.
pub struct Semaphore {
    value: u32,
    waiters: List<RunLink>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Semaphore {
        Semaphore {
            value,
            waiters: List::new(),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

/// Handle to a lock slot in the kernel's lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock(pub(crate) u8);

pub(crate) struct LockState {
    pub(crate) holder: Option<Tid>,
    /// Highest effective priority among threads waiting on this lock.
    pub(crate) ceiling: u8,
    pub(crate) waiters: List<RunLink>,
}

impl LockState {
    const fn new() -> LockState {
        LockState {
            holder: None,
            ceiling: 0,
            waiters: List::new(),
        }
    }
}

pub(crate) struct LockTable {
    slots: [Option<LockState>; MAX_LOCKS],
}

impl LockTable {
    pub(crate) const fn new() -> LockTable {
        LockTable {
            slots: [const { None }; MAX_LOCKS],
        }
    }

    fn allocate(&mut self) -> KernelResult<u8> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::TooManyLocks)?;
        self.slots[slot] = Some(LockState::new());
        Ok(slot as u8)
    }

    fn free(&mut self, slot: u8) {
        self.slots[slot as usize] = None;
    }

    pub(crate) fn state(&self, lock: Lock) -> &LockState {
        match self.slots[lock.0 as usize].as_ref() {
            Some(state) => state,
            None => panic!("lock {} does not exist", lock.0),
        }
    }

    pub(crate) fn state_mut(&mut self, lock: Lock) -> &mut LockState {
        match self.slots[lock.0 as usize].as_mut() {
            Some(state) => state,
            None => panic!("lock {} does not exist", lock.0),
        }
    }

    pub(crate) fn ceiling_of(&self, slot: u8) -> u8 {
        self.state(Lock(slot)).ceiling
    }
}

/// A condition variable. Pair it with a [`Lock`]; the kernel moves
/// signaled waiters onto that lock's queue.
pub struct Condition {
    waiters: List<RunLink>,
}

impl Condition {
    pub const fn new() -> Condition {
        Condition {
            waiters: List::new(),
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

/// The waiter whose effective priority is highest right now; first
/// arrival wins among equals.
fn max_waiter(waiters: &List<RunLink>, arena: &Arena) -> Option<Tid> {
    let mut best: Option<(Tid, u8)> = None;
    for tid in waiters.iter(arena) {
        let priority = arena.thread(tid).effective_priority;
        match best {
            Some((_, top)) if priority <= top => {}
            _ => best = Some((tid, priority)),
        }
    }
    best.map(|(tid, _)| tid)
}

/// Recompute a thread's effective priority from its base priority and
/// the waiter ceilings of the locks it still holds.
pub(crate) fn recompute_effective(table: &mut ThreadTable, locks: &LockTable, tid: Tid) {
    let (base, held) = {
        let thread = table.arena.thread(tid);
        (thread.base_priority, thread.held_locks)
    };
    let mut effective = base;
    for slot in held.iter() {
        let ceiling = locks.ceiling_of(slot);
        if ceiling > effective {
            effective = ceiling;
        }
    }
    table.arena.thread_mut(tid).effective_priority = effective;
}

/// Lend `donor_priority` along the chain of lock holders starting at
/// `lock`, raising ceilings as it goes. Boosted ready threads are
/// repositioned; blocked threads are found by the dequeue re-scan.
fn donate(
    table: &mut ThreadTable,
    locks: &mut LockTable,
    ready: &mut List<RunLink>,
    depth_limit: u32,
    donor_priority: u8,
    lock: Lock,
) {
    let mut slot = lock.0;
    for _ in 0..depth_limit {
        let state = locks.state_mut(Lock(slot));
        if donor_priority > state.ceiling {
            state.ceiling = donor_priority;
        }
        let Some(holder) = state.holder else { break };
        if table.arena.thread(holder).effective_priority >= donor_priority {
            break;
        }
        table.arena.thread_mut(holder).effective_priority = donor_priority;
        trace!("donated priority {} to {} via lock {}", donor_priority, holder, slot);
        if table.arena.thread(holder).status == ThreadStatus::Ready {
            ready.remove(&mut table.arena, holder);
            ready.insert_ordered(&mut table.arena, holder, outranks);
        }
        match table.arena.thread(holder).waiting_on {
            Some(next) => slot = next,
            None => break,
        }
    }
}

impl Kernel {
    /// Decrement the semaphore, blocking while its value is zero.
    pub fn sema_down(&mut self, sema: &mut Semaphore) {
        assert!(
            !self.intr.in_handler(),
            "semaphore down inside the interrupt handler"
        );
        let old = self.intr.disable();
        if sema.value == 0 {
            let tid = self.current_tid();
            sema.waiters.insert_ordered(&mut self.table.arena, tid, outranks);
            self.block();
            // The matching `up` handed us its count directly.
        } else {
            sema.value -= 1;
        }
        self.intr.set_level(old);
    }

    /// Decrement the semaphore only if that needs no waiting.
    pub fn sema_try_down(&mut self, sema: &mut Semaphore) -> bool {
        let old = self.intr.disable();
        let taken = sema.value > 0;
        if taken {
            sema.value -= 1;
        }
        self.intr.set_level(old);
        taken
    }

    /// Increment the semaphore, waking the highest-priority waiter. The
    /// caller yields if the woken thread outranks it.
    pub fn sema_up(&mut self, sema: &mut Semaphore) {
        let old = self.intr.disable();
        match max_waiter(&sema.waiters, &self.table.arena) {
            Some(tid) => {
                sema.waiters.remove(&mut self.table.arena, tid);
                self.unblock(tid);
                self.intr.set_level(old);
                self.check_should_yield();
            }
            None => {
                sema.value += 1;
                self.intr.set_level(old);
            }
        }
    }

    pub fn lock_create(&mut self) -> KernelResult<Lock> {
        let old = self.intr.disable();
        let result = self.locks.allocate();
        self.intr.set_level(old);
        result.map(Lock)
    }

    /// Retire a lock. Destroying a held or contended lock is fatal.
    pub fn lock_destroy(&mut self, lock: Lock) {
        let old = self.intr.disable();
        {
            let state = self.locks.state(lock);
            assert!(
                state.holder.is_none() && state.waiters.is_empty(),
                "destroying lock {} while it is in use",
                lock.0
            );
        }
        self.locks.free(lock.0);
        self.intr.set_level(old);
    }

    /// Acquire the lock, donating priority to the holder chain while
    /// waiting. Donation is skipped under MLFQS.
    pub fn lock_acquire(&mut self, lock: Lock) {
        assert!(
            !self.intr.in_handler(),
            "the interrupt handler cannot take locks"
        );
        let old = self.intr.disable();
        let tid = self.current_tid();
        if self.locks.state(lock).holder == Some(tid) {
            panic!(
                "thread {} ({}) re-acquiring lock {} it already holds",
                tid,
                self.current_name(),
                lock.0
            );
        }
        if self.locks.state(lock).holder.is_none() {
            self.grant_lock(lock, tid);
        } else {
            self.enqueue_lock_waiter(lock, tid);
            self.block();
            // Ownership was transferred to us by the release.
        }
        self.intr.set_level(old);
    }

    /// Acquire the lock only if it is free. Never donates.
    pub fn lock_try_acquire(&mut self, lock: Lock) -> bool {
        assert!(
            !self.intr.in_handler(),
            "the interrupt handler cannot take locks"
        );
        let old = self.intr.disable();
        let tid = self.current_tid();
        let free = self.locks.state(lock).holder.is_none();
        if free {
            self.grant_lock(lock, tid);
        }
        self.intr.set_level(old);
        free
    }

    /// Release the lock, shedding any donation received through it, and
    /// hand it to the highest-priority waiter. Releasing a lock the
    /// caller does not hold is fatal.
    pub fn lock_release(&mut self, lock: Lock) {
        let old = self.intr.disable();
        let tid = self.current_tid();
        if self.locks.state(lock).holder != Some(tid) {
            panic!(
                "thread {} ({}) releasing lock {} it does not hold",
                tid,
                self.current_name(),
                lock.0
            );
        }
        self.release_lock_inner(lock);
        self.intr.set_level(old);
        self.check_should_yield();
    }

    pub fn lock_held_by_current(&self, lock: Lock) -> bool {
        self.locks.state(lock).holder == Some(self.current_tid())
    }

    /// Atomically release the lock and wait on the condition; the lock
    /// is held again when the wait is over.
    pub fn cond_wait(&mut self, cond: &mut Condition, lock: Lock) {
        assert!(
            !self.intr.in_handler(),
            "the interrupt handler cannot wait on a condition"
        );
        assert!(
            self.lock_held_by_current(lock),
            "waiting on a condition without holding its lock"
        );
        let old = self.intr.disable();
        let tid = self.current_tid();
        cond.waiters.insert_ordered(&mut self.table.arena, tid, outranks);
        self.release_lock_inner(lock);
        self.block();
        // A signal moved us to the lock queue and its release granted
        // the lock back to us.
        self.intr.set_level(old);
    }

    /// Wake the waiter whose effective priority is currently highest.
    /// The signaler must hold the paired lock, so the waiter is moved
    /// onto the lock's queue and runs once the lock is released.
    pub fn cond_signal(&mut self, cond: &mut Condition, lock: Lock) {
        assert!(
            self.lock_held_by_current(lock),
            "signaling a condition without holding its lock"
        );
        let old = self.intr.disable();
        if let Some(tid) = max_waiter(&cond.waiters, &self.table.arena) {
            cond.waiters.remove(&mut self.table.arena, tid);
            trace!("signal wakes {} toward lock {}", tid, lock.0);
            self.enqueue_lock_waiter(lock, tid);
        }
        self.intr.set_level(old);
    }

    /// Wake every waiter, in priority order.
    pub fn cond_broadcast(&mut self, cond: &mut Condition, lock: Lock) {
        while cond.has_waiters() {
            self.cond_signal(cond, lock);
        }
    }

    fn grant_lock(&mut self, lock: Lock, tid: Tid) {
        self.locks.state_mut(lock).holder = Some(tid);
        let thread = self.table.arena.thread_mut(tid);
        debug_assert!(!thread.held_locks.contains(lock.0));
        thread.waiting_on = None;
        thread.held_locks.insert(lock.0);
    }

    /// Queue `tid` (the current thread, or a signaled condvar waiter)
    /// behind the lock's holder, donating down the chain first.
    fn enqueue_lock_waiter(&mut self, lock: Lock, tid: Tid) {
        let depth = self.cfg.donation_depth;
        if !self.cfg.mlfqs {
            let donor = self.table.arena.thread(tid).effective_priority;
            let Kernel {
                table,
                locks,
                ready,
                ..
            } = self;
            donate(table, locks, ready, depth, donor, lock);
        } else {
            // The ceiling still tracks the top waiter in this mode; it
            // just never feeds a priority.
            let priority = self.table.arena.thread(tid).effective_priority;
            let state = self.locks.state_mut(lock);
            if priority > state.ceiling {
                state.ceiling = priority;
            }
        }
        self.table.arena.thread_mut(tid).waiting_on = Some(lock.0);
        let Kernel { table, locks, .. } = self;
        locks
            .state_mut(lock)
            .waiters
            .insert_ordered(&mut table.arena, tid, outranks);
    }

    /// Release without the preemption check; shared by `lock_release`
    /// and `cond_wait`.
    fn release_lock_inner(&mut self, lock: Lock) {
        let tid = self.current_tid();
        self.table.arena.thread_mut(tid).held_locks.remove(lock.0);
        // Under MLFQS there are no donations to shed, and folding the
        // ceilings of still-held locks back in would create one.
        if !self.cfg.mlfqs {
            recompute_effective(&mut self.table, &self.locks, tid);
        }

        let next = {
            let Kernel { table, locks, .. } = self;
            let state = locks.state_mut(lock);
            let next = max_waiter(&state.waiters, &table.arena);
            if let Some(n) = next {
                state.waiters.remove(&mut table.arena, n);
            }
            next
        };
        match next {
            Some(n) => {
                let ceiling = {
                    let Kernel { table, locks, .. } = self;
                    let state = locks.state(lock);
                    state
                        .waiters
                        .iter(&table.arena)
                        .map(|w| table.arena.thread(w).effective_priority)
                        .max()
                        .unwrap_or(0)
                };
                self.locks.state_mut(lock).ceiling = ceiling;
                self.grant_lock(lock, n);
                trace!("lock {} handed to {}", lock.0, n);
                self.unblock(n);
            }
            None => {
                let state = self.locks.state_mut(lock);
                state.holder = None;
                state.ceiling = 0;
            }
        }
    }
}

/// Facade over the global kernel.
pub fn sema_down(sema: &mut Semaphore) {
    unsafe { KERNEL.get().sema_down(sema) }
}

pub fn sema_try_down(sema: &mut Semaphore) -> bool {
    unsafe { KERNEL.get().sema_try_down(sema) }
}

pub fn sema_up(sema: &mut Semaphore) {
    unsafe { KERNEL.get().sema_up(sema) }
}

pub fn lock_create() -> KernelResult<Lock> {
    unsafe { KERNEL.get().lock_create() }
}

pub fn lock_destroy(lock: Lock) {
    unsafe { KERNEL.get().lock_destroy(lock) }
}

pub fn lock_acquire(lock: Lock) {
    unsafe { KERNEL.get().lock_acquire(lock) }
}

pub fn lock_try_acquire(lock: Lock) -> bool {
    unsafe { KERNEL.get().lock_try_acquire(lock) }
}

pub fn lock_release(lock: Lock) {
    unsafe { KERNEL.get().lock_release(lock) }
}

pub fn lock_held_by_current(lock: Lock) -> bool {
    unsafe { KERNEL.get().lock_held_by_current(lock) }
}

pub fn cond_wait(cond: &mut Condition, lock: Lock) {
    unsafe { KERNEL.get().cond_wait(cond, lock) }
}

pub fn cond_signal(cond: &mut Condition, lock: Lock) {
    unsafe { KERNEL.get().cond_signal(cond, lock) }
}

pub fn cond_broadcast(cond: &mut Condition, lock: Lock) {
    unsafe { KERNEL.get().cond_broadcast(cond, lock) }
}
