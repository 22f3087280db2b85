#![no_main]

//! Feed arbitrary operation sequences to a kernel instance and let the
//! internal assertions look for states the scheduler should never reach.
//! The harness only issues calls a well-formed thread could make (no
//! double acquires, no blocking as the idle thread), since those are
//! fatal by contract.

use arbitrary::Arbitrary;
use kthreads::{Condition, Kernel, KernelConfig, Lock, Semaphore, ThreadStatus, PRI_MAX};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Create { priority: u8 },
    YieldNow,
    Sleep { ticks: u8 },
    Tick,
    SetPriority { priority: u8 },
    SetNice { nice: i8 },
    Exit,
    LockCreate,
    LockAcquire { index: u8 },
    LockTryAcquire { index: u8 },
    LockRelease { index: u8 },
    SemaDown,
    SemaTryDown,
    SemaUp,
    CondWait { index: u8 },
    CondSignal { index: u8 },
    CondBroadcast { index: u8 },
}

fn noop(_aux: usize) {}

fn pick(locks: &[Lock], index: u8) -> Option<Lock> {
    if locks.is_empty() {
        None
    } else {
        Some(locks[index as usize % locks.len()])
    }
}

fuzz_target!(|input: (bool, Vec<Op>)| {
    let (mlfqs, ops) = input;
    let mut kernel = Kernel::new(KernelConfig {
        mlfqs,
        ..KernelConfig::DEFAULT
    });
    kernel.init().unwrap();
    kernel.start().unwrap();

    let mut locks: Vec<Lock> = Vec::new();
    let mut sema = Semaphore::new(1);
    let mut cond = Condition::new();

    for op in ops {
        // The idle thread only ever spins; while it holds the processor
        // the outside world can still tick the timer.
        let idle = kernel.current_name() == "idle";
        match op {
            Op::Create { priority } => {
                let _ = kernel.create("fuzzed", priority % (PRI_MAX + 1), noop, 0);
            }
            Op::YieldNow if !idle => kernel.yield_now(),
            Op::Sleep { ticks } if !idle => kernel.sleep(i64::from(ticks) % 32 + 1),
            Op::Tick => kernel.tick(),
            Op::SetPriority { priority } if !idle => {
                kernel.set_priority(priority % (PRI_MAX + 1));
            }
            Op::SetNice { nice } if !idle => kernel.set_nice(nice),
            Op::Exit if !idle && kernel.live_threads() > 2 => {
                // Exiting while holding a lock would orphan it, which is
                // a kernel bug rather than a reachable state.
                if locks.iter().all(|&l| !kernel.lock_held_by_current(l)) {
                    kernel.exit();
                }
            }
            Op::LockCreate => {
                if let Ok(lock) = kernel.lock_create() {
                    locks.push(lock);
                }
            }
            Op::LockAcquire { index } if !idle => {
                if let Some(lock) = pick(&locks, index) {
                    if !kernel.lock_held_by_current(lock) {
                        kernel.lock_acquire(lock);
                    }
                }
            }
            Op::LockTryAcquire { index } if !idle => {
                if let Some(lock) = pick(&locks, index) {
                    if !kernel.lock_held_by_current(lock) {
                        let _ = kernel.lock_try_acquire(lock);
                    }
                }
            }
            Op::LockRelease { index } if !idle => {
                if let Some(lock) = pick(&locks, index) {
                    if kernel.lock_held_by_current(lock) {
                        kernel.lock_release(lock);
                    }
                }
            }
            Op::SemaDown if !idle => kernel.sema_down(&mut sema),
            Op::SemaTryDown if !idle => {
                let _ = kernel.sema_try_down(&mut sema);
            }
            Op::SemaUp => kernel.sema_up(&mut sema),
            Op::CondWait { index } if !idle => {
                if let Some(lock) = pick(&locks, index) {
                    if kernel.lock_held_by_current(lock) {
                        kernel.cond_wait(&mut cond, lock);
                    }
                }
            }
            Op::CondSignal { index } if !idle => {
                if let Some(lock) = pick(&locks, index) {
                    if kernel.lock_held_by_current(lock) {
                        kernel.cond_signal(&mut cond, lock);
                    }
                }
            }
            Op::CondBroadcast { index } if !idle => {
                if let Some(lock) = pick(&locks, index) {
                    if kernel.lock_held_by_current(lock) {
                        kernel.cond_broadcast(&mut cond, lock);
                    }
                }
            }
            _ => {}
        }

        // One-running-thread invariant after every operation.
        let current = kernel.current_tid();
        let mut running = 0;
        kernel.foreach(|t| {
            if t.status() == ThreadStatus::Running {
                running += 1;
                assert_eq!(t.tid(), current);
            }
        });
        assert_eq!(running, 1);
    }
});
