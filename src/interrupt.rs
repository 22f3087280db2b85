//! Interrupt-level gate.
//!
//! On a uniprocessor, disabling interrupts gives the running thread
//! exclusive access to all scheduler state; every other form of mutual
//! exclusion in this crate is built on top of this gate. The gate also
//! tracks whether execution is currently inside the timer interrupt
//! handler and carries the deferred-yield flag the handler raises when
//! preemption should happen on interrupt return.

use portable_atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    /// Interrupts may be delivered.
    On,
    /// Interrupts are masked.
    Off,
}

pub struct IntrGate {
    enabled: AtomicBool,
    in_handler: AtomicBool,
    yield_pending: AtomicBool,
}

impl IntrGate {
    /// Interrupts start masked; `start` turns them on.
    pub const fn new() -> IntrGate {
        IntrGate {
            enabled: AtomicBool::new(false),
            in_handler: AtomicBool::new(false),
            yield_pending: AtomicBool::new(false),
        }
    }

    pub fn level(&self) -> IntrLevel {
        if self.enabled.load(Ordering::Acquire) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Mask interrupts, returning the previous level.
    pub fn disable(&self) -> IntrLevel {
        if self.enabled.swap(false, Ordering::AcqRel) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    /// Unmask interrupts. Must not be called from the interrupt handler,
    /// which runs masked by definition.
    pub fn enable(&self) {
        assert!(
            !self.in_handler(),
            "cannot enable interrupts inside an interrupt handler"
        );
        self.enabled.store(true, Ordering::Release);
    }

    /// Restore a level previously returned by [`IntrGate::disable`].
    pub fn set_level(&self, level: IntrLevel) {
        match level {
            IntrLevel::On => self.enable(),
            IntrLevel::Off => {
                self.enabled.store(false, Ordering::Release);
            }
        }
    }

    pub fn in_handler(&self) -> bool {
        self.in_handler.load(Ordering::Acquire)
    }

    pub(crate) fn enter_handler(&self) -> IntrLevel {
        let prev = self.disable();
        self.in_handler.store(true, Ordering::Release);
        prev
    }

    pub(crate) fn leave_handler(&self, prev: IntrLevel) {
        self.in_handler.store(false, Ordering::Release);
        self.set_level(prev);
    }

    /// Ask for a yield once the handler returns.
    pub(crate) fn request_yield(&self) {
        self.yield_pending.store(true, Ordering::Release);
    }

    pub(crate) fn take_yield_request(&self) -> bool {
        self.yield_pending.swap(false, Ordering::AcqRel)
    }
}

/// Critical-section guard: masks interrupts on construction and restores
/// the previous level when dropped.
pub struct IntrGuard<'a> {
    gate: &'a IntrGate,
    prev: IntrLevel,
}

impl<'a> IntrGuard<'a> {
    pub fn new(gate: &'a IntrGate) -> IntrGuard<'a> {
        let prev = gate.disable();
        IntrGuard { gate, prev }
    }
}

impl Drop for IntrGuard<'_> {
    fn drop(&mut self) {
        self.gate.set_level(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_masked() {
        let gate = IntrGate::new();
        assert_eq!(gate.level(), IntrLevel::Off);
        assert!(!gate.enabled());
    }

    #[test]
    fn test_disable_reports_previous_level() {
        let gate = IntrGate::new();
        gate.enable();
        assert_eq!(gate.disable(), IntrLevel::On);
        assert_eq!(gate.disable(), IntrLevel::Off);
        gate.set_level(IntrLevel::On);
        assert!(gate.enabled());
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let gate = IntrGate::new();
        gate.enable();
        {
            let _guard = IntrGuard::new(&gate);
            assert!(!gate.enabled());
            {
                let _nested = IntrGuard::new(&gate);
                assert!(!gate.enabled());
            }
            // Nested guard restores to Off, not On.
            assert!(!gate.enabled());
        }
        assert!(gate.enabled());
    }

    #[test]
    fn test_handler_window() {
        let gate = IntrGate::new();
        gate.enable();
        let prev = gate.enter_handler();
        assert!(gate.in_handler());
        assert!(!gate.enabled());
        gate.request_yield();
        gate.leave_handler(prev);
        assert!(!gate.in_handler());
        assert!(gate.enabled());
        assert!(gate.take_yield_request());
        assert!(!gate.take_yield_request());
    }

    #[test]
    #[should_panic(expected = "inside an interrupt handler")]
    fn test_enable_inside_handler_panics() {
        let gate = IntrGate::new();
        gate.enable();
        let _prev = gate.enter_handler();
        gate.enable();
    }
}
