//! Hardware seams and the interrupts-disabled capability.
//!
//! The clock engine never touches registers directly. A platform supplies:
//!
//! - [`CycleCounter`]: the free-running counter, readable from any context
//! - [`OneShotTimer`]: the per-CPU "set count, arm, one-shot" primitive
//! - [`CalloutDispatcher`]: the timer-queue subsystem that receives pops
//! - [`InterruptMask`]: masking and restoring interrupt delivery on a CPU
//!
//! Mutating entry points take an [`IrqDisabled`] token. Holding one proves
//! that interrupt delivery is masked on `token.cpu()`, which is what makes
//! the owning CPU the sole writer of its time base and timer.

use crate::deadline::TimerPop;
use rtclock_common::cpu::CpuId;
use std::marker::PhantomData;
use std::ops::Deref;

/// Free-running hardware cycle counter.
pub trait CycleCounter: Send + Sync {
    /// Current counter value. Must be cheap and side-effect free.
    fn read(&self) -> u64;
}

/// Per-CPU one-shot interrupt timer.
pub trait OneShotTimer: Send + Sync {
    /// Arm a single interrupt `count` timer ticks from now, replacing any
    /// pending one.
    fn program(&self, count: u32);

    /// Disarm.
    fn stop(&self);
}

/// The timer-queue subsystem that consumes timer pops.
pub trait CalloutDispatcher: Send + Sync {
    /// A timer interrupt was serviced on `irq.cpu()`.
    ///
    /// The dispatcher runs due callouts and decides the next deadline.
    fn timer_expired(&self, irq: &IrqDisabled, pop: &TimerPop);

    /// Re-evaluate every queued deadline for `irq.cpu()` and re-arm.
    fn resync_deadlines(&self, irq: &IrqDisabled);
}

/// Platform interrupt masking.
pub trait InterruptMask {
    /// Mask delivery on `cpu`, returning whether it was enabled before.
    fn mask(&self, cpu: CpuId) -> bool;

    /// Restore the state returned by [`InterruptMask::mask`].
    fn restore(&self, cpu: CpuId, was_enabled: bool);
}

/// Context captured when the timer interrupt was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptFrame {
    /// The interrupted context was running in user mode.
    pub user_mode: bool,
    /// Instruction pointer of the interrupted context.
    pub instruction_pointer: u64,
}

/// Capability: interrupts are disabled on [`IrqDisabled::cpu`].
///
/// Not `Send`: a token describes the CPU it was created on and must not
/// migrate.
#[derive(Debug)]
pub struct IrqDisabled {
    cpu: CpuId,
    _not_send: PhantomData<*const ()>,
}

impl IrqDisabled {
    /// Assert that interrupts are already disabled on `cpu`.
    ///
    /// # Safety
    ///
    /// The caller must be executing on `cpu` with interrupt delivery
    /// masked, for example inside the timer interrupt handler, and must
    /// keep it masked for the token's lifetime.
    #[inline]
    pub const unsafe fn assume(cpu: CpuId) -> Self {
        Self {
            cpu,
            _not_send: PhantomData,
        }
    }

    /// The CPU whose interrupts are masked.
    #[inline]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }
}

/// Masks interrupts for its lifetime and hands out the [`IrqDisabled`] token.
pub struct IrqGuard<'a, M: InterruptMask + ?Sized> {
    mask: &'a M,
    token: IrqDisabled,
    was_enabled: bool,
}

impl<'a, M: InterruptMask + ?Sized> IrqGuard<'a, M> {
    /// Mask interrupts on `cpu` until the guard is dropped.
    pub fn new(mask: &'a M, cpu: CpuId) -> Self {
        let was_enabled = mask.mask(cpu);
        Self {
            mask,
            // SAFETY: Delivery was masked on `cpu` just above and is only
            // restored when this guard, which owns the token, is dropped.
            token: unsafe { IrqDisabled::assume(cpu) },
            was_enabled,
        }
    }

    /// Borrow the capability token.
    #[inline]
    pub fn token(&self) -> &IrqDisabled {
        &self.token
    }
}

impl<M: InterruptMask + ?Sized> Deref for IrqGuard<'_, M> {
    type Target = IrqDisabled;

    fn deref(&self) -> &IrqDisabled {
        &self.token
    }
}

impl<M: InterruptMask + ?Sized> Drop for IrqGuard<'_, M> {
    fn drop(&mut self) {
        self.mask.restore(self.token.cpu, self.was_enabled);
    }
}

static_assertions::assert_not_impl_any!(IrqDisabled: Send, Sync);
