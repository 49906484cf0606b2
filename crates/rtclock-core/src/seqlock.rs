//! Generation-counted sequence lock for small `Copy` payloads.
//!
//! Readers never block and never write shared memory; they retry when they
//! observe an odd generation (a write in progress) or when the generation
//! moved while they were copying the payload. Writers bump the generation
//! to odd, update the payload in place, and bump it to the next even value.
//!
//! ```text
//!   writer:  gen=2k ──CAS──▶ gen=2k+1 ── payload ── store(Release) ──▶ gen=2k+2
//!   reader:  load(Acquire) ── copy payload ── fence(Acquire) ── load ── compare
//! ```
//!
//! Writer entry is a compare-exchange from even to odd, so a second writer
//! spins until the first finishes instead of tearing the payload. On the
//! clock paths only the owning CPU ever writes, with interrupts masked, so
//! that spin never happens in practice.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// A seqlock-protected value.
pub struct SeqLock<T: Copy> {
    /// Generation number (odd = write in progress).
    sequence: CachePadded<AtomicU64>,
    /// Payload.
    data: UnsafeCell<T>,
}

// SAFETY: Readers only take bitwise copies validated by the generation
// check, and writers are serialized by the even→odd compare-exchange.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    /// Create a lock holding `value` at generation 0.
    pub const fn new(value: T) -> Self {
        Self {
            sequence: CachePadded::new(AtomicU64::new(0)),
            data: UnsafeCell::new(value),
        }
    }

    /// Current generation. Even when stable, odd while a writer is active.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Single read attempt.
    ///
    /// Returns `None` if a writer is mid-update or completed an update
    /// while the payload was being copied.
    #[inline]
    pub fn try_read(&self) -> Option<T> {
        self.try_read_with(|v| v)
    }

    /// Single read attempt that also evaluates `f` inside the validated window.
    ///
    /// `f` may be called and its result discarded; it must be free of side
    /// effects that matter.
    #[inline]
    pub fn try_read_with<R>(&self, f: impl FnOnce(T) -> R) -> Option<R> {
        let seq1 = self.sequence.load(Ordering::Acquire);
        if seq1 & 1 != 0 {
            return None;
        }

        // SAFETY: The copy may race with a writer; a torn value is never
        // returned because the generation check below rejects it. Volatile
        // keeps the compiler from caching or splitting the copy.
        let value = unsafe { std::ptr::read_volatile(self.data.get()) };
        let result = f(value);

        fence(Ordering::Acquire);
        let seq2 = self.sequence.load(Ordering::Relaxed);
        (seq1 == seq2).then_some(result)
    }

    /// Read a consistent snapshot, spinning while a writer is active.
    #[inline]
    pub fn read(&self) -> T {
        self.read_with(|v| v)
    }

    /// Read a consistent snapshot and evaluate `f` against it.
    ///
    /// Retries (re-evaluating `f`) until a window completes with no writer
    /// activity, so anything `f` samples is paired with the snapshot it saw.
    #[inline]
    pub fn read_with<R>(&self, mut f: impl FnMut(T) -> R) -> R {
        loop {
            if let Some(result) = self.try_read_with(&mut f) {
                return result;
            }
            std::hint::spin_loop();
        }
    }

    /// Begin a write. The generation is odd until the guard is dropped.
    pub fn lock(&self) -> SeqLockWriteGuard<'_, T> {
        let mut seq = self.sequence.load(Ordering::Relaxed);
        loop {
            if seq & 1 != 0 {
                std::hint::spin_loop();
                seq = self.sequence.load(Ordering::Relaxed);
                continue;
            }
            match self.sequence.compare_exchange_weak(
                seq,
                seq.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => seq = current,
            }
        }
        // Payload stores must not become visible before the odd generation.
        fence(Ordering::Release);
        SeqLockWriteGuard {
            lock: self,
            start: seq,
        }
    }

    /// Mutate the payload in one write window.
    #[inline]
    pub fn write(&self, f: impl FnOnce(&mut T)) {
        let mut guard = self.lock();
        f(&mut guard);
    }

    /// Replace the payload.
    #[inline]
    pub fn store(&self, value: T) {
        *self.lock() = value;
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for SeqLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqLock")
            .field("generation", &self.generation())
            .field("data", &self.try_read())
            .finish()
    }
}

/// Exclusive write access; publishes the next even generation on drop.
pub struct SeqLockWriteGuard<'a, T: Copy> {
    lock: &'a SeqLock<T>,
    start: u64,
}

impl<T: Copy> Deref for SeqLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard holds the odd generation; no other writer exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: Copy> DerefMut for SeqLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As above; readers only copy and then discard torn values.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: Copy> Drop for SeqLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock
            .sequence
            .store(self.start.wrapping_add(2), Ordering::Release);
    }
}
