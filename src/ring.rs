//! A fixed-capacity circular buffer with modulo-masked indexing.
//!
//! This is the storage layer of the work-stealing deque. It is deliberately
//! dumb: loads and stores are non-atomic, and all synchronization is the
//! deque's responsibility.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::MaybeUninit;

use crate::platform::UnsafeCell;

/// A power-of-two-sized array addressed by free-running indices. Because the
/// capacity is a power of two, `index & mask` computes `index % capacity`.
pub(crate) struct RingBuffer<T> {
    mask: i64,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T: Copy> RingBuffer<T> {
    /// Allocates a buffer with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two.
    pub fn new(capacity: i64) -> RingBuffer<T> {
        assert!(
            capacity > 0 && capacity & (capacity - 1) == 0,
            "capacity must be a power of two"
        );
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        RingBuffer {
            mask: capacity - 1,
            slots,
        }
    }

    /// Returns the capacity of the buffer.
    #[inline(always)]
    pub fn capacity(&self) -> i64 {
        self.mask + 1
    }

    /// Stores `value` at `index % capacity`.
    ///
    /// # Safety
    ///
    /// Only the deque owner may store, and only into a slot that no thief can
    /// currently claim (the deque's `bottom` has not yet published it).
    #[inline(always)]
    pub unsafe fn store(&self, index: i64, value: T) {
        let slot = self.slots[(index & self.mask) as usize].get_mut();
        // SAFETY: The caller guarantees the slot is unpublished, so this
        // thread has exclusive access to it.
        unsafe { slot.deref() }.write(value);
    }

    /// Loads the value at `index % capacity`.
    ///
    /// # Safety
    ///
    /// The slot must have been initialized by a previous `store`. The load may
    /// race with the owner overwriting a recycled slot; that is tolerated
    /// because `T` is `Copy` and the deque only surfaces the value to a thief
    /// after winning the CAS on `top`, which proves no such race occurred.
    #[inline(always)]
    pub unsafe fn load(&self, index: i64) -> T {
        let slot = self.slots[(index & self.mask) as usize].get();
        // SAFETY: Initialized per the caller's contract; a torn read is never
        // surfaced, per the note above.
        unsafe { slot.deref().assume_init_read() }
    }

    /// Copies the slots in `[top, bottom)` into a buffer of double capacity,
    /// preserving their modular positions. The caller publishes the result.
    pub fn resize(&self, bottom: i64, top: i64) -> Box<RingBuffer<T>> {
        let bigger = RingBuffer::new(2 * self.capacity());
        for index in top..bottom {
            // SAFETY: The owner calls this between operations, so the range
            // [top, bottom) is initialized and no thief writes slots.
            unsafe { bigger.store(index, self.load(index)) };
        }
        Box::new(bigger)
    }
}
