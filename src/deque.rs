//! A lock-free single-producer multiple-consumer work-stealing deque.
//!
//! This implements the Chase-Lev deque from "Dynamic Circular Work-Stealing
//! Deque", with the memory orderings from "Correct and Efficient Work-Stealing
//! for Weak Memory Models". The orderings are load-bearing and kept literal:
//! the two seq-cst fences and the seq-cst/relaxed CAS on `top` are exactly
//! what the weak-memory proof requires, and relaxing any of them is a
//! correctness bug even where x86 would forgive it.
//!
//! The deque has an *owner*, the one thread allowed to [`push`] and [`pop`]
//! at the bottom (where it behaves like a stack), while any other thread may
//! [`steal`] from the top (where it behaves like a queue). A push that would
//! overflow the current ring buffer copies into a buffer of double capacity;
//! the superseded buffer is retired rather than freed, because a thief may
//! still be reading through a stale buffer pointer. Retired buffers live
//! until the deque is dropped.
//!
//! [`push`]: StealDeque::push
//! [`pop`]: StealDeque::pop
//! [`steal`]: StealDeque::steal

use alloc::boxed::Box;
use alloc::vec::Vec;

use crossbeam_utils::CachePadded;

use crate::platform::AtomicI64;
use crate::platform::AtomicPtr;
use crate::platform::Ordering;
use crate::platform::UnsafeCell;
use crate::platform::fence;
use crate::ring::RingBuffer;

/// The buffer capacity a deque starts out with.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A Chase-Lev work-stealing deque.
///
/// `T` must be `Copy`: a thief reads a slot *before* it knows whether it owns
/// it, and the read may race with the owner recycling that slot. The value is
/// only surfaced if the subsequent CAS on `top` succeeds, which proves the
/// read did not race; a torn read of a trivially-copyable value is otherwise
/// harmless and discarded.
pub struct StealDeque<T> {
    top: CachePadded<AtomicI64>,
    bottom: CachePadded<AtomicI64>,
    buffer: CachePadded<AtomicPtr<RingBuffer<T>>>,
    /// Buffers replaced by a resize, kept alive until the deque dies.
    retired: UnsafeCell<Vec<Box<RingBuffer<T>>>>,
}

// SAFETY: The deque hands values across threads, so `T` must be `Send`. The
// shared state is otherwise atomics and the retirement list, which only the
// owner touches.
unsafe impl<T: Send> Send for StealDeque<T> {}

// SAFETY: As above; concurrent access is mediated by the Chase-Lev protocol.
unsafe impl<T: Send> Sync for StealDeque<T> {}

impl<T: Copy> StealDeque<T> {
    /// Creates a deque whose initial buffer holds `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two.
    pub fn new(capacity: usize) -> StealDeque<T> {
        let buffer = Box::into_raw(Box::new(RingBuffer::new(capacity as i64)));
        StealDeque {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            buffer: CachePadded::new(AtomicPtr::new(buffer)),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Pushes a value onto the bottom of the deque. Never fails, but may
    /// allocate (and, on allocator exhaustion, abort).
    ///
    /// # Safety
    ///
    /// Only the owner thread may call this.
    pub unsafe fn push(&self, value: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        // SAFETY: The buffer pointer is always valid, and only the owner
        // replaces it.
        if unsafe { (*buffer).capacity() } < (b - t) + 1 {
            buffer = self.grow(buffer, b, t);
        }

        // The store does not need to be atomic: no thief can claim this slot
        // until the store to `bottom` below publishes it.
        //
        // SAFETY: Slot `b` is unpublished, per the above.
        unsafe { (*buffer).store(b, value) };

        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Pops a value from the bottom of the deque, returning `None` if the
    /// deque is empty (or if a thief won the race for the final item).
    ///
    /// # Safety
    ///
    /// Only the owner thread may call this.
    pub unsafe fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);

        // Revoke the slot from future thieves.
        self.bottom.store(b, Ordering::Relaxed);

        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t <= b {
            if t == b {
                // This is the last item, and a thief that loaded `bottom`
                // before our store above may be racing us for it.
                if self
                    .top
                    .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    // Lost the race; the thief owns the slot.
                    self.bottom.store(b + 1, Ordering::Relaxed);
                    return None;
                }
                self.bottom.store(b + 1, Ordering::Relaxed);
            }

            // The load can wait until after the slot is secured: only the
            // owner pushes, so nothing can overwrite it under us.
            //
            // SAFETY: Slot `b` was initialized by a previous push.
            Some(unsafe { (*buffer).load(b) })
        } else {
            // Already empty; undo the revocation.
            self.bottom.store(b + 1, Ordering::Relaxed);
            None
        }
    }

    /// Steals a value from the top of the deque. Returns `None` if the deque
    /// is empty or if another thread won the race; a failed steal mutates no
    /// observable state, and losing is the normal outcome under contention.
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t < b {
            // The slot must be read *before* the CAS claims it, because the
            // owner may recycle it immediately afterwards. The read may
            // therefore race with an overwrite; the value is discarded unless
            // the CAS proves the race did not happen. The buffer pointer is
            // loaded with acquire here, standing in for the consume ordering
            // of the published algorithm.
            //
            // SAFETY: `t < b`, so slot `t` was initialized; a torn read is
            // never surfaced.
            let value = unsafe { (*self.buffer.load(Ordering::Acquire)).load(t) };

            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }

            Some(value)
        } else {
            None
        }
    }

    /// Replaces the current buffer with one of double capacity, retiring the
    /// old buffer until the deque is dropped.
    #[cold]
    fn grow(&self, old: *mut RingBuffer<T>, bottom: i64, top: i64) -> *mut RingBuffer<T> {
        // SAFETY: Only the owner calls `grow`, so `old` is the live buffer.
        let bigger = Box::into_raw(unsafe { (*old).resize(bottom, top) });
        self.buffer.store(bigger, Ordering::Relaxed);
        // A thief may still hold the old pointer, so the buffer must outlive
        // every thread that can touch the deque.
        //
        // SAFETY: Only the owner pushes, so the retirement list is not
        // aliased. `old` was created by `Box::into_raw` and is no longer the
        // published buffer.
        unsafe {
            self.retired.get_mut().deref().push(Box::from_raw(old));
        }
        bigger
    }

    /// The number of items in the deque at the instant of the call.
    pub fn size(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        if b >= t { (b - t) as usize } else { 0 }
    }

    /// Whether the deque was empty at the instant of the call.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The capacity of the current buffer.
    pub fn capacity(&self) -> usize {
        // SAFETY: The buffer pointer is always valid.
        unsafe { (*self.buffer.load(Ordering::Relaxed)).capacity() as usize }
    }
}

impl<T: Copy> Default for StealDeque<T> {
    fn default() -> StealDeque<T> {
        StealDeque::new(DEFAULT_CAPACITY)
    }
}

impl<T> Drop for StealDeque<T> {
    fn drop(&mut self) {
        // All threads must be done with the deque by now; the pool joins its
        // workers before the contexts are destroyed. The retirement list is
        // freed when the `UnsafeCell` drops.
        //
        // SAFETY: The published pointer was created by `Box::into_raw` and is
        // no longer reachable by any thread.
        drop(unsafe { Box::from_raw(self.buffer.load(Ordering::Relaxed)) });
    }
}

// -----------------------------------------------------------------------------
// Tests
