//! A fork/join scheduler built on a Chase-Lev work-stealing deque.
//!
//! Tine executes recursively-structured parallel computations on a fixed pool
//! of worker threads. A computation is a tree of lightweight, suspendable task
//! frames: a frame `fork`s children onto its worker's deque and continues
//! inline, idle workers steal those children from the far end, and a `join`
//! suspends the frame until its last outstanding child completes. The worker
//! that observes the child count reach zero is the worker that resumes the
//! parent.
//!
//! The crate deliberately exposes the raw frame protocol rather than a
//! closure-based veneer: a frame is an explicit state machine implementing
//! [`Frame`], with its resume point and spilled locals stored behind
//! owner-only cells. See the `Frame` documentation for the authoring rules.
//!
//! # Acknowledgments
//!
//! The deque follows the published Chase-Lev algorithm as refined for weak
//! memory models ("Correct and Efficient Work-Stealing for Weak Memory
//! Models"); the orderings are kept literal. The panic-containment pattern
//! follows rayon.

// -----------------------------------------------------------------------------
// Boilerplate for building without the standard library

#![no_std]

extern crate alloc;
extern crate std;

// -----------------------------------------------------------------------------
// Modules

pub mod deque;
#[cfg(not(loom))]
mod frame;
#[cfg(not(loom))]
mod inbox;
#[cfg(not(loom))]
mod pool;
mod ring;
#[cfg(not(loom))]
mod rng;
#[cfg(not(loom))]
mod unwind;

// -----------------------------------------------------------------------------
// Top-level exports

pub use deque::StealDeque;
#[cfg(not(loom))]
pub use frame::Frame;
#[cfg(not(loom))]
pub use frame::FrameHeader;
#[cfg(not(loom))]
pub use frame::FrameRef;
#[cfg(not(loom))]
pub use frame::Join;
#[cfg(not(loom))]
pub use frame::Locals;
#[cfg(not(loom))]
pub use frame::Panic;
#[cfg(not(loom))]
pub use frame::Slot;
#[cfg(not(loom))]
pub use frame::SlotRef;
#[cfg(not(loom))]
pub use frame::Step;
#[cfg(not(loom))]
pub use pool::Pool;
#[cfg(not(loom))]
pub use pool::STEAL_ATTEMPTS;
#[cfg(not(loom))]
pub use pool::Worker;

// -----------------------------------------------------------------------------
// Platform Support

// This crate uses `loom` to model-check the work-stealing deque, which
// requires mocking the core atomic types. There are minor API differences
// between `loom` and `core`, so all the important types are re-exported here
// in the `platform` module, with the `core` implementations wrapped where
// necessary to match `loom`.

#[cfg(not(loom))]
mod platform {

    // Core exports

    pub use alloc::sync::Arc;
    pub use core::cell::Cell;
    pub use core::num::NonZero;
    pub use core::sync::atomic::AtomicBool;
    pub use core::sync::atomic::AtomicI64;
    pub use core::sync::atomic::AtomicPtr;
    pub use core::sync::atomic::AtomicU32;
    pub use core::sync::atomic::AtomicU64;
    pub use core::sync::atomic::AtomicUsize;
    pub use core::sync::atomic::Ordering;
    pub use core::sync::atomic::fence;
    pub use std::thread::Builder as ThreadBuilder;
    pub use std::thread::JoinHandle;
    pub use std::thread::available_parallelism;

    // Unsafe Cell

    pub struct UnsafeCell<T> {
        data: core::cell::UnsafeCell<T>,
    }

    impl<T> UnsafeCell<T> {
        #[inline(always)]
        pub const fn new(data: T) -> Self {
            UnsafeCell {
                data: core::cell::UnsafeCell::new(data),
            }
        }

        #[inline(always)]
        pub fn get(&self) -> ConstPtr<T> {
            ConstPtr {
                ptr: self.data.get(),
            }
        }

        #[inline(always)]
        pub fn get_mut(&self) -> MutPtr<T> {
            MutPtr {
                ptr: self.data.get(),
            }
        }
    }

    pub struct ConstPtr<T: ?Sized> {
        ptr: *const T,
    }

    impl<T: ?Sized> ConstPtr<T> {
        /// Dereferences the pointer.
        ///
        /// # Safety
        ///
        /// This is equivalent to dereferencing a `*const T`, so all the same
        /// aliasing considerations apply. The pointer itself is never null,
        /// because a `ConstPtr` can only be obtained from a live
        /// `UnsafeCell`.
        #[inline(always)]
        pub unsafe fn deref(&self) -> &T {
            // SAFETY: The safety requirements of this dereference are
            // identical to those of the function.
            unsafe { &*self.ptr }
        }
    }

    pub struct MutPtr<T: ?Sized> {
        ptr: *mut T,
    }

    #[allow(clippy::mut_from_ref)]
    impl<T: ?Sized> MutPtr<T> {
        /// Dereferences the pointer.
        ///
        /// # Safety
        ///
        /// This is equivalent to dereferencing a `*mut T`, so all the same
        /// aliasing considerations apply. The pointer itself is never null,
        /// because a `MutPtr` can only be obtained from a live `UnsafeCell`.
        #[inline(always)]
        pub unsafe fn deref(&self) -> &mut T {
            // SAFETY: The safety requirements of this dereference are
            // identical to those of the function.
            unsafe { &mut *self.ptr }
        }
    }
}

#[cfg(loom)]
mod platform {
    pub use loom::cell::UnsafeCell;
    pub use loom::sync::Arc;
    pub use loom::sync::atomic::AtomicI64;
    pub use loom::sync::atomic::AtomicPtr;
    pub use loom::sync::atomic::Ordering;
    pub use loom::sync::atomic::fence;
}
