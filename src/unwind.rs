//! Panic containment for the frame protocol.
//!
//! A panic that escapes a frame's continuation must not unwind the worker
//! loop. It is routed through the frame's `fail` hook into the result slot
//! the frame would have filled anyway, the frame counts as terminal, and the
//! parent still joins; only the submitting thread re-raises, when a failed
//! root leaves `sync_wait`. The catch-and-rethrow shape follows rayon.

use core::mem;
use core::panic::AssertUnwindSafe;
use std::eprintln;
use std::panic::catch_unwind;
use std::panic::resume_unwind;
use std::process::abort;

use crate::frame::FrameRef;
use crate::frame::Panic;
use crate::frame::Step;
use crate::pool::Worker;

/// Resumes `frame` with its panics contained.
///
/// An escaped payload is handed to the frame's `fail` hook, which records it
/// exactly as a successful resume records a value, so the parent observes the
/// failure after its join as the `Err` arm of the child's slot. Nothing reads
/// the continuation's state after a failure, so the resume can be treated as
/// exception safe.
pub(crate) fn resume_contained(frame: FrameRef, worker: &Worker) -> Step {
    match catch_unwind(AssertUnwindSafe(|| frame.resume(worker))) {
        Ok(step) => step,
        Err(payload) => fail_contained(frame, payload),
    }
}

/// Converts an escaped panic into the frame's terminal result.
///
/// A frame that panicked with forked children still outstanding cannot fail
/// this way: its children hold pointers into its result slots, teardown
/// cannot proceed, and the process aborts instead. The guard extends the
/// abort to a second panic raised by `fail` itself.
#[cold]
fn fail_contained(frame: FrameRef, payload: Panic) -> Step {
    let guard = AbortOnDrop;
    assert_eq!(
        frame.header().outstanding(),
        0,
        "frame panicked with outstanding children"
    );
    frame.fail(payload);
    mem::forget(guard);
    Step::Done
}

/// Re-raises a payload taken out of a result slot, on the thread that
/// observed it.
#[cold]
pub(crate) fn rethrow(payload: Panic) -> ! {
    resume_unwind(payload)
}

/// Aborts the program when dropped.
struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("tine: a panic escaped the frame protocol; aborting");
        abort();
    }
}
