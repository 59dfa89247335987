//! A lock-free multi-producer, single-consumer stack of frames.
//!
//! Each worker owns one inbox, through which code running *outside* the
//! worker's thread hands it frames to enqueue onto its own deque. The stack
//! is intrusive: the links are embedded in the frame headers, so pushing
//! allocates nothing.

use core::ptr;
use core::ptr::NonNull;

use crate::frame::FrameHeader;
use crate::frame::FrameRef;
use crate::platform::AtomicPtr;
use crate::platform::Ordering;

pub(crate) struct Inbox {
    head: AtomicPtr<FrameHeader>,
}

impl Inbox {
    pub fn new() -> Inbox {
        Inbox {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes a frame onto the stack. Any thread may call this, concurrently
    /// with other pushes and with the owner's `pop_all`.
    pub fn push(&self, frame: FrameRef) {
        let node = frame.header_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is the live header of `frame`, and until the CAS
            // below publishes it, this producer is the only thread touching
            // its link.
            unsafe { (*node).set_next(head) };

            // Release publishes the frame (and its link) to the consumer.
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(stale) => head = stale,
            }
        }
    }

    /// Detaches the entire chain, leaving the stack empty. Only the owning
    /// worker may call this. The chain yields frames in LIFO order.
    pub fn pop_all(&self) -> Chain {
        // Acquire pairs with the release CAS in `push` (consume in the
        // published protocol; acquire is the closest ordering Rust exposes).
        let head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        Chain {
            node: NonNull::new(head),
        }
    }
}

/// A privately-owned chain detached from an [`Inbox`].
pub(crate) struct Chain {
    node: Option<NonNull<FrameHeader>>,
}

impl Iterator for Chain {
    type Item = FrameRef;

    fn next(&mut self) -> Option<FrameRef> {
        let node = self.node?;
        // SAFETY: Frames on a detached chain are live: nothing can resume (or
        // free) them until this iterator yields them.
        let header = unsafe { node.as_ref() };
        // The link must be read before the frame is handed off, because
        // enqueueing or resuming the frame can free it.
        self.node = NonNull::new(header.next());
        Some(header.this())
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    use super::*;
    use crate::frame::Frame;
    use crate::frame::Panic;
    use crate::frame::Step;
    use crate::pool::Worker;

    /// A frame that only exists to be threaded through an inbox.
    struct Node {
        header: FrameHeader,
    }

    impl Frame for Node {
        fn header(&self) -> &FrameHeader {
            &self.header
        }

        fn resume(&self, _worker: &Worker) -> Step {
            unreachable!("inbox tests never resume their frames")
        }

        fn fail(&self, _payload: Panic) {
            unreachable!("inbox tests never resume their frames")
        }
    }

    fn node() -> FrameRef {
        FrameRef::from_heap(Box::new(Node {
            header: FrameHeader::new(),
        }))
    }

    #[test]
    fn pop_all_yields_lifo_and_empties_the_stack() {
        let inbox = Inbox::new();
        let frames = (0..3).map(|_| node()).collect::<Vec<_>>();
        for &frame in &frames {
            inbox.push(frame);
        }

        let drained = inbox.pop_all().map(|f| f.header_ptr()).collect::<Vec<_>>();
        let expected = frames
            .iter()
            .rev()
            .map(|f| f.header_ptr())
            .collect::<Vec<_>>();
        assert_eq!(drained, expected);
        assert!(inbox.pop_all().next().is_none());

        // A drained inbox accepts new pushes.
        let late = node();
        inbox.push(late);
        assert_eq!(inbox.pop_all().count(), 1);

        for frame in frames.into_iter().chain([late]) {
            // SAFETY: The frame was never delivered to a worker, and the
            // handle dies here.
            unsafe { frame.release() };
        }
    }
}
