//! The worker pool: OS threads, wake/sleep coordination, the steal loop, and
//! root-task submission.
//!
//! The pool is deliberately simple about sleeping: a single futex word, the
//! root-in-flight flag, is the only thing workers ever park on. While a root
//! task is in flight every worker is either running frames or stealing.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;
use std::thread;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use tracing::debug;
use tracing::trace;

use crate::deque::StealDeque;
use crate::frame::Frame;
use crate::frame::FrameRef;
use crate::frame::Join;
use crate::frame::Slot;
use crate::frame::Step;
use crate::inbox::Inbox;
use crate::platform::*;
use crate::rng::VictimRng;
use crate::unwind;

// -----------------------------------------------------------------------------
// Pool types

/// The number of consecutive failed steals a worker attempts before it
/// re-checks its loop condition. A tunable; nothing may depend on its exact
/// value.
pub const STEAL_ATTEMPTS: usize = 1024;

/// Futex values for the root-in-flight flag.
const CLEAR: u32 = 0;
const SET: u32 = 1;

/// Per-worker shared state. Exactly one thread at a time acts as the owner of
/// a context: sole pusher/popper of the deque, sole consumer of the inbox,
/// sole user of the prng. Thieves only ever touch the deque's steal end.
struct WorkerContext {
    deque: StealDeque<FrameRef>,
    inbox: Inbox,
    rng: VictimRng,
}

struct PoolInner {
    contexts: Box<[WorkerContext]>,
    /// The futex word every worker parks on. Set while a root task is in
    /// flight.
    root_in_flight: AtomicU32,
    /// The shutdown latch, set once by the pool's destructor.
    stop: AtomicBool,
    /// Round-robin cursor for routing external submissions.
    next_inbox: AtomicUsize,
}

impl PoolInner {
    /// The root's terminal path. Clearing the flag with release ordering is
    /// what lets `sync_wait` observe the root's result.
    fn complete_root(&self) {
        trace!("root task completes");
        self.root_in_flight.store(CLEAR, Ordering::Release);
    }
}

/// A fixed-size pool of work-stealing workers.
///
/// Worker 0 is the submitting thread itself for the duration of a
/// [`Pool::sync_wait`]; the remaining workers get their own OS threads,
/// parked whenever no root task is in flight and joined on drop.
pub struct Pool {
    inner: Arc<PoolInner>,
    threads: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Creates a pool with one worker per available hardware thread.
    pub fn new() -> Pool {
        let workers = available_parallelism().map(NonZero::get).unwrap_or(1);
        Pool::with_workers(workers)
    }

    /// Creates a pool with exactly `workers` workers. Panics if `workers`
    /// is zero.
    pub fn with_workers(workers: usize) -> Pool {
        assert!(workers >= 1, "a pool needs at least one worker");
        debug!(workers, "starting pool");

        // One entropy seed, long-jump-separated per worker, so the victim
        // streams are independent without any cross-thread traffic.
        let mut rng = Xoshiro256StarStar::from_rng(&mut rand::rng());
        let contexts = (0..workers)
            .map(|_| {
                let context = WorkerContext {
                    deque: StealDeque::default(),
                    inbox: Inbox::new(),
                    rng: VictimRng::new(rng.clone()),
                };
                rng.long_jump();
                context
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new(PoolInner {
            contexts,
            root_in_flight: AtomicU32::new(CLEAR),
            stop: AtomicBool::new(false),
            next_inbox: AtomicUsize::new(0),
        });

        // Worker 0 is the submitting thread during `sync_wait`, so only
        // workers 1..n get threads.
        let threads = (1..workers)
            .map(|index| {
                let pool = Arc::clone(&inner);
                ThreadBuilder::new()
                    .name(format!("worker {index}"))
                    .spawn(move || worker_loop(pool, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Pool { inner, threads }
    }

    /// Runs `root` to completion, blocking the calling thread, and returns
    /// the value the root left in `result`. The calling thread acts as
    /// worker 0, executing and stealing work until the root's terminal path
    /// clears the in-flight flag. A root panic is re-raised here.
    ///
    /// Panics if a root task is already in flight on this pool; in
    /// particular, `sync_wait` must not be called from inside a running
    /// frame.
    pub fn sync_wait<F, T>(&self, root: &F, result: &Slot<T>) -> T
    where
        F: Frame + 'static,
        T: Send,
    {
        let previous = self.inner.root_in_flight.swap(SET, Ordering::AcqRel);
        assert_eq!(
            previous, CLEAR,
            "a root task is already in flight on this pool"
        );
        trace!("waking workers");
        atomic_wait::wake_all(&self.inner.root_in_flight);

        // SAFETY: `root` is borrowed for the whole call, and the call does
        // not return until the root's terminal path has cleared the in-flight
        // flag, after which the scheduler never touches the frame again.
        let frame = unsafe { FrameRef::caller_owned(root) };

        let worker = Worker::new(Arc::clone(&self.inner), 0);
        trace!("root task starts");
        worker.resume_as_root(frame);
        worker.steal_until(|| self.inner.root_in_flight.load(Ordering::Acquire) == CLEAR);

        // SAFETY: The flag cleared, so the root completed and filled its
        // slot, and nothing will write it again.
        match unsafe { result.take() } {
            Ok(value) => value,
            Err(payload) => unwind::rethrow(payload),
        }
    }

    /// Hands a frame to a worker (round-robin) through its inbox, for the
    /// worker to enqueue onto its own deque, and wakes the pool. This is the
    /// submission path for callers outside any worker thread: link the frame
    /// into a running tree first with [`FrameRef::adopt`]. External
    /// submissions only make progress while a root task is in flight.
    pub fn submit_external(&self, frame: Box<dyn Frame>) {
        let frame = FrameRef::from_heap(frame);
        let workers = self.inner.contexts.len();
        let chosen = self.inner.next_inbox.fetch_add(1, Ordering::Relaxed) % workers;
        trace!(worker = chosen, "external submission");
        self.inner.contexts[chosen].inbox.push(frame);
        atomic_wait::wake_all(&self.inner.root_in_flight);
    }

    /// The number of workers in the pool.
    pub fn workers(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Whether no root task is in flight and every worker's deque is empty.
    pub fn is_idle(&self) -> bool {
        self.inner.root_in_flight.load(Ordering::Acquire) == CLEAR
            && self
                .inner
                .contexts
                .iter()
                .all(|context| context.deque.is_empty())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        debug!("shutting down pool");

        // Request a stop, then set the flag once more and broadcast so every
        // parked worker wakes up to see the request.
        self.inner.stop.store(true, Ordering::Release);
        self.inner.root_in_flight.store(SET, Ordering::Release);
        atomic_wait::wake_all(&self.inner.root_in_flight);

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }

        // Undelivered external submissions never ran; release them now that
        // no thread can race us. The contexts, and every retired deque
        // buffer, die with the last `Arc`, strictly after the workers have
        // stopped.
        for context in self.inner.contexts.iter() {
            for frame in context.inbox.pop_all() {
                if frame.header().is_owned() {
                    // SAFETY: Never resumed, unreachable, and the handle dies
                    // here.
                    unsafe { frame.release() };
                }
            }
        }

        debug!("pool shut down");
    }
}

// -----------------------------------------------------------------------------
// Worker

/// A thread's capability to act as one of a pool's workers. This is what a
/// frame's `resume` receives, and it carries the fork/call/join primitives.
pub struct Worker {
    pool: Arc<PoolInner>,
    index: usize,
    /// The frame currently being resumed on this worker, which fork/call/join
    /// operate on.
    current: Cell<Option<FrameRef>>,
}

impl Worker {
    fn new(pool: Arc<PoolInner>, index: usize) -> Worker {
        Worker {
            pool,
            index,
            current: Cell::new(None),
        }
    }

    /// The index of this worker within its pool.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    fn context(&self) -> &WorkerContext {
        &self.pool.contexts[self.index]
    }

    /// Enqueues `child` for parallel execution and returns immediately; the
    /// current frame continues inline. The child becomes an outstanding child
    /// of the current frame, settled at the next [`Worker::join`]. Panics if
    /// called outside a running frame.
    pub fn fork(&self, child: Box<dyn Frame>) {
        let parent = self.current.get().expect("fork outside a running frame");
        parent.adopt(child.as_ref());
        let child = FrameRef::from_heap(child);
        // SAFETY: This worker owns its deque.
        unsafe { self.context().deque.push(child) };
    }

    /// Executes `child` inline on this worker, with no deque traffic. The
    /// child is linked exactly like a forked one, so a child that suspends at
    /// its own join is still accounted for at the current frame's join; one
    /// that completes inline leaves no trace. Panics if called outside a
    /// running frame.
    pub fn call(&self, child: Box<dyn Frame>) {
        let parent = self.current.get().expect("call outside a running frame");
        parent.adopt(child.as_ref());
        self.run_frame(FrameRef::from_heap(child));
    }

    /// Arms the current frame's join point. On [`Join::Ready`] every child
    /// has completed and the frame continues inline; on [`Join::Pending`] the
    /// frame must return [`Step::Pending`] without touching its own state
    /// again, and the last child to complete resumes it, on whichever worker
    /// observes the count reach zero. The frame must have set its resume
    /// point before calling this. Panics if called outside a running frame.
    #[must_use]
    pub fn join(&self) -> Join {
        let frame = self.current.get().expect("join outside a running frame");
        frame.header().arm_join()
    }

    /// Resumes a frame and walks the completion chain it produces: a frame
    /// that finishes releases itself into its parent's counter, and if that
    /// was the last outstanding child of a suspended parent, the parent is
    /// resumed here (`resume_as_child` in protocol terms).
    fn run_frame(&self, frame: FrameRef) {
        let mut frame = frame;
        loop {
            let enclosing = self.current.replace(Some(frame));
            let step = unwind::resume_contained(frame, self);
            self.current.set(enclosing);

            match step {
                Step::Pending => return,
                Step::Done => {
                    let header = frame.header();
                    let parent = header.parent();
                    let owned = header.is_owned();

                    let Some(parent) = parent else {
                        if owned {
                            // A parentless fire-and-forget frame.
                            //
                            // SAFETY: `Done` is terminal; the handle dies
                            // here.
                            unsafe { frame.release() };
                        } else {
                            // The root; its terminal path ends the
                            // `sync_wait`.
                            self.pool.complete_root();
                        }
                        return;
                    };

                    if owned {
                        // SAFETY: `Done` is terminal; the result slot was
                        // filled first, so the parent no longer needs the
                        // child.
                        unsafe { frame.release() };
                    }

                    if parent.header().complete_child() {
                        // This worker zeroed the counter of a suspended
                        // parent, so it adopts the resumption.
                        trace!("resuming joined parent");
                        frame = parent;
                        continue;
                    }

                    return;
                }
            }
        }
    }

    /// Runs a frame, then drains the local deque: finish what we started
    /// before taking on anything new.
    fn run_to_idle(&self, frame: FrameRef) {
        self.run_frame(frame);
        // SAFETY: This worker owns its deque.
        while let Some(next) = unsafe { self.context().deque.pop() } {
            self.run_frame(next);
        }
    }

    fn resume_as_root(&self, frame: FrameRef) {
        self.run_to_idle(frame);
    }

    fn resume_as_stolen(&self, frame: FrameRef) {
        frame.header().record_stealer(self.index);
        trace!(worker = self.index, "resuming stolen work");
        self.run_to_idle(frame);
        debug_assert!(
            self.context().deque.is_empty(),
            "should have no work left after a stolen resume"
        );
    }

    /// Moves externally submitted frames from the inbox onto the deque, then
    /// runs them.
    fn drain_inbox(&self) {
        for frame in self.context().inbox.pop_all() {
            // SAFETY: This worker owns its deque.
            unsafe { self.context().deque.push(frame) };
        }
        // SAFETY: This worker owns its deque.
        while let Some(frame) = unsafe { self.context().deque.pop() } {
            self.run_frame(frame);
        }
    }

    /// Steals (and runs) work until `done` reports true. Between rounds of
    /// [`STEAL_ATTEMPTS`] consecutive failures the worker yields the CPU, but
    /// it never sleeps here: the only wake path is the root-in-flight futex,
    /// handled by the worker loop.
    fn steal_until<P>(&self, done: P)
    where
        P: Fn() -> bool,
    {
        let workers = self.pool.contexts.len();
        while !done() {
            self.drain_inbox();

            if workers == 1 {
                // Nothing to steal from; only the predicate and the inbox can
                // change.
                thread::yield_now();
                continue;
            }

            let mut attempts = 0;
            while attempts < STEAL_ATTEMPTS {
                // A victim uniformly at random among the *other* workers.
                //
                // SAFETY: The victim prng belongs to this worker.
                let draw = unsafe { self.context().rng.next_below(workers - 1) };
                let victim = if draw >= self.index { draw + 1 } else { draw };

                match self.pool.contexts[victim].deque.steal() {
                    Some(frame) => {
                        attempts = 0;
                        self.resume_as_stolen(frame);
                    }
                    None => attempts += 1,
                }
            }
            thread::yield_now();
        }
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

fn worker_loop(pool: Arc<PoolInner>, index: usize) {
    let worker = Worker::new(Arc::clone(&pool), index);
    loop {
        // Park until a root task is in flight.
        while pool.root_in_flight.load(Ordering::Acquire) == CLEAR {
            if pool.stop.load(Ordering::Relaxed) {
                trace!("worker returns");
                return;
            }
            atomic_wait::wait(&pool.root_in_flight, CLEAR);
        }

        trace!("worker wakes");

        // If the destructor woke us, exit.
        if pool.stop.load(Ordering::Relaxed) {
            trace!("worker returns");
            return;
        }

        trace!("worker works");

        worker.steal_until(|| {
            pool.root_in_flight.load(Ordering::Acquire) == CLEAR
                || pool.stop.load(Ordering::Relaxed)
        });
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeader;
    use crate::frame::Panic;
    use crate::frame::SlotRef;

    /// A frame with no children: it writes a constant and finishes.
    struct Leaf {
        header: FrameHeader,
        value: u64,
        out: SlotRef<u64>,
    }

    impl Leaf {
        fn new(value: u64, out: SlotRef<u64>) -> Leaf {
            Leaf {
                header: FrameHeader::new(),
                value,
                out,
            }
        }
    }

    impl Frame for Leaf {
        fn header(&self) -> &FrameHeader {
            &self.header
        }

        fn resume(&self, _worker: &Worker) -> Step {
            // SAFETY: This frame's terminal write into its parent's live
            // slot.
            unsafe { self.out.fill(Ok(self.value)) };
            Step::Done
        }

        fn fail(&self, payload: Panic) {
            // SAFETY: As in `resume`.
            unsafe { self.out.fill(Err(payload)) };
        }
    }

    #[test]
    fn leaf_root() {
        let pool = Pool::with_workers(2);
        let result = Slot::new();
        let root = Leaf::new(17, result.slot_ref());
        assert_eq!(pool.sync_wait(&root, &result), 17);
        assert!(pool.is_idle());
        // The root never touches a deque, so no thief ever claimed it.
        assert_eq!(root.header.stealer(), None);
    }

    #[test]
    fn single_worker_pool() {
        let pool = Pool::with_workers(1);
        let result = Slot::new();
        let root = Leaf::new(3, result.slot_ref());
        assert_eq!(pool.sync_wait(&root, &result), 3);
    }

    #[test]
    fn default_pool_size() {
        let pool = Pool::new();
        assert!(pool.workers() >= 1);
    }
}
