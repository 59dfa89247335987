//! Fork/join overhead benchmark: naive recursive Fibonacci, the workload
//! where scheduling overhead dominates actual work.

use std::panic::resume_unwind;

use divan::Bencher;
use tine::Frame;
use tine::FrameHeader;
use tine::Join;
use tine::Locals;
use tine::Panic;
use tine::Pool;
use tine::Slot;
use tine::SlotRef;
use tine::Step;
use tine::Worker;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// -----------------------------------------------------------------------------
// Workload

const N: &[u64] = &[12, 16, 20, 24];

fn fib_sequential(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib_sequential(n - 1) + fib_sequential(n - 2)
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Enter,
    Joined,
}

struct Fib {
    header: FrameHeader,
    stage: Locals<Stage>,
    n: u64,
    left: Slot<u64>,
    right: Slot<u64>,
    out: SlotRef<u64>,
}

impl Fib {
    fn new(n: u64, out: SlotRef<u64>) -> Fib {
        Fib {
            header: FrameHeader::new(),
            stage: Locals::new(Stage::Enter),
            n,
            left: Slot::new(),
            right: Slot::new(),
            out,
        }
    }
}

impl Frame for Fib {
    fn header(&self) -> &FrameHeader {
        &self.header
    }

    fn resume(&self, worker: &Worker) -> Step {
        loop {
            // SAFETY: A frame is resumed by one worker at a time.
            match unsafe { self.stage.get() } {
                Stage::Enter => {
                    if self.n < 2 {
                        // SAFETY: Terminal write into the parent's live slot.
                        unsafe { self.out.fill(Ok(self.n)) };
                        return Step::Done;
                    }
                    // SAFETY: A frame is resumed by one worker at a time.
                    unsafe { self.stage.set(Stage::Joined) };
                    worker.fork(Box::new(Fib::new(self.n - 1, self.left.slot_ref())));
                    worker.call(Box::new(Fib::new(self.n - 2, self.right.slot_ref())));
                    match worker.join() {
                        Join::Ready => continue,
                        Join::Pending => return Step::Pending,
                    }
                }
                Stage::Joined => {
                    // SAFETY: The join was passed, so both children completed.
                    let left = unsafe { self.left.take() }.unwrap_or_else(|p| resume_unwind(p));
                    let right = unsafe { self.right.take() }.unwrap_or_else(|p| resume_unwind(p));
                    // SAFETY: Terminal write into the parent's live slot.
                    unsafe { self.out.fill(Ok(left + right)) };
                    return Step::Done;
                }
            }
        }
    }

    fn fail(&self, payload: Panic) {
        // SAFETY: Terminal write into the parent's live slot.
        unsafe { self.out.fill(Err(payload)) };
    }
}

// -----------------------------------------------------------------------------
// Benchmarks

#[divan::bench(args = N)]
fn baseline(bencher: Bencher, n: u64) {
    let expected = fib_sequential(n);
    bencher.bench_local(move || {
        assert_eq!(fib_sequential(n), expected);
    });
}

#[divan::bench(args = N)]
fn tine(bencher: Bencher, n: u64) {
    let pool = Pool::new();
    let expected = fib_sequential(n);

    bencher.bench_local(move || {
        let result = Slot::new();
        let root = Fib::new(n, result.slot_ref());
        assert_eq!(pool.sync_wait(&root, &result), expected);
    });
}

#[divan::bench(args = N)]
fn rayon(bencher: Bencher, n: u64) {
    fn fib(n: u64) -> u64 {
        if n < 2 {
            n
        } else {
            let (left, right) = rayon::join(|| fib(n - 1), || fib(n - 2));
            left + right
        }
    }

    let expected = fib_sequential(n);

    bencher.bench_local(move || {
        assert_eq!(fib(n), expected);
    });
}

fn main() {
    let fmt_layer = fmt::layer()
        .without_time()
        .with_target(false)
        .with_thread_names(true)
        .compact();

    tracing_subscriber::registry().with(fmt_layer).init();

    divan::main();
}
