//! Concurrent producer/thief microtests for the work-stealing deque.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;

use tine::StealDeque;

/// One producer pushes `1..=ITEMS`, several thieves steal concurrently, and
/// the owner finally pops the remainder. The union of everything taken must
/// be exactly the pushed set: nothing lost, nothing duplicated, nothing
/// invented.
#[test]
fn producer_and_thieves_partition_the_items() {
    const ITEMS: u64 = 100_000;
    const THIEVES: usize = 4;

    let deque = StealDeque::new(64);
    let done = AtomicBool::new(false);

    let mut collected = thread::scope(|scope| {
        let mut thieves = Vec::new();
        for _ in 0..THIEVES {
            thieves.push(scope.spawn(|| {
                let mut taken = Vec::new();
                loop {
                    if let Some(value) = deque.steal() {
                        taken.push(value);
                    } else if done.load(Ordering::Acquire) {
                        break;
                    }
                }
                taken
            }));
        }

        for value in 1..=ITEMS {
            // SAFETY: This thread is the owner.
            unsafe { deque.push(value) };
        }

        let mut taken = Vec::new();
        // A pop returning `None` means the deque is empty for good: the owner
        // pushes nothing more.
        //
        // SAFETY: This thread is the owner.
        while let Some(value) = unsafe { deque.pop() } {
            taken.push(value);
        }
        done.store(true, Ordering::Release);

        for thief in thieves {
            taken.extend(thief.join().unwrap());
        }
        taken
    });

    collected.sort_unstable();
    assert_eq!(collected, (1..=ITEMS).collect::<Vec<_>>());
}

/// As above, but the owner interleaves pops with its pushes, exercising the
/// contended single-item path from both ends.
#[test]
fn owner_pops_while_thieves_steal() {
    const ITEMS: u64 = 50_000;
    const THIEVES: usize = 2;

    let deque = StealDeque::new(2);
    let done = AtomicBool::new(false);

    let mut collected = thread::scope(|scope| {
        let mut thieves = Vec::new();
        for _ in 0..THIEVES {
            thieves.push(scope.spawn(|| {
                let mut taken = Vec::new();
                loop {
                    if let Some(value) = deque.steal() {
                        taken.push(value);
                    } else if done.load(Ordering::Acquire) {
                        break;
                    }
                }
                taken
            }));
        }

        let mut taken = Vec::new();
        for value in 1..=ITEMS {
            // SAFETY: This thread is the owner.
            unsafe { deque.push(value) };
            if value % 3 == 0 {
                // SAFETY: This thread is the owner.
                if let Some(popped) = unsafe { deque.pop() } {
                    taken.push(popped);
                }
            }
        }
        // SAFETY: This thread is the owner.
        while let Some(value) = unsafe { deque.pop() } {
            taken.push(value);
        }
        done.store(true, Ordering::Release);

        for thief in thieves {
            taken.extend(thief.join().unwrap());
        }
        taken
    });

    collected.sort_unstable();
    assert_eq!(collected, (1..=ITEMS).collect::<Vec<_>>());
}
