//! Per-worker victim selection.

use rand::RngCore;
use rand_xoshiro::Xoshiro256StarStar;

use crate::platform::UnsafeCell;

/// A worker's private xoshiro256** state, used to pick steal victims.
///
/// The pool seeds one generator from entropy and separates the workers'
/// states with `long_jump`, so the streams are independent without any
/// cross-thread traffic.
pub(crate) struct VictimRng {
    state: UnsafeCell<Xoshiro256StarStar>,
}

// SAFETY: Only the owning worker draws from the generator.
unsafe impl Sync for VictimRng {}

impl VictimRng {
    pub fn new(state: Xoshiro256StarStar) -> VictimRng {
        VictimRng {
            state: UnsafeCell::new(state),
        }
    }

    /// Draws a uniform value in `0..n`.
    ///
    /// # Safety
    ///
    /// Only the owning worker may call this.
    pub unsafe fn next_below(&self, n: usize) -> usize {
        debug_assert!(n > 0);
        // SAFETY: The owner is the only thread that touches the state.
        let state_ptr = self.state.get_mut();
        let state = unsafe { state_ptr.deref() };
        (state.next_u64() % n as u64) as usize
    }
}
