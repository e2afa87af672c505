#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use std::time::{Duration, Instant};

use super::{cell_flags, is_initialized, NativeWait, FLAG_AUTO_RESET};
use crate::segment::SharedLayout;
use crate::ShmemResult;

const UNSIGNALED: u32 = 0;
const SIGNALED: u32 = 1;
const SPINS_BEFORE_YIELD: u32 = 64;

/// Eight-byte atomic wait cell.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct SpinCell {
    state: AtomicU32,
    flags: AtomicU32,
}

// SAFETY: two `AtomicU32`s, valid for every bit pattern and mutated only atomically.
unsafe impl SharedLayout for SpinCell {}

impl SpinCell {
    /// Builds an initialized cell outside shared memory.
    pub fn new(auto_reset: bool) -> Self {
        Self {
            state: AtomicU32::new(UNSIGNALED),
            flags: AtomicU32::new(cell_flags(auto_reset)),
        }
    }

    /// Single non-blocking check; consumes the signal when auto-reset.
    pub(crate) fn poll(&self) -> bool {
        if self.auto_reset() {
            self.state
                .compare_exchange(SIGNALED, UNSIGNALED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.state.load(Ordering::Acquire) == SIGNALED
        }
    }
}

impl NativeWait for SpinCell {
    fn init(&self, auto_reset: bool) -> ShmemResult<()> {
        self.state.store(UNSIGNALED, Ordering::Relaxed);
        self.flags.store(cell_flags(auto_reset), Ordering::Release);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        is_initialized(self.flags.load(Ordering::Acquire))
    }

    fn auto_reset(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_AUTO_RESET != 0
    }

    fn try_wait(&self, timeout: Duration) -> ShmemResult<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut spins = 0u32;
        loop {
            if self.poll() {
                return Ok(true);
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn signal(&self) -> ShmemResult<()> {
        self.state.store(SIGNALED, Ordering::Release);
        Ok(())
    }

    fn clear(&self) -> ShmemResult<()> {
        self.state.store(UNSIGNALED, Ordering::Release);
        Ok(())
    }

    fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }
}
