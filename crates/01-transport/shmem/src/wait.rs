//! Native wait cells living inside shared memory.
//!
//! Two backings implement [`NativeWait`]:
//! * [`SpinCell`] – an atomic flag polled with `spin_loop`/`yield_now`; portable and
//!   cheap to signal, at the cost of burning CPU while waiting.
//! * [`OsCell`] – a process-shared pthread mutex and condition variable; waiters sleep
//!   in the kernel until signalled or the deadline passes.
//!
//! Both store their auto-reset flag inside the cell so a peer attaching later learns
//! it from memory. Loom tests swap the spin cell's atomics for model-checked ones.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::segment::SharedLayout;
use crate::ShmemResult;

mod os;
mod spin;

pub use os::OsCell;
pub use spin::SpinCell;

/// Marker stored in the high half of a cell's flag word once initialized.
pub(crate) const CELL_MAGIC: u32 = 0x5348_0000;
pub(crate) const CELL_MAGIC_MASK: u32 = 0xFFFF_0000;
pub(crate) const FLAG_AUTO_RESET: u32 = 0x1;

pub(crate) fn cell_flags(auto_reset: bool) -> u32 {
    CELL_MAGIC | if auto_reset { FLAG_AUTO_RESET } else { 0 }
}

pub(crate) fn is_initialized(flags: u32) -> bool {
    flags & CELL_MAGIC_MASK == CELL_MAGIC
}

/// Wait/signal primitive placed in shared memory.
pub trait NativeWait: SharedLayout {
    /// Initializes the cell in place, unsignalled.
    fn init(&self, auto_reset: bool) -> ShmemResult<()>;

    /// Whether [`NativeWait::init`] has run on this memory.
    fn is_initialized(&self) -> bool;

    fn auto_reset(&self) -> bool;

    /// Waits up to `timeout` for a signal. With auto-reset the signal is consumed.
    fn try_wait(&self, timeout: Duration) -> ShmemResult<bool>;

    fn signal(&self) -> ShmemResult<()>;

    /// Resets to unsignalled without waking anyone.
    fn clear(&self) -> ShmemResult<()>;

    fn is_signaled(&self) -> bool;
}

/// Backing selected for every condition of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LockStrategy {
    /// Process-shared pthread mutex and condition variable.
    Os = 0,
    /// Atomic flag polled with backoff.
    #[default]
    Spin = 1,
}

impl LockStrategy {
    /// Bytes one cell of this strategy occupies in a segment (a multiple of 8).
    pub fn backing_size(self) -> usize {
        match self {
            LockStrategy::Os => std::mem::size_of::<OsCell>(),
            LockStrategy::Spin => std::mem::size_of::<SpinCell>(),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(LockStrategy::Os),
            1 => Some(LockStrategy::Spin),
            _ => None,
        }
    }
}
