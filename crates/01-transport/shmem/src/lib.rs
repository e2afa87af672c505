//! Shared-memory primitives for same-host, cross-process channels.
//!
//! * [`Segment`] – a named, file-backed mapping with bounds-checked [`ByteView`]s and
//!   a registry of dependents torn down before the mapping is released.
//! * [`Condition`] – a cross-process signal/wait flag backed by either a spin cell or a
//!   process-shared pthread mutex/condvar pair, selected through [`LockStrategy`].
//! * [`WaitPolicy`] / [`CancelToken`] – backoff tuning and cooperative cancellation.
//! * [`ProcessProvider`] – pid discovery and liveness probing.
//! * [`ShmemError`] – error surface shared by everything above.

#[cfg(not(unix))]
compile_error!("the shmem crate only supports unix targets");

mod backoff;
mod condition;
mod error;
pub mod exit;
mod mapping;
mod process;
mod segment;
pub mod wait;

pub use backoff::{millis, poll_until, Backoff, CancelToken, WaitPolicy};
pub use condition::{Condition, WaitTick};
pub use error::{Resource, ShmemError, ShmemResult};
pub use mapping::{default_dir, DIR_ENV};
pub use process::{OsProcessProvider, ProcessProvider};
pub use segment::{
    ByteView, Dependent, DependentId, Segment, SegmentOptions, SharedLayout, TeardownError,
    ViewGuard, ViewGuardMut,
};
pub use wait::{LockStrategy, NativeWait, OsCell, SpinCell};
