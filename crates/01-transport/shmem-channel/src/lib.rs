//! Zero-copy, rendezvous channel between two processes over a shared-memory segment.
//!
//! The segment holds a control block, five signal conditions and two data buffers:
//!
//! ```text
//! | control (64) | connect | server write | server read | client write | client read | server buf | client buf |
//! ```
//!
//! The process that creates the segment is the server and calls [`Channel::accept`];
//! the process that opens it is the client and calls [`Channel::connect`]. A
//! [`Connection`] then alternates turns: each side borrows its own buffer through a
//! [`WriteGuard`] and the peer's through a [`ReadGuard`], with no copies in between.
//! Peers are watched for liveness while waiting, so a crashed process closes the
//! connection instead of hanging the survivor.

mod address;
mod builder;
mod channel;
mod config;
mod connection;
mod control;
mod error;

pub use address::ChannelAddress;
pub use builder::ChannelBuilder;
pub use channel::{Channel, ChannelState, Role};
pub use config::ChannelConfig;
pub use connection::{Connection, ReadGuard, WriteGuard};
pub use error::{ChannelError, ChannelResult};

pub use shmem::{
    CancelToken, LockStrategy, OsProcessProvider, ProcessProvider, Segment, SegmentOptions,
    ShmemError, WaitPolicy,
};
