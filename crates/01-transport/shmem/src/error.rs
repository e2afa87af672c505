//! Error surface for shared-memory segments, views and conditions.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience result alias for fallible shared-memory operations.
pub type ShmemResult<T, E = ShmemError> = Result<T, E>;

/// Kind of object that was used after being destroyed.
///
/// Views have no lifetime of their own; a view of a closed segment reports `Segment`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Segment,
    Condition,
    Channel,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Segment => "segment",
            Resource::Condition => "condition",
            Resource::Channel => "channel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("range [{offset}, {offset}+{len}) is outside the {size} byte segment")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("{0} was destroyed")]
    Destroyed(Resource),

    #[error("wait was cancelled")]
    Cancelled,

    #[error("remote process {pid} exited without closing the channel")]
    RemoteProcessDied { pid: u64 },

    #[error("no initialized wait cell at offset {offset}")]
    Uninitialized { offset: usize },

    #[error("link {} already exists", .0.display())]
    LinkExists(PathBuf),

    #[error("{op} failed with code {code}")]
    Os { op: &'static str, code: i32 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ShmemError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ShmemError::InvalidArgument(msg.into())
    }

    pub(crate) fn os(op: &'static str, code: i32) -> Self {
        ShmemError::Os { op, code }
    }

    /// True for any [`ShmemError::Destroyed`] variant.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, ShmemError::Destroyed(_))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_resource() {
        let err = ShmemError::Destroyed(Resource::Condition);
        assert_eq!(err.to_string(), "condition was destroyed");
        assert!(err.is_destroyed());
        assert!(!ShmemError::Cancelled.is_destroyed());
        assert_eq!(
            ShmemError::Destroyed(Resource::Segment).to_string(),
            "segment was destroyed"
        );
        assert_eq!(
            ShmemError::Destroyed(Resource::Channel).to_string(),
            "channel was destroyed"
        );
    }

    #[test]
    fn out_of_bounds_reports_range() {
        let err = ShmemError::OutOfBounds {
            offset: 8,
            len: 16,
            size: 12,
        };
        assert_eq!(
            err.to_string(),
            "range [8, 8+16) is outside the 12 byte segment"
        );
    }
}
