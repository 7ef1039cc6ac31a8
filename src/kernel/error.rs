//! Kernel error taxonomy
//!
//! Every fallible operation in the kernel returns one of these. None of
//! them is fatal to the kernel itself; the only destructive operation is
//! an explicit `abort`.

use thiserror::Error;

/// Errors reported by kernel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A blocking operation's deadline elapsed before its condition held
    #[error("timed out before the condition was satisfied")]
    Timeout,

    /// The object is in the wrong state for this operation
    /// (unlock by a non-owner, resume of a non-suspended thread,
    /// abort of an already-dead thread, ...)
    #[error("object is in the wrong state for this operation")]
    InvalidState,

    /// A count or buffer is already at its configured maximum
    #[error("capacity exceeded")]
    CapacityExceeded,

    /// No live object behind that handle
    #[error("no such object")]
    NotFound,

    /// A malformed argument (zero capacity, out-of-range priority,
    /// wrong message size, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Shorthand result type used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;
