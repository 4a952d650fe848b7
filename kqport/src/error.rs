//! Error types shared by the port and the selector.

use crate::event::Filter;

use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`Port`](crate::Port) and [`Selector`](crate::Selector).
///
/// An interrupted poll is never reported here: pollers retry
/// [`io::ErrorKind::Interrupted`] transparently.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A kernel resource (queue, pipe, thread) could not be allocated.
    #[error("failed to {op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A well-formed registration was refused by the kernel queue.
    #[error("kevent registration failed for fd {fd} ({filter:?}): {source}")]
    Internal {
        fd: RawFd,
        filter: Filter,
        #[source]
        source: io::Error,
    },

    /// The port has been shut down and no longer accepts work.
    #[error("port is shut down")]
    RejectedExecution,

    /// The selector has been closed.
    #[error("selector is closed")]
    ClosedSelector,

    /// The selection key has been cancelled.
    #[error("selection key is cancelled")]
    CancelledKey,
}

impl Error {
    /// Wraps an OS error raised while performing `op`.
    #[inline]
    pub(crate) fn os(op: &'static str, source: io::Error) -> Self {
        Self::Os { op, source }
    }

    /// Returns `true` for errors caused by using a closed port or selector.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::RejectedExecution | Self::ClosedSelector)
    }
}
