//! Kernel event queue abstraction.
//!
//! A [`KernelQueue`] is the only component that talks to the OS readiness
//! primitive. It owns the queue descriptor and nothing else: no threads,
//! no registration bookkeeping. The port and the selector are generic over
//! it so that the instrumented [`LabQueue`] can stand in for the kernel.
//!
//! The concrete kqueue backend is selected at compile time on the BSD
//! family. Other Unix targets only get the lab queue.

pub mod lab;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
))]
mod kqueue;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
))]
pub use kqueue::{Kqueue, NativeConstants, init, native_constants};

pub use lab::LabQueue;

use crate::event::{EventFlags, Filter, PollArray};

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// A BSD-style kernel event queue.
///
/// Implementations must be usable from several threads at once:
/// registrations may race with a poll in progress, which is how kqueue
/// itself behaves. Only one thread polls a given [`PollArray`] at a time.
pub trait KernelQueue: Send + Sync + 'static {
    /// Adds, re-arms or removes interest in `filter` for `ident`.
    ///
    /// The documented flag combinations are not expected to fail once the
    /// queue exists; an error here is reported to the caller unchanged.
    fn register(&self, ident: RawFd, filter: Filter, flags: EventFlags) -> io::Result<()>;

    /// Waits for ready events and decodes them into `events`.
    ///
    /// `Some(Duration::ZERO)` returns immediately, `None` blocks until an
    /// event arrives. Returns the number of records written. A signal
    /// interruption is reported as [`io::ErrorKind::Interrupted`] and the
    /// caller is expected to retry.
    fn poll(&self, events: &mut PollArray, timeout: Option<Duration>) -> io::Result<usize>;

    /// Releases the queue descriptor. Calling it more than once is a no-op.
    fn close(&self);
}

impl<Q: KernelQueue> KernelQueue for std::sync::Arc<Q> {
    fn register(&self, ident: RawFd, filter: Filter, flags: EventFlags) -> io::Result<()> {
        (**self).register(ident, filter, flags)
    }

    fn poll(&self, events: &mut PollArray, timeout: Option<Duration>) -> io::Result<usize> {
        (**self).poll(events, timeout)
    }

    fn close(&self) {
        (**self).close()
    }
}
