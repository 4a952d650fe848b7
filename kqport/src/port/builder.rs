use super::{Port, Shared};
use crate::error::Result;
use crate::queue::KernelQueue;

use std::env;
use std::thread;
use tracing::warn;

/// Environment variable read by [`PortBuilder::from_env`].
pub const INTERNAL_THREADS_ENV: &str = "KQPORT_INTERNAL_THREADS";

/// Default number of records fetched by a single poll.
pub const DEFAULT_POLL_CAPACITY: usize = 512;

/// Builder for configuring and starting a [`Port`].
///
/// # Examples
///
/// ```rust,ignore
/// let port = PortBuilder::new()
///     .worker_threads(4)
///     .build(LabQueue::new())?;
/// ```
#[derive(Clone, Debug)]
pub struct PortBuilder {
    /// Number of pooled worker threads.
    pub(crate) worker_threads: usize,

    /// Number of internal (non-pooled) worker threads.
    pub(crate) internal_threads: usize,

    /// Capacity of the poll array.
    pub(crate) poll_capacity: usize,

    /// Prefix for worker thread names.
    pub(crate) thread_name: String,
}

impl PortBuilder {
    /// Creates a builder with default configuration.
    ///
    /// By default the number of worker threads is the number of available
    /// logical CPUs, falling back to `1` if unavailable.
    pub fn new() -> Self {
        let worker_threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            worker_threads,
            internal_threads: 0,
            poll_capacity: DEFAULT_POLL_CAPACITY,
            thread_name: "kqport-worker".to_owned(),
        }
    }

    /// Creates a default builder, then applies [`INTERNAL_THREADS_ENV`].
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let builder = Self::new();

        match env::var(INTERNAL_THREADS_ENV) {
            Ok(raw) => match raw.trim().parse::<usize>() {
                Ok(n) => builder.internal_threads(n),
                Err(_) => {
                    warn!(value = %raw, "ignoring invalid {INTERNAL_THREADS_ENV}");
                    builder
                }
            },
            Err(_) => builder,
        }
    }

    /// Sets the number of pooled worker threads.
    ///
    /// Channels are told they run on a pool thread when their callback is
    /// invoked from one of these.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Sets the number of internal worker threads.
    pub fn internal_threads(mut self, n: usize) -> Self {
        self.internal_threads = n;
        self
    }

    /// Sets how many kernel events a single poll may return.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn poll_capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "poll_capacity must be > 0");

        self.poll_capacity = n;
        self
    }

    /// Sets the prefix used to name worker threads.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Total number of threads the port starts with.
    pub fn total_threads(&self) -> usize {
        self.worker_threads + self.internal_threads
    }

    /// Creates the port on top of `queue` and starts its threads.
    pub fn build<Q: KernelQueue>(self, queue: Q) -> Result<Port<Q>> {
        let shared = Shared::new(queue, &self)?;
        shared.start(self.internal_threads, self.worker_threads)?;

        Ok(Port::from_shared(shared))
    }

    /// Creates the port on a fresh kqueue.
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
    ))]
    pub fn build_kqueue(self) -> Result<Port<crate::queue::Kqueue>> {
        let queue = crate::queue::Kqueue::new(self.poll_capacity)?;
        self.build(queue)
    }
}

impl Default for PortBuilder {
    fn default() -> Self {
        Self::new()
    }
}
