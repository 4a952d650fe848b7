//! Event port: readiness fan-out across a pool of worker threads.
//!
//! A [`Port`] owns a kernel queue, a wakeup pipe, a bounded queue of
//! pending events and a set of worker threads. Exactly one worker at a time
//! holds the "need to poll" token and blocks in the kernel queue; when it
//! returns it hands all but one of the ready events to other workers and
//! delivers the last one itself.
//!
//! Channels attach themselves with [`PortHandle::attach`] and arm one-shot
//! readiness with [`PortHandle::register_channel`]. Each armed filter is
//! delivered at most once; the channel re-registers for the next event.

mod builder;
mod pending;
mod wakeup;
mod worker;

pub use builder::{DEFAULT_POLL_CAPACITY, INTERNAL_THREADS_ENV, PortBuilder};

use crate::error::{Error, Result};
use crate::event::{EventFlags, Interest, PollArray, Ready};
use crate::queue::KernelQueue;
use pending::PendingQueue;
use wakeup::WakeupState;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A unit of work executed on a port thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Receiver of readiness notifications.
///
/// `on_event` runs on whichever worker dequeued the event; implementations
/// must not assume a fixed thread.
pub trait Channel: Send + Sync {
    /// Called with the filters that fired since the last registration.
    ///
    /// `on_pool_thread` is `true` when the calling worker is one of the
    /// pooled threads rather than an internal one.
    fn on_event(&self, ready: Ready, on_pool_thread: bool);

    /// Called by [`PortHandle::shutdown_now`] after the channel is detached.
    fn close(&self) {}
}

/// Work item handed between workers.
pub(crate) enum PendingEvent {
    /// Some idle worker must enter the kernel poll.
    NeedToPoll,

    /// Run one queued task, or exit if none remains.
    ExecuteTaskOrShutdown,

    /// Deliver readiness to a channel.
    Ready {
        channel: Arc<dyn Channel>,
        ready: Ready,
    },
}

/// An attached channel and the filters currently armed for it.
struct Registration {
    channel: Arc<dyn Channel>,
    armed: AtomicU32,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: bool,
    closed: bool,
}

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Wakeups requested (task submissions and shutdown signals).
    pub wakeups: usize,
    /// Bytes written to the wakeup pipe.
    pub bytes_written: usize,
    /// Bytes drained from the wakeup pipe.
    pub bytes_drained: usize,
    /// Times the port's resources were released.
    pub releases: usize,
    /// Worker threads spawned to replace a thread lost to a panic.
    pub replacements: usize,
}

pub(crate) struct Shared<Q> {
    queue: Q,
    poll_array: Mutex<Option<PollArray>>,
    wakeup: WakeupState,
    pending: PendingQueue<PendingEvent>,
    tasks: SegQueue<Task>,
    channels: RwLock<HashMap<RawFd, Registration>>,
    lifecycle: Mutex<Lifecycle>,
    terminated: Condvar,
    threads: AtomicUsize,
    next_thread: AtomicUsize,
    thread_name: String,
    releases: AtomicUsize,
    replacements: AtomicUsize,
}

impl<Q: KernelQueue> Shared<Q> {
    fn new(queue: Q, builder: &PortBuilder) -> Result<Arc<Self>> {
        let wakeup = WakeupState::new().map_err(|e| Error::os("create wakeup pipe", e))?;

        queue
            .register(wakeup.read_fd(), crate::event::Filter::Read, EventFlags::ADD)
            .map_err(|e| Error::os("register wakeup pipe", e))?;

        let pending = PendingQueue::new(builder.poll_capacity + 1);
        pending.put(PendingEvent::NeedToPoll);

        Ok(Arc::new(Self {
            queue,
            poll_array: Mutex::new(Some(PollArray::with_capacity(builder.poll_capacity))),
            wakeup,
            pending,
            tasks: SegQueue::new(),
            channels: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            terminated: Condvar::new(),
            threads: AtomicUsize::new(0),
            next_thread: AtomicUsize::new(0),
            thread_name: builder.thread_name.clone(),
            releases: AtomicUsize::new(0),
            replacements: AtomicUsize::new(0),
        }))
    }

    /// Starts `internal` non-pooled and `pooled` pooled workers.
    fn start(self: &Arc<Self>, internal: usize, pooled: usize) -> Result<()> {
        let kinds = (0..internal).map(|_| false).chain((0..pooled).map(|_| true));

        for on_pool in kinds {
            self.threads.fetch_add(1, Ordering::AcqRel);

            if let Err(e) = self.spawn_worker(on_pool) {
                self.threads.fetch_sub(1, Ordering::AcqRel);
                self.shutdown();
                return Err(Error::os("spawn worker thread", e));
            }
        }

        debug!(
            internal,
            pooled,
            threads = self.threads.load(Ordering::Acquire),
            "port started"
        );

        Ok(())
    }

    /// Spawns one worker thread. The live-thread count is managed by the caller.
    fn spawn_worker(self: &Arc<Self>, on_pool: bool) -> std::io::Result<()> {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let shared = self.clone();

        thread::Builder::new()
            .name(format!("{}-{id}", self.thread_name))
            .spawn(move || shared.run_worker(on_pool))?;

        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.lifecycle.lock().shutdown
    }

    /// Requests shutdown: one wakeup per live thread, or an immediate
    /// release when no thread is left.
    fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.shutdown {
            return;
        }
        lifecycle.shutdown = true;

        let threads = self.threads.load(Ordering::Acquire);
        debug!(threads, "port shutting down");

        if threads == 0 {
            drop(lifecycle);
            self.release();
            return;
        }

        // Held across the signals so release cannot close the pipe under us.
        for _ in 0..threads {
            if let Err(e) = self.wakeup.signal() {
                error!(error = %e, "failed to signal worker for shutdown");
            }
        }
    }

    /// Releases the kernel queue, the poll array and the wakeup pipe.
    ///
    /// Runs at most once.
    fn release(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return;
            }
            lifecycle.closed = true;
        }

        self.queue.close();
        self.poll_array.lock().take();
        self.wakeup.close();
        self.releases.fetch_add(1, Ordering::AcqRel);

        debug!("port resources released");
        self.terminated.notify_all();
    }
}

/// Cloneable handle to a running port.
pub struct PortHandle<Q: KernelQueue> {
    shared: Arc<Shared<Q>>,
}

impl<Q: KernelQueue> Clone for PortHandle<Q> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Q: KernelQueue> PortHandle<Q> {
    /// Associates `fd` with `channel`. Replaces any previous association.
    ///
    /// Fails with [`Error::RejectedExecution`] once the port is shut down.
    pub fn attach(&self, fd: RawFd, channel: Arc<dyn Channel>) -> Result<()> {
        if self.shared.is_shutdown() {
            return Err(Error::RejectedExecution);
        }

        self.shared.channels.write().insert(
            fd,
            Registration {
                channel,
                armed: AtomicU32::new(0),
            },
        );

        Ok(())
    }

    /// Removes the channel associated with `fd`, if any.
    ///
    /// Events still queued for the channel are delivered; later kernel
    /// events for `fd` are dropped.
    pub fn detach(&self, fd: RawFd) -> Option<Arc<dyn Channel>> {
        self.shared
            .channels
            .write()
            .remove(&fd)
            .map(|registration| registration.channel)
    }

    /// Arms one-shot readiness for `fd`: one kernel registration per
    /// requested filter, read first, each with `ADD | ONESHOT`.
    pub fn register_channel(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let shared = &self.shared;

        if shared.lifecycle.lock().closed {
            return Err(Error::RejectedExecution);
        }

        let channels = shared.channels.write();
        let registration = channels.get(&fd);

        for filter in interest.filters() {
            if let Some(registration) = registration {
                registration
                    .armed
                    .fetch_or(filter.ready().bits(), Ordering::AcqRel);
            }

            if let Err(source) = shared
                .queue
                .register(fd, filter, EventFlags::ADD | EventFlags::ONESHOT)
            {
                if let Some(registration) = registration {
                    registration
                        .armed
                        .fetch_and(!filter.ready().bits(), Ordering::AcqRel);
                }

                error!(fd, ?filter, error = %source, "kevent registration failed");
                return Err(Error::Internal { fd, filter, source });
            }
        }

        Ok(())
    }

    /// Filters currently armed for `fd`.
    pub fn registered_interest(&self, fd: RawFd) -> Ready {
        self.shared
            .channels
            .read()
            .get(&fd)
            .map(|r| Ready::from_bits_truncate(r.armed.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Queues `task` for execution on a port thread.
    ///
    /// Fails with [`Error::RejectedExecution`] once the port is closed. If
    /// the wakeup cannot be signalled the task is dropped, not queued.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let lifecycle = shared.lifecycle.lock();

        if lifecycle.closed {
            return Err(Error::RejectedExecution);
        }

        // Signal first: a failed signal leaves nothing queued. Workers that
        // find no task yet wait on the lifecycle lock held here.
        shared
            .wakeup
            .signal()
            .map_err(|e| Error::os("signal wakeup pipe", e))?;
        shared.tasks.push(Box::new(task));

        drop(lifecycle);
        Ok(())
    }

    /// Initiates shutdown. Worker threads finish their current work and
    /// exit; the last one releases the port's resources.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Shuts down after detaching and closing every attached channel.
    pub fn shutdown_now(&self) {
        let channels: Vec<_> = self
            .shared
            .channels
            .write()
            .drain()
            .map(|(_, registration)| registration.channel)
            .collect();

        debug!(channels = channels.len(), "closing attached channels");

        for channel in channels {
            channel.close();
        }

        self.shared.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// `true` once the port's resources have been released.
    pub fn is_terminated(&self) -> bool {
        self.shared.lifecycle.lock().closed
    }

    /// Number of live worker threads.
    pub fn thread_count(&self) -> usize {
        self.shared.threads.load(Ordering::Acquire)
    }

    /// Blocks until the port terminates or `timeout` elapses.
    ///
    /// Returns `true` if the port terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.shared.lifecycle.lock();

        while !lifecycle.closed {
            if self
                .shared
                .terminated
                .wait_until(&mut lifecycle, deadline)
                .timed_out()
            {
                return lifecycle.closed;
            }
        }

        true
    }

    pub fn stats(&self) -> PortStats {
        let shared = &self.shared;

        PortStats {
            wakeups: shared.wakeup.signals(),
            bytes_written: shared.wakeup.bytes_written(),
            bytes_drained: shared.wakeup.bytes_drained(),
            releases: shared.releases.load(Ordering::Acquire),
            replacements: shared.replacements.load(Ordering::Acquire),
        }
    }
}

/// A running event port.
///
/// Dereferences to a [`PortHandle`]; dropping the port initiates shutdown
/// without waiting for the workers.
pub struct Port<Q: KernelQueue> {
    handle: PortHandle<Q>,
}

impl<Q: KernelQueue> Port<Q> {
    fn from_shared(shared: Arc<Shared<Q>>) -> Self {
        Self {
            handle: PortHandle { shared },
        }
    }

    /// Creates a port with default settings on top of `queue`.
    pub fn new(queue: Q) -> Result<Self> {
        PortBuilder::new().build(queue)
    }

    pub fn builder() -> PortBuilder {
        PortBuilder::new()
    }

    /// Returns a cloneable handle, e.g. for channels that re-register.
    pub fn handle(&self) -> PortHandle<Q> {
        self.handle.clone()
    }
}

impl<Q: KernelQueue> Deref for Port<Q> {
    type Target = PortHandle<Q>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<Q: KernelQueue> Drop for Port<Q> {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}
