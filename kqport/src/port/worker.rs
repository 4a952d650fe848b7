use super::{PendingEvent, PendingQueue, Shared, Task};
use crate::queue::KernelQueue;

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

/// Result of running user code (a task or a channel callback) on a worker.
enum Occupancy {
    /// The code returned; the worker carries on.
    Returned,

    /// The code panicked. The worker leaves the loop and must be replaced.
    Panicked(Box<dyn Any + Send>),
}

/// Why a worker left its dispatch loop.
enum Exit {
    /// An `ExecuteTaskOrShutdown` found no task.
    Shutdown,

    /// The kernel queue failed with something other than `EINTR`.
    PollFailed(io::Error),

    /// User code panicked; the panic is resumed once the exit is accounted.
    Replace(Box<dyn Any + Send>),
}

/// Re-posts the poll token when the poller leaves, on every path.
struct Repost<'a>(&'a PendingQueue<PendingEvent>);

impl Drop for Repost<'_> {
    fn drop(&mut self) {
        self.0.put(PendingEvent::NeedToPoll);
    }
}

fn occupy(f: impl FnOnce()) -> Occupancy {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Occupancy::Returned,
        Err(payload) => Occupancy::Panicked(payload),
    }
}

impl<Q: KernelQueue> Shared<Q> {
    /// Worker thread body.
    pub(super) fn run_worker(self: Arc<Self>, on_pool: bool) {
        debug!(on_pool, "worker started");

        let exit = self.dispatch(on_pool);

        let replace = match &exit {
            Exit::Shutdown => {
                debug!("worker observed shutdown");
                false
            }
            Exit::PollFailed(e) => {
                error!(error = %e, "kernel poll failed, worker exiting");
                false
            }
            Exit::Replace(_) => {
                warn!("worker lost to a panic");
                true
            }
        };

        self.thread_exit(replace, on_pool);

        if let Exit::Replace(payload) = exit {
            panic::resume_unwind(payload);
        }
    }

    /// `AWAIT_WORK → {POLLING, EXECUTE_OR_SHUTDOWN, DELIVER_EVENT}` loop.
    fn dispatch(&self, on_pool: bool) -> Exit {
        loop {
            let mut event = self.pending.take();

            if let PendingEvent::NeedToPoll = event {
                event = match self.poll() {
                    Ok(event) => event,
                    Err(e) => return Exit::PollFailed(e),
                };
            }

            let occupancy = match event {
                PendingEvent::NeedToPoll => continue,

                PendingEvent::ExecuteTaskOrShutdown => match self.next_task() {
                    Some(task) => occupy(task),
                    None => return Exit::Shutdown,
                },

                PendingEvent::Ready { channel, ready } => {
                    trace!(?ready, "delivering readiness");
                    occupy(|| channel.on_event(ready, on_pool))
                }
            };

            if let Occupancy::Panicked(payload) = occupancy {
                return Exit::Replace(payload);
            }
        }
    }

    /// Pops the task matching a wakeup, or `None` for a shutdown signal.
    ///
    /// A submitter signals before it pushes, holding the lifecycle lock
    /// across both; taking that lock settles an in-flight submission.
    fn next_task(&self) -> Option<Task> {
        self.tasks.pop().or_else(|| {
            let _lifecycle = self.lifecycle.lock();
            self.tasks.pop()
        })
    }

    /// Polls the kernel queue until at least one deliverable event exists.
    ///
    /// All but the last event are queued for other workers; the last one is
    /// returned to the caller. The poll token is re-posted on every path.
    fn poll(&self) -> io::Result<PendingEvent> {
        let _repost = Repost(&self.pending);

        let mut slot = self.poll_array.lock();
        let Some(array) = slot.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port is closed"));
        };

        let wakeup_fd = self.wakeup.read_fd() as u64;

        loop {
            loop {
                match self.queue.poll(array, None) {
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            let mut batch: Vec<PendingEvent> = Vec::with_capacity(array.len());
            let mut by_fd: HashMap<RawFd, usize> = HashMap::new();

            {
                let channels = self.channels.read();

                for raw in array.iter() {
                    if raw.ident == wakeup_fd {
                        match self.wakeup.consume() {
                            Ok(true) => batch.push(PendingEvent::ExecuteTaskOrShutdown),
                            Ok(false) => {}
                            // The wakeup was accounted; only the drain failed.
                            Err(e) => {
                                error!(error = %e, "failed to drain wakeup pipe");
                                batch.push(PendingEvent::ExecuteTaskOrShutdown);
                            }
                        }
                        continue;
                    }

                    let fd = raw.ident as RawFd;
                    let bit = raw.filter.ready();

                    let Some(registration) = channels.get(&fd) else {
                        trace!(fd, "event for detached descriptor dropped");
                        continue;
                    };

                    let armed = registration.armed.fetch_and(!bit.bits(), Ordering::AcqRel);
                    if armed & bit.bits() == 0 {
                        trace!(fd, filter = ?raw.filter, "stale event dropped");
                        continue;
                    }

                    match by_fd.get(&fd) {
                        Some(&i) => {
                            if let PendingEvent::Ready { ready, .. } = &mut batch[i] {
                                *ready |= bit;
                            }
                        }
                        None => {
                            by_fd.insert(fd, batch.len());
                            batch.push(PendingEvent::Ready {
                                channel: registration.channel.clone(),
                                ready: bit,
                            });
                        }
                    }
                }
            }

            trace!(count = batch.len(), "poll batch decoded");

            if let Some(last) = batch.pop() {
                for event in batch {
                    self.pending.put(event);
                }
                return Ok(last);
            }
        }
    }

    /// Accounts for a worker leaving the loop.
    ///
    /// A worker lost to a panic is replaced by a fresh thread; otherwise the
    /// live-thread count drops and the last thread out after shutdown
    /// releases the port.
    fn thread_exit(self: &Arc<Self>, replace: bool, on_pool: bool) {
        if replace {
            match self.spawn_worker(on_pool) {
                Ok(()) => {
                    self.replacements.fetch_add(1, Ordering::AcqRel);
                    return;
                }
                Err(e) => error!(error = %e, "failed to spawn replacement worker"),
            }
        }

        let remaining = self.threads.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(remaining, "worker exited");

        if remaining == 0 && self.is_shutdown() {
            self.release();
        }
    }
}
