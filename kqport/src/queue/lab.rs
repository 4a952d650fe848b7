//! Instrumented in-process kernel queue.
//!
//! [`LabQueue`] follows kqueue semantics closely enough to drive a
//! [`Port`](crate::Port) or [`Selector`](crate::Selector) without a kernel
//! event queue:
//!
//! - registrations are kept per `(ident, filter)` and honour `ONESHOT`,
//! - *virtual* descriptors are made ready by the test with
//!   [`set_ready`](LabQueue::set_ready) (level triggered, or edge triggered
//!   with `CLEAR`),
//! - any other registered descriptor is treated as a real one and probed
//!   with `poll(2)`, which is how wakeup pipes reach the poller,
//! - interruptions and registration failures can be scripted,
//! - the number of threads inside [`poll`](KernelQueue::poll) is tracked so
//!   tests can assert that polling never overlaps.

use super::KernelQueue;
use crate::event::{EventFlags, Filter, PollArray, RawEvent};

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Longest single wait inside a lab poll before readiness is re-checked.
const SLICE: Duration = Duration::from_millis(5);

type Key = (u64, Filter);

#[derive(Default)]
struct LabState {
    interests: HashMap<Key, EventFlags>,
    virtual_fds: HashSet<u64>,
    ready: HashSet<Key>,
    forced: VecDeque<RawEvent>,
    interrupts: VecDeque<Duration>,
    register_failures: VecDeque<i32>,
    registrations: usize,
}

/// Deterministic stand-in for a kernel event queue.
#[derive(Default)]
pub struct LabQueue {
    state: Mutex<LabState>,
    changed: Condvar,
    pollers: AtomicUsize,
    max_pollers: AtomicUsize,
    polls: AtomicUsize,
    closed: AtomicBool,
}

impl LabQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `fd` as a virtual descriptor and returns it.
    ///
    /// Virtual descriptors are never probed with `poll(2)`; their readiness
    /// is whatever the test sets.
    pub fn virtual_fd(&self, fd: RawFd) -> RawFd {
        self.state.lock().virtual_fds.insert(fd as u64);
        fd
    }

    /// Marks a virtual descriptor ready for `filter`.
    pub fn set_ready(&self, fd: RawFd, filter: Filter) {
        let mut state = self.state.lock();
        state.virtual_fds.insert(fd as u64);
        state.ready.insert((fd as u64, filter));
        self.changed.notify_all();
    }

    /// Clears the readiness of a virtual descriptor.
    pub fn clear_ready(&self, fd: RawFd, filter: Filter) {
        self.state.lock().ready.remove(&(fd as u64, filter));
    }

    /// Queues a record that the next poll reports whether or not anything
    /// is registered for it, as a kernel reporting a stale event would.
    pub fn inject(&self, event: RawEvent) {
        self.state.lock().forced.push_back(event);
        self.changed.notify_all();
    }

    /// Makes the next poll sleep for `after` and then fail with `EINTR`.
    pub fn interrupt_next_poll(&self, after: Duration) {
        self.state.lock().interrupts.push_back(after);
    }

    /// Makes the next registration fail with `errno`.
    pub fn fail_next_register(&self, errno: i32) {
        self.state.lock().register_failures.push_back(errno);
    }

    /// Returns `true` while `fd` is registered for `filter`.
    pub fn is_registered(&self, fd: RawFd, filter: Filter) -> bool {
        self.state
            .lock()
            .interests
            .contains_key(&(fd as u64, filter))
    }

    /// Number of successful `register` calls so far.
    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    /// Number of `poll` calls so far.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::Acquire)
    }

    /// Largest number of threads observed inside `poll` at the same time.
    pub fn max_concurrent_polls(&self) -> usize {
        self.max_pollers.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Collects ready records from forced and virtual sources.
    ///
    /// Returns the real descriptors that still need probing.
    fn collect_virtual(&self, state: &mut LabState, events: &mut PollArray) -> Vec<Key> {
        while events.len() < events.capacity() {
            let Some(event) = state.forced.pop_front() else {
                break;
            };
            events.push(event);
        }

        let mut fired = Vec::new();
        let mut real = Vec::new();

        for (&key, &flags) in &state.interests {
            if !state.virtual_fds.contains(&key.0) {
                real.push(key);
                continue;
            }

            if state.ready.contains(&key) && events.len() < events.capacity() {
                events.push(RawEvent::new(key.0, key.1, flags & EventFlags::ONESHOT));
                fired.push((key, flags));
            }
        }

        for (key, flags) in fired {
            consume(state, key, flags);
        }

        real
    }

    /// Probes real descriptors with `poll(2)` for at most `wait`.
    fn probe_real(&self, keys: &[Key], events: &mut PollArray, wait: Duration) {
        let mut fds: Vec<libc::pollfd> = Vec::new();

        for &(ident, filter) in keys {
            let bit = match filter {
                Filter::Read => libc::POLLIN,
                Filter::Write => libc::POLLOUT,
            };

            match fds.iter_mut().find(|p| p.fd as u64 == ident) {
                Some(p) => p.events |= bit,
                None => fds.push(libc::pollfd {
                    fd: ident as RawFd,
                    events: bit,
                    revents: 0,
                }),
            }
        }

        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                wait.as_millis() as libc::c_int,
            )
        };
        if rc <= 0 {
            return;
        }

        let mut state = self.state.lock();
        for p in fds.iter().filter(|p| p.revents != 0) {
            let ident = p.fd as u64;

            if p.revents & libc::POLLNVAL != 0 {
                state.interests.retain(|key, _| key.0 != ident);
                continue;
            }

            let hangup = p.revents & (libc::POLLHUP | libc::POLLERR) != 0;

            for filter in Filter::ALL {
                let key = (ident, filter);
                let Some(&flags) = state.interests.get(&key) else {
                    continue;
                };

                let fired = match filter {
                    Filter::Read => p.revents & libc::POLLIN != 0 || hangup,
                    Filter::Write => p.revents & libc::POLLOUT != 0 || hangup,
                };

                if fired && events.len() < events.capacity() {
                    let mut out = flags & EventFlags::ONESHOT;
                    if hangup {
                        out |= EventFlags::EOF;
                    }
                    events.push(RawEvent::new(ident, filter, out));
                    consume(&mut state, key, flags);
                }
            }
        }
    }
}

fn consume(state: &mut LabState, key: Key, flags: EventFlags) {
    if flags.contains(EventFlags::ONESHOT) {
        state.interests.remove(&key);
    }
    if flags.contains(EventFlags::CLEAR) {
        state.ready.remove(&key);
    }
}

/// Tracks one thread inside `poll`.
struct PollGuard<'a>(&'a AtomicUsize);

impl<'a> PollGuard<'a> {
    fn enter(lab: &'a LabQueue) -> Self {
        let inside = lab.pollers.fetch_add(1, Ordering::AcqRel) + 1;
        lab.max_pollers.fetch_max(inside, Ordering::AcqRel);
        lab.polls.fetch_add(1, Ordering::AcqRel);
        PollGuard(&lab.pollers)
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl KernelQueue for LabQueue {
    fn register(&self, ident: RawFd, filter: Filter, flags: EventFlags) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let mut state = self.state.lock();

        if let Some(errno) = state.register_failures.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let key = (ident as u64, filter);

        if flags.contains(EventFlags::DELETE) {
            if state.interests.remove(&key).is_none() {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
        } else if flags.contains(EventFlags::ADD) {
            state
                .interests
                .insert(key, flags & (EventFlags::ONESHOT | EventFlags::CLEAR));
        }

        state.registrations += 1;
        self.changed.notify_all();
        Ok(())
    }

    fn poll(&self, events: &mut PollArray, timeout: Option<Duration>) -> io::Result<usize> {
        let _guard = PollGuard::enter(self);
        let deadline = timeout.map(|t| Instant::now() + t);

        events.clear();

        let interrupt = self.state.lock().interrupts.pop_front();
        if let Some(after) = interrupt {
            thread::sleep(after);
            return Err(io::Error::from_raw_os_error(libc::EINTR));
        }

        loop {
            if self.is_closed() {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }

            let wait = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(SLICE),
                None => SLICE,
            };

            let mut state = self.state.lock();
            let real = self.collect_virtual(&mut state, events);

            if real.is_empty() {
                if events.is_empty() && !wait.is_zero() {
                    self.changed.wait_for(&mut state, wait);
                }
            } else {
                drop(state);
                let wait = if events.is_empty() { wait } else { Duration::ZERO };
                self.probe_real(&real, events, wait);
            }

            if !events.is_empty() {
                return Ok(events.len());
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(0);
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.changed.notify_all();
    }
}
