//! Selector: synchronous readiness queries over a kernel queue.
//!
//! A [`Selector`] answers "which registered descriptors are ready now, or
//! within `T`". One thread selects at a time; other threads may change
//! interest ([`SelectionKey::set_interest`]), cancel keys, or call
//! [`Selector::wakeup`] concurrently. Interest changes are queued and only
//! applied by the selecting thread, before and after the blocking poll.
//!
//! A descriptor registered for both filters can produce two kernel records
//! in one poll. A poll-generation counter makes sure such a key is counted
//! once, and that its ready set is merged rather than replaced.

mod key;

pub use key::{Ops, SelectionKey};

use crate::error::{Error, Result};
use crate::event::{EventFlags, Filter, Interest, PollArray};
use crate::queue::KernelQueue;
use crate::sys::{sys_close, sys_drain, sys_pipe, sys_write1};
use key::Updates;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default number of records fetched by a single select.
pub const DEFAULT_SELECT_CAPACITY: usize = 256;

/// State owned by the selecting thread.
struct SelectState {
    array: PollArray,
    fd_to_key: HashMap<RawFd, Arc<SelectionKey>>,
    selected: HashMap<RawFd, Arc<SelectionKey>>,
    poll_count: u64,
}

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectorStats {
    /// Bytes written to the interrupt pipe by [`Selector::wakeup`].
    pub wakeup_bytes_written: usize,
    /// Bytes drained from the interrupt pipe.
    pub wakeup_bytes_drained: usize,
    /// Kernel poll calls, retries included.
    pub polls: usize,
}

/// A kqueue-style selector.
pub struct Selector<Q: KernelQueue> {
    queue: Q,
    state: Mutex<SelectState>,
    registry: Mutex<HashMap<RawFd, Arc<SelectionKey>>>,
    updates: Arc<Updates>,

    /// Whether an interrupt byte is pending in the pipe.
    interrupt: Mutex<bool>,
    read_fd: RawFd,
    write_fd: RawFd,

    closed: AtomicBool,
    written: AtomicUsize,
    drained: AtomicUsize,
    polls: AtomicUsize,
}

impl<Q: KernelQueue> Selector<Q> {
    pub fn new(queue: Q) -> Result<Self> {
        Self::with_capacity(queue, DEFAULT_SELECT_CAPACITY)
    }

    /// Creates a selector whose poll array holds `capacity` records.
    pub fn with_capacity(queue: Q, capacity: usize) -> Result<Self> {
        let (read_fd, write_fd) = sys_pipe().map_err(|e| Error::os("create interrupt pipe", e))?;

        if let Err(e) = queue.register(read_fd, Filter::Read, EventFlags::ADD) {
            sys_close(read_fd);
            sys_close(write_fd);
            return Err(Error::os("register interrupt pipe", e));
        }

        Ok(Self {
            queue,
            state: Mutex::new(SelectState {
                array: PollArray::with_capacity(capacity),
                fd_to_key: HashMap::new(),
                selected: HashMap::new(),
                poll_count: 0,
            }),
            registry: Mutex::new(HashMap::new()),
            updates: Arc::new(Updates::default()),
            interrupt: Mutex::new(false),
            read_fd,
            write_fd,
            closed: AtomicBool::new(false),
            written: AtomicUsize::new(0),
            drained: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ClosedSelector)
        }
    }

    /// Registers `fd` with interest `ops`.
    ///
    /// Registering a descriptor twice returns the existing key with its
    /// interest updated.
    pub fn register(&self, fd: RawFd, ops: Ops) -> Result<Arc<SelectionKey>> {
        self.ensure_open()?;

        let key = {
            let mut registry = self.registry.lock();
            registry
                .entry(fd)
                .or_insert_with(|| SelectionKey::new(fd, &self.updates))
                .clone()
        };

        key.set_interest(ops)?;
        Ok(key)
    }

    /// Changes the interest set of `key`. Applied at the next select.
    pub fn set_interest(&self, key: &Arc<SelectionKey>, ops: Ops) -> Result<()> {
        self.ensure_open()?;
        key.set_interest(ops)
    }

    /// Cancels `key` and removes its kernel registrations right away.
    ///
    /// Waits for a select in progress, but not for its
    /// [`select_with`](Self::select_with) actions. Deregistering a key that
    /// is already gone is a no-op.
    pub fn deregister(&self, key: &Arc<SelectionKey>) {
        key.cancel();

        let mut state = self.state.lock();
        self.impl_dereg(&mut state, key);
    }

    /// Valid keys registered with this selector.
    pub fn keys(&self) -> Vec<Arc<SelectionKey>> {
        self.registry
            .lock()
            .values()
            .filter(|k| k.is_valid())
            .cloned()
            .collect()
    }

    /// Keys selected since the selected set was last cleared.
    pub fn selected_keys(&self) -> Vec<Arc<SelectionKey>> {
        self.state.lock().selected.values().cloned().collect()
    }

    /// Removes one key from the selected set.
    pub fn remove_selected(&self, key: &SelectionKey) -> bool {
        self.state.lock().selected.remove(&key.fd()).is_some()
    }

    pub fn clear_selected(&self) {
        self.state.lock().selected.clear();
    }

    /// Blocks until a key is selected, [`wakeup`](Self::wakeup) is called,
    /// or `timeout` elapses. `None` waits indefinitely.
    ///
    /// Returns the number of keys whose ready set was updated.
    pub fn select(&self, timeout: Option<Duration>) -> Result<usize> {
        self.do_select(None, timeout)
    }

    /// Non-blocking select.
    pub fn select_now(&self) -> Result<usize> {
        self.do_select(None, Some(Duration::ZERO))
    }

    /// Like [`select`](Self::select), but hands each ready key to `action`
    /// instead of adding it to the selected set.
    ///
    /// Actions run once the poll is processed and the selector is unlocked,
    /// so they may deregister keys or close the selector.
    pub fn select_with<F>(&self, mut action: F, timeout: Option<Duration>) -> Result<usize>
    where
        F: FnMut(&Arc<SelectionKey>),
    {
        let action: &mut dyn FnMut(&Arc<SelectionKey>) = &mut action;
        self.do_select(Some(action), timeout)
    }

    /// Interrupts a blocked or the next select.
    ///
    /// Writes to the interrupt pipe only if no interrupt is pending, so any
    /// number of calls before the next select leave a single byte. Fails
    /// with [`Error::ClosedSelector`] once the selector is closed.
    pub fn wakeup(&self) -> Result<()> {
        let mut triggered = self.interrupt.lock();

        if !self.is_open() {
            return Err(Error::ClosedSelector);
        }

        self.trigger(&mut triggered)
    }

    fn trigger(&self, triggered: &mut bool) -> Result<()> {
        if !*triggered {
            sys_write1(self.write_fd).map_err(|e| Error::os("write interrupt pipe", e))?;
            self.written.fetch_add(1, Ordering::Relaxed);
            *triggered = true;
        }

        Ok(())
    }

    /// Closes the selector, deregistering every key. Idempotent.
    ///
    /// May be called from a [`select_with`](Self::select_with) action.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.updates.closed.store(true, Ordering::Release);

        // Unblock a select in progress, then wait for it to finish.
        if let Err(e) = self.trigger(&mut self.interrupt.lock()) {
            warn!(error = %e, "failed to interrupt select on close");
        }

        let mut state = self.state.lock();

        // No select can clear this any more; keeps the closed pipe untouched.
        *self.interrupt.lock() = true;

        let keys: Vec<_> = self.registry.lock().values().cloned().collect();

        for key in &keys {
            key.invalidate();
            self.impl_dereg(&mut state, key);
        }

        self.updates.cancelled.lock().clear();
        self.updates.changed.lock().clear();

        self.queue.close();
        sys_close(self.read_fd);
        sys_close(self.write_fd);

        debug!(keys = keys.len(), "selector closed");
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            wakeup_bytes_written: self.written.load(Ordering::Relaxed),
            wakeup_bytes_drained: self.drained.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
        }
    }

    fn do_select(
        &self,
        action: Option<&mut dyn FnMut(&Arc<SelectionKey>)>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        self.ensure_open()?;

        self.process_deregister_queue(&mut state);
        self.process_update_queue(&mut state);

        let timed = timeout.is_some_and(|t| !t.is_zero());
        let mut remaining = timeout;

        let count = loop {
            let start = Instant::now();
            self.polls.fetch_add(1, Ordering::Relaxed);

            match self.queue.poll(&mut state.array, remaining) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if let (true, Some(left)) = (timed, remaining) {
                        let left = left.saturating_sub(start.elapsed());
                        if left.is_zero() {
                            state.array.clear();
                            break 0;
                        }
                        remaining = Some(left);
                    }
                }
                Err(e) => return Err(Error::os("poll kernel queue", e)),
            }
        };

        self.process_update_queue(&mut state);
        self.process_deregister_queue(&mut state);

        let Some(action) = action else {
            return Ok(self.process_events(&mut state, count, None));
        };

        let mut ready = Vec::new();
        let updated = self.process_events(&mut state, count, Some(&mut ready));
        drop(state);

        // Actions may re-enter the selector.
        for key in &ready {
            action(key);
        }

        Ok(updated)
    }

    /// Applies queued interest changes, diffing against what the kernel
    /// queue already has for each key.
    fn process_update_queue(&self, state: &mut SelectState) {
        let changed: Vec<_> = self.updates.changed.lock().drain(..).collect();

        for key in changed {
            if !key.is_valid() {
                continue;
            }

            let fd = key.fd();
            state.fd_to_key.entry(fd).or_insert_with(|| key.clone());

            let wanted = key.interest_ops().to_interest();
            let mut registered = key.registered_interest();

            if key.take_reset() && !registered.is_empty() {
                for filter in Filter::ALL {
                    self.unregister(fd, filter);
                }
                registered = Interest::empty();
            }

            for filter in Filter::ALL {
                let bit = Interest::from(filter);

                match (registered.contains(bit), wanted.contains(bit)) {
                    (true, false) => {
                        self.unregister(fd, filter);
                        registered.remove(bit);
                    }
                    (false, true) => match self.queue.register(fd, filter, EventFlags::ADD) {
                        Ok(()) => registered.insert(bit),
                        Err(e) => warn!(fd, ?filter, error = %e, "kevent add failed"),
                    },
                    _ => {}
                }
            }

            key.set_registered(registered);
        }
    }

    fn process_deregister_queue(&self, state: &mut SelectState) {
        let cancelled: Vec<_> = self.updates.cancelled.lock().drain(..).collect();

        for key in cancelled {
            self.impl_dereg(state, &key);
        }
    }

    /// Removes every kernel registration of `key` and forgets it.
    fn impl_dereg(&self, state: &mut SelectState, key: &Arc<SelectionKey>) {
        let fd = key.fd();

        {
            let mut registry = self.registry.lock();
            if registry.get(&fd).is_some_and(|k| Arc::ptr_eq(k, key)) {
                registry.remove(&fd);
            }
        }

        state.selected.remove(&fd);

        if state.fd_to_key.remove(&fd).is_some() {
            for filter in key.registered_interest().filters() {
                self.unregister(fd, filter);
            }
            key.set_registered(Interest::empty());
        }
    }

    fn unregister(&self, fd: RawFd, filter: Filter) {
        // A closed descriptor has already left the kernel queue.
        if let Err(e) = self.queue.register(fd, filter, EventFlags::DELETE) {
            trace!(fd, ?filter, error = %e, "kevent delete ignored");
        }
    }

    /// Merges the polled records into the keys' ready sets.
    ///
    /// Keys that became ready go to `ready` when given, and to the selected
    /// set otherwise.
    fn process_events(
        &self,
        state: &mut SelectState,
        count: usize,
        mut ready: Option<&mut Vec<Arc<SelectionKey>>>,
    ) -> usize {
        state.poll_count += 1;
        let generation = state.poll_count;

        let mut updated = 0;
        let mut interrupted = false;

        for i in 0..count {
            let event = *state.array.get(i);

            if event.ident == self.read_fd as u64 {
                interrupted = true;
                continue;
            }

            let fd = event.ident as RawFd;
            let Some(key) = state.fd_to_key.get(&fd).cloned() else {
                continue;
            };

            let ops = key.translate(&event);
            let merge = key.last_polled() == generation;

            let changed = match ready.as_deref_mut() {
                Some(ready) => {
                    let changed = if merge {
                        key.update_ready(ops)
                    } else {
                        key.set_ready(ops)
                    };
                    if changed && !ready.iter().any(|k| Arc::ptr_eq(k, &key)) {
                        ready.push(key.clone());
                    }
                    changed
                }
                None if state.selected.contains_key(&fd) => key.update_ready(ops),
                None => {
                    let ready = key.set_ready(ops);
                    if ready {
                        state.selected.insert(fd, key.clone());
                    }
                    ready
                }
            };

            if changed && !merge {
                updated += 1;
            }
            if changed {
                key.set_last_polled(generation);
            }
        }

        if interrupted {
            self.clear_interrupt();
        }

        trace!(count, updated, "select processed");
        updated
    }

    fn clear_interrupt(&self) {
        let mut triggered = self.interrupt.lock();

        match sys_drain(self.read_fd) {
            Ok(n) => {
                self.drained.fetch_add(n, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "failed to drain interrupt pipe"),
        }

        *triggered = false;
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
))]
impl Selector<crate::queue::Kqueue> {
    /// Opens a selector on a fresh kqueue.
    pub fn open() -> Result<Self> {
        let queue = crate::queue::Kqueue::new(DEFAULT_SELECT_CAPACITY)?;
        Self::new(queue)
    }
}

impl<Q: KernelQueue> Drop for Selector<Q> {
    fn drop(&mut self) {
        self.close();
    }
}
