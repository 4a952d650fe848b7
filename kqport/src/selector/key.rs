use crate::error::{Error, Result};
use crate::event::{EventFlags, Filter, Interest, RawEvent};

use bitflags::bitflags;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

bitflags! {
    /// Operations a [`SelectionKey`] can be interested in or ready for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Ops: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 2;
        const CONNECT = 1 << 3;
        const ACCEPT = 1 << 4;
    }
}

impl Ops {
    /// Operations satisfied by the read filter.
    const READ_SIDE: Ops = Ops::READ.union(Ops::ACCEPT);

    /// Operations satisfied by the write filter.
    const WRITE_SIDE: Ops = Ops::WRITE.union(Ops::CONNECT);

    /// Kernel filters needed to observe these operations.
    pub fn to_interest(self) -> Interest {
        let mut interest = Interest::empty();

        if self.intersects(Self::READ_SIDE) {
            interest |= Interest::READ;
        }
        if self.intersects(Self::WRITE_SIDE) {
            interest |= Interest::WRITE;
        }

        interest
    }

    /// Operations within `self` that `filter` satisfies.
    pub fn ready_for(self, filter: Filter) -> Ops {
        match filter {
            Filter::Read => self & Self::READ_SIDE,
            Filter::Write => self & Self::WRITE_SIDE,
        }
    }
}

/// Interest changes and cancellations waiting for the selecting thread.
#[derive(Default)]
pub(crate) struct Updates {
    pub(crate) changed: Mutex<VecDeque<Arc<SelectionKey>>>,
    pub(crate) cancelled: Mutex<Vec<Arc<SelectionKey>>>,
    pub(crate) closed: AtomicBool,
}

/// Registration of a descriptor with a [`Selector`](super::Selector).
///
/// Interest changes made through [`set_interest`](Self::set_interest) are
/// queued and applied by the selecting thread before and after its next
/// poll.
pub struct SelectionKey {
    fd: RawFd,
    interest: AtomicU32,
    ready: AtomicU32,
    valid: AtomicBool,
    reset: AtomicBool,

    /// Filters registered with the kernel queue. Selector-lock protected.
    registered: AtomicU32,

    /// Poll generation in which the ready set was last touched.
    last_polled: AtomicU64,

    attachment: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    updates: Weak<Updates>,
}

impl SelectionKey {
    pub(crate) fn new(fd: RawFd, updates: &Arc<Updates>) -> Arc<Self> {
        Arc::new(Self {
            fd,
            interest: AtomicU32::new(0),
            ready: AtomicU32::new(0),
            valid: AtomicBool::new(true),
            reset: AtomicBool::new(false),
            registered: AtomicU32::new(0),
            last_polled: AtomicU64::new(0),
            attachment: Mutex::new(None),
            updates: Arc::downgrade(updates),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn interest_ops(&self) -> Ops {
        Ops::from_bits_truncate(self.interest.load(Ordering::Acquire))
    }

    pub fn ready_ops(&self) -> Ops {
        Ops::from_bits_truncate(self.ready.load(Ordering::Acquire))
    }

    pub fn is_readable(&self) -> bool {
        self.ready_ops().contains(Ops::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.ready_ops().contains(Ops::WRITE)
    }

    pub fn is_acceptable(&self) -> bool {
        self.ready_ops().contains(Ops::ACCEPT)
    }

    pub fn is_connectable(&self) -> bool {
        self.ready_ops().contains(Ops::CONNECT)
    }

    /// Filters currently registered with the kernel queue for this key.
    pub fn registered_interest(&self) -> Interest {
        Interest::from_bits_truncate(self.registered.load(Ordering::Acquire))
    }

    /// Changes the interest set. Takes effect at the next select.
    pub fn set_interest(self: &Arc<Self>, ops: Ops) -> Result<()> {
        let updates = self.updates.upgrade().ok_or(Error::ClosedSelector)?;

        if updates.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedSelector);
        }
        if !self.is_valid() {
            return Err(Error::CancelledKey);
        }

        self.interest.store(ops.bits(), Ordering::Release);
        updates.changed.lock().push_back(self.clone());

        Ok(())
    }

    /// Cancels the key. Its kernel registrations are removed at the next
    /// select. Cancelling twice is a no-op.
    pub fn cancel(self: &Arc<Self>) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(updates) = self.updates.upgrade() {
            updates.cancelled.lock().push(self.clone());
        }
    }

    /// Marks the underlying socket as reset: every registered filter is
    /// dropped before the next interest update is applied.
    pub fn reset(self: &Arc<Self>) -> Result<()> {
        self.reset.store(true, Ordering::Release);
        self.set_interest(self.interest_ops())
    }

    /// Attaches an arbitrary object, returning the previous one.
    pub fn attach(
        &self,
        object: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        std::mem::replace(&mut *self.attachment.lock(), object)
    }

    pub fn attachment(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attachment.lock().clone()
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_registered(&self, interest: Interest) {
        self.registered.store(interest.bits(), Ordering::Release);
    }

    pub(crate) fn last_polled(&self) -> u64 {
        self.last_polled.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_polled(&self, generation: u64) {
        self.last_polled.store(generation, Ordering::Release);
    }

    /// Operations reported ready by a kernel record.
    ///
    /// An error record makes every interest operation ready so the owner
    /// notices the failure on its next I/O call.
    pub(crate) fn translate(&self, event: &RawEvent) -> Ops {
        let interest = self.interest_ops();

        if event.flags.contains(EventFlags::ERROR) {
            return interest;
        }

        interest.ready_for(event.filter)
    }

    /// Replaces the ready set. Returns `true` if any interest op is ready.
    pub(crate) fn set_ready(&self, ops: Ops) -> bool {
        self.ready.store(ops.bits(), Ordering::Release);
        ops.intersects(self.interest_ops())
    }

    /// Merges into the ready set. Returns `true` if the set grew.
    pub(crate) fn update_ready(&self, ops: Ops) -> bool {
        let previous = Ops::from_bits_truncate(self.ready.fetch_or(ops.bits(), Ordering::AcqRel));
        !previous.contains(ops)
    }
}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("fd", &self.fd)
            .field("valid", &self.is_valid())
            .field("interest", &self.interest_ops())
            .field("ready", &self.ready_ops())
            .field("registered", &self.registered_interest())
            .finish()
    }
}
