//! Readiness vocabulary shared by the kernel queue, the port and the selector.
//!
//! The types here are platform neutral. Backends translate [`Filter`] and
//! [`EventFlags`] to the native `EVFILT_*` / `EV_*` values through the
//! constants table in [`crate::queue`].

use bitflags::bitflags;

/// What condition a registration watches for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    /// The descriptor has data to read (or a pending connection / EOF).
    #[default]
    Read,

    /// The descriptor has room to write.
    Write,
}

impl Filter {
    /// Both filters, in the order registrations are issued.
    pub const ALL: [Filter; 2] = [Filter::Read, Filter::Write];

    /// The ready bit reported when this filter fires.
    pub const fn ready(self) -> Ready {
        match self {
            Filter::Read => Ready::READ,
            Filter::Write => Ready::WRITE,
        }
    }
}

bitflags! {
    /// Action and status flags carried by a kernel event record.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u16 {
        /// Add the event, re-enabling it if it already exists.
        const ADD = 1 << 0;
        /// Remove the event.
        const DELETE = 1 << 1;
        /// Remove the event after it has been delivered once.
        const ONESHOT = 1 << 2;
        /// Reset the event state after it is retrieved (edge triggered).
        const CLEAR = 1 << 3;
        /// Filter-specific end-of-file condition (output only).
        const EOF = 1 << 4;
        /// Error while processing a change (output only).
        const ERROR = 1 << 5;
    }
}

bitflags! {
    /// Set of filters a caller wants to be notified about.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

bitflags! {
    /// Set of filters that fired for a descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Ready: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl Interest {
    /// Iterates the filters selected by this interest, read first.
    pub fn filters(self) -> impl Iterator<Item = Filter> {
        Filter::ALL
            .into_iter()
            .filter(move |f| self.contains(Interest::from(*f)))
    }

    /// Reinterprets the interest as the matching ready set.
    pub const fn as_ready(self) -> Ready {
        Ready::from_bits_retain(self.bits())
    }
}

impl From<Filter> for Interest {
    fn from(filter: Filter) -> Self {
        Interest::from_bits_retain(filter.ready().bits())
    }
}

/// One decoded kernel event record.
///
/// This is the typed counterpart of the native `struct kevent`: backends
/// copy the native buffer into these records field by field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RawEvent {
    /// Identifier of the event source, the file descriptor for read/write filters.
    pub ident: u64,
    pub filter: Filter,
    pub flags: EventFlags,
    /// Filter-specific data (bytes available, space in the send buffer, errno).
    pub data: i64,
    /// Opaque user tag, passed through unchanged.
    pub udata: u64,
}

impl RawEvent {
    pub fn new(ident: u64, filter: Filter, flags: EventFlags) -> Self {
        Self {
            ident,
            filter,
            flags,
            data: 0,
            udata: 0,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.flags.contains(EventFlags::EOF)
    }
}

/// Fixed-capacity buffer of [`RawEvent`]s filled by a poll.
///
/// The array is allocated once when the owning port or selector is created
/// and reused for every poll. Only `len()` entries are meaningful after a
/// poll returns.
#[derive(Debug)]
pub struct PollArray {
    events: Box<[RawEvent]>,
    len: usize,
}

impl PollArray {
    /// Allocates room for `capacity` records (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            events: vec![RawEvent::default(); capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    /// Number of records written by the last poll.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn get(&self, index: usize) -> &RawEvent {
        &self.events[index]
    }

    pub fn ident(&self, index: usize) -> u64 {
        self.events[index].ident
    }

    pub fn filter(&self, index: usize) -> Filter {
        self.events[index].filter
    }

    pub fn flags(&self, index: usize) -> EventFlags {
        self.events[index].flags
    }

    /// Records produced by the last poll.
    pub fn iter(&self) -> impl Iterator<Item = &RawEvent> {
        self.events[..self.len].iter()
    }

    /// Whole backing storage, for backends filling the array.
    pub fn slots_mut(&mut self) -> &mut [RawEvent] {
        &mut self.events
    }

    /// Marks the first `len` slots as valid. Clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.events.len());
        self.len = len.min(self.events.len());
    }

    /// Appends a record, returning `false` when the array is full.
    pub fn push(&mut self, event: RawEvent) -> bool {
        if self.len == self.events.len() {
            return false;
        }

        self.events[self.len] = event;
        self.len += 1;
        true
    }
}
