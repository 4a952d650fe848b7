//! kqueue backend.
//!
//! Native filter and flag values are read from `libc` once, into a
//! process-wide [`NativeConstants`] table, together with the layout of
//! `struct kevent`. The table is validated on first use and never
//! mutated afterwards.

use super::KernelQueue;
use crate::error::{Error, Result};
use crate::event::{EventFlags, Filter, PollArray, RawEvent};
use crate::sys::{sys_close, sys_set_cloexec};

use parking_lot::Mutex;
use std::mem::{self, offset_of};
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::{io, ptr};
use tracing::debug;

static CONSTANTS: OnceLock<NativeConstants> = OnceLock::new();

/// Native `EVFILT_*` / `EV_*` values and the `struct kevent` layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeConstants {
    pub evfilt_read: i16,
    pub evfilt_write: i16,
    pub ev_add: u16,
    pub ev_delete: u16,
    pub ev_oneshot: u16,
    pub ev_clear: u16,
    pub ev_eof: u16,
    pub ev_error: u16,
    pub kevent_size: usize,
    pub ident_offset: usize,
    pub filter_offset: usize,
    pub flags_offset: usize,
    pub data_offset: usize,
    pub udata_offset: usize,
}

impl NativeConstants {
    fn from_libc() -> Self {
        Self {
            evfilt_read: libc::EVFILT_READ as i16,
            evfilt_write: libc::EVFILT_WRITE as i16,
            ev_add: libc::EV_ADD as u16,
            ev_delete: libc::EV_DELETE as u16,
            ev_oneshot: libc::EV_ONESHOT as u16,
            ev_clear: libc::EV_CLEAR as u16,
            ev_eof: libc::EV_EOF as u16,
            ev_error: libc::EV_ERROR as u16,
            kevent_size: mem::size_of::<libc::kevent>(),
            ident_offset: offset_of!(libc::kevent, ident),
            filter_offset: offset_of!(libc::kevent, filter),
            flags_offset: offset_of!(libc::kevent, flags),
            data_offset: offset_of!(libc::kevent, data),
            udata_offset: offset_of!(libc::kevent, udata),
        }
    }

    /// Checks the record layout this crate decodes against.
    fn validate(&self) -> io::Result<()> {
        let ordered = self.ident_offset == 0
            && self.ident_offset < self.filter_offset
            && self.filter_offset < self.flags_offset
            && self.flags_offset < self.data_offset
            && self.data_offset < self.udata_offset
            && self.udata_offset < self.kevent_size;

        if !ordered || self.evfilt_read == self.evfilt_write {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected kevent layout: {self:?}"),
            ));
        }

        Ok(())
    }

    fn filter(&self, filter: Filter) -> i16 {
        match filter {
            Filter::Read => self.evfilt_read,
            Filter::Write => self.evfilt_write,
        }
    }

    fn decode_filter(&self, native: i16) -> Option<Filter> {
        if native == self.evfilt_read {
            Some(Filter::Read)
        } else if native == self.evfilt_write {
            Some(Filter::Write)
        } else {
            None
        }
    }

    fn flags(&self, flags: EventFlags) -> u16 {
        self.pairs()
            .iter()
            .filter(|(flag, _)| flags.contains(*flag))
            .fold(0, |acc, (_, native)| acc | native)
    }

    fn decode_flags(&self, native: u16) -> EventFlags {
        self.pairs()
            .iter()
            .filter(|(_, bits)| native & bits != 0)
            .fold(EventFlags::empty(), |acc, (flag, _)| acc | *flag)
    }

    fn pairs(&self) -> [(EventFlags, u16); 6] {
        [
            (EventFlags::ADD, self.ev_add),
            (EventFlags::DELETE, self.ev_delete),
            (EventFlags::ONESHOT, self.ev_oneshot),
            (EventFlags::CLEAR, self.ev_clear),
            (EventFlags::EOF, self.ev_eof),
            (EventFlags::ERROR, self.ev_error),
        ]
    }
}

/// Initializes and validates the constants table.
///
/// Safe to call any number of times; the table is built once.
pub fn init() -> io::Result<&'static NativeConstants> {
    let constants = CONSTANTS.get_or_init(NativeConstants::from_libc);
    constants.validate()?;
    Ok(constants)
}

/// Returns the constants table, building it on first use.
pub fn native_constants() -> &'static NativeConstants {
    CONSTANTS.get_or_init(NativeConstants::from_libc)
}

/// A kqueue instance.
///
/// Owns the queue descriptor and a native `kevent` buffer mirroring the
/// capacity of the [`PollArray`] it is polled with.
pub struct Kqueue {
    fd: RawFd,
    closed: AtomicBool,
    constants: &'static NativeConstants,
    native: Mutex<Vec<libc::kevent>>,
}

unsafe impl Send for Kqueue {}
unsafe impl Sync for Kqueue {}

impl Kqueue {
    /// Creates a kqueue whose native buffer holds `capacity` events.
    pub fn new(capacity: usize) -> Result<Self> {
        let constants = init().map_err(|e| Error::os("validate kevent layout", e))?;

        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(Error::os("create kqueue", io::Error::last_os_error()));
        }

        if let Err(e) = sys_set_cloexec(fd) {
            sys_close(fd);
            return Err(Error::os("set kqueue close-on-exec", e));
        }

        let zeroed: libc::kevent = unsafe { mem::zeroed() };

        debug!(fd, capacity, "kqueue created");

        Ok(Self {
            fd,
            closed: AtomicBool::new(false),
            constants,
            native: Mutex::new(vec![zeroed; capacity.max(1)]),
        })
    }

    /// Returns the queue descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl KernelQueue for Kqueue {
    fn register(&self, ident: RawFd, filter: Filter, flags: EventFlags) -> io::Result<()> {
        let mut change: libc::kevent = unsafe { mem::zeroed() };
        change.ident = ident as _;
        change.filter = self.constants.filter(filter) as _;
        change.flags = self.constants.flags(flags) as _;

        let rc = unsafe { libc::kevent(self.fd, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn poll(&self, events: &mut PollArray, timeout: Option<Duration>) -> io::Result<usize> {
        let mut native = self.native.lock();
        let capacity = native.len().min(events.capacity());

        let timeout = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let timeout_ptr = timeout
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);

        events.clear();

        let n = unsafe {
            libc::kevent(
                self.fd,
                ptr::null(),
                0,
                native.as_mut_ptr(),
                capacity as libc::c_int,
                timeout_ptr,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut count = 0;
        for kev in &native[..n as usize] {
            let Some(filter) = self.constants.decode_filter(kev.filter as i16) else {
                continue;
            };

            events.slots_mut()[count] = RawEvent {
                ident: kev.ident as u64,
                filter,
                flags: self.constants.decode_flags(kev.flags as u16),
                data: kev.data as i64,
                udata: kev.udata as usize as u64,
            };
            count += 1;
        }

        events.set_len(count);
        Ok(count)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(fd = self.fd, "kqueue closed");
            sys_close(self.fd);
        }
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        self.close();
    }
}
