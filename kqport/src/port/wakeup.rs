use crate::sys::{sys_close, sys_drain1, sys_pipe, sys_write1};

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cross-thread wakeup for a blocked poll.
///
/// Every [`signal`](Self::signal) bumps a pending counter; only the 0 → 1
/// transition writes a byte to the pipe. The poller calls
/// [`consume`](Self::consume) once per wakeup record and drains a single
/// byte when the counter returns to zero, so a byte written by a later
/// batch is never swallowed.
pub(crate) struct WakeupState {
    pending: AtomicUsize,
    read_fd: RawFd,
    write_fd: RawFd,
    closed: AtomicBool,

    signals: AtomicUsize,
    written: AtomicUsize,
    drained: AtomicUsize,
}

impl WakeupState {
    pub(crate) fn new() -> io::Result<Self> {
        let (read_fd, write_fd) = sys_pipe()?;

        Ok(Self {
            pending: AtomicUsize::new(0),
            read_fd,
            write_fd,
            closed: AtomicBool::new(false),
            signals: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            drained: AtomicUsize::new(0),
        })
    }

    /// Descriptor registered with the kernel queue.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    #[cfg(test)]
    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Requests one wakeup.
    ///
    /// On failure the request is withdrawn and not counted.
    pub(crate) fn signal(&self) -> io::Result<()> {
        if self.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(e) = sys_write1(self.write_fd) {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
            self.written.fetch_add(1, Ordering::Relaxed);
        }

        self.signals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Accounts for one wakeup record returned by the kernel queue.
    ///
    /// Returns `false` if no wakeup was pending, in which case the record
    /// is spurious and must not be acted upon.
    pub(crate) fn consume(&self) -> io::Result<bool> {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                let n = sys_drain1(self.read_fd)?;
                self.drained.fetch_add(n, Ordering::Relaxed);
                Ok(true)
            }
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Closes both ends of the pipe once.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            sys_close(self.read_fd);
            sys_close(self.write_fd);
        }
    }

    pub(crate) fn signals(&self) -> usize {
        self.signals.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_drained(&self) -> usize {
        self.drained.load(Ordering::Relaxed)
    }
}

impl Drop for WakeupState {
    fn drop(&mut self) {
        self.close();
    }
}
