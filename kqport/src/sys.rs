//! Thin wrappers over the raw descriptor calls used by the wakeup pipes.

use libc::{F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, O_NONBLOCK, c_int, close, fcntl, pipe, read, write};
use std::io;
use std::os::fd::RawFd;

/// Reads from a file descriptor into the given buffer.
///
/// Returns the number of bytes read, or a negative value on error.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) }
}

/// Writes the buffer to a file descriptor.
///
/// Returns the number of bytes written, or a negative value on error.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { write(fd, buffer.as_ptr() as *const _, buffer.len()) }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Sets a file descriptor to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Marks a file descriptor close-on-exec.
pub(crate) fn sys_set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { fcntl(fd, F_SETFD, flags | FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Creates a non-blocking, close-on-exec pipe, returning `(read_end, write_end)`.
pub(crate) fn sys_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [c_int; 2] = [-1, -1];

    let rc = unsafe { pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    for fd in fds {
        if let Err(e) = sys_set_nonblocking(fd).and_then(|_| sys_set_cloexec(fd)) {
            sys_close(fds[0]);
            sys_close(fds[1]);
            return Err(e);
        }
    }

    Ok((fds[0], fds[1]))
}

/// Writes a single byte, retrying on `EINTR`.
///
/// A full pipe counts as success: a byte is already pending.
pub(crate) fn sys_write1(fd: RawFd) -> io::Result<()> {
    loop {
        if sys_write(fd, &[0u8]) >= 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(()),
            _ => return Err(err),
        }
    }
}

/// Reads exactly one byte if one is available, retrying on `EINTR`.
///
/// Returns the number of bytes consumed (0 or 1).
pub(crate) fn sys_drain1(fd: RawFd) -> io::Result<usize> {
    let mut byte = [0u8; 1];

    loop {
        let n = sys_read(fd, &mut byte);
        if n >= 0 {
            return Ok(n as usize);
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(0),
            _ => return Err(err),
        }
    }
}

/// Reads until the descriptor would block, returning the byte count.
pub(crate) fn sys_drain(fd: RawFd) -> io::Result<usize> {
    let mut buffer = [0u8; 128];
    let mut total = 0;

    loop {
        let n = sys_read(fd, &mut buffer);

        match n {
            (1..) => total += n as usize,
            0 => return Ok(total),
            _ => {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(total),
                    _ => return Err(err),
                }
            }
        }
    }
}
