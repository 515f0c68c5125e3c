//! Thin non-blocking fd helpers over `libc`.
//!
//! All object I/O in the reactor goes through these: reads and writes
//! retry on `EINTR`, report `WouldBlock` untouched, and never block.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Reads into `buf`, retrying on `EINTR`.  Returns `Ok(0)` at EOF.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        #[allow(unsafe_code)]
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Writes from `buf`, retrying on `EINTR`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        #[allow(unsafe_code)]
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sets `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    #[allow(unsafe_code)]
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Sets `FD_CLOEXEC` on `fd`.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    #[allow(unsafe_code)]
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Reads and clears a socket's pending `SO_ERROR`.  Returns `Some` when
/// an asynchronous connect has failed.
pub fn take_socket_error(fd: RawFd) -> Option<io::Error> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    #[allow(unsafe_code)]
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        // Some systems report the pending error through errno instead.
        return Some(io::Error::last_os_error());
    }
    if err == 0 {
        None
    } else {
        Some(io::Error::from_raw_os_error(err))
    }
}

/// Sets `SO_OOBINLINE` so urgent data stays in the normal stream.
pub fn set_oob_inline(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    #[allow(unsafe_code)]
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_OOBINLINE,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Creates a non-blocking close-on-exec pipe; returns (read, write).
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    #[allow(unsafe_code)]
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    for fd in fds {
        set_nonblocking(fd)?;
        set_cloexec(fd)?;
    }
    #[allow(unsafe_code)]
    unsafe {
        Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_round_trips_bytes() {
        let (rx, tx) = pipe().expect("pipe");
        assert_eq!(write(tx.as_raw_fd(), b"ping").expect("write"), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read(rx.as_raw_fd(), &mut buf).expect("read"), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn empty_pipe_reports_would_block() {
        let (rx, _tx) = pipe().expect("pipe");
        let mut buf = [0u8; 1];
        let err = read(rx.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
