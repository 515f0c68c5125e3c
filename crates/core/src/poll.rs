//! Readiness polling with a self-pipe wake channel.
//!
//! The reactor rebuilds the interest set from scratch every iteration
//! (the object population and each object's readable/writable interest
//! change constantly), so the poller is a plain `pollfd` array plus a
//! pipe whose read end is always present.  Other contexts — signal
//! handlers and IPMI engine worker threads — hold a [`Waker`] and write
//! one byte to interrupt a blocking wait.

use crate::fdio;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Interest/readiness flags, a thin mirror of `POLLIN`/`POLLOUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events {
    pub readable: bool,
    pub writable: bool,
}

impl Events {
    pub const READ: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITE: Self = Self {
        readable: false,
        writable: true,
    };
    pub const READ_WRITE: Self = Self {
        readable: true,
        writable: true,
    };

    pub fn any(self) -> bool {
        self.readable || self.writable
    }
}

/// Handle for waking a blocked [`Poller`] from another context.
///
/// `wake` performs a single non-blocking pipe write and is safe to call
/// from the IPMI engine's worker threads.  The raw fd is exposed so
/// signal handlers can perform the same write without touching the Arc.
#[derive(Clone)]
pub struct Waker {
    tx: Arc<OwnedFd>,
}

impl Waker {
    pub fn wake(&self) {
        // A full pipe already guarantees a pending wake-up.
        let _ = fdio::write(self.tx.as_raw_fd(), &[0u8]);
    }

    pub fn raw_fd(&self) -> RawFd {
        self.tx.as_raw_fd()
    }
}

pub struct Poller {
    fds: Vec<libc::pollfd>,
    wake_rx: OwnedFd,
    waker: Waker,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let (rx, tx) = fdio::pipe()?;
        Ok(Self {
            fds: Vec::with_capacity(64),
            wake_rx: rx,
            waker: Waker { tx: Arc::new(tx) },
        })
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Starts a fresh interest set containing only the wake pipe.
    pub fn begin(&mut self) {
        self.fds.clear();
        self.fds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
    }

    /// Adds `fd` with the given interest; returns a slot token for
    /// [`Self::revents`] after the poll.
    pub fn add(&mut self, fd: RawFd, events: Events) -> usize {
        let mut mask: libc::c_short = 0;
        if events.readable {
            mask |= libc::POLLIN;
        }
        if events.writable {
            mask |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events: mask,
            revents: 0,
        });
        self.fds.len() - 1
    }

    /// Blocks until readiness, timeout, or a wake-up.  A `None` timeout
    /// blocks indefinitely.  Returns the number of ready fds (the wake
    /// pipe, if signalled, is drained and not counted).
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let ms: libc::c_int = match timeout {
            None => -1,
            Some(t) => {
                let ms = t.as_millis();
                // poll(2) rounds up; cap absurd timeouts rather than wrap.
                libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
            }
        };
        let n = loop {
            #[allow(unsafe_code)]
            let n = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms)
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            // EINTR: let the caller re-examine its flags.
            break 0;
        };
        let mut ready = n;
        if self.fds[0].revents & libc::POLLIN != 0 {
            self.drain_wake_pipe();
            ready = ready.saturating_sub(1);
        }
        Ok(ready)
    }

    /// Readiness recorded for the slot returned by [`Self::add`].
    /// Error and hang-up conditions are folded into readability so the
    /// subsequent read observes them.
    pub fn revents(&self, slot: usize) -> Events {
        let revents = self.fds[slot].revents;
        Events {
            readable: revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0,
            writable: revents & (libc::POLLOUT | libc::POLLERR) != 0,
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = fdio::read(self.wake_rx.as_raw_fd(), &mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn waker_interrupts_a_blocking_wait() {
        let mut poller = Poller::new().expect("poller");
        let waker = poller.waker();
        waker.wake();
        poller.begin();
        let started = Instant::now();
        let ready = poller.wait(Some(Duration::from_secs(5))).expect("wait");
        assert_eq!(ready, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timeout_expires_with_no_ready_fds() {
        let mut poller = Poller::new().expect("poller");
        poller.begin();
        let ready = poller.wait(Some(Duration::from_millis(10))).expect("wait");
        assert_eq!(ready, 0);
    }

    #[test]
    fn readable_pipe_reports_readiness() {
        let mut poller = Poller::new().expect("poller");
        let (rx, tx) = crate::fdio::pipe().expect("pipe");
        crate::fdio::write(tx.as_raw_fd(), b"x").expect("write");
        poller.begin();
        let slot = poller.add(rx.as_raw_fd(), Events::READ);
        let ready = poller.wait(Some(Duration::from_secs(1))).expect("wait");
        assert_eq!(ready, 1);
        assert!(poller.revents(slot).readable);
        assert!(!poller.revents(slot).writable);
    }
}
