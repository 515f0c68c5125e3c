//! Local terminal handling for interactive sessions.

use nix::sys::termios::{self, SetArg, Termios};
use std::io;
use std::os::fd::BorrowedFd;

fn stdin_fd() -> BorrowedFd<'static> {
    #[allow(unsafe_code)]
    unsafe {
        BorrowedFd::borrow_raw(libc::STDIN_FILENO)
    }
}

/// Puts stdin into raw mode for the duration of the guard's life; the
/// saved cooked mode is restored on drop.  When stdin is not a tty
/// (piped input) the guard is inert.
pub struct RawTty {
    saved: Option<Termios>,
}

impl RawTty {
    pub fn enable() -> io::Result<Self> {
        #[allow(unsafe_code)]
        let is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
        if !is_tty {
            return Ok(Self { saved: None });
        }
        let saved = termios::tcgetattr(stdin_fd()).map_err(io::Error::from)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin_fd(), SetArg::TCSANOW, &raw).map_err(io::Error::from)?;
        Ok(Self { saved: Some(saved) })
    }
}

impl Drop for RawTty {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            let _ = termios::tcsetattr(stdin_fd(), SetArg::TCSANOW, saved);
        }
    }
}

/// Name of the controlling terminal, for the greeting's TTY field.
#[must_use]
pub fn tty_name() -> Option<String> {
    nix::unistd::ttyname(stdin_fd())
        .ok()
        .map(|p| p.display().to_string())
}
