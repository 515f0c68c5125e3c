//! Local serial-device consoles.
//!
//! A serial console opens its tty once at configuration time and holds
//! it for the daemon's lifetime: serial devices never disconnect, so
//! there is no reconnect state.  The device is advisory-write-locked
//! (one daemon per tty), its cooked termios saved, and a raw mode with
//! the configured line parameters applied.  On destruction pending
//! output is flushed before the saved termios is restored, because a
//! tty stopped by flow control can otherwise hang close() unkillably.

use crate::fdio;
use crate::object::ObjectId;
use fs2::FileExt;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, SetArg, Termios,
};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("unable to open \"{dev}\": {source}")]
    Open {
        dev: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to lock \"{dev}\"")]
    Lock { dev: String },
    #[error("device \"{dev}\" is not a terminal")]
    NotATty { dev: String },
    #[error("unable to configure \"{dev}\": {source}")]
    Termios {
        dev: String,
        #[source]
        source: nix::Error,
    },
}

/// Parity setting for a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial line parameters: `"<bps>[,<databits><parity><stopbits>]"`,
/// e.g. `"9600,8n1"` or `"115200,7e2"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialOptions {
    pub bps: u32,
    pub databits: u8,
    pub parity: Parity,
    pub stopbits: u8,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            bps: 9600,
            databits: 8,
            parity: Parity::None,
            stopbits: 1,
        }
    }
}

impl SerialOptions {
    /// Parses a `SEROPTS` string on top of existing defaults.
    pub fn parse(defaults: Self, s: &str) -> Result<Self, String> {
        let mut opts = defaults;
        let s = s.trim();
        if s.is_empty() {
            return Err(String::from("encountered empty options string"));
        }
        let (bps_str, rest) = match s.split_once(',') {
            Some((b, r)) => (b, Some(r)),
            None => (s, None),
        };
        let bps: u32 = bps_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid baud rate \"{bps_str}\""))?;
        if baud_rate(bps).is_none() {
            return Err(format!("unsupported baud rate {bps}"));
        }
        opts.bps = bps;
        if let Some(rest) = rest {
            let rest = rest.trim().as_bytes();
            if rest.len() != 3 {
                return Err(String::from(
                    "expected <databits><parity><stopbits> after baud rate",
                ));
            }
            opts.databits = match rest[0] {
                b'5' => 5,
                b'6' => 6,
                b'7' => 7,
                b'8' => 8,
                c => return Err(format!("invalid databits '{}'", c as char)),
            };
            opts.parity = match rest[1].to_ascii_uppercase() {
                b'N' => Parity::None,
                b'O' => Parity::Odd,
                b'E' => Parity::Even,
                c => return Err(format!("invalid parity '{}'", c as char)),
            };
            opts.stopbits = match rest[2] {
                b'1' => 1,
                b'2' => 2,
                c => return Err(format!("invalid stopbits '{}'", c as char)),
            };
        }
        Ok(opts)
    }
}

/// Variant payload for a serial console object.
#[derive(Debug)]
pub struct SerialState {
    pub dev: String,
    pub opts: SerialOptions,
    pub logfile: Option<ObjectId>,
    saved: Termios,
}

/// Maps a numeric bps to the termios baud constant.
fn baud_rate(bps: u32) -> Option<BaudRate> {
    Some(match bps {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        _ => return None,
    })
}

/// Opens and configures a serial device, returning the fd for the
/// object and the driver state holding the saved termios and lock.
pub fn open(dev: &str, opts: SerialOptions) -> Result<(OwnedFd, SerialState), SerialError> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(dev)
        .map_err(|source| SerialError::Open {
            dev: String::from(dev),
            source,
        })?;
    if file.try_lock_exclusive().is_err() {
        return Err(SerialError::Lock {
            dev: String::from(dev),
        });
    }
    let fd = file.as_raw_fd();
    #[allow(unsafe_code)]
    let is_tty = unsafe { libc::isatty(fd) } == 1;
    if !is_tty {
        return Err(SerialError::NotATty {
            dev: String::from(dev),
        });
    }
    // Nonblocking semantics on ttys vary across systems; be explicit.
    let _ = fdio::set_nonblocking(fd);
    let _ = fdio::set_cloexec(fd);

    let map_err = |source| SerialError::Termios {
        dev: String::from(dev),
        source,
    };
    let saved = termios::tcgetattr(&file).map_err(map_err)?;
    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    apply_line_params(&mut raw, opts).map_err(map_err)?;
    termios::tcsetattr(&file, SetArg::TCSANOW, &raw).map_err(map_err)?;

    // The advisory lock lives on the open file description, which the
    // object fd keeps alive for the daemon's lifetime.
    let owned = OwnedFd::from(file);
    Ok((
        owned,
        SerialState {
            dev: String::from(dev),
            opts,
            logfile: None,
            saved,
        },
    ))
}

fn apply_line_params(tty: &mut Termios, opts: SerialOptions) -> nix::Result<()> {
    termios::cfsetispeed(tty, baud_rate(opts.bps).unwrap_or(BaudRate::B9600))?;
    termios::cfsetospeed(tty, baud_rate(opts.bps).unwrap_or(BaudRate::B9600))?;

    tty.control_flags.remove(ControlFlags::CSIZE);
    tty.control_flags.insert(match opts.databits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        _ => ControlFlags::CS8,
    });
    match opts.parity {
        Parity::None => {
            tty.control_flags.remove(ControlFlags::PARENB);
        }
        Parity::Odd => {
            tty.control_flags
                .insert(ControlFlags::PARENB | ControlFlags::PARODD);
        }
        Parity::Even => {
            tty.control_flags.insert(ControlFlags::PARENB);
            tty.control_flags.remove(ControlFlags::PARODD);
        }
    }
    if opts.stopbits == 2 {
        tty.control_flags.insert(ControlFlags::CSTOPB);
    } else {
        tty.control_flags.remove(ControlFlags::CSTOPB);
    }
    Ok(())
}

/// Restores a serial device on object destruction: discard pending
/// output, then put the saved cooked mode back.
pub fn restore(name: &str, fd: RawFd, state: &SerialState) {
    #[allow(unsafe_code)]
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(err) = termios::tcflush(fd, termios::FlushArg::TCIOFLUSH) {
        warn!(console = name, error = %err, "unable to flush tty");
    }
    if let Err(err) = termios::tcsetattr(fd, SetArg::TCSANOW, &state.saved) {
        warn!(console = name, error = %err, "unable to restore tty mode");
    }
}

/// Transmits a break on the device.
pub fn send_break(name: &str, fd: RawFd) {
    #[allow(unsafe_code)]
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(err) = termios::tcsendbreak(fd, 0) {
        warn!(console = name, error = %err, "unable to send serial break");
    }
}
