//! # Overview
//!
//! `cmux_core` is the single-process I/O multiplexer at the heart of the
//! `cmuxd` console-manager daemon, together with the object graph it
//! drives: the circular per-object write buffers, the reader/writer link
//! graph wiring console sources to client and logfile sinks, the timer
//! wheel, the per-driver console state machines (serial, telnet, unix
//! socket, child process, IPMI serial-over-LAN, synthetic test), the
//! client session state machine with its in-session escape processor,
//! and the reactor loop that ties fd readiness to timer expiry.
//!
//! The crate performs no configuration parsing and no daemonisation;
//! `cmux_daemon` assembles a [`reactor::Reactor`] from a parsed
//! configuration and runs it.  Everything here is driven by one thread;
//! the only other threads in the process belong to the IPMI SOL engine,
//! which communicates back through per-object shared state and the
//! reactor's [`poll::Waker`].

pub mod buffer;
pub mod console;
pub mod fdio;
pub mod listen;
pub mod logfile;
pub mod object;
pub mod poll;
pub mod reactor;
pub mod reset;
pub mod session;
pub mod timefmt;
pub mod timer;

/// Capacity of every object's circular write buffer (B).
pub const OBJ_BUF_SIZE: usize = 8192;

/// Bytes of recent console output replayed by the `&L` escape (R).
/// Bounded to half the buffer so sanitisation expansion cannot overflow
/// the staging area.
pub const REPLAY_LEN: usize = 4096;

/// Upper bound for informational message lines.
pub const MAX_LINE: usize = 1024;

/// Initial reconnect delay in seconds (T_min), shared by every
/// reconnecting driver; also the stable-connect debounce interval.
pub const MIN_CONNECT_SECS: u64 = 4;

/// Reconnect delay ceiling in seconds (T_max).
pub const MAX_CONNECT_SECS: u64 = 1800;

/// Seconds a reset command may run before its process group is killed.
pub const RESET_CMD_TIMEOUT_SECS: u64 = 60;

/// In-band informational message framing.
pub const MSG_PREFIX: &str = "\r\n<cmux> ";
pub const MSG_SUFFIX: &str = ".\r\n";

/// Builds an in-band informational message line.
#[must_use]
pub fn info_msg(body: &str) -> String {
    let mut msg = String::with_capacity(MSG_PREFIX.len() + body.len() + MSG_SUFFIX.len());
    msg.push_str(MSG_PREFIX);
    msg.push_str(body);
    msg.push_str(MSG_SUFFIX);
    msg
}
