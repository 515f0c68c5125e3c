//! Remote consoles behind terminal servers (reverse telnet).
//!
//! Connection management is a three-state machine: DOWN → PENDING on a
//! non-blocking connect, PENDING → UP once `SO_ERROR` reports success
//! (the reactor watches both directions while pending), and any drop
//! lands back in DOWN with the shared exponential backoff armed.  On
//! entering UP the driver requests the option set a raw console wants
//! (`DO BINARY, DO ECHO, DO SGA, WILL BINARY, WILL SGA`) and arms the
//! stable-connect debounce that zeroes the backoff.
//!
//! Inbound bytes pass through the IAC processor, which strips and
//! handles in-band telnet commands before the remainder is fanned out
//! to readers.  Negotiation is deliberately pragmatic rather than the
//! full RFC 1143 Q-method: BINARY, ECHO, and SGA are accepted, all
//! other options refused.

use crate::console::{Backoff, ConnState};
use crate::object::{Object, ObjectId, ObjectKind, Registry};
use crate::timer::{TimerEvent, TimerId, TimerWheel};
use crate::{fdio, info_msg, timefmt, MIN_CONNECT_SECS};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const BREAK: u8 = 243;
pub const SE: u8 = 240;

pub const TELOPT_BINARY: u8 = 0;
pub const TELOPT_ECHO: u8 = 1;
pub const TELOPT_SGA: u8 = 3;

/// IAC-processor state carried across read bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IacState {
    #[default]
    Normal,
    /// Seen IAC, awaiting a command byte.
    Iac,
    /// Seen IAC + DO/DONT/WILL/WONT, awaiting the option byte.
    Cmd(u8),
    /// Inside a subnegotiation, discarding until IAC SE.
    Sb,
}

/// A command queued for transmission back to the terminal server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelnetCmd {
    pub cmd: u8,
    pub opt: Option<u8>,
}

/// Variant payload for a telnet console object.
pub struct TelnetState {
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
    pub logfile: Option<ObjectId>,
    pub timer: Option<TimerId>,
    pub backoff: Backoff,
    pub conn: ConnState,
    pub keepalive: bool,
    iac: IacState,
    remote_binary: bool,
    remote_echo: bool,
    remote_sga: bool,
}

impl TelnetState {
    #[must_use]
    pub fn new(host: String, port: u16, addr: SocketAddr, keepalive: bool) -> Self {
        Self {
            host,
            port,
            addr,
            logfile: None,
            timer: None,
            backoff: Backoff::new(),
            conn: ConnState::Down,
            keepalive,
            iac: IacState::Normal,
            remote_binary: false,
            remote_echo: false,
            remote_sga: false,
        }
    }

    pub fn is_up(&self) -> bool {
        self.conn == ConnState::Up
    }

    pub fn is_pending(&self) -> bool {
        self.conn == ConnState::Pending
    }

    fn peer(&self) -> String {
        format!("<{}:{}>", self.host, self.port)
    }
}

/// Strips IAC sequences from `buf` in place, returning the retained
/// length and any negotiation replies to send.  State survives bursts,
/// so sequences split across reads are handled.
pub fn process_escapes(
    state: &mut TelnetState,
    name: &str,
    buf: &mut [u8],
) -> (usize, Vec<TelnetCmd>) {
    let mut out = 0;
    let mut replies = Vec::new();
    for i in 0..buf.len() {
        let byte = buf[i];
        match state.iac {
            IacState::Normal => {
                if byte == IAC {
                    state.iac = IacState::Iac;
                } else {
                    buf[out] = byte;
                    out += 1;
                }
            }
            IacState::Iac => match byte {
                IAC => {
                    buf[out] = byte;
                    out += 1;
                    state.iac = IacState::Normal;
                }
                DO | DONT | WILL | WONT => {
                    state.iac = IacState::Cmd(byte);
                }
                SB => {
                    state.iac = IacState::Sb;
                }
                SE => {
                    state.iac = IacState::Normal;
                }
                _ => {
                    // Two-byte command with no option.
                    debug!(console = name, cmd = byte, "ignoring telnet command");
                    state.iac = IacState::Normal;
                }
            },
            IacState::Cmd(cmd) => {
                if let Some(reply) = negotiate(state, name, cmd, byte) {
                    replies.push(reply);
                }
                state.iac = IacState::Normal;
            }
            IacState::Sb => {
                if byte == IAC {
                    state.iac = IacState::Iac;
                }
            }
        }
    }
    (out, replies)
}

fn is_accepted_opt(opt: u8) -> bool {
    matches!(opt, TELOPT_BINARY | TELOPT_ECHO | TELOPT_SGA)
}

/// Pragmatic negotiation policy: accept BINARY/ECHO/SGA silently,
/// refuse everything else, and log the retraction of an accepted
/// option at notice level.
fn negotiate(state: &mut TelnetState, name: &str, cmd: u8, opt: u8) -> Option<TelnetCmd> {
    match cmd {
        DO => {
            if is_accepted_opt(opt) {
                None
            } else {
                Some(TelnetCmd {
                    cmd: WONT,
                    opt: Some(opt),
                })
            }
        }
        WILL => {
            if is_accepted_opt(opt) {
                set_remote_opt(state, opt, true);
                None
            } else {
                Some(TelnetCmd {
                    cmd: DONT,
                    opt: Some(opt),
                })
            }
        }
        WONT => {
            if is_accepted_opt(opt) && remote_opt(state, opt) {
                warn!(console = name, opt, "peer retracted telnet option");
                set_remote_opt(state, opt, false);
            }
            None
        }
        _ => None, // DONT: already off, nothing to say.
    }
}

fn remote_opt(state: &TelnetState, opt: u8) -> bool {
    match opt {
        TELOPT_BINARY => state.remote_binary,
        TELOPT_ECHO => state.remote_echo,
        TELOPT_SGA => state.remote_sga,
        _ => false,
    }
}

fn set_remote_opt(state: &mut TelnetState, opt: u8, value: bool) {
    match opt {
        TELOPT_BINARY => state.remote_binary = value,
        TELOPT_ECHO => state.remote_echo = value,
        TELOPT_SGA => state.remote_sga = value,
        _ => {}
    }
}

/// Queues `IAC cmd [opt]` for transmission; a no-op unless the
/// connection is UP with an open fd.
pub fn send_cmd(obj: &mut Object, cmd: u8, opt: Option<u8>) {
    let mut bytes = [IAC, cmd, 0];
    let len = match opt {
        Some(opt) => {
            bytes[2] = opt;
            3
        }
        None => 2,
    };
    obj.write_data(&bytes[..len], false);
}

/// Drives the connect state machine: initiates a non-blocking connect
/// from DOWN, or completes/fails a PENDING connect via `SO_ERROR`.
pub fn connect(reg: &mut Registry, wheel: &mut TimerWheel, id: ObjectId) {
    let Some(obj) = reg.get_mut(id) else { return };
    let fd = obj.raw_fd();
    let ObjectKind::Telnet(state) = &mut obj.kind else {
        return;
    };
    if let Some(timer) = state.timer.take() {
        wheel.cancel(timer);
    }

    match state.conn {
        ConnState::Up => return,
        ConnState::Down => {
            let addr = state.addr;
            let keepalive = state.keepalive;
            match start_connect(addr, keepalive) {
                Ok((fd, completed)) => {
                    obj.fd = Some(fd);
                    if !completed {
                        if let ObjectKind::Telnet(state) = &mut obj.kind {
                            state.conn = ConnState::Pending;
                        }
                        return;
                    }
                }
                Err(err) => {
                    let name = obj.name.clone();
                    debug!(console = %name, error = %err, "connect failed");
                    disconnect(reg, wheel, id);
                    return;
                }
            }
        }
        ConnState::Pending => {
            let err = fd.and_then(fdio::take_socket_error);
            if let Some(err) = err {
                let name = obj.name.clone();
                debug!(console = %name, error = %err, "connect completion failed");
                obj.fd.take();
                disconnect(reg, wheel, id);
                return;
            }
        }
    }

    // Connection established.
    let (name, peer) = {
        let Some(obj) = reg.get_mut(id) else { return };
        let ObjectKind::Telnet(state) = &mut obj.kind else {
            return;
        };
        state.conn = ConnState::Up;
        state.iac = IacState::Normal;
        let peer = state.peer();
        (obj.name.clone(), peer)
    };
    info!(console = %name, peer = %peer, "console connected");
    let msg = info_msg(&format!(
        "Console [{name}] connected to {peer} at {}",
        timefmt::short_time()
    ));
    reg.notify_console(id, &msg);

    if let Some(obj) = reg.get_mut(id) {
        for (cmd, opt) in [
            (DO, TELOPT_BINARY),
            (DO, TELOPT_ECHO),
            (DO, TELOPT_SGA),
            (WILL, TELOPT_BINARY),
            (WILL, TELOPT_SGA),
        ] {
            send_cmd(obj, cmd, Some(opt));
        }
        if let ObjectKind::Telnet(state) = &mut obj.kind {
            // The backoff only resets once the connection survives the
            // debounce interval.
            state.timer = Some(wheel.arm_in(
                Duration::from_secs(MIN_CONNECT_SECS),
                TimerEvent::ResetBackoff(id),
            ));
        }
    }
}

fn start_connect(addr: SocketAddr, keepalive: bool) -> io::Result<(OwnedFd, bool)> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    // Urgent data must arrive in-band so console output never reorders.
    fdio::set_oob_inline(socket.as_raw_fd())?;
    if keepalive {
        socket.set_keepalive(true)?;
    }
    match socket.connect(&addr.into()) {
        Ok(()) => Ok((socket.into(), true)),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
            Ok((socket.into(), false))
        }
        Err(err) => Err(err),
    }
}

/// Tears the connection down and arms the reconnect timer with the
/// next backoff delay.
pub fn disconnect(reg: &mut Registry, wheel: &mut TimerWheel, id: ObjectId) {
    let Some(obj) = reg.get_mut(id) else { return };
    obj.fd.take();
    obj.buf().clear();
    let ObjectKind::Telnet(state) = &mut obj.kind else {
        return;
    };
    if let Some(timer) = state.timer.take() {
        wheel.cancel(timer);
    }
    let was_up = state.conn == ConnState::Up;
    state.conn = ConnState::Down;
    let delay = state.backoff.advance();
    state.timer = Some(wheel.arm_in(delay, TimerEvent::Reconnect(id)));
    let name = obj.name.clone();
    let peer = match &obj.kind {
        ObjectKind::Telnet(s) => s.peer(),
        _ => String::new(),
    };

    if was_up {
        info!(console = %name, peer = %peer, "console disconnected");
        let msg = info_msg(&format!(
            "Console [{name}] disconnected from {peer} at {}",
            timefmt::short_time()
        ));
        reg.notify_console(id, &msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TelnetState {
        TelnetState::new(
            String::from("ts1"),
            23,
            "127.0.0.1:23".parse().expect("addr"),
            false,
        )
    }

    #[test]
    fn doubled_iac_passes_one_ff_downstream() {
        let mut st = state();
        let mut buf = *b"H\xff\xffI";
        let (len, replies) = process_escapes(&mut st, "c0", &mut buf);
        assert_eq!(&buf[..len], b"H\xffI");
        assert!(replies.is_empty());
    }

    #[test]
    fn will_echo_is_accepted_without_reply() {
        // S5: H IAC IAC I IAC WILL ECHO J  =>  H 0xFF I J, no reply.
        let mut st = state();
        let mut buf = *b"H\xff\xffI\xff\xfb\x01J";
        let (len, replies) = process_escapes(&mut st, "c0", &mut buf);
        assert_eq!(&buf[..len], b"H\xffIJ");
        assert!(replies.is_empty());
        assert!(st.remote_echo);
    }

    #[test]
    fn unknown_will_gets_dont_and_unknown_do_gets_wont() {
        let mut st = state();
        let mut buf = [IAC, WILL, 42, IAC, DO, 42];
        let (len, replies) = process_escapes(&mut st, "c0", &mut buf);
        assert_eq!(len, 0);
        assert_eq!(
            replies,
            vec![
                TelnetCmd {
                    cmd: DONT,
                    opt: Some(42)
                },
                TelnetCmd {
                    cmd: WONT,
                    opt: Some(42)
                },
            ]
        );
    }

    #[test]
    fn sequences_split_across_bursts_are_reassembled() {
        let mut st = state();
        let mut first = [b'A', IAC];
        let (len, _) = process_escapes(&mut st, "c0", &mut first);
        assert_eq!(&first[..len], b"A");
        assert_eq!(st.iac, IacState::Iac);
        let mut second = [WILL];
        let (len, _) = process_escapes(&mut st, "c0", &mut second);
        assert_eq!(len, 0);
        let mut third = [TELOPT_SGA, b'B'];
        let (len, replies) = process_escapes(&mut st, "c0", &mut third);
        assert_eq!(&third[..len], b"B");
        assert!(replies.is_empty());
        assert!(st.remote_sga);
    }

    #[test]
    fn subnegotiation_is_discarded_through_iac_se() {
        let mut st = state();
        let mut buf = [b'X', IAC, SB, 1, 2, 3, IAC, SE, b'Y'];
        let (len, replies) = process_escapes(&mut st, "c0", &mut buf);
        assert_eq!(&buf[..len], b"XY");
        assert!(replies.is_empty());
        assert_eq!(st.iac, IacState::Normal);
    }

    #[test]
    fn retracting_an_accepted_option_clears_its_flag() {
        let mut st = state();
        let mut buf = [IAC, WILL, TELOPT_ECHO, IAC, WONT, TELOPT_ECHO];
        let (len, replies) = process_escapes(&mut st, "c0", &mut buf);
        assert_eq!(len, 0);
        assert!(replies.is_empty());
        assert!(!st.remote_echo);
    }

    #[test]
    fn two_byte_commands_are_consumed_silently() {
        let mut st = state();
        let mut buf = [b'A', IAC, 241 /* NOP */, b'B'];
        let (len, replies) = process_escapes(&mut st, "c0", &mut buf);
        assert_eq!(&buf[..len], b"AB");
        assert!(replies.is_empty());
    }
}
