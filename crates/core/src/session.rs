//! Client sessions: protocol phases, request validation, and the
//! in-session escape processor.
//!
//! A freshly accepted client walks GREET → REQ → DATA.  The handshake
//! phases accumulate protocol lines from read bursts; every response —
//! including multi-line error bodies — is appended to the client's own
//! ring buffer, so ordering with subsequent console data is free.  A
//! request that fails validation is answered and the session flagged
//! EOF; the reactor reaps it once the response drains.
//!
//! In DATA phase, bytes from the client pass through the escape
//! processor before being fanned out to the consoles it writes.  The
//! escape byte is only recognised immediately after a line terminator,
//! so console-bound binary data is disturbed as little as possible.

use crate::console::{ipmi, serial, telnet};
use crate::object::{compare_console_names, ObjectId, ObjectKind, Registry};
use crate::{info_msg, timefmt, REPLAY_LEN};
use cmux_protocol::wire::{
    CommandVerb, ErrorCode, Greeting, Request, Response, WireError, MAX_SOCK_LINE,
};
use regex::RegexBuilder;
use std::time::Instant;
use tracing::{info, warn};

/// Default in-session escape byte.
pub const DEFAULT_ESCAPE: u8 = b'&';

/// Protocol phase of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Greeting,
    Request,
    Data,
}

/// Escape-processor mode: the escape byte is live only in `Eol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeMode {
    Eol,
    Chr,
    Esc,
}

/// Commands produced by the escape processor for the reactor to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeCmd {
    Break,
    Close,
    Help,
    SetForce,
    SetJoin,
    SetMonitor,
    Replay,
    QuietToggle,
    Reset,
    SuspendToggle,
}

/// Variant payload for a client object.
pub struct ClientState {
    pub user: String,
    pub host: String,
    pub ip: String,
    pub port: u16,
    pub tty: Option<String>,
    pub phase: Phase,
    pub command: Option<CommandVerb>,
    pub broadcast: bool,
    pub force: bool,
    pub join: bool,
    pub quiet: bool,
    pub regex: bool,
    pub got_suspend: bool,
    pub last_read: Instant,
    pub escape_char: u8,
    pub escape_mode: EscapeMode,
    line: Vec<u8>,
}

impl ClientState {
    /// State for a freshly accepted connection, before the greeting.
    #[must_use]
    pub fn accepted(host: String, ip: String, port: u16) -> Self {
        Self {
            user: String::new(),
            host,
            ip,
            port,
            tty: None,
            phase: Phase::Greeting,
            command: None,
            broadcast: false,
            force: false,
            join: false,
            quiet: false,
            regex: false,
            got_suspend: false,
            last_read: Instant::now(),
            escape_char: DEFAULT_ESCAPE,
            escape_mode: EscapeMode::Eol,
            line: Vec::new(),
        }
    }

    /// A connected state for unit tests elsewhere in the crate.
    #[must_use]
    pub fn for_tests(user: &str, host: &str) -> Self {
        let mut state = Self::accepted(String::from(host), String::from("127.0.0.1"), 1);
        state.user = String::from(user);
        state.phase = Phase::Data;
        state
    }

    #[must_use]
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    #[must_use]
    pub fn idle_secs(&self) -> u64 {
        self.last_read.elapsed().as_secs()
    }
}

/// Result of feeding one read burst through a client session.
#[derive(Default)]
pub struct InputResult {
    /// Bytes to fan out to the consoles this client writes.
    pub forward: Vec<u8>,
    /// Escape commands to apply, in order.
    pub commands: Vec<EscapeCmd>,
}

/// Feeds a read burst into the session state machine.
pub fn handle_input(reg: &mut Registry, id: ObjectId, burst: &[u8]) -> InputResult {
    let phase = {
        let Some(client) = reg.get_mut(id).and_then(|o| o.kind.as_client_mut()) else {
            return InputResult::default();
        };
        client.last_read = Instant::now();
        if client.phase != Phase::Data {
            client.line.extend_from_slice(burst);
        }
        client.phase
    };
    if phase == Phase::Data {
        return process_data(reg, id, burst);
    }

    loop {
        let step = {
            let Some(obj) = reg.get_mut(id) else {
                return InputResult::default();
            };
            if obj.got_eof {
                return InputResult::default();
            }
            let Some(client) = obj.kind.as_client_mut() else {
                return InputResult::default();
            };
            match client.phase {
                Phase::Data => {
                    // Handshake finished mid-burst; the tail of the
                    // burst belongs to the data phase.
                    let rest = std::mem::take(&mut client.line);
                    return process_data(reg, id, &rest);
                }
                phase => match take_line(&mut client.line) {
                    Some(line) => (phase, line),
                    None => {
                        if client.line.len() > MAX_SOCK_LINE {
                            let ip = client.ip.clone();
                            warn!(peer = %ip, "request line too long");
                            respond_error(reg, id, ErrorCode::BadRequest, "Request too long.");
                            close_session(reg, id);
                        }
                        return InputResult::default();
                    }
                },
            }
        };
        match step {
            (Phase::Greeting, line) => handle_greeting_line(reg, id, &line),
            (_, line) => handle_request_line(reg, id, &line),
        }
    }
}

/// Splits one complete line (terminator included) off the front of
/// `buf`, if present.
fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let rest = buf.split_off(pos + 1);
    Some(std::mem::replace(buf, rest))
}

fn handle_greeting_line(reg: &mut Registry, id: ObjectId, line: &[u8]) {
    match Greeting::parse(line) {
        Ok(greeting) => {
            let Some(obj) = reg.get_mut(id) else { return };
            let Some(client) = obj.kind.as_client_mut() else {
                return;
            };
            client.user = greeting.user;
            client.tty = greeting.tty;
            client.phase = Phase::Request;
            let name = format!("{}@{}:{}", client.user, client.host, client.port);
            let who = client.user_at_host();
            obj.name = name;
            obj.write_data(&Response::ok_line(), false);
            info!(client = %who, "greeting accepted");
        }
        Err(WireError::MissingUser) => {
            respond_error(
                reg,
                id,
                ErrorCode::BadRequest,
                "Invalid greeting: no user specified.",
            );
            close_session(reg, id);
        }
        Err(_) => {
            respond_error(reg, id, ErrorCode::BadRequest, "Invalid greeting.");
            close_session(reg, id);
        }
    }
}

fn handle_request_line(reg: &mut Registry, id: ObjectId, line: &[u8]) {
    let req = match Request::parse(line) {
        Ok(req) => req,
        Err(WireError::MissingVerb) => {
            respond_error(
                reg,
                id,
                ErrorCode::BadRequest,
                "Invalid request: no command specified.",
            );
            close_session(reg, id);
            return;
        }
        Err(_) => {
            respond_error(reg, id, ErrorCode::BadRequest, "Invalid request.");
            close_session(reg, id);
            return;
        }
    };

    if let Some(client) = reg.get_mut(id).and_then(|o| o.kind.as_client_mut()) {
        client.command = Some(req.verb);
        client.broadcast = req.verb == CommandVerb::Connect && req.broadcast;
        client.force = req.force;
        client.join = req.join;
        client.quiet = req.quiet;
        client.regex = req.regex;
    }

    let matches = match query_consoles(reg, &req) {
        Ok(matches) => matches,
        Err((code, msg)) => {
            respond_error(reg, id, code, &msg);
            close_session(reg, id);
            return;
        }
    };
    if matches.is_empty() {
        respond_error(reg, id, ErrorCode::NoConsoles, "Found no matching consoles.");
        close_session(reg, id);
        return;
    }

    // Multiple matches are fine for QUERY, MONITOR, and broadcasting
    // CONNECTs; a plain CONNECT needs exactly one console.
    let multi_ok = match req.verb {
        CommandVerb::Query | CommandVerb::Monitor => true,
        CommandVerb::Connect => req.broadcast,
    };
    if matches.len() > 1 && !multi_ok {
        respond_error(
            reg,
            id,
            ErrorCode::TooManyConsoles,
            &format!("Found {} matching consoles.", matches.len()),
        );
        for (_, name) in &matches {
            reg.write_to(id, format!("{name}\n").as_bytes(), false);
        }
        close_session(reg, id);
        return;
    }

    if req.verb == CommandVerb::Connect && !req.force && !req.join {
        let busy: Vec<ObjectId> = matches
            .iter()
            .filter(|(cid, _)| {
                reg.get(*cid).is_some_and(|o| !o.writers.is_empty())
            })
            .map(|(cid, _)| *cid)
            .collect();
        if !busy.is_empty() {
            respond_error(
                reg,
                id,
                ErrorCode::BusyConsoles,
                &format!(
                    "Found {} console{} already in use.",
                    busy.len(),
                    if busy.len() == 1 { "" } else { "s" }
                ),
            );
            for cid in busy {
                write_busy_detail(reg, id, cid);
            }
            close_session(reg, id);
            return;
        }
    }

    perform_command(reg, id, req.verb, &matches);
}

fn write_busy_detail(reg: &mut Registry, client: ObjectId, console: ObjectId) {
    let Some(obj) = reg.get(console) else { return };
    let console_name = obj.name.clone();
    let writers = obj.writers.clone();
    for writer in writers {
        let Some(wc) = reg.get(writer).and_then(|o| o.kind.as_client()) else {
            continue;
        };
        let line = format!(
            "Console [{console_name}] in use by <{}> (idle {}).\n",
            wc.user_at_host(),
            timefmt::delta_string(wc.idle_secs()),
        );
        reg.write_to(client, line.as_bytes(), false);
    }
}

fn perform_command(
    reg: &mut Registry,
    id: ObjectId,
    verb: CommandVerb,
    matches: &[(ObjectId, String)],
) {
    match verb {
        CommandVerb::Query => {
            reg.write_to(id, &Response::ok_line(), false);
            for (_, name) in matches {
                reg.write_to(id, format!("{name}\n").as_bytes(), false);
            }
            close_session(reg, id);
        }
        CommandVerb::Monitor => {
            let names: Vec<&str> = matches.iter().map(|(_, n)| n.as_str()).collect();
            let line = Response::ok_line_with_consoles(&names)
                .unwrap_or_else(|_| Response::ok_line());
            reg.write_to(id, &line, false);
            for (cid, _) in matches {
                reg.link(*cid, id);
            }
            set_phase(reg, id, Phase::Data);
        }
        CommandVerb::Connect => {
            let names: Vec<&str> = matches.iter().map(|(_, n)| n.as_str()).collect();
            let line = Response::ok_line_with_consoles(&names)
                .unwrap_or_else(|_| Response::ok_line());
            reg.write_to(id, &line, false);
            let broadcast = reg
                .get(id)
                .and_then(|o| o.kind.as_client())
                .is_some_and(|c| c.broadcast);
            if broadcast {
                for (cid, _) in matches {
                    reg.link(id, *cid);
                }
            } else if let Some((cid, _)) = matches.first() {
                reg.link(id, *cid);
                reg.link(*cid, id);
            }
            set_phase(reg, id, Phase::Data);
        }
    }
}

fn set_phase(reg: &mut Registry, id: ObjectId, phase: Phase) {
    if let Some(client) = reg.get_mut(id).and_then(|o| o.kind.as_client_mut()) {
        client.phase = phase;
    }
}

/// Resolves request patterns to console objects, sorted for listing.
fn query_consoles(
    reg: &Registry,
    req: &Request,
) -> Result<Vec<(ObjectId, String)>, (ErrorCode, String)> {
    let joined = if req.consoles.is_empty() {
        // A bare QUERY matches every console.
        if req.verb == CommandVerb::Query {
            String::from(".*")
        } else {
            return Ok(Vec::new());
        }
    } else {
        req.consoles
            .iter()
            .map(|p| {
                if req.regex {
                    p.clone()
                } else {
                    regex::escape(p)
                }
            })
            .collect::<Vec<_>>()
            .join("|")
    };
    let anchored = format!("^(?:{joined})$");
    let re = RegexBuilder::new(&anchored)
        .case_insensitive(true)
        .build()
        .map_err(|err| {
            let text: String = err
                .to_string()
                .chars()
                .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect();
            (ErrorCode::BadRegex, text)
        })?;

    let mut matches: Vec<(ObjectId, String)> = reg
        .iter()
        .filter(|(_, obj)| obj.kind.is_console() && re.is_match(&obj.name))
        .map(|(cid, obj)| (cid, obj.name.clone()))
        .collect();
    matches.sort_by(|a, b| compare_console_names(&a.1, &b.1));
    Ok(matches)
}

fn respond_error(reg: &mut Registry, id: ObjectId, code: ErrorCode, msg: &str) {
    reg.write_to(id, &Response::error_line(code, msg), false);
}

/// Flags the session for teardown once its buffer drains.
pub fn close_session(reg: &mut Registry, id: ObjectId) {
    reg.unlink_all(id);
    if let Some(obj) = reg.get_mut(id) {
        obj.got_eof = true;
    }
}

fn process_data(reg: &mut Registry, id: ObjectId, data: &[u8]) -> InputResult {
    let Some(client) = reg.get_mut(id).and_then(|o| o.kind.as_client_mut()) else {
        return InputResult::default();
    };
    process_escapes(client, data)
}

/// Runs the DATA-phase escape processor over `data`.
///
/// The escape byte is recognised only in `Eol` mode (immediately after
/// a forwarded CR or LF, or at session start).  A recognised escape is
/// never forwarded; the next byte is consumed as a command, with the
/// doubled escape byte forwarding a single literal copy.  Command
/// bytes leave the processor in `Eol` mode so commands can be chained
/// without retyping a newline.
pub fn process_escapes(client: &mut ClientState, data: &[u8]) -> InputResult {
    let mut result = InputResult::default();
    for &b in data {
        match client.escape_mode {
            EscapeMode::Esc => {
                client.escape_mode = EscapeMode::Eol;
                if b == client.escape_char {
                    result.forward.push(b);
                    client.escape_mode = EscapeMode::Chr;
                    continue;
                }
                let cmd = match b {
                    b'.' => Some(EscapeCmd::Close),
                    b'?' => Some(EscapeCmd::Help),
                    b'B' => Some(EscapeCmd::Break),
                    b'F' => Some(EscapeCmd::SetForce),
                    b'J' => Some(EscapeCmd::SetJoin),
                    b'L' => Some(EscapeCmd::Replay),
                    b'M' => Some(EscapeCmd::SetMonitor),
                    b'Q' => Some(EscapeCmd::QuietToggle),
                    b'R' => Some(EscapeCmd::Reset),
                    b'Z' => Some(EscapeCmd::SuspendToggle),
                    _ => {
                        warn!(
                            client = %client.user_at_host(),
                            escape = %(b as char),
                            "invalid escape dropped"
                        );
                        None
                    }
                };
                result.commands.extend(cmd);
            }
            EscapeMode::Eol if b == client.escape_char => {
                client.escape_mode = EscapeMode::Esc;
            }
            EscapeMode::Eol | EscapeMode::Chr => {
                result.forward.push(b);
                client.escape_mode = if b == b'\r' || b == b'\n' {
                    EscapeMode::Eol
                } else {
                    EscapeMode::Chr
                };
            }
        }
    }
    result
}

const HELP_TEXT: &str = concat!(
    "\r\nSupported escape sequences:\r\n",
    "  &?  display this help\r\n",
    "  &.  disconnect\r\n",
    "  &&  send a single escape character\r\n",
    "  &B  send serial break\r\n",
    "  &F  force console write access\r\n",
    "  &J  join console write access\r\n",
    "  &L  replay the console log\r\n",
    "  &M  monitor the console read-only\r\n",
    "  &Q  toggle quiet mode\r\n",
    "  &R  reset the console\r\n",
    "  &Z  toggle output suspend\r\n",
);

/// Applies one escape command produced by [`process_escapes`].
pub fn apply_command(reg: &mut Registry, id: ObjectId, cmd: EscapeCmd) {
    match cmd {
        EscapeCmd::Close => close_session(reg, id),
        EscapeCmd::Help => {
            reg.write_to(id, HELP_TEXT.as_bytes(), false);
        }
        EscapeCmd::Break => perform_break(reg, id),
        EscapeCmd::SetForce => perform_relink(reg, id, EscapeCmd::SetForce),
        EscapeCmd::SetJoin => perform_relink(reg, id, EscapeCmd::SetJoin),
        EscapeCmd::SetMonitor => perform_relink(reg, id, EscapeCmd::SetMonitor),
        EscapeCmd::Replay => perform_replay(reg, id),
        EscapeCmd::QuietToggle => perform_quiet_toggle(reg, id),
        EscapeCmd::Reset => perform_reset(reg, id),
        EscapeCmd::SuspendToggle => {
            if let Some(client) = reg.get_mut(id).and_then(|o| o.kind.as_client_mut()) {
                client.got_suspend = !client.got_suspend;
            }
        }
    }
}

/// Transmits a serial-break to every console this client writes.
fn perform_break(reg: &mut Registry, id: ObjectId) {
    let consoles = reg.get(id).map(|o| o.readers.clone()).unwrap_or_default();
    for cid in consoles {
        let Some(obj) = reg.get_mut(cid) else { continue };
        match &obj.kind {
            ObjectKind::Serial(_) => {
                if let Some(fd) = obj.raw_fd() {
                    let name = obj.name.clone();
                    serial::send_break(&name, fd);
                }
            }
            ObjectKind::Telnet(_) => {
                telnet::send_cmd(obj, telnet::BREAK, None);
            }
            ObjectKind::Ipmi(_) => {
                ipmi::send_break(obj);
            }
            _ => {}
        }
    }
}

/// Switches the session flavour between force/join/read-only by
/// relinking the client's write leg.  A no-op for broadcast sessions.
fn perform_relink(reg: &mut Registry, id: ObjectId, cmd: EscapeCmd) {
    let console = {
        let Some(obj) = reg.get_mut(id) else { return };
        let console = obj.writers.first().copied();
        let Some(client) = obj.kind.as_client_mut() else {
            return;
        };
        if client.broadcast {
            return;
        }
        match cmd {
            EscapeCmd::SetForce => {
                client.force = true;
                client.join = false;
                client.command = Some(CommandVerb::Connect);
            }
            EscapeCmd::SetJoin => {
                client.force = false;
                client.join = true;
                client.command = Some(CommandVerb::Connect);
            }
            _ => {
                client.force = false;
                client.join = false;
                client.command = Some(CommandVerb::Monitor);
            }
        }
        console
    };
    let Some(console) = console else { return };
    let writing = reg
        .get(id)
        .is_some_and(|o| o.readers.contains(&console));

    match cmd {
        EscapeCmd::SetMonitor => {
            if writing {
                reg.unlink_pair(id, console);
            }
        }
        EscapeCmd::SetForce => {
            if writing {
                // Already a writer: evict everyone else.
                let others: Vec<ObjectId> = reg
                    .get(console)
                    .map(|o| o.writers.iter().copied().filter(|&w| w != id).collect())
                    .unwrap_or_default();
                for other in others {
                    reg.unlink_all(other);
                }
            } else {
                reg.link(id, console);
            }
        }
        _ => {
            if !writing {
                reg.link(id, console);
            }
        }
    }
}

/// Replays the tail of the console's logfile to the client as one
/// informational blob framed by begin/end markers.  A no-op for
/// broadcast sessions; "not being logged" is reported in-band.
fn perform_replay(reg: &mut Registry, id: ObjectId) {
    let Some(console) = reg.get(id).and_then(|o| o.writers.first().copied()) else {
        return; // broadcast sessions have no writer
    };
    let Some(console_obj) = reg.get(console) else { return };
    let console_name = console_obj.name.clone();
    let logfile = console_obj
        .kind
        .logfile_id()
        .and_then(|lid| reg.get(lid).map(|o| (lid, o.raw_fd())));

    let blob = match logfile {
        Some((lid, Some(_fd))) => {
            let begin = info_msg(&format!("Begin log replay of console [{console_name}]"));
            let end = info_msg(&format!("End log replay of console [{console_name}]"));
            let Some(log_obj) = reg.get(lid) else { return };
            let mut blob = Vec::with_capacity(begin.len() + end.len() + REPLAY_LEN);
            blob.extend_from_slice(begin.as_bytes());
            {
                // The buffer lock covers the history copy, exactly like
                // the drain path.
                let ring = log_obj.buf();
                let cap = crate::OBJ_BUF_SIZE - 1;
                let room = cap.saturating_sub(begin.len() + end.len());
                let n = REPLAY_LEN.min(ring.history_len()).min(room);
                ring.copy_tail(n, &mut blob);
            }
            blob.extend_from_slice(end.as_bytes());
            blob
        }
        _ => info_msg(&format!("Console [{console_name}] is not being logged"))
            .into_bytes(),
    };
    reg.write_to(id, &blob, false);
}

fn perform_quiet_toggle(reg: &mut Registry, id: ObjectId) {
    let Some(client) = reg.get_mut(id).and_then(|o| o.kind.as_client_mut()) else {
        return;
    };
    client.quiet = !client.quiet;
    let (op, action) = if client.quiet {
        ("Enabled", "suppressed")
    } else {
        ("Disabled", "displayed")
    };
    let msg = info_msg(&format!("{op} quiet-mode -- info msgs will be {action}"));
    // Written as non-informational so the acknowledgement always lands.
    reg.write_to(id, msg.as_bytes(), false);
}

/// Flags every console this client writes for reset; the reactor's
/// post-step runs the operator command.
fn perform_reset(reg: &mut Registry, id: ObjectId) {
    let (who, tty, consoles) = {
        let Some(obj) = reg.get(id) else { return };
        let Some(client) = obj.kind.as_client() else { return };
        (
            client.user_at_host(),
            client.tty.clone(),
            obj.readers.clone(),
        )
    };
    let now = timefmt::short_time();
    for cid in consoles {
        let Some(obj) = reg.get_mut(cid) else { continue };
        if !obj.kind.is_console() || obj.got_reset {
            continue;
        }
        obj.got_reset = true;
        let name = obj.name.clone();
        info!(console = %name, by = %who, "console reset requested");
        let on_tty = tty
            .as_ref()
            .map_or_else(String::new, |t| format!(" on {t}"));
        let msg = info_msg(&format!(
            "Console [{name}] reset by <{who}>{on_tty} at {now}"
        ));
        reg.notify_console(cid, &msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::test_dev::{TestOptions, TestState};
    use crate::fdio;
    use crate::logfile::{LogOptions, LogfileState, SanitizeState};
    use crate::object::Object;
    use std::os::fd::OwnedFd;
    use std::path::PathBuf;

    fn sink_fd() -> OwnedFd {
        let (_rx, tx) = fdio::pipe().expect("pipe");
        std::mem::forget(_rx);
        tx
    }

    fn console(name: &str) -> Object {
        Object::new(
            String::from(name),
            Some(sink_fd()),
            ObjectKind::Test(TestState::new(TestOptions::default())),
        )
    }

    fn fresh_client(reg: &mut Registry) -> ObjectId {
        let state = ClientState::accepted(String::from("home"), String::from("10.0.0.9"), 4242);
        reg.insert(Object::new(
            String::from("10.0.0.9:4242"),
            Some(sink_fd()),
            ObjectKind::Client(state),
        ))
    }

    fn drain_client(reg: &mut Registry, id: ObjectId) -> Vec<u8> {
        let obj = reg.get(id).expect("client");
        let mut ring = obj.buf();
        let mut out = Vec::new();
        while !ring.is_empty() {
            let chunk = ring.drainable().to_vec();
            out.extend_from_slice(&chunk);
            ring.consume(chunk.len());
        }
        out
    }

    fn greet(reg: &mut Registry, id: ObjectId) {
        handle_input(reg, id, b"HELLO USER='u'\n");
        let out = drain_client(reg, id);
        assert_eq!(out, b"OK\n");
    }

    #[test]
    fn query_lists_consoles_in_integer_sorted_order() {
        let mut reg = Registry::new();
        for name in ["a", "b1", "b2", "b10"] {
            reg.insert(console(name));
        }
        let id = fresh_client(&mut reg);
        greet(&mut reg, id);
        handle_input(&mut reg, id, b"QUERY\n");
        let out = drain_client(&mut reg, id);
        assert_eq!(out, b"OK\na\nb1\nb2\nb10\n");
        assert!(reg.get(id).expect("client").got_eof);
    }

    #[test]
    fn connect_to_a_busy_console_without_force_reports_the_writer() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c"));
        // First client connects read/write.
        let first = fresh_client(&mut reg);
        handle_input(&mut reg, first, b"HELLO USER='x'\nCONNECT CONSOLE='c'\n");
        drain_client(&mut reg, first);
        assert!(reg.get(con).expect("console").writers.contains(&first));

        // Second client without FORCE is refused with detail.
        let second = fresh_client(&mut reg);
        handle_input(&mut reg, second, b"HELLO USER='y'\nCONNECT CONSOLE='c'\n");
        let out = String::from_utf8(drain_client(&mut reg, second)).expect("utf8");
        assert!(out.starts_with("OK\n"), "got: {out}");
        assert!(
            out.contains("ERROR CODE=7 MESSAGE='Found 1 console already in use.'\n"),
            "got: {out}"
        );
        assert!(out.contains("Console [c] in use by <x@home> (idle 0s).\n"), "got: {out}");
        assert!(reg.get(second).expect("client").got_eof);
    }

    #[test]
    fn connect_with_force_steals_the_console() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c"));
        let first = fresh_client(&mut reg);
        handle_input(&mut reg, first, b"HELLO USER='x'\nCONNECT CONSOLE='c'\n");
        let second = fresh_client(&mut reg);
        handle_input(
            &mut reg,
            second,
            b"HELLO USER='y'\nCONNECT CONSOLE='c' OPTION=FORCE\n",
        );
        let writers = reg.get(con).expect("console").writers.clone();
        assert_eq!(writers, vec![second]);
        assert!(reg.get(first).expect("old client").got_eof);
        // The old client was told about the takeover.
        let out = String::from_utf8(drain_client(&mut reg, first)).expect("utf8");
        assert!(out.contains("stolen by <y@home>"), "got: {out}");
    }

    #[test]
    fn monitor_links_read_only() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='m'\nMONITOR CONSOLE='c'\n");
        let out = drain_client(&mut reg, id);
        assert_eq!(out, b"OK\nOK CONSOLE='c'\n");
        let obj = reg.get(id).expect("client");
        assert!(obj.readers.is_empty());
        assert_eq!(obj.writers, vec![con]);
    }

    #[test]
    fn unmatched_patterns_yield_no_consoles() {
        let mut reg = Registry::new();
        reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='u'\nCONNECT CONSOLE='zzz'\n");
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(
            out.contains("ERROR CODE=5 MESSAGE='Found no matching consoles.'"),
            "got: {out}"
        );
    }

    #[test]
    fn multiple_matches_without_broadcast_list_the_candidates() {
        let mut reg = Registry::new();
        reg.insert(console("web1"));
        reg.insert(console("web2"));
        let id = fresh_client(&mut reg);
        handle_input(
            &mut reg,
            id,
            b"HELLO USER='u'\nCONNECT CONSOLE='web[0-9]+' OPTION=REGEX\n",
        );
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(
            out.contains("ERROR CODE=6 MESSAGE='Found 2 matching consoles.'"),
            "got: {out}"
        );
        assert!(out.contains("web1\nweb2\n"), "got: {out}");
    }

    #[test]
    fn literal_patterns_do_not_act_as_regexes() {
        let mut reg = Registry::new();
        reg.insert(console("web1"));
        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='u'\nCONNECT CONSOLE='web.'\n");
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(out.contains("ERROR CODE=5"), "got: {out}");
    }

    #[test]
    fn bad_regex_is_reported() {
        let mut reg = Registry::new();
        reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        handle_input(
            &mut reg,
            id,
            b"HELLO USER='u'\nCONNECT CONSOLE='[' OPTION=REGEX\n",
        );
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(out.contains("ERROR CODE=3"), "got: {out}");
    }

    #[test]
    fn console_matching_is_case_insensitive() {
        let mut reg = Registry::new();
        reg.insert(console("Web1"));
        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='u'\nMONITOR CONSOLE='wEB1'\n");
        let out = drain_client(&mut reg, id);
        assert_eq!(out, b"OK\nOK CONSOLE='Web1'\n");
    }

    #[test]
    fn doubled_escape_forwards_one_literal() {
        // S3: with escape '&', X\n&&Y forwards X\n&Y.
        let mut client = ClientState::for_tests("u", "h");
        client.escape_mode = EscapeMode::Chr;
        let result = process_escapes(&mut client, b"X\n&&Y");
        assert_eq!(result.forward, b"X\n&Y");
        assert!(result.commands.is_empty());
    }

    #[test]
    fn escape_only_fires_after_a_line_terminator() {
        let mut client = ClientState::for_tests("u", "h");
        client.escape_mode = EscapeMode::Chr;
        let result = process_escapes(&mut client, b"A&B\r&Z");
        // The first '&' is mid-line data; the second follows a CR.
        assert_eq!(result.forward, b"A&B\r");
        assert_eq!(result.commands, vec![EscapeCmd::SuspendToggle]);
    }

    #[test]
    fn escape_state_survives_split_bursts() {
        let mut client = ClientState::for_tests("u", "h");
        let r1 = process_escapes(&mut client, b"\n&");
        assert_eq!(r1.forward, b"\n");
        assert!(r1.commands.is_empty());
        let r2 = process_escapes(&mut client, b".");
        assert!(r2.forward.is_empty());
        assert_eq!(r2.commands, vec![EscapeCmd::Close]);
    }

    #[test]
    fn commands_chain_without_a_fresh_newline() {
        let mut client = ClientState::for_tests("u", "h");
        let result = process_escapes(&mut client, b"&B&R");
        assert!(result.forward.is_empty());
        assert_eq!(result.commands, vec![EscapeCmd::Break, EscapeCmd::Reset]);
    }

    #[test]
    fn unknown_escape_commands_are_dropped() {
        let mut client = ClientState::for_tests("u", "h");
        let result = process_escapes(&mut client, b"&x");
        assert!(result.forward.is_empty());
        assert!(result.commands.is_empty());
    }

    #[test]
    fn reset_flags_written_consoles_and_announces() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='u'\nCONNECT CONSOLE='c'\n");
        drain_client(&mut reg, id);
        apply_command(&mut reg, id, EscapeCmd::Reset);
        assert!(reg.get(con).expect("console").got_reset);
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(out.contains("reset by <u@home>"), "got: {out}");
    }

    #[test]
    fn monitor_escape_downgrades_a_connect_session() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='u'\nCONNECT CONSOLE='c'\n");
        apply_command(&mut reg, id, EscapeCmd::SetMonitor);
        let obj = reg.get(id).expect("client");
        assert!(obj.readers.is_empty());
        assert_eq!(obj.writers, vec![con]);
        // And force upgrades it back.
        apply_command(&mut reg, id, EscapeCmd::SetForce);
        let obj = reg.get(id).expect("client");
        assert_eq!(obj.readers, vec![con]);
    }

    #[test]
    fn replay_without_a_logfile_reports_in_band() {
        let mut reg = Registry::new();
        reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='u'\nCONNECT CONSOLE='c'\n");
        drain_client(&mut reg, id);
        apply_command(&mut reg, id, EscapeCmd::Replay);
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(out.contains("Console [c] is not being logged"), "got: {out}");
    }

    #[test]
    fn replay_frames_the_log_tail_between_markers() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c"));
        let logfile = reg.insert(Object::new(
            String::from("/tmp/c.log"),
            Some(sink_fd()),
            ObjectKind::Logfile(LogfileState {
                console_name: String::from("c"),
                path: PathBuf::from("/tmp/c.log"),
                opts: LogOptions::default(),
                sanitize: SanitizeState::default(),
            }),
        ));
        reg.get_mut(con)
            .expect("console")
            .kind
            .set_logfile_id(Some(logfile));
        reg.link(con, logfile);
        // 3000 bytes of history, unwrapped.
        let payload = vec![b'x'; 3000];
        reg.get_mut(logfile).expect("logfile").buf().write(&payload);

        let id = fresh_client(&mut reg);
        handle_input(&mut reg, id, b"HELLO USER='u'\nCONNECT CONSOLE='c'\n");
        drain_client(&mut reg, id);
        apply_command(&mut reg, id, EscapeCmd::Replay);
        let out = drain_client(&mut reg, id);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Begin log replay of console [c]"), "got: {text}");
        assert!(text.contains("End log replay of console [c]"), "got: {text}");
        let xs = out.iter().filter(|&&b| b == b'x').count();
        assert_eq!(xs, 3000);
    }

    #[test]
    fn quiet_toggle_acknowledges_despite_quiet_mode() {
        let mut reg = Registry::new();
        reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        handle_input(
            &mut reg,
            id,
            b"HELLO USER='u'\nCONNECT CONSOLE='c' OPTION=QUIET\n",
        );
        drain_client(&mut reg, id);
        apply_command(&mut reg, id, EscapeCmd::QuietToggle);
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(out.contains("Disabled quiet-mode"), "got: {out}");
    }

    #[test]
    fn oversized_request_lines_are_rejected() {
        let mut reg = Registry::new();
        reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        let huge = vec![b'A'; MAX_SOCK_LINE + 2];
        handle_input(&mut reg, id, &huge);
        let out = String::from_utf8(drain_client(&mut reg, id)).expect("utf8");
        assert!(out.contains("ERROR CODE=2"), "got: {out}");
        assert!(reg.get(id).expect("client").got_eof);
    }

    #[test]
    fn handshake_and_data_in_one_burst() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c"));
        let id = fresh_client(&mut reg);
        let result = handle_input(
            &mut reg,
            id,
            b"HELLO USER='u'\nCONNECT CONSOLE='c'\nls\n",
        );
        assert_eq!(result.forward, b"ls\n");
        assert!(reg.get(con).expect("console").writers.contains(&id));
    }
}
