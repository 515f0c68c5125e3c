//! # Overview
//!
//! `cmux_cli` implements the thin interactive front-end for the cmux
//! console manager.  The crate is intentionally small: it parses the
//! client switches, performs the `HELLO`/request handshake with the
//! daemon, and then pumps raw bytes between the local terminal and the
//! socket until either side closes.  All console semantics — escapes,
//! takeover, replay — live in the daemon; the only client-side
//! cleverness is rewriting a non-default `-e` escape character onto
//! the server's.
//!
//! [`run`] accepts an argument iterator plus stdout/stderr handles and
//! returns the exit code: 0 on a normal close, 1 for usage or local
//! errors, 2 when the server reports an error.

pub mod args;
pub mod rewrite;
pub mod tty;

use args::ClientArgs;
use clap::Parser;
use cmux_core::fdio;
use cmux_core::poll::{Events, Poller};
use cmux_protocol::wire::{CommandVerb, Greeting, Request, Response};
use rewrite::EscapeRewriter;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

/// Runs the client.  See the crate docs for the exit-code contract.
pub fn run<'a, I, T>(args: I, stdout: &'a mut dyn Write, stderr: &'a mut dyn Write) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = match ClientArgs::try_parse_from(args) {
        Ok(args) => args,
        Err(err) => {
            let is_help = err.kind() == clap::error::ErrorKind::DisplayHelp
                || err.kind() == clap::error::ErrorKind::DisplayVersion;
            let _ = write!(if is_help { stdout } else { stderr }, "{err}");
            return i32::from(!is_help);
        }
    };
    if let Err(err) = args.validate() {
        let _ = writeln!(stderr, "cmux: {err}");
        return 1;
    }
    match session(&args, stdout, stderr) {
        Ok(code) => code,
        Err(err) => {
            let _ = writeln!(stderr, "cmux: {err}");
            1
        }
    }
}

fn session(
    args: &ClientArgs,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<i32, String> {
    let (host, port) = args.endpoint()?;
    let mut stream = TcpStream::connect((host.as_str(), port))
        .map_err(|e| format!("unable to connect to {host}:{port}: {e}"))?;

    // Greeting.
    let greeting = Greeting {
        user: login_name(),
        tty: tty::tty_name(),
    };
    let line = greeting.to_line().map_err(|e| e.to_string())?;
    stream.write_all(&line).map_err(|e| e.to_string())?;
    match read_response(&mut stream)? {
        Response::Ok { .. } => {}
        Response::Err { message, .. } => {
            let _ = writeln!(stderr, "cmux: server error: {message}");
            return Ok(2);
        }
    }

    // Request.
    let mut request = Request::new(args.verb());
    request.consoles = args.consoles.clone();
    request.broadcast = args.broadcast;
    request.force = args.force;
    request.join = args.join;
    request.quiet = args.quiet;
    request.regex = args.regex;
    let line = request.to_line().map_err(|e| e.to_string())?;
    stream.write_all(&line).map_err(|e| e.to_string())?;
    match read_response(&mut stream)? {
        Response::Ok { consoles } => {
            if args.verbose && !consoles.is_empty() {
                let _ = writeln!(stderr, "cmux: connected to [{}]", consoles.join(", "));
            }
        }
        Response::Err { message, .. } => {
            let _ = writeln!(stderr, "cmux: server error: {message}");
            // Error detail (busy writers, candidate consoles) follows
            // until the server closes.
            let mut detail = String::new();
            let _ = stream.read_to_string(&mut detail);
            for line in detail.lines() {
                let _ = writeln!(stderr, "cmux: {line}");
            }
            return Ok(2);
        }
    }

    if args.verb() == CommandVerb::Query {
        let mut names = Vec::new();
        stream
            .read_to_end(&mut names)
            .map_err(|e| e.to_string())?;
        stdout.write_all(&names).map_err(|e| e.to_string())?;
        return Ok(0);
    }

    pump(args, stream, stdout)
}

/// Bidirectional copy between the local terminal and the daemon, with
/// the local tty in raw mode.  Returns once the server closes.
fn pump(
    args: &ClientArgs,
    stream: TcpStream,
    stdout: &mut dyn Write,
) -> Result<i32, String> {
    stream.set_nonblocking(true).map_err(|e| e.to_string())?;
    let sock_fd = stream.as_raw_fd();
    let stdin_fd = libc::STDIN_FILENO;

    let mut session_log = match &args.log {
        Some(path) => Some(open_session_log(path)?),
        None => None,
    };
    let _raw = tty::RawTty::enable().map_err(|e| e.to_string())?;
    let mut rewriter = EscapeRewriter::new(args.escape);
    let mut poller = Poller::new().map_err(|e| e.to_string())?;
    let mut stdin_open = true;
    let mut outbound: Vec<u8> = Vec::new();

    loop {
        poller.begin();
        let stdin_slot = stdin_open.then(|| poller.add(stdin_fd, Events::READ));
        let sock_events = if outbound.is_empty() {
            Events::READ
        } else {
            Events::READ_WRITE
        };
        let sock_slot = poller.add(sock_fd, sock_events);
        poller
            .wait(Some(Duration::from_secs(60)))
            .map_err(|e| e.to_string())?;

        if let Some(slot) = stdin_slot {
            if poller.revents(slot).readable {
                let mut buf = [0u8; 4096];
                match fdio::read(stdin_fd, &mut buf) {
                    Ok(0) => {
                        // Keyboard EOF: stop reading, let output drain.
                        stdin_open = false;
                        let _ = stream.shutdown(std::net::Shutdown::Write);
                    }
                    Ok(n) => rewriter.rewrite(&buf[..n], &mut outbound),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err.to_string()),
                }
            }
        }

        let revents = poller.revents(sock_slot);
        if revents.writable && !outbound.is_empty() {
            match fdio::write(sock_fd, &outbound) {
                Ok(n) => {
                    outbound.drain(..n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.to_string()),
            }
        }
        if revents.readable {
            let mut buf = [0u8; 8192];
            match fdio::read(sock_fd, &mut buf) {
                Ok(0) => break, // server closed
                Ok(n) => {
                    stdout.write_all(&buf[..n]).map_err(|e| e.to_string())?;
                    stdout.flush().ok();
                    if let Some(log) = &mut session_log {
                        log.write_all(&buf[..n]).map_err(|e| e.to_string())?;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.to_string()),
            }
        }
    }
    Ok(0)
}

fn open_session_log(path: &Path) -> Result<std::fs::File, String> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("unable to open log \"{}\": {e}", path.display()))
}

/// The invoking user's login name, for the greeting.
fn login_name() -> String {
    users::get_current_username()
        .map(|name| name.to_string_lossy().into_owned())
        .or_else(|| std::env::var("LOGNAME").ok())
        .unwrap_or_else(|| format!("uid{}", users::get_current_uid()))
}

/// Reads one LF-terminated response line, one byte at a time so no
/// session data past the terminator is consumed.
fn read_response(stream: &mut TcpStream) -> Result<Response, String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).map_err(|e| e.to_string())?;
        if n == 0 {
            return Err(String::from("connection terminated by server"));
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() > cmux_protocol::wire::MAX_SOCK_LINE {
            return Err(String::from("response line too long"));
        }
    }
    Response::parse(&line).map_err(|e| e.to_string())
}
