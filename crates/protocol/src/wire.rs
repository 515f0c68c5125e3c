//! Typed request/response forms of the client↔daemon wire protocol.
//!
//! One command per line, LF-terminated (CR-LF accepted), tokens separated
//! by spaces, keywords case-insensitive.  The exchange is:
//!
//! ```text
//! C: HELLO USER='alice' TTY='/dev/pts/4'
//! S: OK
//! C: CONNECT CONSOLE='web[0-9]+' OPTION=REGEX OPTION=JOIN
//! S: OK CONSOLE='web1'
//! ```
//!
//! after which the connection is an opaque byte stream.  Error responses
//! carry `CODE=<n> MESSAGE='…'` with the code values of [`ErrorCode`].

use crate::lexer::{LexError, Lexer, Token};
use crate::takeout::{self, TakeoutError};
use thiserror::Error;

/// Maximum length of a single protocol line, terminator included.
pub const MAX_SOCK_LINE: usize = 32768;

/// Default TCP port the daemon listens on.
pub const DEFAULT_PORT: u16 = 7890;

/// Error codes carried on the wire in `ERROR CODE=<n>` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    Local,
    BadRequest,
    BadRegex,
    Authenticate,
    NoConsoles,
    TooManyConsoles,
    BusyConsoles,
    NoResources,
}

impl ErrorCode {
    pub fn to_wire(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Local => 1,
            Self::BadRequest => 2,
            Self::BadRegex => 3,
            Self::Authenticate => 4,
            Self::NoConsoles => 5,
            Self::TooManyConsoles => 6,
            Self::BusyConsoles => 7,
            Self::NoResources => 8,
        }
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Local,
            2 => Self::BadRequest,
            3 => Self::BadRegex,
            4 => Self::Authenticate,
            5 => Self::NoConsoles,
            6 => Self::TooManyConsoles,
            7 => Self::BusyConsoles,
            8 => Self::NoResources,
            _ => return None,
        })
    }
}

/// The three request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerb {
    Query,
    Monitor,
    Connect,
}

impl CommandVerb {
    fn keyword(self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::Monitor => "MONITOR",
            Self::Connect => "CONNECT",
        }
    }
}

/// `OPTION=` values accepted on a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOption {
    Broadcast,
    Force,
    Join,
    Quiet,
    Regex,
}

/// Parse or encode failures for protocol lines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Takeout(#[from] TakeoutError),
    #[error("line exceeds {MAX_SOCK_LINE} bytes")]
    LineTooLong,
    #[error("greeting is missing a user name")]
    MissingUser,
    #[error("request is missing a command verb")]
    MissingVerb,
    #[error("unrecognized response")]
    UnrecognizedResponse,
    #[error("malformed error response")]
    MalformedError,
}

/// The `HELLO` greeting a client opens the session with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub user: String,
    pub tty: Option<String>,
}

impl Greeting {
    /// Parses one greeting line.  The user name must be present and
    /// non-empty.
    pub fn parse(line: &[u8]) -> Result<Self, WireError> {
        check_len(line)?;
        let mut lex = Lexer::new(line);
        let mut user: Option<String> = None;
        let mut tty: Option<String> = None;
        let mut saw_hello = false;
        loop {
            match lex.next_token()? {
                Token::Word(w) if w.eq_ignore_ascii_case("HELLO") => {
                    saw_hello = true;
                }
                Token::Word(w) if saw_hello && w.eq_ignore_ascii_case("USER") => {
                    if let Some(value) = parse_kv_str(&mut lex)? {
                        user = Some(value);
                    }
                }
                Token::Word(w) if saw_hello && w.eq_ignore_ascii_case("TTY") => {
                    if let Some(value) = parse_kv_str(&mut lex)? {
                        tty = Some(value);
                    }
                }
                Token::Eol | Token::Eof => break,
                _ => {}
            }
        }
        match user {
            Some(user) if !user.is_empty() => Ok(Self { user, tty }),
            _ => Err(WireError::MissingUser),
        }
    }

    /// Encodes the greeting as a wire line, LF-terminated.
    pub fn to_line(&self) -> Result<Vec<u8>, WireError> {
        let mut line = Vec::with_capacity(64);
        line.extend_from_slice(b"HELLO USER='");
        line.extend_from_slice(&takeout::encode(self.user.as_bytes())?);
        line.push(b'\'');
        if let Some(tty) = &self.tty {
            line.extend_from_slice(b" TTY='");
            line.extend_from_slice(&takeout::encode(tty.as_bytes())?);
            line.push(b'\'');
        }
        line.push(b'\n');
        Ok(line)
    }
}

/// A parsed request line: verb, console patterns, and option flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: CommandVerb,
    pub consoles: Vec<String>,
    pub broadcast: bool,
    pub force: bool,
    pub join: bool,
    pub quiet: bool,
    pub regex: bool,
}

impl Request {
    pub fn new(verb: CommandVerb) -> Self {
        Self {
            verb,
            consoles: Vec::new(),
            broadcast: false,
            force: false,
            join: false,
            quiet: false,
            regex: false,
        }
    }

    /// Parses one request line.  Unrecognised keywords are ignored, per
    /// the forward-compatibility convention of the protocol.
    pub fn parse(line: &[u8]) -> Result<Self, WireError> {
        check_len(line)?;
        let mut lex = Lexer::new(line);
        let mut req: Option<Request> = None;
        loop {
            match lex.next_token()? {
                Token::Word(w) => {
                    let upper_matches = |kw: &str| w.eq_ignore_ascii_case(kw);
                    if upper_matches("QUERY") {
                        req.get_or_insert(Request::new(CommandVerb::Query));
                    } else if upper_matches("MONITOR") {
                        req.get_or_insert(Request::new(CommandVerb::Monitor));
                    } else if upper_matches("CONNECT") {
                        req.get_or_insert(Request::new(CommandVerb::Connect));
                    } else if let Some(req) = req.as_mut() {
                        if upper_matches("CONSOLE") {
                            if let Some(value) = parse_kv_str(&mut lex)? {
                                if !value.is_empty() {
                                    req.consoles.push(value);
                                }
                            }
                        } else if upper_matches("OPTION") {
                            if let Some(opt) = parse_kv_option(&mut lex)? {
                                req.set_option(opt);
                            }
                        }
                    }
                }
                Token::Eol | Token::Eof => break,
                _ => {}
            }
        }
        req.ok_or(WireError::MissingVerb)
    }

    fn set_option(&mut self, opt: RequestOption) {
        match opt {
            RequestOption::Broadcast => self.broadcast = true,
            RequestOption::Force => self.force = true,
            RequestOption::Join => self.join = true,
            RequestOption::Quiet => self.quiet = true,
            RequestOption::Regex => self.regex = true,
        }
    }

    /// Encodes the request as a wire line, LF-terminated.
    pub fn to_line(&self) -> Result<Vec<u8>, WireError> {
        let mut line = Vec::with_capacity(64);
        line.extend_from_slice(self.verb.keyword().as_bytes());
        for console in &self.consoles {
            line.extend_from_slice(b" CONSOLE='");
            line.extend_from_slice(&takeout::encode(console.as_bytes())?);
            line.push(b'\'');
        }
        for (flag, name) in [
            (self.broadcast, "BROADCAST"),
            (self.force, "FORCE"),
            (self.join, "JOIN"),
            (self.quiet, "QUIET"),
            (self.regex, "REGEX"),
        ] {
            if flag {
                line.extend_from_slice(b" OPTION=");
                line.extend_from_slice(name.as_bytes());
            }
        }
        line.push(b'\n');
        if line.len() > MAX_SOCK_LINE {
            return Err(WireError::LineTooLong);
        }
        Ok(line)
    }
}

/// A server response: `OK [CONSOLE='…']…` or `ERROR CODE= MESSAGE=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok { consoles: Vec<String> },
    Err { code: ErrorCode, message: String },
}

impl Response {
    /// Parses one response line.
    pub fn parse(line: &[u8]) -> Result<Self, WireError> {
        check_len(line)?;
        let mut lex = Lexer::new(line);
        loop {
            match lex.next_token()? {
                Token::Word(w) if w.eq_ignore_ascii_case("OK") => {
                    return Self::parse_ok(&mut lex);
                }
                Token::Word(w) if w.eq_ignore_ascii_case("ERROR") => {
                    return Self::parse_err(&mut lex);
                }
                Token::Eol | Token::Eof => return Err(WireError::UnrecognizedResponse),
                _ => {}
            }
        }
    }

    fn parse_ok(lex: &mut Lexer<'_>) -> Result<Self, WireError> {
        let mut consoles = Vec::new();
        loop {
            match lex.next_token()? {
                Token::Word(w) if w.eq_ignore_ascii_case("CONSOLE") => {
                    if let Some(value) = parse_kv_str(lex)? {
                        consoles.push(value);
                    }
                }
                Token::Eol | Token::Eof => return Ok(Self::Ok { consoles }),
                _ => {}
            }
        }
    }

    fn parse_err(lex: &mut Lexer<'_>) -> Result<Self, WireError> {
        let mut code: Option<ErrorCode> = None;
        let mut message = String::new();
        loop {
            match lex.next_token()? {
                Token::Word(w) if w.eq_ignore_ascii_case("CODE") => {
                    if lex.next_token()? == Token::Char(b'=') {
                        if let Token::Int(n) = lex.next_token()? {
                            code = ErrorCode::from_wire(n);
                        }
                    }
                }
                Token::Word(w) if w.eq_ignore_ascii_case("MESSAGE") => {
                    if let Some(value) = parse_kv_str(lex)? {
                        message = value;
                    }
                }
                Token::Eol | Token::Eof => break,
                _ => {}
            }
        }
        let code = code.ok_or(WireError::MalformedError)?;
        Ok(Self::Err { code, message })
    }

    /// Builds a bare `OK` line.
    pub fn ok_line() -> Vec<u8> {
        b"OK\n".to_vec()
    }

    /// Builds an `OK` line naming the consoles granted to the client.
    pub fn ok_line_with_consoles<S: AsRef<str>>(
        consoles: &[S],
    ) -> Result<Vec<u8>, WireError> {
        let mut line = Vec::with_capacity(16);
        line.extend_from_slice(b"OK");
        for console in consoles {
            line.extend_from_slice(b" CONSOLE='");
            line.extend_from_slice(&takeout::encode(console.as_ref().as_bytes())?);
            line.push(b'\'');
        }
        line.push(b'\n');
        Ok(line)
    }

    /// Builds an `ERROR` line.  The message is take-out encoded so it can
    /// carry quotes safely.
    pub fn error_line(code: ErrorCode, message: &str) -> Vec<u8> {
        let encoded = takeout::encode(message.as_bytes())
            .unwrap_or_else(|_| b"malformed error message".to_vec());
        let mut line = Vec::with_capacity(32 + encoded.len());
        line.extend_from_slice(b"ERROR CODE=");
        line.extend_from_slice(code.to_wire().to_string().as_bytes());
        line.extend_from_slice(b" MESSAGE='");
        line.extend_from_slice(&encoded);
        line.extend_from_slice(b"'\n");
        line
    }
}

fn check_len(line: &[u8]) -> Result<(), WireError> {
    if line.len() > MAX_SOCK_LINE {
        return Err(WireError::LineTooLong);
    }
    Ok(())
}

/// Parses the `='<value>'` tail of a key-value pair, decoding the
/// take-out encoding.  Returns `None` when the shape does not match,
/// mirroring the lenient parsing of unrecognised tokens.
fn parse_kv_str(lex: &mut Lexer<'_>) -> Result<Option<String>, WireError> {
    if lex.next_token()? != Token::Char(b'=') {
        return Ok(None);
    }
    match lex.next_token()? {
        Token::Str(bytes) => Ok(Some(takeout::decode_to_string(bytes))),
        _ => Ok(None),
    }
}

fn parse_kv_option(lex: &mut Lexer<'_>) -> Result<Option<RequestOption>, WireError> {
    if lex.next_token()? != Token::Char(b'=') {
        return Ok(None);
    }
    let Token::Word(w) = lex.next_token()? else {
        return Ok(None);
    };
    let opt = if w.eq_ignore_ascii_case("BROADCAST") {
        RequestOption::Broadcast
    } else if w.eq_ignore_ascii_case("FORCE") {
        RequestOption::Force
    } else if w.eq_ignore_ascii_case("JOIN") {
        RequestOption::Join
    } else if w.eq_ignore_ascii_case("QUIET") {
        RequestOption::Quiet
    } else if w.eq_ignore_ascii_case("REGEX") {
        RequestOption::Regex
    } else {
        return Ok(None);
    };
    Ok(Some(opt))
}
