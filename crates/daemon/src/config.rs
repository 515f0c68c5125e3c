//! Server configuration-file parsing.
//!
//! The file shares the wire protocol's lexer: one directive per line,
//! `#` comments, quoted values, keywords matched case-insensitively.
//! Three directives exist — `SERVER` for daemon-wide settings, `GLOBAL`
//! for per-console defaults, and `CONSOLE` to declare a console.  The
//! `DEV` value discriminates the driver:
//!
//! ```text
//! SERVER  PORT=7890 PIDFILE="/run/cmuxd.pid" RESETCMD="powerman -r &"
//! GLOBAL  LOG="/var/log/cmux/&.log" LOGOPTS="sanitize,timestamp"
//! CONSOLE NAME="web1" DEV="ts1:2001"
//! CONSOLE NAME="db1"  DEV="/dev/ttyS0" SEROPTS="115200,8n1"
//! CONSOLE NAME="bmc1" DEV="ipmi:bmc1.mgmt" IPMIOPTS="U:admin,P:pw"
//! ```

use cmux_core::console::ipmi::IpmiOptions;
use cmux_core::console::serial::SerialOptions;
use cmux_core::console::test_dev::TestOptions;
use cmux_core::logfile::LogOptions;
use cmux_protocol::lexer::{Lexer, Token};
use cmux_protocol::takeout;
use cmux_protocol::wire::DEFAULT_PORT;
use std::path::PathBuf;
use thiserror::Error;

/// Escape character expanded in `LOG` and `RESETCMD` templates.
pub const CONFIG_ESCAPE: char = '&';

#[derive(Debug, Error)]
#[error("{path}:{line}: {message}")]
pub struct ConfigError {
    pub path: String,
    pub line: u32,
    pub message: String,
}

/// One `CONSOLE` directive, before driver classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsoleSpec {
    pub name: String,
    pub dev: String,
    pub log: Option<String>,
    pub log_opts: Option<String>,
    pub ser_opts: Option<String>,
    pub ipmi_opts: Option<String>,
    pub test_opts: Option<String>,
}

/// The parsed configuration.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub loopback: bool,
    pub keepalive: bool,
    pub log_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub reset_cmd: Option<String>,
    pub syslog_facility: Option<String>,
    pub tstamp_minutes: u32,
    pub exec_path: Option<String>,
    pub global_log: Option<String>,
    pub global_log_opts: LogOptions,
    pub global_ser_opts: SerialOptions,
    pub global_ipmi_opts: IpmiOptions,
    pub global_test_opts: TestOptions,
    pub consoles: Vec<ConsoleSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            loopback: false,
            keepalive: true,
            log_dir: None,
            log_file: None,
            pid_file: None,
            reset_cmd: None,
            syslog_facility: None,
            tstamp_minutes: 0,
            exec_path: None,
            global_log: None,
            global_log_opts: LogOptions::default(),
            global_ser_opts: SerialOptions::default(),
            global_ipmi_opts: IpmiOptions::default(),
            global_test_opts: TestOptions::default(),
            consoles: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parses the configuration text.  The first malformed directive
    /// aborts the parse; a daemon must not start half-configured.
    pub fn parse(path: &str, text: &[u8]) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let mut lex = Lexer::new(text);
        loop {
            let tok = next_or_err(path, &mut lex)?;
            match tok {
                Token::Eof => break,
                Token::Eol => {}
                Token::Word(w) if w.eq_ignore_ascii_case("SERVER") => {
                    parse_server_directive(path, &mut lex, &mut cfg)?;
                }
                Token::Word(w) if w.eq_ignore_ascii_case("GLOBAL") => {
                    parse_global_directive(path, &mut lex, &mut cfg)?;
                }
                Token::Word(w) if w.eq_ignore_ascii_case("CONSOLE") => {
                    let spec = parse_console_directive(path, &mut lex)?;
                    cfg.consoles.push(spec);
                }
                other => {
                    return Err(err(path, lex.line(), format!(
                        "unrecognized directive {}",
                        describe(&other)
                    )));
                }
            }
        }
        Ok(cfg)
    }
}

fn err(path: &str, line: u32, message: String) -> ConfigError {
    ConfigError {
        path: String::from(path),
        line,
        message,
    }
}

fn describe(tok: &Token<'_>) -> String {
    match tok {
        Token::Word(w) => format!("\"{w}\""),
        Token::Str(_) => String::from("(string)"),
        Token::Int(n) => format!("{n}"),
        Token::Char(c) => format!("'{}'", *c as char),
        Token::Eol => String::from("(eol)"),
        Token::Eof => String::from("(eof)"),
    }
}

fn next_or_err<'a>(path: &str, lex: &mut Lexer<'a>) -> Result<Token<'a>, ConfigError> {
    lex.next_token()
        .map_err(|e| err(path, lex.line(), e.to_string()))
}

/// Reads the `=` and value of a `KEY=value` pair; the value may be a
/// quoted string, a bare word, or an integer.
fn parse_value(path: &str, lex: &mut Lexer<'_>) -> Result<String, ConfigError> {
    match next_or_err(path, lex)? {
        Token::Char(b'=') => {}
        other => {
            return Err(err(path, lex.line(), format!(
                "expected '=', got {}",
                describe(&other)
            )))
        }
    }
    match next_or_err(path, lex)? {
        Token::Str(s) => Ok(takeout::decode_to_string(s)),
        Token::Word(w) => Ok(String::from(w)),
        Token::Int(n) => Ok(n.to_string()),
        other => Err(err(path, lex.line(), format!(
            "expected a value, got {}",
            describe(&other)
        ))),
    }
}

fn parse_on_off(path: &str, line: u32, value: &str) -> Result<bool, ConfigError> {
    if value.eq_ignore_ascii_case("ON") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("OFF") {
        Ok(false)
    } else {
        Err(err(path, line, format!("expected ON or OFF, got \"{value}\"")))
    }
}

/// `TIMESTAMP=<n>[mhd]`, normalised to minutes.
fn parse_timestamp(path: &str, line: u32, value: &str) -> Result<u32, ConfigError> {
    let bad = || err(path, line, format!("invalid TIMESTAMP value \"{value}\""));
    let value = value.trim();
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        None => (value, 'm'),
        Some((pos, c)) if pos + c.len_utf8() == value.len() => (&value[..pos], c),
        Some(_) => return Err(bad()),
    };
    let n: u32 = digits.parse().map_err(|_| bad())?;
    match unit.to_ascii_lowercase() {
        'm' => Ok(n),
        'h' => Ok(n * 60),
        'd' => Ok(n * 60 * 24),
        _ => Err(bad()),
    }
}

fn parse_server_directive(
    path: &str,
    lex: &mut Lexer<'_>,
    cfg: &mut ServerConfig,
) -> Result<(), ConfigError> {
    loop {
        let tok = next_or_err(path, lex)?;
        let key = match tok {
            Token::Eol | Token::Eof => return Ok(()),
            Token::Word(w) => w.to_ascii_uppercase(),
            other => {
                return Err(err(path, lex.line(), format!(
                    "expected a SERVER key, got {}",
                    describe(&other)
                )))
            }
        };
        let line = lex.line();
        let value = parse_value(path, lex)?;
        match key.as_str() {
            "KEEPALIVE" => cfg.keepalive = parse_on_off(path, line, &value)?,
            "LOOPBACK" => cfg.loopback = parse_on_off(path, line, &value)?,
            "LOGDIR" => cfg.log_dir = Some(PathBuf::from(value)),
            "LOGFILE" => {
                if !value.starts_with('/') {
                    return Err(err(path, line, String::from(
                        "LOGFILE requires an absolute path",
                    )));
                }
                cfg.log_file = Some(PathBuf::from(value));
            }
            "PIDFILE" => {
                if !value.starts_with('/') {
                    return Err(err(path, line, String::from(
                        "PIDFILE requires an absolute path",
                    )));
                }
                cfg.pid_file = Some(PathBuf::from(value));
            }
            "PORT" => {
                cfg.port = value
                    .parse()
                    .map_err(|_| err(path, line, format!("invalid PORT \"{value}\"")))?;
            }
            "RESETCMD" => cfg.reset_cmd = Some(value),
            "SYSLOG" => cfg.syslog_facility = Some(value),
            "TIMESTAMP" => cfg.tstamp_minutes = parse_timestamp(path, line, &value)?,
            "EXECPATH" => cfg.exec_path = Some(value),
            other => {
                return Err(err(path, line, format!("unrecognized SERVER key \"{other}\"")))
            }
        }
    }
}

fn parse_global_directive(
    path: &str,
    lex: &mut Lexer<'_>,
    cfg: &mut ServerConfig,
) -> Result<(), ConfigError> {
    loop {
        let tok = next_or_err(path, lex)?;
        let key = match tok {
            Token::Eol | Token::Eof => return Ok(()),
            Token::Word(w) => w.to_ascii_uppercase(),
            other => {
                return Err(err(path, lex.line(), format!(
                    "expected a GLOBAL key, got {}",
                    describe(&other)
                )))
            }
        };
        let line = lex.line();
        let value = parse_value(path, lex)?;
        let map = |e: String| err(path, line, e);
        match key.as_str() {
            "LOG" => {
                if !value.contains(CONFIG_ESCAPE) {
                    return Err(err(path, line, format!(
                        "global LOG template must contain '{CONFIG_ESCAPE}'"
                    )));
                }
                cfg.global_log = Some(value);
            }
            "LOGOPTS" => {
                cfg.global_log_opts = LogOptions::parse(cfg.global_log_opts, &value).map_err(map)?;
            }
            "SEROPTS" => {
                cfg.global_ser_opts =
                    SerialOptions::parse(cfg.global_ser_opts, &value).map_err(map)?;
            }
            "IPMIOPTS" => {
                cfg.global_ipmi_opts =
                    IpmiOptions::parse(&cfg.global_ipmi_opts, &value).map_err(map)?;
            }
            "TESTOPTS" => {
                cfg.global_test_opts =
                    TestOptions::parse(cfg.global_test_opts, &value).map_err(map)?;
            }
            other => {
                return Err(err(path, line, format!("unrecognized GLOBAL key \"{other}\"")))
            }
        }
    }
}

fn parse_console_directive(
    path: &str,
    lex: &mut Lexer<'_>,
) -> Result<ConsoleSpec, ConfigError> {
    let mut spec = ConsoleSpec::default();
    let start_line = lex.line();
    loop {
        let tok = next_or_err(path, lex)?;
        let key = match tok {
            Token::Eol | Token::Eof => break,
            Token::Word(w) => w.to_ascii_uppercase(),
            other => {
                return Err(err(path, lex.line(), format!(
                    "expected a CONSOLE key, got {}",
                    describe(&other)
                )))
            }
        };
        let value = parse_value(path, lex)?;
        match key.as_str() {
            "NAME" => spec.name = value,
            "DEV" => spec.dev = value,
            "LOG" => spec.log = Some(value),
            "LOGOPTS" => spec.log_opts = Some(value),
            "SEROPTS" => spec.ser_opts = Some(value),
            "IPMIOPTS" => spec.ipmi_opts = Some(value),
            "TESTOPTS" => spec.test_opts = Some(value),
            other => {
                return Err(err(path, lex.line(), format!(
                    "unrecognized CONSOLE key \"{other}\""
                )))
            }
        }
    }
    if spec.name.is_empty() {
        return Err(err(path, start_line, String::from("console requires a NAME")));
    }
    if spec.dev.is_empty() {
        return Err(err(
            path,
            start_line,
            format!("console [{}] requires a DEV", spec.name),
        ));
    }
    Ok(spec)
}

/// Driver selected by a console's `DEV` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Telnet { host: String, port: u16 },
    Serial { dev: String },
    Ipmi { host: String },
    Unixsock { path: String },
    Test,
    Process { dev: String },
}

/// Classifies a `DEV` value.  Prefix tags win; `host:port` selects
/// telnet; a leading `/` selects serial unless the target is an
/// executable regular file; anything else is a program to spawn.
#[must_use]
pub fn classify_device(dev: &str) -> DeviceKind {
    let lower = dev.to_ascii_lowercase();
    if let Some(host) = lower.strip_prefix("ipmi:") {
        return DeviceKind::Ipmi {
            host: String::from(&dev[dev.len() - host.len()..]),
        };
    }
    if let Some(path) = lower.strip_prefix("unix:") {
        return DeviceKind::Unixsock {
            path: String::from(&dev[dev.len() - path.len()..]),
        };
    }
    if lower == "test:" {
        return DeviceKind::Test;
    }
    if !dev.contains('/') {
        if let Some((host, port)) = dev.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() && port > 0 {
                    return DeviceKind::Telnet {
                        host: String::from(host),
                        port,
                    };
                }
            }
        }
    }
    if dev.starts_with('/') {
        let is_executable_file = std::fs::metadata(dev)
            .map(|m| {
                use std::os::unix::fs::PermissionsExt;
                m.is_file() && m.permissions().mode() & 0o111 != 0
            })
            .unwrap_or(false);
        if !is_executable_file {
            return DeviceKind::Serial {
                dev: String::from(dev),
            };
        }
    }
    DeviceKind::Process {
        dev: String::from(dev),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmux_core::console::serial::Parity;

    fn parse(text: &str) -> ServerConfig {
        ServerConfig::parse("test.conf", text.as_bytes()).expect("parses")
    }

    #[test]
    fn server_directive_sets_daemon_options() {
        let cfg = parse(
            "# cmuxd configuration\n\
             SERVER PORT=6000 LOOPBACK=ON KEEPALIVE=OFF\n\
             SERVER PIDFILE=\"/run/cmuxd.pid\" RESETCMD=\"pm -r &\"\n\
             SERVER TIMESTAMP=1h LOGDIR=\"/var/log/cmux\"\n",
        );
        assert_eq!(cfg.port, 6000);
        assert!(cfg.loopback);
        assert!(!cfg.keepalive);
        assert_eq!(cfg.pid_file, Some(PathBuf::from("/run/cmuxd.pid")));
        assert_eq!(cfg.reset_cmd.as_deref(), Some("pm -r &"));
        assert_eq!(cfg.tstamp_minutes, 60);
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/var/log/cmux")));
    }

    #[test]
    fn global_defaults_flow_into_consoles() {
        let cfg = parse(
            "GLOBAL LOG=\"&.log\" LOGOPTS=\"sanitize\" SEROPTS=\"115200,7e2\"\n\
             CONSOLE NAME=\"web1\" DEV=\"ts1:2001\"\n",
        );
        assert_eq!(cfg.global_log.as_deref(), Some("&.log"));
        assert!(cfg.global_log_opts.sanitize);
        assert_eq!(cfg.global_ser_opts.bps, 115_200);
        assert_eq!(cfg.global_ser_opts.parity, Parity::Even);
        assert_eq!(cfg.consoles.len(), 1);
        assert_eq!(cfg.consoles[0].name, "web1");
        assert_eq!(cfg.consoles[0].dev, "ts1:2001");
    }

    #[test]
    fn console_keys_are_recorded() {
        let cfg = parse(
            "CONSOLE NAME=\"db1\" DEV=\"/dev/ttyS0\" LOG=\"db1.log\" \
             LOGOPTS=\"timestamp\" SEROPTS=\"9600,8n1\"\n",
        );
        let spec = &cfg.consoles[0];
        assert_eq!(spec.log.as_deref(), Some("db1.log"));
        assert_eq!(spec.log_opts.as_deref(), Some("timestamp"));
        assert_eq!(spec.ser_opts.as_deref(), Some("9600,8n1"));
    }

    #[test]
    fn keywords_match_case_insensitively() {
        let cfg = parse("server port=1234\nconsole name=\"c\" dev=\"test:\"\n");
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.consoles[0].name, "c");
    }

    #[test]
    fn line_continuations_join_directives() {
        let cfg = parse("CONSOLE NAME=\"c\" \\\n DEV=\"test:\"\n");
        assert_eq!(cfg.consoles[0].dev, "test:");
    }

    #[test]
    fn errors_carry_the_line_number() {
        let e = ServerConfig::parse("t.conf", b"SERVER PORT=7890\nSERVER BOGUS=1\n")
            .unwrap_err();
        assert_eq!(e.line, 2);
        assert!(e.to_string().contains("BOGUS"), "got: {e}");
    }

    #[test]
    fn consoles_require_name_and_dev() {
        assert!(ServerConfig::parse("t.conf", b"CONSOLE DEV=\"test:\"\n").is_err());
        assert!(ServerConfig::parse("t.conf", b"CONSOLE NAME=\"c\"\n").is_err());
    }

    #[test]
    fn global_log_template_must_contain_the_escape() {
        assert!(ServerConfig::parse("t.conf", b"GLOBAL LOG=\"fixed.log\"\n").is_err());
    }

    #[test]
    fn relative_pidfile_and_logfile_are_rejected() {
        assert!(ServerConfig::parse("t.conf", b"SERVER PIDFILE=\"cmuxd.pid\"\n").is_err());
        assert!(ServerConfig::parse("t.conf", b"SERVER LOGFILE=\"d.log\"\n").is_err());
    }

    #[test]
    fn timestamp_units_normalise_to_minutes() {
        assert_eq!(parse("SERVER TIMESTAMP=30\n").tstamp_minutes, 30);
        assert_eq!(parse("SERVER TIMESTAMP=2h\n").tstamp_minutes, 120);
        assert_eq!(parse("SERVER TIMESTAMP=1d\n").tstamp_minutes, 1440);
        assert!(ServerConfig::parse("t.conf", b"SERVER TIMESTAMP=5x\n").is_err());
    }

    #[test]
    fn devices_classify_by_shape() {
        assert_eq!(
            classify_device("ts1:2001"),
            DeviceKind::Telnet {
                host: String::from("ts1"),
                port: 2001
            }
        );
        assert_eq!(
            classify_device("/dev/ttyS0"),
            DeviceKind::Serial {
                dev: String::from("/dev/ttyS0")
            }
        );
        assert_eq!(
            classify_device("IPMI:bmc1.mgmt"),
            DeviceKind::Ipmi {
                host: String::from("bmc1.mgmt")
            }
        );
        assert_eq!(
            classify_device("unix:/run/console.sock"),
            DeviceKind::Unixsock {
                path: String::from("/run/console.sock")
            }
        );
        assert_eq!(classify_device("TEST:"), DeviceKind::Test);
        assert_eq!(
            classify_device("/bin/sh"),
            DeviceKind::Process {
                dev: String::from("/bin/sh")
            }
        );
        assert_eq!(
            classify_device("console-wrapper"),
            DeviceKind::Process {
                dev: String::from("console-wrapper")
            }
        );
    }
}
