//! Client command-line arguments.

use clap::Parser;
use cmux_protocol::wire::{CommandVerb, DEFAULT_PORT};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cmux", about = "cmux - console multiplexer client")]
pub struct ClientArgs {
    /// Daemon to contact, as HOST[:PORT]
    #[arg(short = 'd', long = "destination", value_name = "HOST[:PORT]",
          default_value = "127.0.0.1")]
    pub destination: String,

    /// Broadcast input to every matching console (write-only)
    #[arg(short = 'b', long = "broadcast")]
    pub broadcast: bool,

    /// Take over the console, disconnecting existing writers
    #[arg(short = 'f', long = "force", conflicts_with = "join")]
    pub force: bool,

    /// Share the console with existing writers
    #[arg(short = 'j', long = "join")]
    pub join: bool,

    /// Monitor the console read-only
    #[arg(short = 'm', long = "monitor", conflicts_with_all = ["broadcast", "force", "join"])]
    pub monitor: bool,

    /// List matching console names and exit
    #[arg(short = 'q', long = "query")]
    pub query: bool,

    /// Suppress informational messages
    #[arg(short = 'Q', long = "quiet")]
    pub quiet: bool,

    /// Treat console arguments as regular expressions
    #[arg(short = 'x', long = "regex")]
    pub regex: bool,

    /// In-session escape character
    #[arg(short = 'e', long = "escape", value_name = "CHAR", default_value = "&")]
    pub escape: char,

    /// Append a copy of the session to FILE
    #[arg(short = 'l', long = "log", value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Verbose diagnostics
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Console name patterns
    #[arg(value_name = "CONSOLE")]
    pub consoles: Vec<String>,
}

impl ClientArgs {
    pub fn verb(&self) -> CommandVerb {
        if self.query {
            CommandVerb::Query
        } else if self.monitor {
            CommandVerb::Monitor
        } else {
            CommandVerb::Connect
        }
    }

    /// `(host, port)` for the daemon connection.
    pub fn endpoint(&self) -> Result<(String, u16), String> {
        match self.destination.rsplit_once(':') {
            None => Ok((self.destination.clone(), DEFAULT_PORT)),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(format!("invalid destination \"{}\"", self.destination));
                }
                let port = port
                    .parse()
                    .map_err(|_| format!("invalid port in \"{}\"", self.destination))?;
                Ok((String::from(host), port))
            }
        }
    }

    /// Usage checks beyond what clap expresses.
    pub fn validate(&self) -> Result<(), String> {
        if self.consoles.is_empty() && !self.query {
            return Err(String::from("a console name is required"));
        }
        if self.broadcast && self.consoles.is_empty() {
            return Err(String::from("broadcast requires console names"));
        }
        if !self.escape.is_ascii() {
            return Err(String::from("escape character must be ASCII"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_is_the_default_verb() {
        let args = ClientArgs::try_parse_from(["cmux", "web1"]).expect("parses");
        assert_eq!(args.verb(), CommandVerb::Connect);
        assert_eq!(args.consoles, vec!["web1"]);
        args.validate().expect("valid");
    }

    #[test]
    fn endpoint_parses_host_and_port() {
        let args =
            ClientArgs::try_parse_from(["cmux", "-d", "mgmt1:6000", "c"]).expect("parses");
        assert_eq!(args.endpoint().expect("endpoint"), (String::from("mgmt1"), 6000));
        let args = ClientArgs::try_parse_from(["cmux", "-d", "mgmt1", "c"]).expect("parses");
        assert_eq!(
            args.endpoint().expect("endpoint"),
            (String::from("mgmt1"), DEFAULT_PORT)
        );
    }

    #[test]
    fn force_and_join_conflict() {
        assert!(ClientArgs::try_parse_from(["cmux", "-f", "-j", "c"]).is_err());
    }

    #[test]
    fn monitor_conflicts_with_write_options() {
        assert!(ClientArgs::try_parse_from(["cmux", "-m", "-f", "c"]).is_err());
    }

    #[test]
    fn query_without_consoles_is_allowed() {
        let args = ClientArgs::try_parse_from(["cmux", "-q"]).expect("parses");
        args.validate().expect("valid");
        assert_eq!(args.verb(), CommandVerb::Query);
    }

    #[test]
    fn connect_without_consoles_is_rejected() {
        let args = ClientArgs::try_parse_from(["cmux"]).expect("parses");
        assert!(args.validate().is_err());
    }
}
