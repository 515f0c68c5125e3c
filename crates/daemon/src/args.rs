//! Daemon command-line arguments.

use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_CONFIG: &str = "/etc/cmux.conf";

#[derive(Debug, Parser)]
#[command(
    name = "cmuxd",
    about = "cmuxd - console multiplexer daemon",
    disable_version_flag = true
)]
pub struct DaemonArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Override the configured listen port
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Display license information and exit
    #[arg(short = 'L', long = "license")]
    pub license: bool,

    /// Display version information and exit
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    /// Verbose diagnostics
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Truncate console logfiles at startup
    #[arg(short = 'z', long = "zero-logs")]
    pub zero_logs: bool,

    /// Signal the running daemon to terminate and exit
    #[arg(short = 'k', long = "kill")]
    pub kill: bool,

    /// Signal the running daemon to reopen its logfiles and exit
    #[arg(short = 'r', long = "reopen-logs")]
    pub reopen: bool,

    /// Stay in the foreground (no daemonisation)
    #[arg(short = 'F', long = "foreground")]
    pub foreground: bool,
}
