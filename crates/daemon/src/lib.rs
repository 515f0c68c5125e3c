//! # Overview
//!
//! `cmux_daemon` is the runtime shell around [`cmux_core`]: it parses
//! the command line and configuration file, sets up logging, detaches
//! from the terminal, takes the single-instance lock, builds the
//! console object graph, and hands control to the reactor until a
//! shutdown signal arrives.
//!
//! The crate exposes [`run`] with the same shape the binaries use:
//! an argument iterator plus stdout/stderr handles, returning the
//! process exit code.  Keeping I/O injectable keeps the entry point
//! testable without a tty.

pub mod args;
pub mod builder;
pub mod config;
pub mod daemonize;
pub mod logging;

use args::DaemonArgs;
use clap::Parser;
use cmux_core::console::ipmi::DisabledEngine;
use cmux_core::listen;
use cmux_core::reactor::{Reactor, ReactorConfig};
use config::ServerConfig;
use logging::LogSink;
use std::ffi::OsString;
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info};

const LICENSE_TEXT: &str = "\
cmux is free software: you can redistribute it and/or modify it under\n\
the terms of the GNU General Public License as published by the Free\n\
Software Foundation, either version 3 of the License, or (at your\n\
option) any later version.  There is NO WARRANTY, to the extent\n\
permitted by law.\n";

/// Runs the daemon.  Returns the process exit code: 0 on a clean
/// shutdown, 1 on a fatal configuration or runtime error.
pub fn run<'a, I, T>(args: I, stdout: &'a mut dyn Write, stderr: &'a mut dyn Write) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = match DaemonArgs::try_parse_from(args) {
        Ok(args) => args,
        Err(err) => {
            let is_help = err.kind() == clap::error::ErrorKind::DisplayHelp;
            let _ = write!(if is_help { stdout } else { stderr }, "{err}");
            return i32::from(!is_help);
        }
    };

    if args.license {
        let _ = write!(stdout, "{LICENSE_TEXT}");
        return 0;
    }
    if args.version {
        let _ = writeln!(stdout, "cmuxd {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    if args.kill || args.reopen {
        let signal = if args.kill { libc::SIGTERM } else { libc::SIGHUP };
        return match daemonize::signal_daemon(&args.config, signal) {
            Ok(pid) => {
                let _ = writeln!(
                    stdout,
                    "Sent {} to cmuxd (pid {pid})",
                    if args.kill { "SIGTERM" } else { "SIGHUP" }
                );
                0
            }
            Err(err) => {
                let _ = writeln!(stderr, "cmuxd: {err}");
                1
            }
        };
    }

    let text = match std::fs::read(&args.config) {
        Ok(text) => text,
        Err(err) => {
            let _ = writeln!(
                stderr,
                "cmuxd: unable to read \"{}\": {err}",
                args.config.display()
            );
            return 1;
        }
    };
    let mut cfg = match ServerConfig::parse(&args.config.display().to_string(), &text) {
        Ok(cfg) => cfg,
        Err(err) => {
            let _ = writeln!(stderr, "cmuxd: {err}");
            return 1;
        }
    };
    if let Some(port) = args.port {
        cfg.port = port;
    }

    let sink = LogSink::stderr();
    logging::init(&sink, args.verbose);

    let sync_pipe = if args.foreground {
        None
    } else {
        match daemonize::begin() {
            Ok(pipe) => Some(pipe),
            Err(err) => {
                let _ = writeln!(stderr, "cmuxd: unable to daemonize: {err}");
                return 1;
            }
        }
    };

    serve(&args, cfg, &sink, sync_pipe, stderr)
}

fn serve(
    args: &DaemonArgs,
    cfg: ServerConfig,
    sink: &LogSink,
    sync_pipe: Option<daemonize::SyncPipe>,
    stderr: &mut dyn Write,
) -> i32 {
    // Held for the daemon's lifetime: the write-lock marks the running
    // instance and carries its pid for -k / -r.  Taken after the forks
    // because fcntl record locks do not survive them.
    let _config_lock = match daemonize::lock_config(&args.config) {
        Ok(lock) => lock,
        Err(err) => {
            let _ = writeln!(
                stderr,
                "cmuxd: unable to lock \"{}\" (already running?): {err}",
                args.config.display()
            );
            return 1;
        }
    };

    let reactor_cfg = ReactorConfig {
        reset_cmd: cfg.reset_cmd.clone(),
        config_escape: config::CONFIG_ESCAPE,
        keepalive: cfg.keepalive,
        tstamp_minutes: cfg.tstamp_minutes,
        log_reopen: Some(Box::new({
            let sink = sink.clone();
            move || sink.reopen()
        })),
    };
    let mut reactor = match Reactor::new(reactor_cfg, Arc::new(DisabledEngine)) {
        Ok(reactor) => reactor,
        Err(err) => {
            let _ = writeln!(stderr, "cmuxd: unable to create reactor: {err}");
            return 1;
        }
    };

    let consoles = builder::build_consoles(&mut reactor, &cfg, args.zero_logs);

    let listener = match listen::create_listener(cfg.port, cfg.loopback) {
        Ok(listener) => listener,
        Err(err) => {
            let _ = writeln!(stderr, "cmuxd: unable to listen on port {}: {err}", cfg.port);
            return 1;
        }
    };
    reactor.set_listener(listener);

    if args.verbose {
        display_configuration(&args.config.display().to_string(), &cfg, consoles, stderr);
    }

    // Diagnostics move from stderr to the daemon log before the parent
    // is released and stderr turns into /dev/null.
    if let Some(path) = &cfg.log_file {
        if let Err(err) = sink.open_file(path.clone(), args.zero_logs) {
            let _ = writeln!(
                stderr,
                "cmuxd: unable to open logfile \"{}\": {err}",
                path.display()
            );
        }
    }
    if let Some(pipe) = sync_pipe {
        if let Err(err) = daemonize::finish(pipe) {
            let _ = writeln!(stderr, "cmuxd: unable to daemonize: {err}");
            return 1;
        }
    }
    if let Some(pid_file) = &cfg.pid_file {
        if let Err(err) = daemonize::write_pidfile(pid_file) {
            error!(pidfile = %pid_file.display(), error = %err, "unable to write pidfile");
        }
    }
    if let Err(err) =
        daemonize::install_signal_handlers(reactor.flags(), &reactor.waker())
    {
        error!(error = %err, "unable to install signal handlers");
        return 1;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        port = cfg.port,
        "starting cmuxd"
    );
    reactor.start_consoles();
    let status = match reactor.run() {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "reactor failed");
            1
        }
    };
    info!(pid = std::process::id(), "stopping cmuxd");
    if let Some(pid_file) = &cfg.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    status
}

fn display_configuration(
    path: &str,
    cfg: &ServerConfig,
    consoles: usize,
    stderr: &mut dyn Write,
) {
    let mut options = Vec::new();
    if cfg.keepalive {
        options.push(String::from("KeepAlive"));
    }
    if cfg.log_file.is_some() {
        options.push(String::from("LogFile"));
    }
    if cfg.loopback {
        options.push(String::from("LoopBack"));
    }
    if cfg.reset_cmd.is_some() {
        options.push(String::from("ResetCmd"));
    }
    if cfg.syslog_facility.is_some() {
        options.push(String::from("SysLog"));
    }
    if cfg.tstamp_minutes > 0 {
        options.push(format!("TimeStamp={}m", cfg.tstamp_minutes));
    }
    if options.is_empty() {
        options.push(String::from("None"));
    }
    let _ = writeln!(stderr, "Configuration: {path}");
    let _ = writeln!(stderr, "Options: {}", options.join(" "));
    let _ = writeln!(stderr, "Listening on port {}", cfg.port);
    let _ = writeln!(
        stderr,
        "Monitoring {consoles} console{}",
        if consoles == 1 { "" } else { "s" }
    );
}
