//! Turns a parsed configuration into a live object graph.
//!
//! Consoles with problems (unresolvable hosts, unopenable devices,
//! duplicate names) are logged and skipped rather than aborting the
//! daemon; operators fix them and SIGHUP-restart at leisure.

use crate::config::{classify_device, ConsoleSpec, DeviceKind, ServerConfig, CONFIG_ESCAPE};
use cmux_core::console::ipmi::{IpmiOptions, IpmiState};
use cmux_core::console::process::{self, ProcessState};
use cmux_core::console::serial::{self, SerialOptions};
use cmux_core::console::telnet::TelnetState;
use cmux_core::console::test_dev::{TestOptions, TestState};
use cmux_core::console::unixsock::UnixsockState;
use cmux_core::logfile::{self, LogOptions};
use cmux_core::object::{Object, ObjectKind, Registry};
use cmux_core::reactor::Reactor;
use std::collections::HashSet;
use std::net::ToSocketAddrs;
use std::path::Path;
use tracing::warn;

/// Populates the reactor's registry from the console specs.  Returns
/// the number of consoles actually created.
pub fn build_consoles(reactor: &mut Reactor, cfg: &ServerConfig, zero_logs: bool) -> usize {
    let mut names: HashSet<String> = HashSet::new();
    let mut devices: HashSet<String> = HashSet::new();
    let mut logfiles: HashSet<std::path::PathBuf> = HashSet::new();
    let cwd = std::env::current_dir().ok();
    let mut created = 0;

    for spec in &cfg.consoles {
        if !names.insert(spec.name.clone()) {
            warn!(console = %spec.name, "ignoring duplicate console name");
            continue;
        }
        if !devices.insert(spec.dev.clone()) {
            warn!(console = %spec.name, dev = %spec.dev, "ignoring duplicate device");
            continue;
        }
        let Some(obj) = build_console(spec, cfg, cwd.as_deref()) else {
            continue;
        };
        let id = reactor.reg.insert(obj);
        created += 1;
        attach_logfile(&mut reactor.reg, id, spec, cfg, zero_logs, &mut logfiles);
    }
    created
}

fn build_console(
    spec: &ConsoleSpec,
    cfg: &ServerConfig,
    cwd: Option<&Path>,
) -> Option<Object> {
    let name = spec.name.clone();
    match classify_device(&spec.dev) {
        DeviceKind::Telnet { host, port } => {
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.find(std::net::SocketAddr::is_ipv4));
            let Some(addr) = addr else {
                warn!(console = %name, host = %host, "unable to resolve host");
                return None;
            };
            Some(Object::new(
                name,
                None,
                ObjectKind::Telnet(TelnetState::new(host, port, addr, cfg.keepalive)),
            ))
        }
        DeviceKind::Serial { dev } => {
            let opts = match &spec.ser_opts {
                Some(s) => match SerialOptions::parse(cfg.global_ser_opts, s) {
                    Ok(opts) => opts,
                    Err(e) => {
                        warn!(console = %name, error = %e, "invalid SEROPTS");
                        return None;
                    }
                },
                None => cfg.global_ser_opts,
            };
            match serial::open(&dev, opts) {
                Ok((fd, state)) => {
                    Some(Object::new(name, Some(fd), ObjectKind::Serial(state)))
                }
                Err(e) => {
                    warn!(console = %name, error = %e, "unable to open console");
                    None
                }
            }
        }
        DeviceKind::Ipmi { host } => {
            let opts = match &spec.ipmi_opts {
                Some(s) => match IpmiOptions::parse(&cfg.global_ipmi_opts, s) {
                    Ok(opts) => opts,
                    Err(e) => {
                        warn!(console = %name, error = %e, "invalid IPMIOPTS");
                        return None;
                    }
                },
                None => cfg.global_ipmi_opts.clone(),
            };
            Some(Object::new(
                name,
                None,
                ObjectKind::Ipmi(IpmiState::new(host, opts)),
            ))
        }
        DeviceKind::Unixsock { path } => Some(Object::new(
            name,
            None,
            ObjectKind::Unixsock(UnixsockState::new(path)),
        )),
        DeviceKind::Test => {
            let opts = match &spec.test_opts {
                Some(s) => match TestOptions::parse(cfg.global_test_opts, s) {
                    Ok(opts) => opts,
                    Err(e) => {
                        warn!(console = %name, error = %e, "invalid TESTOPTS");
                        return None;
                    }
                },
                None => cfg.global_test_opts,
            };
            Some(Object::new(name, None, ObjectKind::Test(TestState::new(opts))))
        }
        DeviceKind::Process { dev } => {
            let mut argv: Vec<String> =
                dev.split_whitespace().map(String::from).collect();
            let Some(first) = argv.first().cloned() else {
                warn!(console = %name, "empty process command");
                return None;
            };
            let Some(resolved) =
                process::resolve_command(&first, cwd, cfg.exec_path.as_deref())
            else {
                warn!(console = %name, prog = %first, "unable to resolve executable");
                return None;
            };
            argv[0] = resolved.display().to_string();
            Some(Object::new(
                name,
                None,
                ObjectKind::Process(ProcessState::new(argv)),
            ))
        }
    }
}

fn attach_logfile(
    reg: &mut Registry,
    console: cmux_core::object::ObjectId,
    spec: &ConsoleSpec,
    cfg: &ServerConfig,
    zero_logs: bool,
    seen: &mut HashSet<std::path::PathBuf>,
) {
    let template = spec.log.as_ref().or(cfg.global_log.as_ref());
    let Some(template) = template.filter(|t| !t.is_empty()) else {
        return;
    };
    let opts = match &spec.log_opts {
        Some(s) => match LogOptions::parse(cfg.global_log_opts, s) {
            Ok(opts) => opts,
            Err(e) => {
                warn!(console = %spec.name, error = %e, "invalid LOGOPTS");
                return;
            }
        },
        None => cfg.global_log_opts,
    };
    let path = logfile::resolve_name(
        template,
        CONFIG_ESCAPE,
        &spec.name,
        cfg.log_dir.as_deref(),
    );
    if !seen.insert(path.clone()) {
        warn!(logfile = %path.display(), "ignoring duplicate logfile name");
        return;
    }
    match logfile::open(&path, zero_logs) {
        Ok(fd) => {
            let obj = logfile::make_object(path, fd, &spec.name, opts);
            let logfile_id = reg.insert(obj);
            reg.link(console, logfile_id);
            if let Some(con) = reg.get_mut(console) {
                con.kind.set_logfile_id(Some(logfile_id));
            }
        }
        Err(e) => {
            warn!(console = %spec.name, error = %e, "unable to open logfile");
        }
    }
}
