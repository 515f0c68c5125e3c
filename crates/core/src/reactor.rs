//! The reactor: one thread, one loop, every fd.
//!
//! Each iteration handles, in order: a pending reconfigure (logfile
//! reopen), expired timers, IPMI engine notifications, interest-set
//! construction, the blocking poll (bounded by the next timer), new
//! client accepts, per-object reads and drains, and finally any
//! pending console resets.  Data read from a source is in every linked
//! reader's buffer before the next iteration begins.
//!
//! Per-object errors never abort the loop: network-backed consoles go
//! DOWN and back off, serial consoles and clients are destroyed, and
//! logfiles close until the next reconfigure.

use crate::console::{ipmi, process, telnet, test_dev, unixsock};
use crate::console::ipmi::{IpmiNotifier, SolEngine};
use crate::fdio;
use crate::logfile;
use crate::object::{DrainOutcome, Object, ObjectId, ObjectKind, Registry};
use crate::poll::{Events, Poller, Waker};
use crate::reset;
use crate::session;
use crate::timer::{TimerEvent, TimerWheel};
use crate::{OBJ_BUF_SIZE, RESET_CMD_TIMEOUT_SECS};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Read scratch per burst; half the ring so a sanitising logfile's
/// twofold expansion still fits.
const READ_SCRATCH: usize = (OBJ_BUF_SIZE / 2) - 1;

/// Flags set from signal handlers and polled at the top of the loop.
#[derive(Default)]
pub struct SignalFlags {
    pub done: AtomicBool,
    pub reconfig: AtomicBool,
}

/// Reactor-level configuration, distilled from the server config.
pub struct ReactorConfig {
    /// Shell command template run on console reset, if configured.
    pub reset_cmd: Option<String>,
    /// Escape character expanded in templates (reset command, log names).
    pub config_escape: char,
    /// Enable TCP keep-alive on accepted clients.
    pub keepalive: bool,
    /// Minutes between logfile timestamp banners; 0 disables.
    pub tstamp_minutes: u32,
    /// Hook invoked on reconfigure so the daemon log reopens too.
    pub log_reopen: Option<Box<dyn Fn() + Send>>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            reset_cmd: None,
            config_escape: '&',
            keepalive: false,
            tstamp_minutes: 0,
            log_reopen: None,
        }
    }
}

pub struct Reactor {
    pub reg: Registry,
    pub wheel: TimerWheel,
    cfg: ReactorConfig,
    poller: Poller,
    listener: Option<OwnedFd>,
    engine: Arc<dyn SolEngine>,
    notifier: IpmiNotifier,
    flags: Arc<SignalFlags>,
    tstamp_next: Option<OffsetDateTime>,
}

impl Reactor {
    pub fn new(cfg: ReactorConfig, engine: Arc<dyn SolEngine>) -> io::Result<Self> {
        let poller = Poller::new()?;
        let notifier = IpmiNotifier::new(poller.waker());
        Ok(Self {
            reg: Registry::new(),
            wheel: TimerWheel::new(),
            cfg,
            poller,
            listener: None,
            engine,
            notifier,
            flags: Arc::new(SignalFlags::default()),
            tstamp_next: None,
        })
    }

    pub fn set_listener(&mut self, listener: OwnedFd) {
        self.listener = Some(listener);
    }

    /// Wakes a blocked loop; hand clones to signal handlers and engine
    /// callbacks.
    pub fn waker(&self) -> Waker {
        self.poller.waker()
    }

    pub fn flags(&self) -> Arc<SignalFlags> {
        Arc::clone(&self.flags)
    }

    fn console_count(&self) -> usize {
        self.reg.iter().filter(|(_, o)| o.kind.is_console()).count()
    }

    /// Brings every configured console into service: network drivers
    /// start their connect machinery, test consoles open their sink and
    /// arm the first tick.
    pub fn start_consoles(&mut self) {
        let ipmi_count = self
            .reg
            .iter()
            .filter(|(_, o)| matches!(o.kind, ObjectKind::Ipmi(_)))
            .count();
        if ipmi_count > 0 {
            let threads = ipmi::engine_thread_count(ipmi_count);
            if let Err(err) = self.engine.start(threads) {
                warn!(error = %err, "unable to start SOL engine");
            } else {
                info!(threads, consoles = ipmi_count, "SOL engine started");
            }
        }
        for id in self.reg.ids() {
            let Some(obj) = self.reg.get_mut(id) else { continue };
            match &mut obj.kind {
                ObjectKind::Telnet(_) => telnet::connect(&mut self.reg, &mut self.wheel, id),
                ObjectKind::Unixsock(_) => {
                    unixsock::connect(&mut self.reg, &mut self.wheel, id);
                }
                ObjectKind::Process(_) => process::connect(&mut self.reg, &mut self.wheel, id),
                ObjectKind::Ipmi(_) => ipmi::connect(
                    &mut self.reg,
                    &mut self.wheel,
                    id,
                    self.engine.as_ref(),
                    &self.notifier,
                ),
                ObjectKind::Test(_) => {
                    match test_dev::open_sink() {
                        Ok(fd) => obj.fd = Some(fd),
                        Err(err) => {
                            warn!(console = %obj.name, error = %err, "unable to open test sink");
                            continue;
                        }
                    }
                    let timer = self.wheel.arm_in(Duration::ZERO, TimerEvent::TestTick(id));
                    if let ObjectKind::Test(state) = &mut obj.kind {
                        state.timer = Some(timer);
                    }
                }
                _ => {}
            }
        }
    }

    /// Runs the multiplexer until a shutdown signal lands.
    pub fn run(&mut self) -> io::Result<()> {
        if self.console_count() == 0 {
            warn!("no consoles are defined in this configuration");
            return Ok(());
        }
        if self.cfg.tstamp_minutes > 0 {
            self.schedule_timestamp();
        }

        while !self.flags.done.load(Ordering::SeqCst) {
            if self.flags.reconfig.swap(false, Ordering::SeqCst) {
                self.reopen_logfiles();
            }

            let now = Instant::now();
            while let Some(event) = self.wheel.pop_due(now) {
                self.handle_timer(event);
            }
            for id in self.notifier.drain() {
                ipmi::connect(
                    &mut self.reg,
                    &mut self.wheel,
                    id,
                    self.engine.as_ref(),
                    &self.notifier,
                );
            }

            self.poller.begin();
            let listen_slot = self
                .listener
                .as_ref()
                .map(|fd| self.poller.add(fd.as_raw_fd(), Events::READ));
            let mut watch: Vec<(ObjectId, usize)> = Vec::with_capacity(self.reg.len());
            for (id, obj) in self.reg.iter() {
                let Some(fd) = obj.raw_fd() else { continue };
                let events = if matches!(&obj.kind, ObjectKind::Telnet(t) if t.is_pending()) {
                    // Either direction signals connect completion.
                    Events::READ_WRITE
                } else {
                    Events {
                        readable: obj.kind.wants_read(),
                        writable: obj.wants_write(),
                    }
                };
                if events.any() {
                    watch.push((id, self.poller.add(fd, events)));
                }
            }

            let timeout = self
                .wheel
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            self.poller.wait(timeout)?;

            if let Some(slot) = listen_slot {
                if self.poller.revents(slot).readable {
                    self.accept_clients();
                }
            }

            for (id, slot) in watch {
                let events = self.poller.revents(slot);
                if !events.any() {
                    continue;
                }
                // The object may have been destroyed or its fd closed
                // earlier in this pass.
                let Some(obj) = self.reg.get(id) else { continue };
                if obj.raw_fd().is_none() {
                    continue;
                }
                if matches!(&obj.kind, ObjectKind::Telnet(t) if t.is_pending()) {
                    telnet::connect(&mut self.reg, &mut self.wheel, id);
                    continue;
                }
                if events.readable {
                    self.handle_read(id);
                }
                let still_open = self
                    .reg
                    .get(id)
                    .and_then(Object::raw_fd)
                    .is_some();
                if events.writable && still_open {
                    self.handle_write(id);
                }
            }

            self.dispatch_resets();
        }

        self.shutdown();
        Ok(())
    }

    fn accept_clients(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        for client in crate::listen::accept_clients(listener, self.cfg.keepalive) {
            self.reg.insert(client);
        }
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Reconnect(id) | TimerEvent::IpmiRecheck(id) => {
                self.reconnect(id);
            }
            TimerEvent::ResetBackoff(id) => {
                if let Some(obj) = self.reg.get_mut(id) {
                    match &mut obj.kind {
                        ObjectKind::Telnet(s) => {
                            s.timer = None;
                            s.backoff.reset();
                        }
                        ObjectKind::Unixsock(s) => {
                            s.timer = None;
                            s.backoff.reset();
                        }
                        ObjectKind::Process(s) => {
                            s.timer = None;
                            s.backoff.reset();
                        }
                        ObjectKind::Ipmi(s) => {
                            s.timer = None;
                            s.backoff.reset();
                        }
                        _ => {}
                    }
                }
            }
            TimerEvent::TestTick(id) => self.test_tick(id),
            TimerEvent::LogTimestamp => self.timestamp_logfiles(),
            TimerEvent::KillResetCmd { pgid } => reset::kill_if_running(pgid),
        }
    }

    fn reconnect(&mut self, id: ObjectId) {
        let Some(obj) = self.reg.get(id) else { return };
        match &obj.kind {
            ObjectKind::Telnet(_) => telnet::connect(&mut self.reg, &mut self.wheel, id),
            ObjectKind::Unixsock(_) => unixsock::connect(&mut self.reg, &mut self.wheel, id),
            ObjectKind::Process(_) => process::connect(&mut self.reg, &mut self.wheel, id),
            ObjectKind::Ipmi(_) => ipmi::connect(
                &mut self.reg,
                &mut self.wheel,
                id,
                self.engine.as_ref(),
                &self.notifier,
            ),
            _ => {}
        }
    }

    fn test_tick(&mut self, id: ObjectId) {
        let burst_and_delay = {
            let Some(obj) = self.reg.get_mut(id) else { return };
            let ObjectKind::Test(state) = &mut obj.kind else {
                return;
            };
            state.timer = None;
            state.tick()
        };
        let (burst, delay) = burst_and_delay;
        if let Some(bytes) = burst {
            self.fan_out(id, &bytes);
        }
        let timer = self.wheel.arm_in(delay, TimerEvent::TestTick(id));
        if let Some(ObjectKind::Test(state)) = self.reg.get_mut(id).map(|o| &mut o.kind) {
            state.timer = Some(timer);
        }
    }

    /// Copies one read burst into the buffer of every linked reader.
    fn fan_out(&mut self, src: ObjectId, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let readers = self
            .reg
            .get(src)
            .map(|o| o.readers.clone())
            .unwrap_or_default();
        for reader in readers {
            let Some(obj) = self.reg.get_mut(reader) else {
                continue;
            };
            if obj.kind.is_logfile() {
                logfile::write_log_data(obj, data);
            } else {
                obj.write_data(data, false);
            }
        }
    }

    fn handle_read(&mut self, id: ObjectId) {
        let Some(obj) = self.reg.get_mut(id) else { return };
        let Some(fd) = obj.raw_fd() else { return };
        let mut scratch = [0u8; READ_SCRATCH];
        let n = match fdio::read(fd, &mut scratch) {
            Ok(0) => {
                self.reap(id);
                return;
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                debug!(object = %obj.name, error = %err, "read failed");
                self.reap(id);
                return;
            }
        };

        match &obj.kind {
            ObjectKind::Client(_) => {
                let result = session::handle_input(&mut self.reg, id, &scratch[..n]);
                for cmd in result.commands {
                    session::apply_command(&mut self.reg, id, cmd);
                }
                self.fan_out(id, &result.forward);
            }
            ObjectKind::Telnet(_) => {
                let name = obj.name.clone();
                let (len, replies) = {
                    let ObjectKind::Telnet(state) = &mut obj.kind else {
                        return;
                    };
                    telnet::process_escapes(state, &name, &mut scratch[..n])
                };
                for reply in replies {
                    telnet::send_cmd(obj, reply.cmd, reply.opt);
                }
                self.fan_out(id, &scratch[..len]);
            }
            _ => self.fan_out(id, &scratch[..n]),
        }
    }

    fn handle_write(&mut self, id: ObjectId) {
        let Some(obj) = self.reg.get_mut(id) else { return };
        if obj.drain() == DrainOutcome::Dead {
            self.reap(id);
        }
    }

    /// Routes a dead object: reconnecting drivers close and back off,
    /// logfiles close until reconfigure, everything else is destroyed.
    fn reap(&mut self, id: ObjectId) {
        let Some(obj) = self.reg.get_mut(id) else { return };
        match &obj.kind {
            ObjectKind::Telnet(_) => telnet::disconnect(&mut self.reg, &mut self.wheel, id),
            ObjectKind::Unixsock(_) => {
                unixsock::disconnect(&mut self.reg, &mut self.wheel, id);
            }
            ObjectKind::Process(_) => process::disconnect(&mut self.reg, &mut self.wheel, id),
            ObjectKind::Ipmi(_) => {
                ipmi::disconnect(&mut self.reg, &mut self.wheel, id);
                ipmi::connect(
                    &mut self.reg,
                    &mut self.wheel,
                    id,
                    self.engine.as_ref(),
                    &self.notifier,
                );
            }
            ObjectKind::Logfile(_) => {
                obj.fd = None;
                obj.buf().clear();
                obj.got_eof = false;
            }
            ObjectKind::Client(_) | ObjectKind::Serial(_) | ObjectKind::Test(_) => {
                self.destroy(id);
            }
        }
    }

    fn destroy(&mut self, id: ObjectId) {
        if let Some(obj) = self.reg.get(id) {
            debug!(object = %obj.name, kind = obj.kind.type_name(), "destroying object");
            if let (ObjectKind::Serial(state), Some(fd)) = (&obj.kind, obj.raw_fd()) {
                crate::console::serial::restore(&obj.name, fd, state);
            }
        }
        self.reg.unlink_all(id);
        self.reg.remove(id);
    }

    fn dispatch_resets(&mut self) {
        for id in self.reg.ids() {
            let Some(obj) = self.reg.get_mut(id) else { continue };
            if !obj.got_reset {
                continue;
            }
            obj.got_reset = false;
            let name = obj.name.clone();
            let Some(template) = self.cfg.reset_cmd.clone() else {
                warn!(console = %name, "no reset command configured");
                continue;
            };
            if let Some(pgid) = reset::spawn(&name, &template, self.cfg.config_escape) {
                self.wheel.arm_in(
                    Duration::from_secs(RESET_CMD_TIMEOUT_SECS),
                    TimerEvent::KillResetCmd { pgid },
                );
            }
        }
    }

    fn timestamp_logfiles(&mut self) {
        for id in self.reg.ids() {
            let Some(obj) = self.reg.get_mut(id) else { continue };
            let Some(state) = obj.kind.as_logfile() else { continue };
            if !state.opts.timestamp {
                continue;
            }
            let banner = logfile::timestamp_banner(&state.console_name);
            obj.write_data(banner.as_bytes(), true);
        }
        self.schedule_timestamp();
    }

    /// Arms the next timestamp tick: aligned from midnight on first
    /// arm, then rebased off the previous target so the cadence never
    /// drifts.
    fn schedule_timestamp(&mut self) {
        let interval = i64::from(self.cfg.tstamp_minutes);
        if interval <= 0 {
            return;
        }
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let next = match self.tstamp_next {
            Some(prev) => prev + time::Duration::minutes(interval),
            None => {
                let minutes_today = i64::from(now.hour()) * 60 + i64::from(now.minute());
                let completed = minutes_today / interval;
                now.replace_time(time::Time::MIDNIGHT)
                    + time::Duration::minutes((completed + 1) * interval)
            }
        };
        self.tstamp_next = Some(next);
        let delay = (next - now).max(time::Duration::ZERO);
        let delay: Duration = delay.try_into().unwrap_or_default();
        self.wheel.arm_in(delay, TimerEvent::LogTimestamp);
    }

    fn reopen_logfiles(&mut self) {
        info!("reopening logfiles");
        for id in self.reg.ids() {
            let Some(obj) = self.reg.get_mut(id) else { continue };
            let Some(state) = obj.kind.as_logfile() else { continue };
            let path = state.path.clone();
            let console_name = state.console_name.clone();
            obj.fd = None;
            obj.got_eof = false;
            match logfile::open(&path, false) {
                Ok(fd) => {
                    obj.fd = Some(fd);
                    let banner = logfile::open_banner(&console_name);
                    obj.write_data(banner.as_bytes(), false);
                }
                Err(err) => {
                    warn!(logfile = %path.display(), error = %err, "unable to reopen");
                }
            }
        }
        if let Some(hook) = &self.cfg.log_reopen {
            hook();
        }
    }

    fn shutdown(&mut self) {
        info!("shutting down");
        for id in self.reg.ids() {
            let Some(obj) = self.reg.get(id) else { continue };
            if let (ObjectKind::Serial(state), Some(fd)) = (&obj.kind, obj.raw_fd()) {
                crate::console::serial::restore(&obj.name, fd, state);
            }
        }
        self.engine.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ipmi::DisabledEngine;
    use crate::console::test_dev::{TestOptions, TestState};
    use crate::listen::create_listener;
    use socket2::SockRef;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn quiet_test_console(name: &str) -> Object {
        let opts = TestOptions {
            probability: 0,
            ..TestOptions::default()
        };
        Object::new(String::from(name), None, ObjectKind::Test(TestState::new(opts)))
    }

    fn spawn_reactor(
        consoles: &[&str],
    ) -> (u16, Arc<SignalFlags>, Waker, std::thread::JoinHandle<()>) {
        let mut reactor =
            Reactor::new(ReactorConfig::default(), Arc::new(DisabledEngine)).expect("reactor");
        for name in consoles {
            reactor.reg.insert(quiet_test_console(name));
        }
        let listener = create_listener(0, true).expect("listener");
        let port = SockRef::from(&listener)
            .local_addr()
            .expect("addr")
            .as_socket()
            .expect("inet")
            .port();
        reactor.set_listener(listener);
        let flags = reactor.flags();
        let waker = reactor.waker();
        let handle = std::thread::spawn(move || {
            reactor.start_consoles();
            reactor.run().expect("reactor run");
        });
        (port, flags, waker, handle)
    }

    fn stop_reactor(flags: &SignalFlags, waker: &Waker, handle: std::thread::JoinHandle<()>) {
        flags.done.store(true, Ordering::SeqCst);
        waker.wake();
        handle.join().expect("join");
    }

    #[test]
    fn query_round_trips_over_tcp() {
        let (port, flags, waker, handle) = spawn_reactor(&["a", "b1", "b2", "b10"]);
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .write_all(b"HELLO USER='u'\nQUERY\n")
            .expect("send request");
        let mut response = Vec::new();
        stream.read_to_end(&mut response).expect("read to close");
        assert_eq!(response, b"OK\nOK\na\nb1\nb2\nb10\n");
        stop_reactor(&flags, &waker, handle);
    }

    #[test]
    fn connect_fans_client_input_to_the_console() {
        let (port, flags, waker, handle) = spawn_reactor(&["c"]);
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .write_all(b"HELLO USER='u'\nCONNECT CONSOLE='c'\n")
            .expect("send request");
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).expect("greeting ok");
        assert!(buf[..n].starts_with(b"OK\n"));
        // Input flows to the test console's /dev/null sink without
        // killing the session; the suspend toggle proves the escape
        // processor runs server-side.
        stream.write_all(b"hello console\n&Z&Z").expect("data");
        std::thread::sleep(Duration::from_millis(100));
        stream.write_all(b"still alive\n").expect("more data");
        stop_reactor(&flags, &waker, handle);
    }

    #[test]
    fn second_writer_without_force_is_refused() {
        let (port, flags, waker, handle) = spawn_reactor(&["c"]);
        let mut first = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        first
            .write_all(b"HELLO USER='x'\nCONNECT CONSOLE='c'\n")
            .expect("send request");
        let mut buf = [0u8; 128];
        let n = first.read(&mut buf).expect("ok");
        assert!(buf[..n].starts_with(b"OK\n"));

        let mut second = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        second
            .write_all(b"HELLO USER='y'\nCONNECT CONSOLE='c'\n")
            .expect("send request");
        let mut response = Vec::new();
        second.read_to_end(&mut response).expect("read to close");
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("CODE=7"), "got: {text}");
        assert!(text.contains("in use by <x@"), "got: {text}");
        stop_reactor(&flags, &waker, handle);
    }
}
