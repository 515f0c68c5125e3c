//! IPMI Serial-Over-LAN consoles.
//!
//! The heavy lifting lives in an external SOL engine that runs its own
//! worker threads; this driver owns the contract with it.  A connect
//! submits a context to the engine; the engine later invokes the
//! completion callback *from a worker thread*.  Worker threads never
//! touch the object graph: the callback records nothing but pushes the
//! object id onto the [`IpmiNotifier`] queue and wakes the reactor,
//! which re-enters [`connect`] on its own thread.  Established sessions
//! surface a file descriptor that joins the reactor's poll set like any
//! other console fd.
//!
//! Per-object state shared with the engine callback sits behind its own
//! mutex, guarding the DOWN → PENDING → UP transitions against the
//! race between the safety-recheck timer and the worker callback.

use crate::console::{Backoff, ConnState};
use crate::object::{Object, ObjectId, ObjectKind, Registry};
use crate::poll::Waker;
use crate::timer::{TimerEvent, TimerId, TimerWheel};
use crate::{fdio, info_msg, MIN_CONNECT_SECS};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

pub const IPMI_MAX_USER_LEN: usize = 16;
pub const IPMI_MAX_PSWD_LEN: usize = 20;
pub const IPMI_MAX_KG_LEN: usize = 20;

/// Seconds before a PENDING connect is re-checked in case the engine
/// never invoked its callback.
pub const IPMI_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Engine worker threads are sized at one per this many consoles.
pub const ENGINE_CONSOLES_PER_THREAD: usize = 4;

/// Ceiling on engine worker threads.
pub const ENGINE_THREADS_MAX: usize = 32;

/// Named workaround flags, OR-able with raw numeric values.
pub mod workaround {
    pub const AUTHCAP: u32 = 0x0000_0001;
    pub const INTEL20: u32 = 0x0000_0002;
    pub const SUPERMICRO20: u32 = 0x0000_0004;
    pub const SUN20: u32 = 0x0000_0008;
    pub const OPENSESSPRIV: u32 = 0x0000_0010;
    pub const INTEGRITYCHECKVALUE: u32 = 0x0000_0020;
    pub const SOLPAYLOADSIZE: u32 = 0x0100_0000;
    pub const SOLPORT: u32 = 0x0200_0000;
    pub const SOLSTATUS: u32 = 0x0400_0000;
}

/// IPMI privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Operator,
    Admin,
}

impl Privilege {
    fn from_level(n: i64) -> Option<Self> {
        Some(match n {
            2 => Self::User,
            3 => Self::Operator,
            4 => Self::Admin,
            _ => return None,
        })
    }
}

/// Per-console SOL credentials and session knobs, from `IPMIOPTS`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpmiOptions {
    pub username: String,
    pub password: String,
    pub kg: Vec<u8>,
    pub privilege: Option<Privilege>,
    pub cipher_suite: Option<u8>,
    pub workaround_flags: u32,
}

impl IpmiOptions {
    /// Parses a comma-separated list of `X:value` tokens on top of
    /// existing defaults, where X selects username, password, K_g,
    /// privilege level, cipher suite, or workaround flag.
    pub fn parse(defaults: &Self, s: &str) -> Result<Self, String> {
        let mut opts = defaults.clone();
        for tok in s.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            let (tag, value) = match tok.split_at_checked(2) {
                Some((head, value)) if head.as_bytes()[1] == b':' => {
                    (head.as_bytes()[0].to_ascii_uppercase(), value)
                }
                _ => return Err(format!("invalid ipmiopts token \"{tok}\"")),
            };
            match tag {
                b'U' => {
                    if value.len() > IPMI_MAX_USER_LEN {
                        return Err(format!(
                            "IPMI username exceeds {IPMI_MAX_USER_LEN}-byte maximum"
                        ));
                    }
                    opts.username = String::from(value);
                }
                b'P' => {
                    let key = parse_key(value, IPMI_MAX_PSWD_LEN).ok_or(format!(
                        "IPMI password exceeds {IPMI_MAX_PSWD_LEN}-byte maximum"
                    ))?;
                    opts.password = String::from_utf8_lossy(&key).into_owned();
                }
                b'K' => {
                    opts.kg = parse_key(value, IPMI_MAX_KG_LEN).ok_or(format!(
                        "IPMI K_g exceeds {IPMI_MAX_KG_LEN}-byte maximum"
                    ))?;
                }
                b'L' => {
                    opts.privilege = parse_privilege(value)?;
                }
                b'C' => {
                    opts.cipher_suite = parse_cipher(value)?;
                }
                b'W' => {
                    opts.workaround_flags = parse_workaround(opts.workaround_flags, value)?;
                }
                _ => return Err(format!("invalid ipmiopts tag '{}'", tag as char)),
            }
        }
        Ok(opts)
    }
}

fn parse_privilege(value: &str) -> Result<Option<Privilege>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    let privilege = match value.to_ascii_lowercase().as_str() {
        "user" => Privilege::User,
        "op" | "operator" => Privilege::Operator,
        "admin" | "administrator" => Privilege::Admin,
        other => {
            let n: i64 = other
                .parse()
                .map_err(|_| format!("invalid IPMI privilege level \"{value}\""))?;
            Privilege::from_level(n)
                .ok_or_else(|| format!("invalid IPMI privilege level {n}"))?
        }
    };
    Ok(Some(privilege))
}

fn parse_cipher(value: &str) -> Result<Option<u8>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    let n: i64 = value
        .parse()
        .map_err(|_| format!("invalid IPMI cipher suite \"{value}\""))?;
    if !(0..=17).contains(&n) {
        return Err(format!("invalid IPMI cipher suite {n}"));
    }
    Ok(Some(n as u8))
}

fn parse_workaround(current: u32, value: &str) -> Result<u32, String> {
    if value.is_empty() {
        return Ok(0);
    }
    let named = match value.to_ascii_lowercase().as_str() {
        "authcap" => Some(workaround::AUTHCAP),
        "intel20" => Some(workaround::INTEL20),
        "supermicro20" => Some(workaround::SUPERMICRO20),
        "sun20" => Some(workaround::SUN20),
        "opensesspriv" => Some(workaround::OPENSESSPRIV),
        "integritycheckvalue" => Some(workaround::INTEGRITYCHECKVALUE),
        "solpayloadsize" => Some(workaround::SOLPAYLOADSIZE),
        "solport" => Some(workaround::SOLPORT),
        "solstatus" => Some(workaround::SOLSTATUS),
        _ => None,
    };
    if let Some(flag) = named {
        return Ok(current | flag);
    }
    let numeric = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    match numeric {
        Ok(0) => Ok(0),
        Ok(n) => Ok(current | n),
        Err(_) => Err(format!("invalid IPMI workaround flag \"{value}\"")),
    }
}

/// Parses a key that is either ASCII text or, with a `0x` prefix over
/// hex digits only, raw binary (which may contain embedded NULs).
/// Returns `None` if the decoded key exceeds `max_len`.
fn parse_key(src: &str, max_len: usize) -> Option<Vec<u8>> {
    let hex = src
        .strip_prefix("0x")
        .or_else(|| src.strip_prefix("0X"))
        .filter(|rest| rest.bytes().all(|b| b.is_ascii_hexdigit()));
    let Some(hex) = hex else {
        return (src.len() <= max_len).then(|| src.as_bytes().to_vec());
    };
    let mut out = Vec::with_capacity(hex.len().div_ceil(2));
    let mut nibbles = hex.bytes().map(|b| match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    });
    while let Some(high) = nibbles.next() {
        let low = nibbles.next().unwrap_or(0);
        out.push((high << 4) | low);
    }
    (out.len() <= max_len).then_some(out)
}

/// Status of a submitted SOL context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolStatus {
    Pending,
    Established,
    Error,
}

/// A live engine context for one console session.
pub trait SolContext: Send {
    fn status(&self) -> SolStatus;
    /// Surrenders the session fd once the SOL session is established.
    fn take_fd(&mut self) -> Option<OwnedFd>;
    /// Generates a serial-break on the session.
    fn generate_break(&mut self) -> io::Result<()>;
    /// A short description of the last failure, for diagnostics.
    fn error_text(&self) -> String {
        String::from("connection failed")
    }
}

/// The external SOL engine.  `submit` must invoke `done` exactly once,
/// from any thread, when the connection attempt resolves.
pub trait SolEngine: Send + Sync {
    fn start(&self, num_threads: usize) -> io::Result<()>;
    fn stop(&self);
    fn submit(
        &self,
        host: &str,
        opts: &IpmiOptions,
        done: Box<dyn FnOnce() + Send>,
    ) -> io::Result<Box<dyn SolContext>>;
}

/// Engine stand-in used when no SOL engine is linked in: submissions
/// fail, so IPMI consoles cycle through the normal backoff and the
/// rest of the daemon is unaffected.
pub struct DisabledEngine;

impl SolEngine for DisabledEngine {
    fn start(&self, _num_threads: usize) -> io::Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn submit(
        &self,
        _host: &str,
        _opts: &IpmiOptions,
        _done: Box<dyn FnOnce() + Send>,
    ) -> io::Result<Box<dyn SolContext>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no SOL engine available",
        ))
    }
}

/// Worker threads for `num_consoles` sessions: one per
/// [`ENGINE_CONSOLES_PER_THREAD`], clamped to [`ENGINE_THREADS_MAX`].
#[must_use]
pub fn engine_thread_count(num_consoles: usize) -> usize {
    if num_consoles == 0 {
        return 0;
    }
    num_consoles
        .div_ceil(ENGINE_CONSOLES_PER_THREAD)
        .min(ENGINE_THREADS_MAX)
}

/// Queue + waker pair handed to engine callbacks.  `notify` is the only
/// thing a worker thread ever does to the reactor.
#[derive(Clone)]
pub struct IpmiNotifier {
    queue: Arc<Mutex<Vec<ObjectId>>>,
    waker: Waker,
}

impl IpmiNotifier {
    #[must_use]
    pub fn new(waker: Waker) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            waker,
        }
    }

    pub fn notify(&self, id: ObjectId) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        self.waker.wake();
    }

    /// Drains the pending notifications (reactor thread only).
    #[must_use]
    pub fn drain(&self) -> Vec<ObjectId> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// State shared between the reactor and engine callbacks.
pub struct IpmiShared {
    pub conn: ConnState,
    pub ctx: Option<Box<dyn SolContext>>,
}

/// Variant payload for an IPMI console object.
pub struct IpmiState {
    pub host: String,
    pub opts: IpmiOptions,
    pub logfile: Option<ObjectId>,
    pub timer: Option<TimerId>,
    pub backoff: Backoff,
    shared: Arc<Mutex<IpmiShared>>,
}

impl IpmiState {
    #[must_use]
    pub fn new(host: String, opts: IpmiOptions) -> Self {
        Self {
            host,
            opts,
            logfile: None,
            timer: None,
            backoff: Backoff::new(),
            shared: Arc::new(Mutex::new(IpmiShared {
                conn: ConnState::Down,
                ctx: None,
            })),
        }
    }

    pub fn shared(&self) -> MutexGuard<'_, IpmiShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_up(&self) -> bool {
        self.shared().conn == ConnState::Up
    }
}

enum ConnectOutcome {
    NoChange,
    WentUp,
    Failed(String),
}

/// Drives the connect state machine from the reactor thread: DOWN
/// submits a fresh context, PENDING inspects the context status.  A
/// no-op when already UP, which guards against the race between the
/// safety timer and the engine callback both re-entering here.
pub fn connect(
    reg: &mut Registry,
    wheel: &mut TimerWheel,
    id: ObjectId,
    engine: &dyn SolEngine,
    notifier: &IpmiNotifier,
) {
    let Some(obj) = reg.get_mut(id) else { return };
    let name = obj.name.clone();

    let outcome = {
        let ObjectKind::Ipmi(state) = &mut obj.kind else {
            return;
        };
        let shared = state.shared.clone();
        let mut sh = shared.lock().unwrap_or_else(PoisonError::into_inner);
        if sh.conn == ConnState::Up {
            ConnectOutcome::NoChange
        } else {
            if let Some(timer) = state.timer.take() {
                wheel.cancel(timer);
            }
            match sh.conn {
                ConnState::Down => {
                    let done = {
                        let notifier = notifier.clone();
                        Box::new(move || notifier.notify(id))
                    };
                    match engine.submit(&state.host, &state.opts, done) {
                        Ok(ctx) => {
                            sh.ctx = Some(ctx);
                            sh.conn = ConnState::Pending;
                            state.timer = Some(wheel.arm_in(
                                Duration::from_secs(IPMI_CONNECT_TIMEOUT_SECS),
                                TimerEvent::IpmiRecheck(id),
                            ));
                            ConnectOutcome::NoChange
                        }
                        Err(err) => fail(state, &mut sh, wheel, id, err.to_string()),
                    }
                }
                ConnState::Pending => {
                    let status = sh.ctx.as_ref().map(|c| c.status());
                    match status {
                        Some(SolStatus::Established) => {
                            match sh.ctx.as_mut().and_then(|c| c.take_fd()) {
                                Some(fd) => {
                                    let _ = fdio::set_nonblocking(fd.as_raw_fd());
                                    let _ = fdio::set_cloexec(fd.as_raw_fd());
                                    obj.fd = Some(fd);
                                    obj.got_eof = false;
                                    sh.conn = ConnState::Up;
                                    state.timer = Some(wheel.arm_in(
                                        Duration::from_secs(MIN_CONNECT_SECS),
                                        TimerEvent::ResetBackoff(id),
                                    ));
                                    ConnectOutcome::WentUp
                                }
                                None => fail(
                                    state,
                                    &mut sh,
                                    wheel,
                                    id,
                                    String::from("engine produced no session fd"),
                                ),
                            }
                        }
                        Some(SolStatus::Pending) => ConnectOutcome::NoChange,
                        Some(SolStatus::Error) => {
                            let text = sh
                                .ctx
                                .as_ref()
                                .map_or_else(|| String::from("unknown"), |c| c.error_text());
                            fail(state, &mut sh, wheel, id, text)
                        }
                        None => fail(
                            state,
                            &mut sh,
                            wheel,
                            id,
                            String::from("missing engine context"),
                        ),
                    }
                }
                ConnState::Up => ConnectOutcome::NoChange,
            }
        }
    };

    match outcome {
        ConnectOutcome::NoChange => {}
        ConnectOutcome::WentUp => {
            let host = match reg.get(id).map(|o| &o.kind) {
                Some(ObjectKind::Ipmi(s)) => s.host.clone(),
                _ => String::new(),
            };
            info!(console = %name, host = %host, "SOL session established");
            let msg = info_msg(&format!("Console [{name}] connected to <{host}>"));
            reg.notify_console(id, &msg);
        }
        ConnectOutcome::Failed(reason) => {
            info!(console = %name, reason = %reason, "SOL connect failed");
        }
    }
}

fn fail(
    state: &mut IpmiState,
    sh: &mut IpmiShared,
    wheel: &mut TimerWheel,
    id: ObjectId,
    reason: String,
) -> ConnectOutcome {
    sh.conn = ConnState::Down;
    sh.ctx = None;
    let delay = state.backoff.advance();
    state.timer = Some(wheel.arm_in(delay, TimerEvent::Reconnect(id)));
    ConnectOutcome::Failed(reason)
}

/// Closes the session: drops the engine context, closes the fd, and
/// announces the disconnect if the session was up.  The caller decides
/// whether to re-enter [`connect`].
pub fn disconnect(reg: &mut Registry, wheel: &mut TimerWheel, id: ObjectId) {
    let Some(obj) = reg.get_mut(id) else { return };
    if obj.fd.take().is_some() {
        obj.buf().clear();
    }
    let name = obj.name.clone();
    let was_up;
    let host;
    {
        let ObjectKind::Ipmi(state) = &mut obj.kind else {
            return;
        };
        if let Some(timer) = state.timer.take() {
            wheel.cancel(timer);
        }
        let mut sh = state.shared();
        was_up = sh.conn == ConnState::Up;
        sh.conn = ConnState::Down;
        sh.ctx = None;
        host = state.host.clone();
    }
    if was_up {
        info!(console = %name, host = %host, "SOL session closed");
        let msg = info_msg(&format!("Console [{name}] disconnected from <{host}>"));
        reg.notify_console(id, &msg);
    }
}

/// Generates a serial-break through the engine context.
pub fn send_break(obj: &mut Object) {
    let name = obj.name.clone();
    let ObjectKind::Ipmi(state) = &mut obj.kind else {
        return;
    };
    let shared = state.shared.clone();
    let mut sh = shared.lock().unwrap_or_else(PoisonError::into_inner);
    match sh.ctx.as_mut() {
        Some(ctx) => {
            if let Err(err) = ctx.generate_break() {
                warn!(console = %name, error = %err, "unable to send serial break");
            }
        }
        None => warn!(console = %name, "unable to send serial break: no SOL context"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::Poller;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn key_parser_handles_text_and_hex() {
        assert_eq!(parse_key("secret", 20), Some(b"secret".to_vec()));
        assert_eq!(parse_key("0xDEADBEEF", 20), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        // Odd nibble counts leave the final low nibble zero.
        assert_eq!(parse_key("0xABC", 20), Some(vec![0xab, 0xc0]));
        // Non-hex after the prefix falls back to literal text.
        assert_eq!(parse_key("0xZZ", 20), Some(b"0xZZ".to_vec()));
        assert_eq!(parse_key("0x00FF00", 2), None);
        assert_eq!(parse_key("toolongtoolongtoolongx", 20), None);
    }

    #[test]
    fn options_parse_tagged_tokens() {
        let opts = IpmiOptions::parse(
            &IpmiOptions::default(),
            "U:admin,P:secret,K:0x4B47,L:operator,C:3,W:intel20,W:0x40",
        )
        .expect("parses");
        assert_eq!(opts.username, "admin");
        assert_eq!(opts.password, "secret");
        assert_eq!(opts.kg, b"KG".to_vec());
        assert_eq!(opts.privilege, Some(Privilege::Operator));
        assert_eq!(opts.cipher_suite, Some(3));
        assert_eq!(opts.workaround_flags, workaround::INTEL20 | 0x40);
    }

    #[test]
    fn workaround_zero_clears_accumulated_flags() {
        let opts = IpmiOptions::parse(&IpmiOptions::default(), "W:authcap,W:0")
            .expect("parses");
        assert_eq!(opts.workaround_flags, 0);
    }

    #[test]
    fn options_reject_malformed_tokens() {
        assert!(IpmiOptions::parse(&IpmiOptions::default(), "X:nope").is_err());
        assert!(IpmiOptions::parse(&IpmiOptions::default(), "L:root").is_err());
        assert!(IpmiOptions::parse(&IpmiOptions::default(), "C:99").is_err());
        assert!(IpmiOptions::parse(&IpmiOptions::default(), "U:this-name-is-way-too-long")
            .is_err());
    }

    #[test]
    fn thread_count_scales_and_clamps() {
        assert_eq!(engine_thread_count(0), 0);
        assert_eq!(engine_thread_count(1), 1);
        assert_eq!(engine_thread_count(4), 1);
        assert_eq!(engine_thread_count(5), 2);
        assert_eq!(engine_thread_count(1000), ENGINE_THREADS_MAX);
    }

    struct MockContext {
        status: SolStatus,
        fd: Option<OwnedFd>,
        broke: Arc<AtomicBool>,
    }

    impl SolContext for MockContext {
        fn status(&self) -> SolStatus {
            self.status
        }
        fn take_fd(&mut self) -> Option<OwnedFd> {
            self.fd.take()
        }
        fn generate_break(&mut self) -> io::Result<()> {
            self.broke.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockEngine {
        status: SolStatus,
        broke: Arc<AtomicBool>,
    }

    impl SolEngine for MockEngine {
        fn start(&self, _num_threads: usize) -> io::Result<()> {
            Ok(())
        }
        fn stop(&self) {}
        fn submit(
            &self,
            _host: &str,
            _opts: &IpmiOptions,
            done: Box<dyn FnOnce() + Send>,
        ) -> io::Result<Box<dyn SolContext>> {
            let (_rx, tx) = crate::fdio::pipe()?;
            // Resolve from another thread, as the real engine does.
            std::thread::spawn(done);
            Ok(Box::new(MockContext {
                status: self.status,
                fd: Some(tx),
                broke: self.broke.clone(),
            }))
        }
    }

    fn ipmi_obj() -> Object {
        Object::new(
            String::from("bmc1"),
            None,
            ObjectKind::Ipmi(IpmiState::new(
                String::from("bmc1.mgmt"),
                IpmiOptions::default(),
            )),
        )
    }

    #[test]
    fn connect_walks_down_pending_up() {
        let broke = Arc::new(AtomicBool::new(false));
        let engine = MockEngine {
            status: SolStatus::Established,
            broke: broke.clone(),
        };
        let poller = Poller::new().expect("poller");
        let notifier = IpmiNotifier::new(poller.waker());
        let mut reg = Registry::new();
        let mut wheel = TimerWheel::new();
        let id = reg.insert(ipmi_obj());

        connect(&mut reg, &mut wheel, id, &engine, &notifier);
        {
            let obj = reg.get(id).expect("object");
            let ObjectKind::Ipmi(state) = &obj.kind else {
                panic!("wrong kind")
            };
            assert_eq!(state.shared().conn, ConnState::Pending);
        }
        // Wait for the worker callback to queue its notification.
        for _ in 0..100 {
            if !notifier.drain().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        connect(&mut reg, &mut wheel, id, &engine, &notifier);
        let obj = reg.get_mut(id).expect("object");
        assert!(obj.raw_fd().is_some());
        assert!(obj.kind.is_up_for_write());
        send_break(obj);
        assert!(broke.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_submit_arms_backoff() {
        let engine = DisabledEngine;
        let poller = Poller::new().expect("poller");
        let notifier = IpmiNotifier::new(poller.waker());
        let mut reg = Registry::new();
        let mut wheel = TimerWheel::new();
        let id = reg.insert(ipmi_obj());
        connect(&mut reg, &mut wheel, id, &engine, &notifier);
        let obj = reg.get(id).expect("object");
        let ObjectKind::Ipmi(state) = &obj.kind else {
            panic!("wrong kind")
        };
        assert_eq!(state.shared().conn, ConnState::Down);
        assert!(!wheel.is_empty());
    }

    #[test]
    fn engine_error_status_fails_the_pending_connect() {
        let broke = Arc::new(AtomicBool::new(false));
        let engine = MockEngine {
            status: SolStatus::Error,
            broke,
        };
        let poller = Poller::new().expect("poller");
        let notifier = IpmiNotifier::new(poller.waker());
        let mut reg = Registry::new();
        let mut wheel = TimerWheel::new();
        let id = reg.insert(ipmi_obj());
        connect(&mut reg, &mut wheel, id, &engine, &notifier);
        connect(&mut reg, &mut wheel, id, &engine, &notifier);
        let obj = reg.get(id).expect("object");
        let ObjectKind::Ipmi(state) = &obj.kind else {
            panic!("wrong kind")
        };
        assert_eq!(state.shared().conn, ConnState::Down);
        assert!(obj.raw_fd().is_none());
    }
}
