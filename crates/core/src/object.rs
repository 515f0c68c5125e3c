//! The object graph: every unit of I/O the reactor drives.
//!
//! An [`Object`] couples a name, an optional fd, a circular write
//! buffer, EOF/reset flags, the reader/writer link lists, and a
//! driver-specific [`ObjectKind`].  The [`Registry`] is the master list
//! and sole owner; readers/writers hold [`ObjectId`] handles, never
//! references, so the mutual links of the graph stay cycle-safe.
//!
//! Data flow: bytes read from a source object are appended to the ring
//! of every object in its `readers` list; the reactor's write pass
//! drains each ring toward its fd.  `A ∈ B.writers ⇔ B ∈ A.readers`
//! holds at every public-method boundary.

use crate::buffer::{RingBuf, Written};
use crate::console::ipmi::IpmiState;
use crate::console::process::ProcessState;
use crate::console::serial::SerialState;
use crate::console::telnet::TelnetState;
use crate::console::test_dev::TestState;
use crate::console::unixsock::UnixsockState;
use crate::fdio;
use crate::logfile::LogfileState;
use crate::session::ClientState;
use crate::{info_msg, timefmt};
use std::cmp::Ordering;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Generational handle into the [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    /// Constructs a handle from raw parts (tests and diagnostics only;
    /// registry lookups reject stale generations).
    #[must_use]
    pub fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Driver-specific payload discriminating the object variants.
pub enum ObjectKind {
    Client(ClientState),
    Logfile(LogfileState),
    Serial(SerialState),
    Telnet(TelnetState),
    Unixsock(UnixsockState),
    Process(ProcessState),
    Ipmi(IpmiState),
    Test(TestState),
}

impl ObjectKind {
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    pub fn is_logfile(&self) -> bool {
        matches!(self, Self::Logfile(_))
    }

    /// Consoles are everything a client can attach to.
    pub fn is_console(&self) -> bool {
        matches!(
            self,
            Self::Serial(_)
                | Self::Telnet(_)
                | Self::Unixsock(_)
                | Self::Process(_)
                | Self::Ipmi(_)
                | Self::Test(_)
        )
    }

    /// True when writes may enter this object's buffer: network-backed
    /// consoles drop data unless their connection is UP.
    pub fn is_up_for_write(&self) -> bool {
        match self {
            Self::Client(_) | Self::Logfile(_) | Self::Serial(_) | Self::Test(_) => true,
            Self::Telnet(t) => t.is_up(),
            Self::Unixsock(u) => u.is_up(),
            Self::Process(p) => p.is_up(),
            Self::Ipmi(i) => i.is_up(),
        }
    }

    /// True when the reactor should poll this object's fd for input.
    pub fn wants_read(&self) -> bool {
        match self {
            Self::Client(_) | Self::Serial(_) => true,
            Self::Telnet(t) => t.is_up(),
            Self::Unixsock(u) => u.is_up(),
            Self::Process(p) => p.is_up(),
            Self::Ipmi(i) => i.is_up(),
            // Test consoles are timer-driven; the fd is a /dev/null sink.
            Self::Logfile(_) | Self::Test(_) => false,
        }
    }

    /// The logfile attached to this console, if any.
    pub fn logfile_id(&self) -> Option<ObjectId> {
        match self {
            Self::Serial(s) => s.logfile,
            Self::Telnet(t) => t.logfile,
            Self::Unixsock(u) => u.logfile,
            Self::Process(p) => p.logfile,
            Self::Ipmi(i) => i.logfile,
            Self::Test(t) => t.logfile,
            Self::Client(_) | Self::Logfile(_) => None,
        }
    }

    /// Attaches a logfile to this console.
    pub fn set_logfile_id(&mut self, id: Option<ObjectId>) {
        match self {
            Self::Serial(s) => s.logfile = id,
            Self::Telnet(t) => t.logfile = id,
            Self::Unixsock(u) => u.logfile = id,
            Self::Process(p) => p.logfile = id,
            Self::Ipmi(i) => i.logfile = id,
            Self::Test(t) => t.logfile = id,
            Self::Client(_) | Self::Logfile(_) => {}
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Client(_) => "client",
            Self::Logfile(_) => "logfile",
            Self::Serial(_) => "serial",
            Self::Telnet(_) => "telnet",
            Self::Unixsock(_) => "unixsock",
            Self::Process(_) => "process",
            Self::Ipmi(_) => "ipmi",
            Self::Test(_) => "test",
        }
    }

    pub fn as_client(&self) -> Option<&ClientState> {
        match self {
            Self::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_client_mut(&mut self) -> Option<&mut ClientState> {
        match self {
            Self::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_logfile(&self) -> Option<&LogfileState> {
        match self {
            Self::Logfile(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_logfile_mut(&mut self) -> Option<&mut LogfileState> {
        match self {
            Self::Logfile(l) => Some(l),
            _ => None,
        }
    }
}

/// Outcome of a drain pass over one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Alive,
    /// EOF was set and the buffer has fully drained (or died trying);
    /// the object is ready for shutdown.
    Dead,
}

pub struct Object {
    pub name: String,
    pub fd: Option<OwnedFd>,
    buf: Mutex<RingBuf>,
    pub got_eof: bool,
    pub got_reset: bool,
    pub readers: Vec<ObjectId>,
    pub writers: Vec<ObjectId>,
    pub kind: ObjectKind,
}

impl Object {
    #[must_use]
    pub fn new(name: String, fd: Option<OwnedFd>, kind: ObjectKind) -> Self {
        Self {
            name,
            fd,
            buf: Mutex::new(RingBuf::new()),
            got_eof: false,
            got_reset: false,
            readers: Vec::new(),
            writers: Vec::new(),
            kind,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Locks the circular buffer.  The IPMI engine's worker threads
    /// never touch buffers directly, but the lock is kept so the replay
    /// copy and the drain path serialise exactly as specified.
    pub fn buf(&self) -> MutexGuard<'_, RingBuf> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `src` to this object's buffer, honouring the no-op rules:
    /// closed fd, EOF already seen, down network connection, or an
    /// informational message to a quiet client.  Returns bytes stored.
    pub fn write_data(&mut self, src: &[u8], is_info: bool) -> usize {
        if src.is_empty() || self.fd.is_none() {
            return 0;
        }
        if self.got_eof {
            debug!(object = %self.name, "write after EOF dropped");
            return 0;
        }
        if !self.kind.is_up_for_write() {
            debug!(object = %self.name, "write to down connection dropped");
            return 0;
        }
        let suspended = match &self.kind {
            ObjectKind::Client(c) => {
                if is_info && c.quiet {
                    return 0;
                }
                c.got_suspend
            }
            _ => false,
        };
        let Written {
            stored,
            overwritten,
        } = self.buf().write(src);
        if overwritten > 0 && !suspended {
            debug!(object = %self.name, lost = overwritten, "buffer overrun");
        }
        stored
    }

    /// True when the reactor should poll this object's fd for write:
    /// data pending or EOF flush wanted, unless the client is suspended.
    pub fn wants_write(&self) -> bool {
        if let ObjectKind::Client(c) = &self.kind {
            if c.got_suspend {
                return false;
            }
        }
        self.got_eof || !self.buf().is_empty()
    }

    /// Writes one bounded chunk from the buffer to the fd.
    ///
    /// `EAGAIN` leaves all state unchanged; any other write error marks
    /// the object EOF and clears the buffer so the reactor can reap it.
    /// A suspended client contributes nothing; a down network console's
    /// buffer is discarded.
    pub fn drain(&mut self) -> DrainOutcome {
        let Some(fd) = self.raw_fd() else {
            return DrainOutcome::Alive;
        };
        let suspended = matches!(&self.kind, ObjectKind::Client(c) if c.got_suspend);
        let is_down_net = self.kind.is_console() && !self.kind.is_up_for_write();

        let mut ring = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        if is_down_net {
            ring.clear();
        } else if !suspended && !ring.drainable().is_empty() {
            match fdio::write(fd, ring.drainable()) {
                Ok(n) => ring.consume(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!(object = %self.name, error = %err, "write failed");
                    self.got_eof = true;
                    ring.clear();
                }
            }
        }
        if self.got_eof && ring.is_empty() {
            DrainOutcome::Dead
        } else {
            DrainOutcome::Alive
        }
    }
}

struct Slot {
    generation: u32,
    obj: Option<Object>,
}

/// The master object list: owns every object, preserves insertion order
/// for the reactor's iteration, and recycles slots generationally so
/// stale handles miss instead of aliasing.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<ObjectId>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, obj: Object) -> ObjectId {
        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.obj = Some(obj);
            ObjectId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 1,
                obj: Some(obj),
            });
            ObjectId {
                index,
                generation: 1,
            }
        };
        self.order.push(id);
        id
    }

    /// Removes and returns the object.  The caller is responsible for
    /// having unlinked it first.
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let obj = slot.obj.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.order.retain(|&o| o != id);
        Some(obj)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.obj.as_ref()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.obj.as_mut()
    }

    /// Object ids in insertion order.  A snapshot, so callers may mutate
    /// the registry while walking it.
    #[must_use]
    pub fn ids(&self) -> Vec<ObjectId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Object)> + '_ {
        self.order.iter().filter_map(|&id| Some((id, self.get(id)?)))
    }

    /// Finds a console object by exact name.
    pub fn find_console(&self, name: &str) -> Option<ObjectId> {
        self.iter()
            .find(|(_, obj)| obj.kind.is_console() && obj.name == name)
            .map(|(id, _)| id)
    }

    /// Appends `msg` to `dst`'s buffer if the object still exists.
    pub fn write_to(&mut self, dst: ObjectId, msg: &[u8], is_info: bool) -> usize {
        match self.get_mut(dst) {
            Some(obj) => obj.write_data(msg, is_info),
            None => 0,
        }
    }

    /// Notifies every reader and writer of `console` with an
    /// informational message; an object linked both ways hears it once.
    pub fn notify_console(&mut self, console: ObjectId, msg: &str) {
        let Some(obj) = self.get(console) else {
            return;
        };
        debug_assert!(obj.kind.is_console());
        let readers = obj.readers.clone();
        let writers = obj.writers.clone();
        for id in &readers {
            self.write_to(*id, msg.as_bytes(), true);
        }
        for id in writers {
            if !readers.contains(&id) {
                self.write_to(id, msg.as_bytes(), true);
            }
        }
    }

    /// Links data flow from `src` to `dst`: bytes read from `src` will
    /// be copied into `dst`'s buffer.
    ///
    /// When a writable client attaches to a console this announces the
    /// arrival to the console's existing parties, tells the new client
    /// about existing writers, and — under force — steals the console by
    /// unlinking every existing writer.
    pub fn link(&mut self, src: ObjectId, dst: ObjectId) {
        let src_is_client = self.get(src).is_some_and(|o| o.kind.is_client());
        let dst_is_console = self.get(dst).is_some_and(|o| o.kind.is_console());

        if src_is_client && dst_is_console {
            self.announce_writer_arrival(src, dst);
        }

        if let Some(obj) = self.get_mut(src) {
            debug_assert!(!obj.readers.contains(&dst));
            obj.readers.push(dst);
        }
        if let Some(obj) = self.get_mut(dst) {
            debug_assert!(!obj.writers.contains(&src));
            obj.writers.push(src);
        }
        debug_assert!(self.links_are_symmetric(src));
        debug_assert!(self.links_are_symmetric(dst));
    }

    fn announce_writer_arrival(&mut self, client: ObjectId, console: ObjectId) {
        let (user_host, tty, broadcast, force) = match self
            .get(client)
            .and_then(|o| o.kind.as_client())
        {
            Some(c) => (
                c.user_at_host(),
                c.tty.clone(),
                c.broadcast,
                c.force,
            ),
            None => return,
        };
        let console_name = match self.get(console) {
            Some(obj) => obj.name.clone(),
            None => return,
        };
        let existing_writers = self
            .get(console)
            .map(|o| o.writers.clone())
            .unwrap_or_default();
        let stolen = force && !existing_writers.is_empty();
        let now = timefmt::short_time();

        let on_tty = |tty: &Option<String>| match tty {
            Some(t) => format!(" on {t}"),
            None => String::new(),
        };
        let msg = info_msg(&format!(
            "Console [{console_name}] {}{} by <{user_host}>{} at {now}",
            if stolen { "stolen" } else { "joined" },
            if broadcast { " for B/C" } else { "" },
            on_tty(&tty),
        ));
        self.notify_console(console, &msg);

        for writer in &existing_writers {
            let Some(wc) = self.get(*writer).and_then(|o| o.kind.as_client()) else {
                continue;
            };
            let msg = info_msg(&format!(
                "Console [{console_name}] {} <{}>{} at {now}",
                if stolen { "stolen from" } else { "joined with" },
                wc.user_at_host(),
                on_tty(&wc.tty.clone()),
            ));
            self.write_to(client, msg.as_bytes(), true);
        }

        if stolen {
            for writer in existing_writers {
                self.unlink_all(writer);
            }
        }
    }

    /// Removes the `src`→`dst` data-flow link, announcing the departure
    /// of a writable client and flagging fully-unlinked clients EOF so
    /// the reactor reaps them once their buffers drain.
    pub fn unlink_pair(&mut self, src: ObjectId, dst: ObjectId) {
        if let Some(obj) = self.get_mut(src) {
            obj.readers.retain(|&id| id != dst);
        }
        let mut removed = false;
        if let Some(obj) = self.get_mut(dst) {
            let before = obj.writers.len();
            obj.writers.retain(|&id| id != src);
            removed = obj.writers.len() != before;
        }

        let src_is_client = self.get(src).is_some_and(|o| o.kind.is_client());
        let dst_is_console = self.get(dst).is_some_and(|o| o.kind.is_console());
        if removed && src_is_client && dst_is_console {
            let user_host;
            let tty;
            match self.get(src).and_then(|o| o.kind.as_client()) {
                Some(c) => {
                    user_host = c.user_at_host();
                    tty = c.tty.clone();
                }
                None => {
                    user_host = String::new();
                    tty = None;
                }
            }
            let console_name = self
                .get(dst)
                .map(|o| o.name.clone())
                .unwrap_or_default();
            let on_tty = match tty {
                Some(t) => format!(" on {t}"),
                None => String::new(),
            };
            let msg = info_msg(&format!(
                "Console [{console_name}] departed by <{user_host}>{on_tty} at {}",
                timefmt::short_time(),
            ));
            self.notify_console(dst, &msg);
        }

        for id in [src, dst] {
            if let Some(obj) = self.get_mut(id) {
                if obj.kind.is_client() && obj.readers.is_empty() && obj.writers.is_empty() {
                    obj.got_eof = true;
                }
            }
        }
        debug_assert!(self.links_are_symmetric(src));
        debug_assert!(self.links_are_symmetric(dst));
    }

    /// Severs every link touching `obj` (shutdown and pre-destruction).
    pub fn unlink_all(&mut self, id: ObjectId) {
        loop {
            let Some(obj) = self.get(id) else { return };
            if let Some(&writer) = obj.writers.first() {
                self.unlink_pair(writer, id);
            } else if let Some(&reader) = obj.readers.first() {
                self.unlink_pair(id, reader);
            } else {
                return;
            }
        }
    }

    fn links_are_symmetric(&self, id: ObjectId) -> bool {
        let Some(obj) = self.get(id) else { return true };
        obj.readers.iter().all(|&r| {
            self.get(r)
                .map_or(true, |other| other.writers.contains(&id))
        }) && obj.writers.iter().all(|&w| {
            self.get(w)
                .map_or(true, |other| other.readers.contains(&id))
        })
    }
}

/// Orders console names ascending, except that names agreeing up to
/// trailing integer suffixes compare those suffixes numerically
/// (`foo1 < foo2 < foo10`).
#[must_use]
pub fn compare_console_names(a: &str, b: &str) -> Ordering {
    fn trailing_int_start(s: &[u8]) -> Option<usize> {
        let mut start = None;
        for (i, b) in s.iter().enumerate() {
            if b.is_ascii_digit() {
                start.get_or_insert(i);
            } else {
                start = None;
            }
        }
        start
    }
    fn leading_int(s: &[u8]) -> u64 {
        let mut n: u64 = 0;
        for &b in s {
            if !b.is_ascii_digit() {
                break;
            }
            n = n.saturating_mul(10).saturating_add(u64::from(b - b'0'));
        }
        n
    }

    let ab = a.as_bytes();
    let bb = b.as_bytes();
    let ia = trailing_int_start(ab);
    let ib = trailing_int_start(bb);
    let mut i = 0;
    while i < ab.len() {
        if ia == Some(i) && ib == Some(i) {
            return leading_int(&ab[i..]).cmp(&leading_int(&bb[i..]));
        }
        if bb.get(i) == Some(&ab[i]) {
            i += 1;
        } else {
            break;
        }
    }
    let ca = ab.get(i).copied().unwrap_or(0);
    let cb = bb.get(i).copied().unwrap_or(0);
    ca.cmp(&cb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::test_dev::{TestOptions, TestState};
    use crate::session::ClientState;
    use std::os::fd::OwnedFd;

    fn sink_fd() -> OwnedFd {
        let (_rx, tx) = fdio::pipe().expect("pipe");
        tx
    }

    fn console(name: &str) -> Object {
        Object::new(
            String::from(name),
            Some(sink_fd()),
            ObjectKind::Test(TestState::new(TestOptions::default())),
        )
    }

    fn client(user: &str) -> Object {
        let state = ClientState::for_tests(user, "testhost");
        Object::new(
            format!("{user}@testhost:1"),
            Some(sink_fd()),
            ObjectKind::Client(state),
        )
    }

    #[test]
    fn link_and_unlink_are_symmetric_inverses() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c0"));
        let cli = reg.insert(client("alice"));
        reg.link(con, cli);
        assert!(reg.get(con).expect("console").readers.contains(&cli));
        assert!(reg.get(cli).expect("client").writers.contains(&con));
        reg.unlink_pair(con, cli);
        assert!(reg.get(con).expect("console").readers.is_empty());
        assert!(reg.get(cli).expect("client").writers.is_empty());
    }

    #[test]
    fn fully_unlinked_client_is_flagged_eof() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c0"));
        let cli = reg.insert(client("alice"));
        reg.link(con, cli);
        reg.link(cli, con);
        reg.unlink_all(cli);
        assert!(reg.get(cli).expect("client").got_eof);
        assert!(reg.get(con).expect("console").writers.is_empty());
        assert!(reg.get(con).expect("console").readers.is_empty());
    }

    #[test]
    fn force_link_steals_existing_writers() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c0"));
        let old = reg.insert(client("alice"));
        reg.link(con, old);
        reg.link(old, con);

        let mut thief = client("bob");
        if let ObjectKind::Client(c) = &mut thief.kind {
            c.force = true;
        }
        let thief = reg.insert(thief);
        reg.link(con, thief);
        reg.link(thief, con);

        let writers = &reg.get(con).expect("console").writers;
        assert_eq!(writers.as_slice(), &[thief]);
        assert!(reg.get(old).expect("old client").got_eof);
    }

    #[test]
    fn stale_ids_miss_after_removal() {
        let mut reg = Registry::new();
        let id = reg.insert(console("c0"));
        reg.remove(id).expect("present");
        assert!(reg.get(id).is_none());
        let reused = reg.insert(console("c1"));
        assert!(reg.get(id).is_none());
        assert!(reg.get(reused).is_some());
    }

    #[test]
    fn registry_iterates_in_insertion_order() {
        let mut reg = Registry::new();
        let a = reg.insert(console("a"));
        let b = reg.insert(console("b"));
        let c = reg.insert(console("c"));
        reg.remove(b);
        let order: Vec<ObjectId> = reg.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, c]);
    }

    #[test]
    fn fanout_appends_exactly_the_burst_to_each_reader() {
        let mut reg = Registry::new();
        let con = reg.insert(console("c0"));
        let r1 = reg.insert(client("alice"));
        let r2 = reg.insert(client("bob"));
        reg.link(con, r1);
        reg.link(con, r2);
        let burst = b"0123456789";
        for id in reg.get(con).expect("console").readers.clone() {
            let n = reg.write_to(id, burst, false);
            assert_eq!(n, burst.len());
        }
        for id in [r1, r2] {
            assert_eq!(reg.get(id).expect("reader").buf().len(), burst.len());
        }
    }

    #[test]
    fn quiet_clients_drop_informational_writes_only() {
        let mut reg = Registry::new();
        let mut cli = client("alice");
        if let ObjectKind::Client(c) = &mut cli.kind {
            c.quiet = true;
        }
        let cli = reg.insert(cli);
        assert_eq!(reg.write_to(cli, b"info", true), 0);
        assert_eq!(reg.write_to(cli, b"data", false), 4);
    }

    #[test]
    fn eof_objects_refuse_new_data() {
        let mut reg = Registry::new();
        let cli = reg.insert(client("alice"));
        reg.get_mut(cli).expect("client").got_eof = true;
        assert_eq!(reg.write_to(cli, b"data", false), 0);
    }

    #[test]
    fn console_names_sort_numerically_on_trailing_integers() {
        let mut names = vec!["b10", "a", "b2", "b1"];
        names.sort_by(|a, b| compare_console_names(a, b));
        assert_eq!(names, vec!["a", "b1", "b2", "b10"]);
    }

    #[test]
    fn console_name_sort_falls_back_to_bytes() {
        assert_eq!(compare_console_names("abc", "abd"), Ordering::Less);
        assert_eq!(compare_console_names("abc", "abc"), Ordering::Equal);
        assert_eq!(compare_console_names("abc", "ab"), Ordering::Greater);
        // Differing prefixes before the integers compare as strings.
        assert_eq!(compare_console_names("a9", "b1"), Ordering::Less);
    }

    #[test]
    fn suspended_clients_advertise_no_write_interest() {
        let mut reg = Registry::new();
        let cli = reg.insert(client("alice"));
        reg.write_to(cli, b"data", false);
        assert!(reg.get(cli).expect("client").wants_write());
        if let ObjectKind::Client(c) = &mut reg.get_mut(cli).expect("client").kind {
            c.got_suspend = true;
        }
        assert!(!reg.get(cli).expect("client").wants_write());
    }
}
