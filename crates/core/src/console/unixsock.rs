//! Consoles behind named unix domain stream sockets.
//!
//! Two states only: a unix-socket connect either completes immediately
//! or fails, so there is no PENDING.  Failures (missing path, not a
//! socket, refused) arm the shared backoff; the daemon keeps retrying
//! until the endpoint appears.

use crate::console::{Backoff, ConnState};
use crate::object::{ObjectId, ObjectKind, Registry};
use crate::timer::{TimerEvent, TimerId, TimerWheel};
use crate::{fdio, info_msg, timefmt, MIN_CONNECT_SECS};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest path a `sockaddr_un` can address, NUL excluded.
#[must_use]
pub fn max_dev_strlen() -> usize {
    let addr = libc::sockaddr_un {
        sun_family: 0,
        sun_path: [0; 108],
    };
    addr.sun_path.len() - 1
}

/// Variant payload for a unix-socket console object.
pub struct UnixsockState {
    pub dev: String,
    pub logfile: Option<ObjectId>,
    pub timer: Option<TimerId>,
    pub backoff: Backoff,
    pub conn: ConnState,
}

impl UnixsockState {
    #[must_use]
    pub fn new(dev: String) -> Self {
        Self {
            dev,
            logfile: None,
            timer: None,
            backoff: Backoff::new(),
            conn: ConnState::Down,
        }
    }

    pub fn is_up(&self) -> bool {
        self.conn == ConnState::Up
    }
}

/// Attempts to connect; on failure falls through to [`disconnect`],
/// which arms the retry timer.
pub fn connect(reg: &mut Registry, wheel: &mut TimerWheel, id: ObjectId) {
    let Some(obj) = reg.get_mut(id) else { return };
    let name = obj.name.clone();
    let ObjectKind::Unixsock(state) = &mut obj.kind else {
        return;
    };
    if let Some(timer) = state.timer.take() {
        wheel.cancel(timer);
    }
    if state.conn == ConnState::Up {
        return;
    }
    let dev = state.dev.clone();

    match try_connect(&name, &dev) {
        Ok(fd) => {
            obj.got_eof = false;
            obj.fd = Some(fd);
            if let ObjectKind::Unixsock(state) = &mut obj.kind {
                state.conn = ConnState::Up;
                state.timer = Some(wheel.arm_in(
                    Duration::from_secs(MIN_CONNECT_SECS),
                    TimerEvent::ResetBackoff(id),
                ));
            }
            info!(console = %name, dev = %dev, "console connected");
            let msg = info_msg(&format!(
                "Console [{name}] connected to \"{dev}\" at {}",
                timefmt::short_time()
            ));
            reg.notify_console(id, &msg);
        }
        Err(reason) => {
            debug!(console = %name, dev = %dev, error = %reason, "connect failed");
            disconnect(reg, wheel, id);
        }
    }
}

fn try_connect(name: &str, dev: &str) -> Result<OwnedFd, String> {
    if dev.len() > max_dev_strlen() {
        return Err(format!(
            "device path exceeds {}-byte maximum",
            max_dev_strlen()
        ));
    }
    let meta = std::fs::metadata(dev).map_err(|e| format!("cannot stat device: {e}"))?;
    use std::os::unix::fs::FileTypeExt;
    if !meta.file_type().is_socket() {
        warn!(console = name, dev, "device is not a socket");
        return Err(String::from("device is not a socket"));
    }
    let stream = UnixStream::connect(dev).map_err(|e| format!("cannot connect: {e}"))?;
    stream
        .set_nonblocking(true)
        .map_err(|e| format!("cannot set non-blocking: {e}"))?;
    let _ = fdio::set_cloexec(stream.as_raw_fd());
    Ok(stream.into())
}

/// Closes the connection (if any) and arms the reconnect timer.
pub fn disconnect(reg: &mut Registry, wheel: &mut TimerWheel, id: ObjectId) {
    let Some(obj) = reg.get_mut(id) else { return };
    let had_fd = obj.fd.take().is_some();
    if had_fd {
        obj.buf().clear();
    }
    let name = obj.name.clone();
    let ObjectKind::Unixsock(state) = &mut obj.kind else {
        return;
    };
    if let Some(timer) = state.timer.take() {
        wheel.cancel(timer);
    }
    let was_up = state.conn == ConnState::Up;
    state.conn = ConnState::Down;
    let dev = state.dev.clone();
    let delay = state.backoff.advance();
    state.timer = Some(wheel.arm_in(delay, TimerEvent::Reconnect(id)));

    if was_up {
        info!(console = %name, dev = %dev, "console disconnected");
        let msg = info_msg(&format!(
            "Console [{name}] disconnected from \"{dev}\" at {}",
            timefmt::short_time()
        ));
        reg.notify_console(id, &msg);
    }
}
