//! Consoles backed by a locally spawned program.
//!
//! The child is spawned with stdin, stdout, and stderr wired to one end
//! of a unix socketpair; the parent end becomes the console fd.  When
//! the child exits (read returns EOF) or errors, the driver kills the
//! pid best-effort, transitions DOWN, and rearms the shared backoff.
//! The stable-connect debounce is identical to the telnet driver's.

use crate::console::{Backoff, ConnState};
use crate::object::{ObjectId, ObjectKind, Registry};
use crate::timer::{TimerEvent, TimerId, TimerWheel};
use crate::{fdio, info_msg, timefmt, MIN_CONNECT_SECS};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Variant payload for a process console object.
pub struct ProcessState {
    pub argv: Vec<String>,
    /// Basename of the program, used in messages.
    pub prog: String,
    pub logfile: Option<ObjectId>,
    pub timer: Option<TimerId>,
    pub backoff: Backoff,
    pub conn: ConnState,
    pub pid: Option<i32>,
    pub started: Option<Instant>,
}

impl ProcessState {
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        let prog = argv
            .first()
            .map(|a| {
                Path::new(a)
                    .file_name()
                    .map_or_else(|| a.clone(), |f| f.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        Self {
            argv,
            prog,
            logfile: None,
            timer: None,
            backoff: Backoff::new(),
            conn: ConnState::Down,
            pid: None,
            started: None,
        }
    }

    pub fn is_up(&self) -> bool {
        self.conn == ConnState::Up
    }
}

/// Resolves `dev` to an executable path: an explicit path is used
/// as-is (relative ones against `cwd`), a bare word is searched along
/// the colon-separated `exec_path`.  Returns `None` unless the result
/// is a regular file with execute permission.
#[must_use]
pub fn resolve_command(dev: &str, cwd: Option<&Path>, exec_path: Option<&str>) -> Option<PathBuf> {
    let candidate = if !dev.contains('/') {
        search_exec_path(exec_path?, dev)?
    } else if let Some(cwd) = cwd.filter(|_| !dev.starts_with('/')) {
        cwd.join(dev)
    } else {
        PathBuf::from(dev)
    };
    is_executable_file(&candidate).then_some(candidate)
}

fn search_exec_path(path_list: &str, prog: &str) -> Option<PathBuf> {
    for dir in path_list.split(':').filter(|d| !d.is_empty()) {
        let dir_path = Path::new(dir);
        if !dir_path.is_dir() {
            continue;
        }
        let candidate = dir_path.join(prog);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Spawns the child and brings the console UP, or arms the retry timer.
pub fn connect(reg: &mut Registry, wheel: &mut TimerWheel, id: ObjectId) {
    let Some(obj) = reg.get_mut(id) else { return };
    let name = obj.name.clone();
    let ObjectKind::Process(state) = &mut obj.kind else {
        return;
    };
    if let Some(timer) = state.timer.take() {
        wheel.cancel(timer);
    }
    if state.conn == ConnState::Up {
        return;
    }
    let argv = state.argv.clone();
    let prog = state.prog.clone();

    match spawn_child(&argv) {
        Ok((fd, pid)) => {
            obj.got_eof = false;
            obj.fd = Some(fd);
            if let ObjectKind::Process(state) = &mut obj.kind {
                state.conn = ConnState::Up;
                state.pid = Some(pid);
                state.started = Some(Instant::now());
                state.timer = Some(wheel.arm_in(
                    Duration::from_secs(MIN_CONNECT_SECS),
                    TimerEvent::ResetBackoff(id),
                ));
            }
            info!(console = %name, prog = %prog, pid, "console process spawned");
            let msg = info_msg(&format!(
                "Console [{name}] connected to \"{prog}\" (pid {pid})"
            ));
            reg.notify_console(id, &msg);
        }
        Err(reason) => {
            warn!(console = %name, prog = %prog, error = %reason, "spawn failed");
            let msg = info_msg(&format!(
                "Console [{name}] connection failed: {reason}"
            ));
            reg.notify_console(id, &msg);
            disconnect(reg, wheel, id);
        }
    }
}

fn spawn_child(argv: &[String]) -> Result<(OwnedFd, i32), String> {
    let prog = argv.first().ok_or("empty command")?;
    if !is_executable_file(Path::new(prog)) {
        return Err(format!("\"{prog}\" is not an executable regular file"));
    }
    let (parent, child) = UnixStream::pair().map_err(|e| format!("socketpair error: {e}"))?;
    parent
        .set_nonblocking(true)
        .map_err(|e| format!("fcntl error: {e}"))?;
    let _ = fdio::set_cloexec(parent.as_raw_fd());

    let stdin = child.try_clone().map_err(|e| format!("dup error: {e}"))?;
    let stdout = child.try_clone().map_err(|e| format!("dup error: {e}"))?;
    let spawned = Command::new(prog)
        .args(&argv[1..])
        .stdin(Stdio::from(OwnedFd::from(stdin)))
        .stdout(Stdio::from(OwnedFd::from(stdout)))
        .stderr(Stdio::from(OwnedFd::from(child)))
        .spawn()
        .map_err(|e| format!("exec error: {e}"))?;
    let pid = spawned.id() as i32;
    Ok((parent.into(), pid))
}

/// Kills the child (best effort), transitions DOWN, and arms the
/// reconnect timer with the next backoff delay.
pub fn disconnect(reg: &mut Registry, wheel: &mut TimerWheel, id: ObjectId) {
    let Some(obj) = reg.get_mut(id) else { return };
    if obj.fd.take().is_some() {
        obj.buf().clear();
    }
    let name = obj.name.clone();
    let ObjectKind::Process(state) = &mut obj.kind else {
        return;
    };
    if let Some(timer) = state.timer.take() {
        wheel.cancel(timer);
    }
    let was_up = state.conn == ConnState::Up;
    state.conn = ConnState::Down;
    let prog = state.prog.clone();
    let pid = state.pid.take();
    let uptime = state.started.take().map(|t| t.elapsed().as_secs());
    let delay = state.backoff.advance();
    state.timer = Some(wheel.arm_in(delay, TimerEvent::Reconnect(id)));

    if let Some(pid) = pid {
        // The child usually exited already; reap-on-SIGCHLD handles it.
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
    if was_up {
        let after = uptime.map_or_else(String::new, |s| {
            format!(" after {}", timefmt::delta_string(s))
        });
        debug!(console = %name, prog = %prog, "console process down");
        let msg = info_msg(&format!(
            "Console [{name}] disconnected from \"{prog}\" (pid {}){after}",
            pid.unwrap_or(0)
        ));
        reg.notify_console(id, &msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_accepts_absolute_executables() {
        let path = resolve_command("/bin/sh", None, None).expect("resolves");
        assert_eq!(path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn resolve_searches_the_exec_path_for_bare_words() {
        let path = resolve_command("sh", None, Some("/nonexistent:/bin:/usr/bin"))
            .expect("resolves");
        assert!(path.ends_with("sh"));
        assert!(path.is_absolute());
    }

    #[test]
    fn resolve_rejects_non_executables_and_directories() {
        assert!(resolve_command("/etc/hostname", None, None).is_none());
        assert!(resolve_command("/etc", None, None).is_none());
        assert!(resolve_command("no-such-prog", None, Some("/bin")).is_none());
    }

    #[test]
    fn resolve_joins_relative_paths_against_cwd() {
        let path = resolve_command("./sh", Some(Path::new("/bin")), None).expect("resolves");
        assert_eq!(path, PathBuf::from("/bin/./sh"));
    }

    #[test]
    fn spawned_child_talks_over_the_socketpair() {
        let argv = vec![String::from("/bin/cat")];
        let (fd, pid) = spawn_child(&argv).expect("spawn");
        assert!(pid > 0);
        crate::fdio::write(fd.as_raw_fd(), b"echo\n").expect("write to cat");
        // cat echoes the line back through the same socketpair.
        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..100 {
            match crate::fdio::read(fd.as_raw_fd(), &mut buf) {
                Ok(n) => {
                    got = n;
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => panic!("read failed: {err}"),
            }
        }
        assert_eq!(&buf[..got], b"echo\n");
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(pid, libc::SIGKILL);
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        }
    }

    #[test]
    fn spawn_of_a_missing_program_fails() {
        let argv = vec![String::from("/no/such/prog")];
        assert!(spawn_child(&argv).is_err());
    }
}
