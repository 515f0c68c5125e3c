//! Daemonisation, pidfile, config-file locking, and signal plumbing.
//!
//! Daemonisation is the double-fork+setsid idiom with a sync pipe: the
//! parent blocks on the pipe until the grandchild finishes startup, so
//! every diagnostic written to stderr during configuration reaches the
//! invoking shell before it gets its prompt back.
//!
//! The configuration file carries an advisory fcntl write-lock for the
//! daemon's lifetime.  That gives single-instance enforcement for free
//! and lets `-k`/`-r` discover the running daemon's pid via `F_GETLK`.

use cmux_core::poll::Waker;
use cmux_core::reactor::SignalFlags;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

/// Write end of the parent sync pipe, held until startup completes.
pub struct SyncPipe {
    tx: OwnedFd,
}

/// First half of daemonisation: fork twice, detach from the session,
/// and return in the grandchild with the sync pipe open.  The parent
/// and intermediate child exit on their own paths.
pub fn begin() -> io::Result<SyncPipe> {
    #[allow(unsafe_code)]
    unsafe {
        libc::umask(0);

        // No core files: buffers may hold console credentials.
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &limit);

        let mut fds = [0 as RawFd; 2];
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
        let (rx, tx) = (fds[0], fds[1]);

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {
                libc::close(rx);
            }
            _ => {
                // Parent: wait for the grandchild to finish startup.
                libc::close(tx);
                let mut pipe = File::from_raw_fd(rx);
                let mut byte = [0u8; 1];
                let _ = pipe.read(&mut byte);
                libc::_exit(0);
            }
        }

        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        // The session leader's exit must not take us with it.
        libc::signal(libc::SIGHUP, libc::SIG_IGN);

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        Ok(SyncPipe {
            tx: OwnedFd::from_raw_fd(tx),
        })
    }
}

/// Second half: point stdio at `/dev/null`, move off any mounted
/// directory, and release the waiting parent.
pub fn finish(pipe: SyncPipe) -> io::Result<()> {
    std::env::set_current_dir("/")?;
    let dev_null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    #[allow(unsafe_code)]
    unsafe {
        for fd in 0..=2 {
            if libc::dup2(dev_null.as_raw_fd(), fd) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    drop(pipe); // closing the write end EOFs the parent
    Ok(())
}

/// Writes the daemon pid followed by LF.
pub fn write_pidfile(path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

/// Opens the configuration file and takes the fcntl write-lock that
/// marks this process as the running daemon.  Fails when another
/// instance holds it.
pub fn lock_config(path: &Path) -> io::Result<File> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mut lock = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, std::ptr::addr_of_mut!(lock)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

/// Pid of the daemon holding the configuration write-lock, if any.
pub fn lock_holder(path: &Path) -> io::Result<Option<i32>> {
    let file = File::open(path)?;
    let mut lock = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, std::ptr::addr_of_mut!(lock)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if lock.l_type == libc::F_UNLCK as libc::c_short {
        Ok(None)
    } else {
        Ok(Some(lock.l_pid))
    }
}

/// Sends `signal` to the daemon locking `config_path`.
pub fn signal_daemon(config_path: &Path, signal: i32) -> io::Result<i32> {
    let Some(pid) = lock_holder(config_path)? else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "daemon does not appear to be running",
        ));
    };
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(pid, signal) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pid)
}

struct SigState {
    flags: Arc<SignalFlags>,
    wake_fd: RawFd,
}

static SIG_STATE: OnceLock<SigState> = OnceLock::new();

extern "C" fn handle_exit(_sig: libc::c_int) {
    // Handlers only set flags; everything else happens in the loop.
    if let Some(state) = SIG_STATE.get() {
        state.flags.done.store(true, Ordering::SeqCst);
        #[allow(unsafe_code)]
        unsafe {
            libc::write(state.wake_fd, [0u8].as_ptr().cast(), 1);
        }
    }
}

extern "C" fn handle_reconfig(_sig: libc::c_int) {
    if let Some(state) = SIG_STATE.get() {
        state.flags.reconfig.store(true, Ordering::SeqCst);
        #[allow(unsafe_code)]
        unsafe {
            libc::write(state.wake_fd, [0u8].as_ptr().cast(), 1);
        }
    }
}

extern "C" fn handle_chld(_sig: libc::c_int) {
    #[allow(unsafe_code)]
    unsafe {
        while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
    }
}

fn install(sig: libc::c_int, handler: usize) -> io::Result<()> {
    #[allow(unsafe_code)]
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        if libc::sigaction(sig, &action, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Installs the daemon's signal dispositions: INT/TERM request
/// shutdown, HUP requests reconfigure, CHLD reaps, PIPE is ignored.
pub fn install_signal_handlers(flags: Arc<SignalFlags>, waker: &Waker) -> io::Result<()> {
    let _ = SIG_STATE.set(SigState {
        flags,
        wake_fd: waker.raw_fd(),
    });
    install(libc::SIGINT, handle_exit as usize)?;
    install(libc::SIGTERM, handle_exit as usize)?;
    install(libc::SIGHUP, handle_reconfig as usize)?;
    install(libc::SIGCHLD, handle_chld as usize)?;
    install(libc::SIGPIPE, libc::SIG_IGN)?;
    Ok(())
}
