//! Daemon diagnostics: a `tracing` subscriber over a reopenable sink.
//!
//! Before daemonisation the sink is stderr; after it, the configured
//! daemon log file.  The sink handle is shared with the reactor's
//! reconfigure hook so SIGHUP closes and reopens the file in place
//! (log rotation without restarting).  Writes that race a failed
//! reopen fall back to stderr rather than disappearing.

use fs2::FileExt;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::fmt::MakeWriter;

enum Target {
    Stderr,
    File {
        path: PathBuf,
        file: Option<File>,
    },
}

/// Shared, reopenable log destination.
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<Target>>,
}

impl LogSink {
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stderr)),
        }
    }

    /// Switches the sink to an append-only, write-locked, close-on-exec
    /// file.
    pub fn open_file(&self, path: PathBuf, truncate: bool) -> io::Result<()> {
        let file = open_log_file(&path, truncate)?;
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        *target = Target::File {
            path,
            file: Some(file),
        };
        Ok(())
    }

    /// Closes and reopens the file (SIGHUP rotation).  A no-op for the
    /// stderr sink.
    pub fn reopen(&self) {
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        if let Target::File { path, file } = &mut *target {
            *file = None;
            match open_log_file(path, false) {
                Ok(reopened) => *file = Some(reopened),
                Err(err) => {
                    let _ = writeln!(
                        io::stderr(),
                        "cmuxd: unable to reopen log \"{}\": {err}",
                        path.display()
                    );
                }
            }
        }
    }
}

fn open_log_file(path: &std::path::Path, truncate: bool) -> io::Result<File> {
    let mut flags = libc::O_APPEND;
    if truncate {
        flags |= libc::O_TRUNC;
    }
    use std::os::unix::fs::OpenOptionsExt;
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .custom_flags(flags)
        .mode(0o644)
        .open(path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "log file is locked by another process",
        ));
    }
    cmux_core::fdio::set_cloexec(file.as_raw_fd())?;
    Ok(file)
}

pub struct LogWriter {
    target: Arc<Mutex<Target>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *target {
            Target::File {
                file: Some(file), ..
            } => file.write(buf),
            Target::File { file: None, .. } | Target::Stderr => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *target {
            Target::File {
                file: Some(file), ..
            } => file.flush(),
            _ => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            target: Arc::clone(&self.target),
        }
    }
}

/// Installs the global subscriber.  `verbose` lowers the floor to
/// debug; `RUST_LOG` refines it further.
pub fn init(sink: &LogSink, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink.clone())
        .with_ansi(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_appends_across_reopen() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("daemon.log");
        let sink = LogSink::stderr();
        sink.open_file(path.clone(), false).expect("open");
        let mut writer = sink.make_writer();
        writer.write_all(b"first\n").expect("write");
        sink.reopen();
        let mut writer = sink.make_writer();
        writer.write_all(b"second\n").expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text, "first\nsecond\n");
    }

    #[test]
    fn truncating_open_discards_old_contents() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("daemon.log");
        std::fs::write(&path, "stale\n").expect("seed");
        let sink = LogSink::stderr();
        sink.open_file(path.clone(), true).expect("open");
        let mut writer = sink.make_writer();
        writer.write_all(b"fresh\n").expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text, "fresh\n");
    }
}
