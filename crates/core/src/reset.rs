//! Operator reset-command dispatch.
//!
//! When a client flags a console for reset, the reactor's post-step
//! expands the configured command template (the config escape character
//! becomes the console name) and runs it under `/bin/sh -c` in its own
//! process group with stdio detached.  A timer kills the whole group
//! if the command outlives its limit.

use std::process::{Command, Stdio};
use tracing::warn;

/// Longest expanded reset command accepted.
const RESET_CMD_MAX: usize = crate::MAX_LINE;

/// Substitutes `escape` in `template` with `name`, refusing results
/// longer than the bound (a truncated command must not run).
#[must_use]
pub fn expand_template(template: &str, escape: char, name: &str) -> Option<String> {
    let mut out = String::with_capacity(template.len() + name.len());
    for c in template.chars() {
        if c == escape {
            out.push_str(name);
        } else {
            out.push(c);
        }
        if out.len() > RESET_CMD_MAX {
            return None;
        }
    }
    Some(out)
}

/// Spawns the expanded reset command.  Returns the child pid (which is
/// also its process-group id) for the kill timer.
pub fn spawn(console_name: &str, template: &str, escape: char) -> Option<i32> {
    let Some(cmd) = expand_template(template, escape, console_name) else {
        warn!(
            console = console_name,
            "unable to reset console: command too long"
        );
        return None;
    };
    let spawned = {
        use std::os::unix::process::CommandExt;
        Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // A fresh process group before exec, so the kill timer can
            // take out the whole subtree without racing the shell.
            .process_group(0)
            .spawn()
    };
    match spawned {
        Ok(child) => Some(child.id() as i32),
        Err(err) => {
            warn!(console = console_name, error = %err, "unable to reset console");
            None
        }
    }
}

/// Kills the reset command's process group if it is still running.
pub fn kill_if_running(pgid: i32) {
    #[allow(unsafe_code)]
    unsafe {
        if libc::kill(pgid, 0) < 0 {
            return; // already gone
        }
        if libc::kill(-pgid, libc::SIGKILL) == 0 {
            warn!(
                pid = pgid,
                limit = crate::RESET_CMD_TIMEOUT_SECS,
                "reset command exceeded time limit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion_substitutes_every_escape() {
        assert_eq!(
            expand_template("powerman -r &", '&', "web1"),
            Some(String::from("powerman -r web1"))
        );
        assert_eq!(
            expand_template("echo & && reboot &", '&', "c"),
            Some(String::from("echo c cc reboot c"))
        );
        assert_eq!(
            expand_template("no escape here", '&', "c"),
            Some(String::from("no escape here"))
        );
    }

    #[test]
    fn oversized_expansions_are_refused() {
        let name = "x".repeat(RESET_CMD_MAX);
        assert_eq!(expand_template("reset &", '&', &name), None);
    }

    #[test]
    fn spawn_runs_the_command_in_its_own_group() {
        let pid = spawn("c0", "exec sleep 30 # &", '&').expect("spawn");
        #[allow(unsafe_code)]
        let pgid = unsafe { libc::getpgid(pid) };
        assert_eq!(pgid, pid);
        kill_if_running(pid);
        #[allow(unsafe_code)]
        unsafe {
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        }
    }

    #[test]
    fn kill_of_a_dead_pid_is_a_no_op() {
        let pid = spawn("c0", "true", '&').expect("spawn");
        #[allow(unsafe_code)]
        unsafe {
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        }
        kill_if_running(pid);
    }
}
