//! Child pipeline supervision.
//!
//! # Safety
//!
//! The `pre_exec` hook and the parent-side process-group fixup use raw libc
//! calls; both are limited to async-signal-safe operations.
#![allow(unsafe_code)]
//!
//! The helper pipeline runs as a single child in its own process group so
//! the copier, the relay, the compressor and any shell glue can be
//! signalled, and die, together. The group is always the signal target;
//! the bare PID never is.
//!
//! Descriptor hygiene: Rust opens everything close-on-exec, so the child
//! inherits only the standard three plus the pipe ends whose `FD_CLOEXEC`
//! flag the `pre_exec` hook clears. Stdin is not connected, stdout is
//! inherited so the shell glue can print, and stderr is captured through a
//! pipe.

use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};

use rustix::io::Errno;
use rustix::process::{kill_process_group, Pid, Signal};

/// Final disposition of the child pipeline.
///
/// `exit_status` follows the status record convention: non-negative exit
/// codes as-is, termination by signal encoded as `-signum`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildOutcome {
    /// Encoded exit status.
    pub exit_status: i32,
    /// Human-readable failure description; empty on success.
    pub message: String,
}

impl ChildOutcome {
    /// Decodes a wait status into the record representation.
    #[must_use]
    pub fn from_wait(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            let message = if code == 0 {
                String::new()
            } else {
                format!("Exited with status {code}")
            };
            return Self {
                exit_status: code,
                message,
            };
        }
        if let Some(signum) = status.signal() {
            return Self {
                exit_status: -signum,
                message: format!("Exited due to signal {signum}"),
            };
        }
        Self {
            exit_status: -1,
            message: "Exited with unknown status".to_owned(),
        }
    }

    /// Whether the pipeline completed successfully.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// A spawned helper pipeline and its process group.
#[derive(Debug)]
pub struct ChildSupervisor {
    child: Child,
    pid: i32,
}

impl ChildSupervisor {
    /// Spawns `argv` in its own process group.
    ///
    /// `keep_fds` lists the descriptors the child must inherit beyond the
    /// standard three; everything else stays close-on-exec.
    ///
    /// # Errors
    ///
    /// Propagates spawn failures; a failed parent-side `setpgid` is fatal
    /// unless the child already moved itself (permission errors after exec).
    pub fn spawn(
        argv: &[String],
        env: &[(String, String)],
        keep_fds: &[RawFd],
    ) -> io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut command = Command::new(program);
        command.args(args);
        for (name, value) in env {
            command.env(name, value);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::piped());

        let keep = keep_fds.to_vec();
        unsafe {
            command.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                for &fd in &keep {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = i32::try_from(child.id())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "child pid out of range"))?;

        // Close the race between our first group-targeted kill and the
        // child's own setpgid. EACCES/EPERM mean the child already execed
        // with the group in place.
        let rc = unsafe { libc::setpgid(pid, pid) };
        if rc != 0 {
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EPERM) => {}
                _ => return Err(error),
            }
        }

        Ok(Self { child, pid })
    }

    /// The child's PID (also its process group ID).
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Takes the pipe capturing the child's stderr.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Sends `signal` to the whole child process group.
    ///
    /// A group that no longer exists is not an error.
    ///
    /// # Errors
    ///
    /// Propagates unexpected `kill(2)` failures.
    pub fn kill(&self, signal: Signal) -> io::Result<()> {
        let Some(pid) = Pid::from_raw(self.pid) else {
            return Ok(());
        };
        match kill_process_group(pid, signal) {
            Ok(()) | Err(Errno::SRCH) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Waits for the child to exit, reaping it.
    ///
    /// # Errors
    ///
    /// Propagates `waitpid` failures.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }

    /// Ensures the child is dead and reaped.
    ///
    /// If the child is still alive the whole group gets SIGKILL first. Used
    /// on every teardown path, so the supervisor can never exit with the
    /// pipeline still running.
    ///
    /// # Errors
    ///
    /// Propagates `kill(2)` and `waitpid` failures.
    pub fn force_quit(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.kill(Signal::Kill)?;
        self.child.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    #[test]
    fn clean_exit_is_status_zero() {
        let mut child = ChildSupervisor::spawn(&sh("exit 0"), &[], &[]).unwrap();
        let outcome = ChildOutcome::from_wait(child.wait().unwrap());
        assert_eq!(outcome.exit_status, 0);
        assert!(outcome.message.is_empty());
        assert!(outcome.success());
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let mut child = ChildSupervisor::spawn(&sh("exit 3"), &[], &[]).unwrap();
        let outcome = ChildOutcome::from_wait(child.wait().unwrap());
        assert_eq!(outcome.exit_status, 3);
        assert_eq!(outcome.message, "Exited with status 3");
    }

    #[test]
    fn signal_death_is_encoded_negative() {
        let mut child = ChildSupervisor::spawn(&sh("kill -KILL $$"), &[], &[]).unwrap();
        let outcome = ChildOutcome::from_wait(child.wait().unwrap());
        assert_eq!(outcome.exit_status, -(libc::SIGKILL));
        assert_eq!(
            outcome.message,
            format!("Exited due to signal {}", libc::SIGKILL)
        );
    }

    #[test]
    fn child_runs_in_its_own_process_group() {
        let mut child = ChildSupervisor::spawn(&sh("sleep 1"), &[], &[]).unwrap();
        // /proc/<pid>/stat field 5 is the process group id.
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", child.pid()))
            .expect("stat readable while the child sleeps");
        let pgrp = stat
            .split_whitespace()
            .nth(4)
            .expect("stat has a pgrp field");
        assert_eq!(pgrp, child.pid().to_string());
        let _ = child.force_quit().unwrap();
    }

    #[test]
    fn kill_targets_the_whole_group() {
        // The shell spawns a grandchild; killing the group takes out both.
        let mut child =
            ChildSupervisor::spawn(&sh("sleep 30 & wait"), &[], &[]).unwrap();
        child.kill(Signal::Term).unwrap();
        let outcome = ChildOutcome::from_wait(child.wait().unwrap());
        assert_eq!(outcome.exit_status, -(libc::SIGTERM));
    }

    #[test]
    fn kill_after_exit_is_not_an_error() {
        let mut child = ChildSupervisor::spawn(&sh("exit 0"), &[], &[]).unwrap();
        let _ = child.wait().unwrap();
        assert!(child.kill(Signal::Term).is_ok());
    }

    #[test]
    fn force_quit_reaps_a_running_child() {
        let mut child = ChildSupervisor::spawn(&sh("sleep 30"), &[], &[]).unwrap();
        let status = child.force_quit().unwrap();
        let outcome = ChildOutcome::from_wait(status);
        assert_eq!(outcome.exit_status, -(libc::SIGKILL));
    }

    #[test]
    fn force_quit_after_exit_returns_the_real_status() {
        let mut child = ChildSupervisor::spawn(&sh("exit 7"), &[], &[]).unwrap();
        // Give the shell a moment to exit, then force_quit must not KILL it.
        let _ = child.child.wait();
        let outcome = ChildOutcome::from_wait(child.force_quit().unwrap());
        assert_eq!(outcome.exit_status, 7);
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(ChildSupervisor::spawn(&[], &[], &[]).is_err());
    }

    #[test]
    fn environment_is_passed_through() {
        let mut child = ChildSupervisor::spawn(
            &sh("test \"$DISKFERRY_TEST_VAR\" = marker"),
            &[("DISKFERRY_TEST_VAR".to_owned(), "marker".to_owned())],
            &[],
        )
        .unwrap();
        let outcome = ChildOutcome::from_wait(child.wait().unwrap());
        assert_eq!(outcome.exit_status, 0);
    }
}
