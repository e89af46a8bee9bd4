//! Signal bridge between the kernel and the event loop.
//!
//! # Safety
//!
//! This module uses unsafe code to install Unix signal handlers via libc.
//! The handlers are async-signal-safe: they store two atomics, write one
//! byte to a pre-registered pipe and forward the signal with `kill(2)`.
#![allow(unsafe_code)]
//!
//! The supervisor must react promptly to SIGINT and SIGTERM without doing
//! any real work inside a handler context. The classic self-pipe trick makes
//! signals look like I/O: the handler writes a byte into a pipe whose read
//! end is registered in the event loop, so `poll` wakes immediately and all
//! policy runs on the supervising flow.
//!
//! The handler also forwards the signal to the child process group straight
//! away; the event loop only has to arm the exit linger afterwards. Because
//! of that forwarding, the bridge must be installed **after** the child and
//! its process group exist.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use rustix::io::Errno;
use rustix::pipe::{pipe_with, PipeFlags};

/// Set once a handled signal has been observed; cleared by the event loop.
static BRIDGE_CALLED: AtomicBool = AtomicBool::new(false);

/// Last handled signal number; 0 means none.
static BRIDGE_SIGNUM: AtomicI32 = AtomicI32::new(0);

/// Write end of the self-pipe; -1 while no bridge is installed.
static WAKEUP_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Process group the handler forwards signals to; 0 disables forwarding.
static FORWARD_PGID: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_termination(signum: libc::c_int) {
    BRIDGE_SIGNUM.store(signum, Ordering::SeqCst);
    BRIDGE_CALLED.store(true, Ordering::SeqCst);
    let fd = WAKEUP_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [1u8];
        // A full pipe only means a wakeup is already pending.
        let _ = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
    }
    let pgid = FORWARD_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        let _ = unsafe { libc::kill(-pgid, signum) };
    }
}

/// Installed handlers for the user-initiated termination signals.
///
/// Dropping the bridge restores the previous signal dispositions.
#[derive(Debug)]
pub struct SignalBridge {
    wake_read: OwnedFd,
    // Keeps the write end alive; the handler uses the published raw fd.
    _wake_write: OwnedFd,
    previous_int: libc::sigaction,
    previous_term: libc::sigaction,
}

impl SignalBridge {
    /// Installs handlers for SIGINT and SIGTERM, forwarding to `child_pgid`.
    ///
    /// Call this only after the child process group exists; signals arriving
    /// before installation keep their default disposition.
    ///
    /// # Errors
    ///
    /// Returns an error when the self-pipe cannot be created or a handler
    /// cannot be installed.
    pub fn install(child_pgid: i32) -> io::Result<Self> {
        let (wake_read, wake_write) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)?;

        BRIDGE_CALLED.store(false, Ordering::SeqCst);
        BRIDGE_SIGNUM.store(0, Ordering::SeqCst);
        WAKEUP_WRITE_FD.store(wake_write.as_raw_fd(), Ordering::SeqCst);
        FORWARD_PGID.store(child_pgid, Ordering::SeqCst);

        let previous_int = install_handler(libc::SIGINT)?;
        let previous_term = install_handler(libc::SIGTERM)?;

        Ok(Self {
            wake_read,
            _wake_write: wake_write,
            previous_int,
            previous_term,
        })
    }

    /// The wakeup descriptor to register for read readiness.
    #[must_use]
    pub fn fileno(&self) -> BorrowedFd<'_> {
        self.wake_read.as_fd()
    }

    /// Whether a handled signal has been observed since the last clear.
    #[must_use]
    pub fn called(&self) -> bool {
        BRIDGE_CALLED.load(Ordering::SeqCst)
    }

    /// The last handled signal number, if any.
    #[must_use]
    pub fn signum(&self) -> Option<i32> {
        match BRIDGE_SIGNUM.load(Ordering::SeqCst) {
            0 => None,
            signum => Some(signum),
        }
    }

    /// Drains the wakeup pipe and resets the called flag.
    ///
    /// The recorded signal number is kept: a later observer may still want
    /// to know which signal triggered the shutdown.
    pub fn clear(&self) {
        let mut buffer = [0u8; 64];
        loop {
            match rustix::io::read(&self.wake_read, &mut buffer) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::INTR) => continue,
                Err(_) => break,
            }
        }
        BRIDGE_CALLED.store(false, Ordering::SeqCst);
    }

    /// Restores the previous signal dispositions.
    ///
    /// Also invoked from `Drop`; calling it twice is harmless.
    pub fn reset(&self) {
        unsafe {
            let _ = libc::sigaction(libc::SIGINT, &self.previous_int, std::ptr::null_mut());
            let _ = libc::sigaction(libc::SIGTERM, &self.previous_term, std::ptr::null_mut());
        }
        WAKEUP_WRITE_FD.store(-1, Ordering::SeqCst);
        FORWARD_PGID.store(0, Ordering::SeqCst);
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.reset();
    }
}

fn install_handler(signum: libc::c_int) -> io::Result<libc::sigaction> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_termination as libc::sighandler_t;
        // Restart interrupted syscalls; poll is never restarted, and the
        // self-pipe wakes it regardless.
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        let mut previous: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signum, &action, &mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(previous)
    }
}

/// The bridge publishes process-global state; tests that install one must
/// hold this lock, including tests in other modules of this crate.
#[cfg(test)]
pub(crate) static TEST_BRIDGE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
