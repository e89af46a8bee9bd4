//! The descriptor-multiplexing heart of the supervisor.
//!
//! A single level-triggered `poll(2)` loop owns every parent-side read
//! descriptor plus the signal bridge's wakeup pipe. Besides shuttling bytes
//! into the progress parser it drives three timers:
//!
//! - the **listen deadline** (import mode): if no connection is observed in
//!   time, the child group gets SIGTERM and the exit linger starts;
//! - the **exit deadline**: once the child has been told to die, it gets
//!   [`CHILD_LINGER`] to drain and exit before the loop gives up;
//! - the **stats deadline**: the copier is poked for fresh counters every
//!   [`STATS_INTERVAL`], or every [`STATS_RETRY`] while its PID is still
//!   unknown, so the first progress sample appears within a second of the
//!   copier starting.
//!
//! Reads are capped at [`READ_CHUNK`] bytes so no single stream can starve
//! the others. A signal-interrupted `poll` is treated as an empty ready
//! set; only the wakeup descriptor constitutes a wake condition.
//!
//! The loop terminates as soon as every data descriptor has hit end of
//! file; that means the child is done or dying, not necessarily reaped.
//! The caller always follows up with a `wait` or a force-quit.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};
use rustix::io::Errno;
use rustix::process::Signal;
use tracing::{debug, info, warn};

use diskferry_core::config::Mode;
use diskferry_core::linebuf::LineSplitter;

use crate::child::ChildSupervisor;
use crate::parser::{ProgressParser, StreamTag};
use crate::signals::SignalBridge;
use crate::status_file::StatusWriter;

/// Grace period between telling the child to die and giving up on it.
pub const CHILD_LINGER: Duration = Duration::from_secs(5);

/// Poke interval for copier statistics once its PID is known.
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Poke retry interval while the copier PID is still unknown.
pub const STATS_RETRY: Duration = Duration::from_secs(1);

/// Re-check interval while waiting for the connection announcement.
const LISTEN_RECHECK: Duration = Duration::from_secs(1);

/// Per-read byte cap.
pub const READ_CHUNK: usize = 1024;

/// One supervised source descriptor with its line reassembly state.
#[derive(Debug)]
pub struct StreamEntry {
    fd: OwnedFd,
    tag: StreamTag,
    splitter: LineSplitter,
}

impl StreamEntry {
    /// Wraps a read descriptor for the given stream.
    #[must_use]
    pub fn new(fd: OwnedFd, tag: StreamTag) -> Self {
        Self {
            fd,
            tag,
            splitter: LineSplitter::new(),
        }
    }
}

/// The supervisor's poll loop and its timer state.
#[derive(Debug)]
pub struct EventLoop<'bridge> {
    entries: Vec<StreamEntry>,
    signals: &'bridge SignalBridge,
    connect_timeout: Option<Duration>,
    listen_deadline: Option<Instant>,
    exit_deadline: Option<Instant>,
    stats_deadline: Instant,
}

impl<'bridge> EventLoop<'bridge> {
    /// Prepares the loop: all descriptors become non-blocking, the listen
    /// deadline is armed for import mode, the first stats poke is due
    /// immediately.
    ///
    /// # Errors
    ///
    /// Propagates `fcntl` failures.
    pub fn new(
        entries: Vec<StreamEntry>,
        signals: &'bridge SignalBridge,
        mode: Mode,
        connect_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        for entry in &entries {
            set_nonblocking(entry.fd.as_fd())?;
        }
        set_nonblocking(signals.fileno())?;

        let now = Instant::now();
        let listen_deadline = match (mode, connect_timeout) {
            (Mode::Import, Some(timeout)) => Some(now + timeout),
            _ => None,
        };

        Ok(Self {
            entries,
            signals,
            connect_timeout,
            listen_deadline,
            exit_deadline: None,
            stats_deadline: now,
        })
    }

    /// Runs the loop until every data descriptor has hit end of file or the
    /// exit deadline expires.
    ///
    /// Returns `true` iff the child closed all its descriptors without the
    /// exit deadline ever being armed; on `true` the caller should `wait`,
    /// on `false` it must force-quit.
    ///
    /// # Errors
    ///
    /// Propagates poll, read, kill and status-file errors.
    pub fn run(
        &mut self,
        parser: &mut ProgressParser,
        status: &mut StatusWriter,
        child: &ChildSupervisor,
    ) -> io::Result<bool> {
        let clean = loop {
            // All child streams EOF'd: the child is done or dying.
            if self.entries.is_empty() {
                break self.exit_deadline.is_none();
            }

            let now = Instant::now();
            let mut timeout: Option<Duration> = None;

            if self.exit_deadline.is_none() {
                if let Some(deadline) = self.listen_deadline {
                    if status.record().connected() {
                        debug!("connection observed, disarming listen deadline");
                        self.listen_deadline = None;
                    } else if now >= deadline {
                        self.expire_listen_deadline(now, status, child)?;
                    } else {
                        timeout = fold_timeout(timeout, LISTEN_RECHECK);
                    }
                }
            }

            if let Some(deadline) = self.exit_deadline {
                if now >= deadline {
                    warn!("child process didn't exit in time");
                    break false;
                }
                timeout = fold_timeout(timeout, deadline.saturating_duration_since(now));
            }

            if now >= self.stats_deadline {
                let interval = if parser.notify_copier() {
                    STATS_INTERVAL
                } else {
                    STATS_RETRY
                };
                self.stats_deadline = now + interval;
            }
            timeout = fold_timeout(timeout, self.stats_deadline.saturating_duration_since(now));

            let (ready, wake_ready) = {
                let mut fds: Vec<PollFd<'_>> = self
                    .entries
                    .iter()
                    .map(|entry| PollFd::new(&entry.fd, PollFlags::IN))
                    .collect();
                fds.push(PollFd::from_borrowed_fd(self.signals.fileno(), PollFlags::IN));
                match poll(&mut fds, poll_timeout_ms(timeout)) {
                    Ok(_) => {}
                    // Interrupted poll is not a wake condition; only the
                    // wakeup descriptor is.
                    Err(Errno::INTR) => continue,
                    Err(error) => return Err(error.into()),
                }
                let wake = fds
                    .pop()
                    .map(|fd| fd.revents())
                    .unwrap_or_else(PollFlags::empty);
                let ready: Vec<PollFlags> = fds.iter().map(PollFd::revents).collect();
                (ready, wake)
            };

            self.dispatch_ready(&ready, parser, status)?;

            if wake_ready.contains(PollFlags::IN) && self.signals.called() {
                let signum = self.signals.signum().unwrap_or(0);
                self.signals.clear();
                let now = Instant::now();
                match self.exit_deadline {
                    None => {
                        // The handler already forwarded the signal to the
                        // child group; give it linger-time to die.
                        info!(signum, "signal relayed to child group, arming exit linger");
                        self.exit_deadline = Some(now + CHILD_LINGER);
                    }
                    Some(deadline) => {
                        let left = deadline.saturating_duration_since(now);
                        info!(
                            signum,
                            remaining_secs = left.as_secs_f64(),
                            "already waiting for child to exit"
                        );
                    }
                }
            }
        };

        self.flush_tails(parser, status)?;
        Ok(clean)
    }

    fn expire_listen_deadline(
        &mut self,
        now: Instant,
        status: &mut StatusWriter,
        child: &ChildSupervisor,
    ) -> io::Result<()> {
        let secs = self.connect_timeout.map_or(0, |timeout| timeout.as_secs());
        let message = format!(
            "Child process didn't establish connection in time ({secs}s), sending SIGTERM"
        );
        warn!("{message}");
        status.add_line(&message);
        status.flush(true)?;
        child.kill(Signal::Term)?;
        self.listen_deadline = None;
        self.exit_deadline = Some(now + CHILD_LINGER);
        Ok(())
    }

    fn dispatch_ready(
        &mut self,
        ready: &[PollFlags],
        parser: &mut ProgressParser,
        status: &mut StatusWriter,
    ) -> io::Result<()> {
        let mut closed = Vec::new();
        for (index, revents) in ready.iter().enumerate() {
            if revents.is_empty() {
                continue;
            }
            let entry = &mut self.entries[index];
            let mut eof = false;
            if revents.contains(PollFlags::IN) {
                let mut buffer = [0u8; READ_CHUNK];
                match rustix::io::read(&entry.fd, &mut buffer) {
                    Ok(0) => eof = true,
                    Ok(count) => {
                        for line in entry.splitter.push(&buffer[..count]) {
                            parser.handle_line(entry.tag, &line, status)?;
                        }
                    }
                    Err(Errno::INTR | Errno::AGAIN) => {}
                    Err(error) => return Err(error.into()),
                }
            } else if revents.intersects(PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL) {
                eof = true;
            }
            if eof {
                if let Some(tail) = entry.splitter.flush() {
                    parser.handle_line(entry.tag, &tail, status)?;
                }
                closed.push(index);
            }
        }
        for index in closed.into_iter().rev() {
            let entry = self.entries.remove(index);
            debug!(stream = entry.tag.as_str(), "stream closed");
        }
        Ok(())
    }

    fn flush_tails(
        &mut self,
        parser: &mut ProgressParser,
        status: &mut StatusWriter,
    ) -> io::Result<()> {
        for entry in &mut self.entries {
            if let Some(tail) = entry.splitter.flush() {
                parser.handle_line(entry.tag, &tail, status)?;
            }
        }
        Ok(())
    }
}

fn fold_timeout(current: Option<Duration>, candidate: Duration) -> Option<Duration> {
    Some(current.map_or(candidate, |timeout| timeout.min(candidate)))
}

fn poll_timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(duration) => {
            let mut millis = duration.as_millis();
            // Round up so a sub-millisecond remainder doesn't busy-poll.
            if Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX)) < duration {
                millis += 1;
            }
            i32::try_from(millis).unwrap_or(i32::MAX)
        }
    }
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = fcntl_getfl(fd)?;
    fcntl_setfl(fd, flags | OFlags::NONBLOCK)?;
    Ok(())
}
