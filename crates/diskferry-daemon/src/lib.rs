#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Pipeline supervisor for the diskferry transfer daemon.
//!
//! One call to [`run`] performs one transfer: it probes the compression
//! helper, opens the report pipes, spawns the helper pipeline in its own
//! process group, multiplexes the pipeline's diagnostic streams through the
//! [`event_loop`], and reaps the child. The status file always reflects the
//! true outcome: the supervising flow is wrapped by an unconditional forced
//! flush, and the child is never left running.
//!
//! The transfer payload itself never passes through this process; the
//! pipeline moves it directly between the standard descriptors and the
//! network. The supervisor only sees text: counters, notices, one PID and
//! possibly one size report.

/// Child pipeline supervision (process group lifecycle).
pub mod child;
/// Command-line front end.
pub mod cli;
/// Helper pipeline command construction.
pub mod command;
/// The descriptor-multiplexing event loop.
pub mod event_loop;
/// Textual progress parsing for the helper streams.
pub mod parser;
/// Compression helper availability probe.
pub mod probe;
/// Self-pipe signal bridge.
pub mod signals;
/// Rate-limited atomic status file persistence.
pub mod status_file;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use rustix::pipe::{pipe_with, PipeFlags};
use tracing::{debug, error, info};

use diskferry_core::config::Config;
use diskferry_core::error::TransferError;
use diskferry_core::exit_code::{ExitCode, HasExitCode};

use child::{ChildOutcome, ChildSupervisor};
use command::ChildFds;
use event_loop::{EventLoop, StreamEntry};
use parser::{ProgressParser, StreamTag};
use signals::SignalBridge;
use status_file::StatusWriter;

/// The four report pipes shared with the child pipeline.
///
/// Write ends are inherited by the child (their numbers are spliced into
/// the pipeline script); read ends feed the event loop.
#[derive(Debug)]
pub struct TransferPipes {
    copier_status: (OwnedFd, OwnedFd),
    copier_pid: (OwnedFd, OwnedFd),
    relay_stderr: (OwnedFd, OwnedFd),
    size_report: (OwnedFd, OwnedFd),
}

impl TransferPipes {
    /// Opens all four pipes, close-on-exec on both ends.
    ///
    /// The child supervisor clears the flag on exactly the write ends at
    /// exec time.
    ///
    /// # Errors
    ///
    /// Propagates `pipe2` failures.
    pub fn create() -> io::Result<Self> {
        let open = || pipe_with(PipeFlags::CLOEXEC).map_err(io::Error::from);
        Ok(Self {
            copier_status: open()?,
            copier_pid: open()?,
            relay_stderr: open()?,
            size_report: open()?,
        })
    }

    /// The descriptor numbers the command builder splices into the script.
    #[must_use]
    pub fn child_fds(&self) -> ChildFds {
        ChildFds {
            copier_status: self.copier_status.1.as_raw_fd(),
            copier_pid: self.copier_pid.1.as_raw_fd(),
            relay_stderr: self.relay_stderr.1.as_raw_fd(),
            size_report: self.size_report.1.as_raw_fd(),
        }
    }

    /// The write ends the child must inherit.
    #[must_use]
    pub fn keep_fds(&self) -> Vec<RawFd> {
        let fds = self.child_fds();
        vec![
            fds.copier_status,
            fds.copier_pid,
            fds.relay_stderr,
            fds.size_report,
        ]
    }
}

/// Runs one complete transfer under the given configuration.
///
/// Always records the outcome in the status file before returning, whatever
/// happens; the returned code is the process exit status.
pub fn run(config: &Config) -> ExitCode {
    let mut status = StatusWriter::new(config.status_path.clone());
    let result = transfer(config, &mut status);

    let code = match &result {
        Ok(outcome) if outcome.success() => ExitCode::Ok,
        Ok(_) => ExitCode::TransferFailed,
        Err(error) => error.exit_code(),
    };

    match result {
        Ok(outcome) => {
            if outcome.success() {
                info!("transfer finished");
            } else {
                error!("transfer failed: {}", outcome.message);
            }
            status.set_exit_status(outcome.exit_status, outcome.message);
        }
        Err(ref error) => {
            error!("transfer failed: {error}");
            status.set_exit_status(code.as_i32(), error.to_string());
        }
    }

    // The status file must reflect the true outcome even when the final
    // write is the thing that fails; that error can only be logged.
    if let Err(error) = status.flush(true) {
        error!("failed to write status file: {error}");
    }

    code
}

fn transfer(config: &Config, status: &mut StatusWriter) -> Result<ChildOutcome, TransferError> {
    probe::verify_compressor(config.compress)?;

    let pipes = TransferPipes::create().map_err(TransferError::Io)?;
    let command = command::build(config, &pipes.child_fds())?;
    debug!(script = %command.argv.last().map(String::as_str).unwrap_or(""), "pipeline assembled");

    supervise_pipeline(config, status, &command.argv, &command.env, pipes)
}

/// Spawns `argv` against the given pipes and supervises it to completion.
///
/// Split from [`run`] so the scenario tests can drive scripted children
/// through the identical code path.
///
/// # Errors
///
/// Any error after the spawn still force-quits and reaps the child before
/// propagating.
pub fn supervise_pipeline(
    config: &Config,
    status: &mut StatusWriter,
    argv: &[String],
    env: &[(String, String)],
    pipes: TransferPipes,
) -> Result<ChildOutcome, TransferError> {
    let keep = pipes.keep_fds();
    let mut child = ChildSupervisor::spawn(argv, env, &keep).map_err(TransferError::Spawn)?;
    info!(pid = child.pid(), "pipeline spawned");

    // Drop the child's ends now that they are inherited, preserving EOF
    // semantics on the read ends.
    let TransferPipes {
        copier_status,
        copier_pid,
        relay_stderr,
        size_report,
    } = pipes;
    let reads = [
        (copier_status.0, StreamTag::CopierStatus),
        (copier_pid.0, StreamTag::CopierPid),
        (relay_stderr.0, StreamTag::RelayStderr),
        (size_report.0, StreamTag::ExpectedSize),
    ];
    drop(copier_status.1);
    drop(copier_pid.1);
    drop(relay_stderr.1);
    drop(size_report.1);

    let result = supervise_spawned(config, status, &mut child, reads);
    if result.is_err() {
        // Never leave the pipeline running behind an error.
        let _ = child.force_quit();
    }
    result
}

fn supervise_spawned(
    config: &Config,
    status: &mut StatusWriter,
    child: &mut ChildSupervisor,
    reads: [(OwnedFd, StreamTag); 4],
) -> Result<ChildOutcome, TransferError> {
    let child_stderr = child
        .take_stderr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stderr unavailable"))?;

    // Installed only now: the handlers forward straight to the child group,
    // which must exist first.
    let signals = SignalBridge::install(child.pid())?;

    let mut parser = ProgressParser::new(config.expected_size);
    let mut entries: Vec<StreamEntry> = reads
        .into_iter()
        .map(|(fd, tag)| StreamEntry::new(fd, tag))
        .collect();
    entries.push(StreamEntry::new(
        OwnedFd::from(child_stderr),
        StreamTag::ChildStderr,
    ));

    let mut event_loop =
        EventLoop::new(entries, &signals, config.mode, config.connect_timeout)?;
    let clean = event_loop.run(&mut parser, status, child)?;

    let wait_status = if clean {
        debug!("all streams closed, waiting for the child");
        child.wait()
    } else {
        debug!("shutdown deadline reached, force-quitting the child");
        child.force_quit()
    }?;

    let outcome = ChildOutcome::from_wait(wait_status);
    info!(exit_status = outcome.exit_status, "pipeline reaped");
    Ok(outcome)
}
