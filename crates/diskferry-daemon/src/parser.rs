//! Textual progress parsing for the helper streams.
//!
//! The pipeline talks to the supervisor exclusively through text lines on a
//! handful of descriptors. This module classifies those lines and folds
//! them into the status record:
//!
//! - the copier's periodic stderr counters become throughput samples,
//! - the copier's PID line enables the stats poke ([`ProgressParser::notify_copier`]),
//! - relay stderr is mirrored into `recent_output`, with the listen-port
//!   and connection announcements pattern-matched independently on every
//!   line,
//! - a single integer on the size-report descriptor replaces the `custom`
//!   expected-size marker and unblocks percent/ETA,
//! - leftover shell glue output goes to the secondary log verbatim.
//!
//! Streams are unordered relative to each other; in particular the first
//! copier counters may arrive before the PID line, which is why the stats
//! poke retries at a 1-second cadence until the PID is known.

use std::time::Instant;

use regex::Regex;
use rustix::io::Errno;
use rustix::process::{kill_process, Pid, Signal};
use tracing::{debug, info, trace, warn};

use diskferry_core::config::ExpectedSize;
use diskferry_core::throughput::ThroughputWindow;

use crate::status_file::StatusWriter;

const MIB: f64 = 1_048_576.0;

/// Classification of the supervised source streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamTag {
    /// The bulk copier's periodic stderr counters.
    CopierStatus,
    /// The single line carrying the copier's PID.
    CopierPid,
    /// The socket relay's stderr.
    RelayStderr,
    /// The export helper's size report.
    ExpectedSize,
    /// Shell glue stderr captured from the child itself.
    ChildStderr,
}

impl StreamTag {
    /// Short name used in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CopierStatus => "copier-status",
            Self::CopierPid => "copier-pid",
            Self::RelayStderr => "relay-stderr",
            Self::ExpectedSize => "expected-size",
            Self::ChildStderr => "child-stderr",
        }
    }
}

/// Per-run parsing state for every helper stream.
#[derive(Debug)]
pub struct ProgressParser {
    copier_pid: Option<i32>,
    expected_bytes: Option<u64>,
    window: ThroughputWindow,
    copier_counter: Regex,
    relay_listening: Regex,
    relay_connected: Regex,
}

impl ProgressParser {
    /// Creates a parser; `expected` seeds the percent/ETA denominator.
    #[must_use]
    pub fn new(expected: ExpectedSize) -> Self {
        Self {
            copier_pid: None,
            expected_bytes: expected.bytes(),
            window: ThroughputWindow::new(),
            // The copier prints its running total when nudged, e.g.
            // "1048576 bytes (1.0 MB, 1.0 MiB) copied, 1.2 s, 850 kB/s".
            copier_counter: Regex::new(r"^(\d+)\s+bytes?\b.*\bcopied\b")
                .expect("static pattern"),
            // Relay notices, e.g. "listening on AF=2 0.0.0.0:33101".
            relay_listening: Regex::new(r"(?i)^listening on\s.*:(\d+)\s*$")
                .expect("static pattern"),
            relay_connected: Regex::new(r"(?i)^starting data transfer loop\b")
                .expect("static pattern"),
        }
    }

    /// The copier's PID, once its announcement line has arrived.
    #[must_use]
    pub const fn copier_pid(&self) -> Option<i32> {
        self.copier_pid
    }

    /// The effective expected byte count, if known by now.
    #[must_use]
    pub const fn expected_bytes(&self) -> Option<u64> {
        self.expected_bytes
    }

    /// Consumes one complete line from a stream.
    ///
    /// `raw` is delimiter-preserving, exactly as the line splitter emitted
    /// it.
    ///
    /// # Errors
    ///
    /// Propagates status-file write errors from the forced flushes that the
    /// listen-port and connected transitions trigger.
    pub fn handle_line(
        &mut self,
        tag: StreamTag,
        raw: &[u8],
        status: &mut StatusWriter,
    ) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\r', '\n']);
        trace!(stream = tag.as_str(), line, "stream line");
        match tag {
            StreamTag::CopierStatus => self.handle_copier_status(line, status),
            StreamTag::CopierPid => {
                self.handle_copier_pid(line);
                Ok(())
            }
            StreamTag::RelayStderr => self.handle_relay_line(line, status),
            StreamTag::ExpectedSize => {
                self.handle_size_report(line);
                Ok(())
            }
            StreamTag::ChildStderr => {
                info!(target: "diskferry::child", "{line}");
                Ok(())
            }
        }
    }

    fn handle_copier_status(
        &mut self,
        line: &str,
        status: &mut StatusWriter,
    ) -> std::io::Result<()> {
        let Some(captures) = self.copier_counter.captures(line) else {
            // The copier also prints record counts and summaries; only the
            // byte counter is interesting.
            debug!(line, "ignoring copier output");
            return Ok(());
        };
        let Ok(bytes) = captures[1].parse::<u64>() else {
            warn!(line, "copier byte counter out of range");
            return Ok(());
        };
        self.record_copier_bytes(Instant::now(), bytes, status);
        Ok(())
    }

    /// Folds one byte-counter sample into the window and the record.
    ///
    /// Split out from the pattern match so tests can drive the clock.
    fn record_copier_bytes(&mut self, at: Instant, bytes: u64, status: &mut StatusWriter) {
        self.window.record(at, bytes);
        let mbytes = bytes as f64 / MIB;
        let throughput = self.window.rate().map(|rate| rate / MIB);
        let (percent, eta) = match self.expected_bytes {
            Some(expected) if expected > 0 => {
                let percent = (bytes as f64 / expected as f64) * 100.0;
                (Some(percent.min(100.0)), self.window.eta(expected))
            }
            _ => (None, None),
        };
        status.set_progress(mbytes, throughput, percent, eta);
    }

    fn handle_copier_pid(&mut self, line: &str) {
        if self.copier_pid.is_some() {
            debug!(line, "ignoring extra copier pid line");
            return;
        }
        match line.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => {
                info!(pid, "copier pid received");
                self.copier_pid = Some(pid);
            }
            _ => warn!(line, "unparsable copier pid line"),
        }
    }

    fn handle_relay_line(&mut self, line: &str, status: &mut StatusWriter) -> std::io::Result<()> {
        status.add_line(line);

        // Both facts are matched independently; a single line may announce
        // either or both.
        if let Some(captures) = self.relay_listening.captures(line) {
            match captures[1].parse::<u16>() {
                Ok(port) if port > 0 => {
                    if status.record().listen_port() != Some(port) {
                        match status.set_listen_port(port) {
                            Ok(()) => {
                                info!(port, "relay listening");
                                status.flush(true)?;
                            }
                            Err(error) => warn!(%error, line, "rejected listen port"),
                        }
                    }
                }
                _ => warn!(line, "relay announced an unusable port"),
            }
        }

        if self.relay_connected.is_match(line) && !status.record().connected() {
            info!("relay connection established");
            status.set_connected();
            status.flush(true)?;
        }

        Ok(())
    }

    fn handle_size_report(&mut self, line: &str) {
        if self.expected_bytes.is_some() {
            debug!(line, "ignoring extra size report");
            return;
        }
        match line.trim().parse::<u64>() {
            Ok(bytes) => {
                info!(bytes, "exported size received");
                self.expected_bytes = Some(bytes);
            }
            Err(_) => warn!(line, "unparsable size report"),
        }
    }

    /// Pokes the copier so it prints fresh counters.
    ///
    /// Returns `true` iff the copier PID is known; the event loop uses the
    /// result to pick the 5-second rearm or the 1-second retry.
    pub fn notify_copier(&self) -> bool {
        let Some(raw_pid) = self.copier_pid else {
            return false;
        };
        let Some(pid) = Pid::from_raw(raw_pid) else {
            return false;
        };
        match kill_process(pid, Signal::Usr1) {
            Ok(()) => {}
            Err(Errno::SRCH) => debug!(pid = raw_pid, "copier already gone"),
            Err(error) => warn!(%error, pid = raw_pid, "failed to poke copier"),
        }
        true
    }
}
