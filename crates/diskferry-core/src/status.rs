//! The progress record persisted to the status file.
//!
//! A [`StatusRecord`] lives for the entire daemon process. The progress
//! parser and the supervisor mutate it; the status writer serializes it to a
//! self-describing JSON document the orchestrator polls.
//!
//! # Invariants
//!
//! - `mtime >= ctime` whenever `mtime` is set.
//! - `exit_status == 0` if and only if `error_message` is empty.
//! - `recent_output` keeps at most [`RECENT_OUTPUT_LIMIT`] lines, dropping
//!   the oldest first.
//! - `connected` transitions false to true at most once and never back.
//! - `progress_percent` is set only when an expected size is known and stays
//!   within `[0, 100]`.

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;

/// Upper bound on the lines retained in `recent_output`.
pub const RECENT_OUTPUT_LIMIT: usize = 20;

/// Error returned when an out-of-range listen port is reported.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("invalid listen port {0}")]
pub struct InvalidListenPort(pub u32);

/// Progress record for one transfer run.
#[derive(Clone, Debug, Serialize)]
pub struct StatusRecord {
    ctime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtime: Option<i64>,
    recent_output: VecDeque<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    listen_port: Option<u16>,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress_mbytes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress_throughput: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress_eta: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_status: Option<i32>,
    error_message: String,
}

impl StatusRecord {
    /// Creates a fresh record stamped with its creation time (unix seconds).
    #[must_use]
    pub fn new(now_unix: i64) -> Self {
        Self {
            ctime: now_unix,
            mtime: None,
            recent_output: VecDeque::with_capacity(RECENT_OUTPUT_LIMIT),
            listen_port: None,
            connected: false,
            progress_mbytes: None,
            progress_throughput: None,
            progress_percent: None,
            progress_eta: None,
            exit_status: None,
            error_message: String::new(),
        }
    }

    /// Creation time, unix seconds.
    #[must_use]
    pub const fn ctime(&self) -> i64 {
        self.ctime
    }

    /// Last flush time, unix seconds; `None` before the first flush.
    #[must_use]
    pub const fn mtime(&self) -> Option<i64> {
        self.mtime
    }

    /// Stamps the record as flushed at `now_unix`.
    ///
    /// The modification time never goes below the creation time even when
    /// the wall clock jumps backwards.
    pub fn touch(&mut self, now_unix: i64) {
        self.mtime = Some(now_unix.max(self.ctime));
    }

    /// Appends a human-readable line, dropping the oldest beyond the limit.
    pub fn add_line(&mut self, line: &str) {
        self.recent_output.push_back(line.to_owned());
        while self.recent_output.len() > RECENT_OUTPUT_LIMIT {
            self.recent_output.pop_front();
        }
    }

    /// The retained output lines, oldest first.
    #[must_use]
    pub const fn recent_output(&self) -> &VecDeque<String> {
        &self.recent_output
    }

    /// Records the TCP port the child advertises in import mode.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidListenPort`] for port 0.
    pub fn set_listen_port(&mut self, port: u16) -> Result<(), InvalidListenPort> {
        if port == 0 {
            return Err(InvalidListenPort(0));
        }
        self.listen_port = Some(port);
        Ok(())
    }

    /// The advertised listen port, if any.
    #[must_use]
    pub const fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    /// Marks the transfer connection as established. Monotone.
    pub fn set_connected(&mut self) {
        self.connected = true;
    }

    /// Whether the transfer connection has been established.
    #[must_use]
    pub const fn connected(&self) -> bool {
        self.connected
    }

    /// Updates the derived progress fields.
    ///
    /// `percent` is clamped into `[0, 100]`; callers pass `None` for percent
    /// and ETA while the expected size is unknown.
    pub fn set_progress(
        &mut self,
        mbytes: f64,
        throughput: Option<f64>,
        percent: Option<f64>,
        eta: Option<u64>,
    ) {
        self.progress_mbytes = Some(mbytes);
        self.progress_throughput = throughput;
        self.progress_percent = percent.map(|value| value.clamp(0.0, 100.0));
        self.progress_eta = eta;
    }

    /// Transferred mebibytes so far, if any status line has been seen.
    #[must_use]
    pub const fn progress_mbytes(&self) -> Option<f64> {
        self.progress_mbytes
    }

    /// Windowed throughput in MiB/s.
    #[must_use]
    pub const fn progress_throughput(&self) -> Option<f64> {
        self.progress_throughput
    }

    /// Transfer completion percentage, when the expected size is known.
    #[must_use]
    pub const fn progress_percent(&self) -> Option<f64> {
        self.progress_percent
    }

    /// Estimated seconds to completion, when the expected size is known.
    #[must_use]
    pub const fn progress_eta(&self) -> Option<u64> {
        self.progress_eta
    }

    /// Records the final exit status; negative values encode `-signum`.
    ///
    /// The error message is kept coherent with the status: it is cleared for
    /// status 0, and a generic description is substituted when a non-zero
    /// status arrives without one.
    pub fn set_exit_status(&mut self, exit_status: i32, error_message: impl Into<String>) {
        self.exit_status = Some(exit_status);
        if exit_status == 0 {
            self.error_message.clear();
            return;
        }
        let message = error_message.into();
        self.error_message = if message.is_empty() {
            default_exit_message(exit_status)
        } else {
            message
        };
    }

    /// The recorded exit status, if the run has concluded.
    #[must_use]
    pub const fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// The recorded error message; empty exactly when the run succeeded.
    #[must_use]
    pub fn error_message(&self) -> &str {
        &self.error_message
    }
}

fn default_exit_message(exit_status: i32) -> String {
    if exit_status < 0 {
        format!("Exited due to signal {}", -exit_status)
    } else {
        format!("Exited with status {exit_status}")
    }
}
