//! Rate-limited atomic persistence of the status record.
//!
//! The orchestrator polls the status file, so two things matter: a reader
//! must never observe a torn write, and the daemon must not hammer the
//! filesystem. Writes therefore go through a temp file in the target
//! directory followed by a rename, and unforced flushes are limited to one
//! per [`FLUSH_INTERVAL_SECS`].
//!
//! The file is written world-unreadable (mode 0400): the record carries
//! relay output that may mention TLS material paths.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use diskferry_core::status::{InvalidListenPort, StatusRecord};

/// Minimum seconds between unforced status file writes.
pub const FLUSH_INTERVAL_SECS: i64 = 5;

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

/// Owns the status record and its on-disk representation.
#[derive(Debug)]
pub struct StatusWriter {
    path: PathBuf,
    record: StatusRecord,
}

impl StatusWriter {
    /// Creates a writer for `path` with a fresh record.
    ///
    /// Nothing is written until the first [`flush`](Self::flush).
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self::new_at(path, unix_now())
    }

    /// [`new`](Self::new) against an explicit clock, for tests.
    #[doc(hidden)]
    #[must_use]
    pub fn new_at(path: PathBuf, now_unix: i64) -> Self {
        Self {
            path,
            record: StatusRecord::new(now_unix),
        }
    }

    /// The record being maintained.
    #[must_use]
    pub const fn record(&self) -> &StatusRecord {
        &self.record
    }

    /// Appends a human-readable line to the record's recent output.
    pub fn add_line(&mut self, line: &str) {
        self.record.add_line(line);
    }

    /// Records the advertised listen port.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidListenPort`] for port 0.
    pub fn set_listen_port(&mut self, port: u16) -> Result<(), InvalidListenPort> {
        self.record.set_listen_port(port)
    }

    /// Marks the transfer connection as established.
    pub fn set_connected(&mut self) {
        self.record.set_connected();
    }

    /// Updates the derived progress fields.
    pub fn set_progress(
        &mut self,
        mbytes: f64,
        throughput: Option<f64>,
        percent: Option<f64>,
        eta: Option<u64>,
    ) {
        self.record.set_progress(mbytes, throughput, percent, eta);
    }

    /// Records the final exit status and error message.
    pub fn set_exit_status(&mut self, exit_status: i32, error_message: impl Into<String>) {
        self.record.set_exit_status(exit_status, error_message);
    }

    /// Persists the record, unless a write happened within the rate limit.
    ///
    /// `force` bypasses the limit; it is used for the listen-port discovery,
    /// the connected transition, connect-timeout expiry and the final exit.
    ///
    /// # Errors
    ///
    /// Propagates serialization and filesystem errors.
    pub fn flush(&mut self, force: bool) -> io::Result<()> {
        self.flush_at(unix_now(), force)
    }

    /// [`flush`](Self::flush) against an explicit clock, for tests.
    #[doc(hidden)]
    pub fn flush_at(&mut self, now_unix: i64, force: bool) -> io::Result<()> {
        if !force {
            if let Some(mtime) = self.record.mtime() {
                if now_unix.saturating_sub(mtime) < FLUSH_INTERVAL_SECS {
                    return Ok(());
                }
            }
        }
        self.record.touch(now_unix);
        self.write_atomic()
    }

    fn write_atomic(&self) -> io::Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let payload = serde_json::to_vec_pretty(&self.record)?;
        let mut staged = tempfile::Builder::new()
            .prefix(".diskferry.status.")
            .tempfile_in(parent)?;
        staged.write_all(&payload)?;
        staged.write_all(b"\n")?;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o400))?;
        staged.persist(&self.path).map_err(|error| error.error)?;
        Ok(())
    }
}
