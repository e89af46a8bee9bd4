//! Error taxonomy shared across the workspace.
//!
//! Every failure the daemon can hit before, during or after supervision is
//! a [`TransferError`]; each variant knows which process exit code it maps
//! to. The supervising flow is wrapped by an unconditional forced status
//! flush, so whatever unwinds to the top also ends up in the status file's
//! `error_message`.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::exit_code::{ExitCode, HasExitCode};

/// Failures surfaced by the transfer daemon.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Invalid command-line input, reported before any child is spawned.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The selected compression helper failed its availability probe.
    #[error("Verification attempt of selected compression method {method} failed: {reason}")]
    ToolUnavailable {
        /// The method whose probe failed.
        method: &'static str,
        /// What the probe observed.
        reason: String,
    },

    /// The availability probe itself hung.
    ///
    /// Kept distinct from [`TransferError::ToolUnavailable`]: a helper that
    /// wedges on `-h` will also wedge mid-pipeline.
    #[error(
        "Verification attempt of selected compression method {method} \
         timed out after {timeout_secs}s"
    )]
    ToolProbeTimeout {
        /// The method whose probe hung.
        method: &'static str,
        /// The probe deadline that elapsed.
        timeout_secs: u64,
    },

    /// The child pipeline could not be started.
    #[error("failed to start transfer pipeline: {0}")]
    Spawn(#[source] io::Error),

    /// Any other I/O failure in the supervising flow.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HasExitCode for TransferError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Spawn(_) => ExitCode::CommandNotFound,
            Self::Config(_)
            | Self::ToolUnavailable { .. }
            | Self::ToolProbeTimeout { .. }
            | Self::Io(_) => ExitCode::TransferFailed,
        }
    }
}
