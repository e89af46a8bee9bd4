//! One-shot availability check for the compression helper.
//!
//! A transfer that fails halfway through because `gzip` is missing wastes
//! minutes of copying; probing `NAME -h` up front turns that into an
//! immediate, clearly-reported failure. A probe that hangs is reported
//! separately from one that fails: a helper that wedges on `-h` will also
//! wedge mid-pipeline, which is worth calling out.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use diskferry_core::config::CompressMethod;
use diskferry_core::error::TransferError;

/// Deadline for the `NAME -h` probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Verifies that the selected compression helper is runnable.
///
/// `CompressMethod::None` always passes. For anything else the helper's
/// binary is invoked as `NAME -h` with all stdio disconnected; it must exit
/// 0 within [`PROBE_TIMEOUT`].
///
/// # Errors
///
/// [`TransferError::ToolUnavailable`] when the helper cannot be started or
/// exits non-zero; [`TransferError::ToolProbeTimeout`] when the probe
/// itself hangs.
pub fn verify_compressor(method: CompressMethod) -> Result<(), TransferError> {
    let Some(program) = method.program() else {
        return Ok(());
    };
    verify_program(program, method.name())
}

/// Probes an arbitrary helper binary; factored out for the test suites.
pub fn verify_program(program: &str, method_name: &'static str) -> Result<(), TransferError> {
    debug!(program, "probing compression helper");
    let mut child = Command::new(program)
        .arg("-h")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|error| TransferError::ToolUnavailable {
            method: method_name,
            reason: error.to_string(),
        })?;

    let deadline = Instant::now() + PROBE_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                info!(program, "compression helper verified");
                return Ok(());
            }
            Ok(Some(status)) => {
                return Err(TransferError::ToolUnavailable {
                    method: method_name,
                    reason: status.to_string(),
                });
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TransferError::ToolProbeTimeout {
                        method: method_name,
                        timeout_secs: PROBE_TIMEOUT.as_secs(),
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TransferError::ToolUnavailable {
                    method: method_name,
                    reason: error.to_string(),
                });
            }
        }
    }
}
