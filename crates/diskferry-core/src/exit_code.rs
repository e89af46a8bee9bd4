//! Centralized exit code definitions for the daemon binaries.
//!
//! The orchestrator only distinguishes three outcomes: the transfer
//! succeeded, the transfer failed, or the helper pipeline could not even be
//! started. All error types across the workspace map onto these codes via
//! [`HasExitCode`] so the process exit status stays consistent no matter
//! where a failure originates.

use std::fmt;

/// Exit codes returned by the transfer daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful completion: the child pipeline exited 0.
    Ok = 0,

    /// The transfer failed.
    ///
    /// Covers configuration errors, probe failures, supervision timeouts and
    /// abnormal child exits. The status file carries the detailed reason.
    TransferFailed = 1,

    /// The child command could not be run at all.
    ///
    /// Mirrors the shell convention for "command not found".
    CommandNotFound = 127,
}

impl ExitCode {
    /// Returns the numeric exit code value.
    ///
    /// # Examples
    ///
    /// ```
    /// use diskferry_core::exit_code::ExitCode;
    ///
    /// assert_eq!(ExitCode::Ok.as_i32(), 0);
    /// assert_eq!(ExitCode::TransferFailed.as_i32(), 1);
    /// ```
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns a human-readable description of this exit code.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::TransferFailed => "transfer failed",
            Self::CommandNotFound => "transfer command not found",
        }
    }

    /// Returns `true` if this represents a successful exit.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Creates an exit code from an i32 value.
    ///
    /// Returns `None` if the value doesn't correspond to a known exit code.
    #[must_use]
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::TransferFailed),
            127 => Some(Self::CommandNotFound),
            _ => None,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.as_i32()
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        // Clamp to u8 range for std::process::ExitCode
        let value = code.as_i32().clamp(0, 255) as u8;
        Self::from(value)
    }
}

/// Trait for types that have an associated exit code.
///
/// Implement this for error types so the binary can derive its process exit
/// status from whatever error unwinds to the top.
pub trait HasExitCode {
    /// Returns the exit code associated with this value.
    fn exit_code(&self) -> ExitCode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_are_stable() {
        assert_eq!(ExitCode::Ok.as_i32(), 0);
        assert_eq!(ExitCode::TransferFailed.as_i32(), 1);
        assert_eq!(ExitCode::CommandNotFound.as_i32(), 127);
    }

    #[test]
    fn from_i32_roundtrips() {
        for code in [
            ExitCode::Ok,
            ExitCode::TransferFailed,
            ExitCode::CommandNotFound,
        ] {
            assert_eq!(ExitCode::from_i32(code.as_i32()), Some(code));
        }
    }

    #[test]
    fn from_i32_returns_none_for_unknown() {
        assert_eq!(ExitCode::from_i32(-1), None);
        assert_eq!(ExitCode::from_i32(2), None);
        assert_eq!(ExitCode::from_i32(255), None);
    }

    #[test]
    fn is_success_only_for_ok() {
        assert!(ExitCode::Ok.is_success());
        assert!(!ExitCode::TransferFailed.is_success());
        assert!(!ExitCode::CommandNotFound.is_success());
    }

    #[test]
    fn display_shows_description() {
        assert_eq!(format!("{}", ExitCode::Ok), "success");
        assert_eq!(format!("{}", ExitCode::TransferFailed), "transfer failed");
    }

    #[test]
    fn into_process_exit_code() {
        let code: std::process::ExitCode = ExitCode::TransferFailed.into();
        let _ = code;
    }
}
