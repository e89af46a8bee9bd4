//! Immutable run configuration and input validators.
//!
//! A [`Config`] is assembled once by the CLI front end and then passed by
//! reference through the supervisor; nothing mutates it afterwards and no
//! process-global configuration exists. Fields that only the command builder
//! understands (TLS material, bind address, remote endpoint, magic, command
//! prefix/suffix) are carried opaquely.

use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Pattern a transfer magic value must match.
const MAGIC_PATTERN: &str = "^[A-Za-z0-9_.-]+$";

/// Errors raised while validating command-line input.
///
/// All of these are reported before any child process is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The magic value contains characters outside the allowed set.
    #[error("invalid magic {value:?}: must match {MAGIC_PATTERN}")]
    InvalidMagic {
        /// The rejected value.
        value: String,
    },

    /// The remote host is neither an IP literal nor a resolvable name.
    #[error("cannot resolve host {host:?}")]
    UnresolvableHost {
        /// The rejected host.
        host: String,
    },

    /// The port is neither a decimal number nor a known service name.
    #[error("unknown service {service:?}")]
    UnknownService {
        /// The rejected port or service name.
        service: String,
    },

    /// The compression method is not part of the supported set.
    #[error("unknown compression method {name:?}")]
    UnknownCompressMethod {
        /// The rejected method name.
        name: String,
    },

    /// The expected size is neither a MiB integer nor the `custom` sentinel.
    #[error("invalid expected size {value:?}: expected a size in MiB or \"custom\"")]
    InvalidExpectedSize {
        /// The rejected value.
        value: String,
    },

    /// Export mode was requested without a remote endpoint.
    #[error("export mode requires --host and --port")]
    MissingRemote,
}

/// Transfer direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Receive a disk image: the relay listens for the remote side.
    Import,
    /// Send a disk image: the relay connects to the remote side.
    Export,
}

impl Mode {
    /// Canonical lowercase name, as accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Export => "export",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family restriction for the relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressFamily {
    /// No restriction.
    #[default]
    Any,
    /// IPv4 only (`--ipv4`).
    V4,
    /// IPv6 only (`--ipv6`).
    V6,
}

/// How much data the transfer is expected to move.
///
/// Percent and ETA reporting stay disabled until a concrete byte count is
/// known; `Custom` means the export-side helper will report the actual size
/// at runtime on the size-report descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedSize {
    /// No size information.
    Unknown,
    /// Fixed size given on the command line, in MiB.
    Mebibytes(u64),
    /// The export helper reports the size at runtime.
    Custom,
}

impl ExpectedSize {
    /// Returns the expected byte count, if one is known up front.
    ///
    /// # Examples
    ///
    /// ```
    /// use diskferry_core::config::ExpectedSize;
    ///
    /// assert_eq!(ExpectedSize::Mebibytes(2).bytes(), Some(2 << 20));
    /// assert_eq!(ExpectedSize::Custom.bytes(), None);
    /// assert_eq!(ExpectedSize::Unknown.bytes(), None);
    /// ```
    #[must_use]
    pub const fn bytes(self) -> Option<u64> {
        match self {
            Self::Mebibytes(mib) => Some(mib << 20),
            Self::Unknown | Self::Custom => None,
        }
    }
}

impl FromStr for ExpectedSize {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "custom" {
            return Ok(Self::Custom);
        }
        value
            .parse::<u64>()
            .map(Self::Mebibytes)
            .map_err(|_| ConfigError::InvalidExpectedSize {
                value: value.to_owned(),
            })
    }
}

/// Compression methods recognised by the pipeline builder.
///
/// Each non-`None` method names an external binary whose availability is
/// probed before the pipeline is spawned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressMethod {
    /// No compression stage.
    None,
    /// gzip at its default level.
    Gzip,
    /// gzip at its fastest level.
    GzipFast,
    /// gzip at its slowest, densest level.
    GzipSlow,
    /// lzop.
    Lzop,
}

impl CompressMethod {
    /// Canonical name, as accepted on the command line.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::GzipFast => "gzip-fast",
            Self::GzipSlow => "gzip-slow",
            Self::Lzop => "lzop",
        }
    }

    /// The external binary implementing this method, if any.
    #[must_use]
    pub const fn program(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip | Self::GzipFast | Self::GzipSlow => Some("gzip"),
            Self::Lzop => Some("lzop"),
        }
    }

    /// Shell fragment for the compressing pipeline stage.
    #[must_use]
    pub const fn compress_stage(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip -c"),
            Self::GzipFast => Some("gzip -1 -c"),
            Self::GzipSlow => Some("gzip -9 -c"),
            Self::Lzop => Some("lzop -c"),
        }
    }

    /// Shell fragment for the decompressing pipeline stage.
    #[must_use]
    pub const fn decompress_stage(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip | Self::GzipFast | Self::GzipSlow => Some("gzip -d -c"),
            Self::Lzop => Some("lzop -d -c"),
        }
    }
}

impl FromStr for CompressMethod {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "gzip-fast" => Ok(Self::GzipFast),
            "gzip-slow" => Ok(Self::GzipSlow),
            "lzop" => Ok(Self::Lzop),
            other => Err(ConfigError::UnknownCompressMethod {
                name: other.to_owned(),
            }),
        }
    }
}

/// Log verbosity selected on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Errors only (the default).
    #[default]
    Errors,
    /// `--verbose`: informational diagnostics.
    Info,
    /// `--debug`: everything.
    Debug,
}

impl Verbosity {
    /// Derives the verbosity from the two CLI flags; `--debug` wins.
    #[must_use]
    pub const fn from_flags(debug: bool, verbose: bool) -> Self {
        if debug {
            Self::Debug
        } else if verbose {
            Self::Info
        } else {
            Self::Errors
        }
    }
}

/// Immutable configuration for one transfer run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Transfer direction.
    pub mode: Mode,
    /// Path of the status file consumed by the orchestrator.
    pub status_path: PathBuf,
    /// Deadline for the import side to observe a connection; `None` disables.
    pub connect_timeout: Option<Duration>,
    /// Export-side relay connect retries.
    pub connect_retries: u32,
    /// Expected transfer size.
    pub expected_size: ExpectedSize,
    /// Compression method for the pipeline.
    pub compress: CompressMethod,
    /// Selected log verbosity.
    pub verbosity: Verbosity,
    /// TLS key path, forwarded to the relay.
    pub key_path: Option<PathBuf>,
    /// TLS certificate path, forwarded to the relay.
    pub cert_path: Option<PathBuf>,
    /// TLS CA path, forwarded to the relay.
    pub ca_path: Option<PathBuf>,
    /// Local bind address, forwarded to the relay.
    pub bind: Option<String>,
    /// Address family restriction.
    pub family: AddressFamily,
    /// Remote host (export mode).
    pub host: Option<String>,
    /// Remote port (export mode).
    pub port: Option<u16>,
    /// Transfer magic, forwarded to the helpers.
    pub magic: Option<String>,
    /// Opaque command fragment spliced before the pipeline.
    pub cmd_prefix: Option<String>,
    /// Opaque command fragment spliced after the pipeline.
    pub cmd_suffix: Option<String>,
}

impl Config {
    /// Converts a CLI timeout value into the internal representation.
    ///
    /// Zero means "disabled", mirrored as `None`.
    #[must_use]
    pub const fn connect_timeout_from_secs(seconds: u64) -> Option<Duration> {
        if seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(seconds))
        }
    }
}

/// Validates a transfer magic value.
///
/// The magic is forwarded verbatim to the helpers, so it is restricted to a
/// conservative character set.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidMagic`] when the value does not match
/// `^[A-Za-z0-9_.-]+$`.
pub fn validate_magic(value: &str) -> Result<(), ConfigError> {
    let pattern = Regex::new(MAGIC_PATTERN).map_err(|_| ConfigError::InvalidMagic {
        value: value.to_owned(),
    })?;
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidMagic {
            value: value.to_owned(),
        })
    }
}

/// Validates a remote host as an IP literal or a resolvable name.
///
/// # Errors
///
/// Returns [`ConfigError::UnresolvableHost`] when resolution fails.
pub fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    match (host, 0u16).to_socket_addrs() {
        Ok(_) => Ok(()),
        Err(_) => Err(ConfigError::UnresolvableHost {
            host: host.to_owned(),
        }),
    }
}

/// Resolves a port argument: a decimal number or a TCP service name.
///
/// Service names are looked up in `/etc/services`; there is no portable
/// `getservbyname` in std.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownService`] for port 0, out-of-range numbers
/// and unknown service names.
pub fn resolve_service(value: &str) -> Result<u16, ConfigError> {
    if let Ok(port) = value.parse::<u16>() {
        if port > 0 {
            return Ok(port);
        }
        return Err(ConfigError::UnknownService {
            service: value.to_owned(),
        });
    }
    lookup_tcp_service(value).ok_or_else(|| ConfigError::UnknownService {
        service: value.to_owned(),
    })
}

fn lookup_tcp_service(name: &str) -> Option<u16> {
    let data = std::fs::read_to_string("/etc/services").ok()?;
    for raw in data.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(service) = fields.next() else {
            continue;
        };
        let Some(port_proto) = fields.next() else {
            continue;
        };
        let Some((port, proto)) = port_proto.split_once('/') else {
            continue;
        };
        if proto != "tcp" {
            continue;
        }
        if service == name || fields.any(|alias| alias == name) {
            if let Ok(port) = port.parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}
