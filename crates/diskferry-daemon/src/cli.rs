//! Command-line front end.
//!
//! Parses `diskferryd <status-file> {import|export}` plus its options into
//! an immutable [`Config`], initialises logging, and hands off to
//! [`crate::run`]. All validation happens here, before any child process
//! exists; a rejected invocation exits non-zero without touching the status
//! file beyond the error report.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use diskferry_core::config::{
    self, AddressFamily, CompressMethod, Config, ConfigError, ExpectedSize, Mode, Verbosity,
};
use diskferry_core::exit_code::{ExitCode, HasExitCode};
use diskferry_core::error::TransferError;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    /// Receive a disk image on this host.
    Import,
    /// Send a disk image to a remote host.
    Export,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Import => Self::Import,
            ModeArg::Export => Self::Export,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "diskferryd",
    about = "Disk image transfer daemon for cluster instance export/import",
    version
)]
struct Args {
    /// Status file updated for the orchestrator during the transfer.
    status_file: PathBuf,

    /// Transfer direction.
    #[arg(value_enum)]
    mode: ModeArg,

    /// Enable debug-level diagnostics.
    #[arg(long)]
    debug: bool,

    /// Enable informational diagnostics.
    #[arg(long)]
    verbose: bool,

    /// TLS key file for the relay.
    #[arg(long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// TLS certificate file for the relay.
    #[arg(long, value_name = "FILE")]
    cert: Option<PathBuf>,

    /// TLS CA file for the relay; enables peer verification.
    #[arg(long, value_name = "FILE")]
    ca: Option<PathBuf>,

    /// Local address to bind the relay to.
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Restrict the relay to IPv4.
    #[arg(long, conflicts_with = "ipv6")]
    ipv4: bool,

    /// Restrict the relay to IPv6.
    #[arg(long)]
    ipv6: bool,

    /// Remote host to connect to (export mode).
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Remote port or service name (export mode).
    #[arg(long, value_name = "PORT")]
    port: Option<String>,

    /// Relay connect retries (export mode).
    #[arg(long, value_name = "N", default_value_t = 0)]
    connect_retries: u32,

    /// Seconds to wait for the connection; 0 disables the deadline.
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    connect_timeout: u64,

    /// Compression method: none, gzip, gzip-fast, gzip-slow or lzop.
    #[arg(long, value_name = "METHOD", default_value = "none")]
    compress: String,

    /// Expected image size in MiB, or "custom" for a runtime size report.
    #[arg(long, value_name = "SIZE")]
    expected_size: Option<String>,

    /// Transfer magic forwarded to the helpers.
    #[arg(long, value_name = "MAGIC")]
    magic: Option<String>,

    /// Command fragment spliced before the pipeline.
    #[arg(long, value_name = "CMD")]
    cmd_prefix: Option<String>,

    /// Command fragment spliced after the pipeline.
    #[arg(long, value_name = "CMD")]
    cmd_suffix: Option<String>,
}

fn build_config(args: Args) -> Result<Config, ConfigError> {
    let mode = Mode::from(args.mode);

    if let Some(magic) = &args.magic {
        config::validate_magic(magic)?;
    }
    if let Some(host) = &args.host {
        config::validate_host(host)?;
    }
    let port = args
        .port
        .as_deref()
        .map(config::resolve_service)
        .transpose()?;
    if mode == Mode::Export && (args.host.is_none() || port.is_none()) {
        return Err(ConfigError::MissingRemote);
    }

    let expected_size = args
        .expected_size
        .as_deref()
        .map(str::parse)
        .transpose()?
        .unwrap_or(ExpectedSize::Unknown);
    let compress: CompressMethod = args.compress.parse()?;

    let family = if args.ipv4 {
        AddressFamily::V4
    } else if args.ipv6 {
        AddressFamily::V6
    } else {
        AddressFamily::Any
    };

    Ok(Config {
        mode,
        status_path: args.status_file,
        connect_timeout: Config::connect_timeout_from_secs(args.connect_timeout),
        connect_retries: args.connect_retries,
        expected_size,
        compress,
        verbosity: Verbosity::from_flags(args.debug, args.verbose),
        key_path: args.key,
        cert_path: args.cert,
        ca_path: args.ca,
        bind: args.bind,
        family,
        host: args.host,
        port,
        magic: args.magic,
        cmd_prefix: args.cmd_prefix,
        cmd_suffix: args.cmd_suffix,
    })
}

/// Runs the daemon CLI and returns the process exit code.
pub fn run<I, S>(arguments: I) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    let args = match Args::try_parse_from(arguments) {
        Ok(args) => args,
        Err(error) => {
            // clap renders help/version through the same path.
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::TransferFailed.as_i32()
            } else {
                ExitCode::Ok.as_i32()
            };
        }
    };

    let verbosity = Verbosity::from_flags(args.debug, args.verbose);
    diskferry_logging::init(verbosity);

    let config = match build_config(args) {
        Ok(config) => config,
        Err(error) => {
            let error = TransferError::from(error);
            tracing::error!("{error}");
            eprintln!("diskferryd: {error}");
            return error.exit_code().as_i32();
        }
    };

    crate::run(&config).as_i32()
}

/// Converts a numeric exit code into a [`std::process::ExitCode`].
#[must_use]
pub fn exit_code_from(status: i32) -> std::process::ExitCode {
    std::process::ExitCode::from(status.clamp(0, 255) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["diskferryd", "/var/run/xfer.status", "import"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("arguments parse")
    }

    #[test]
    fn minimal_import_invocation() {
        let config = build_config(parse(&[])).unwrap();
        assert_eq!(config.mode, Mode::Import);
        assert_eq!(config.status_path, PathBuf::from("/var/run/xfer.status"));
        assert_eq!(
            config.connect_timeout,
            Some(std::time::Duration::from_secs(60))
        );
        assert_eq!(config.compress, CompressMethod::None);
        assert_eq!(config.expected_size, ExpectedSize::Unknown);
    }

    #[test]
    fn connect_timeout_zero_disables_the_deadline() {
        let config = build_config(parse(&["--connect-timeout", "0"])).unwrap();
        assert_eq!(config.connect_timeout, None);
    }

    #[test]
    fn export_requires_a_remote_endpoint() {
        let args = Args::try_parse_from(["diskferryd", "/s", "export"]).unwrap();
        assert!(matches!(
            build_config(args),
            Err(ConfigError::MissingRemote)
        ));
    }

    #[test]
    fn export_with_remote_resolves_the_port() {
        let args = Args::try_parse_from([
            "diskferryd",
            "/s",
            "export",
            "--host",
            "127.0.0.1",
            "--port",
            "33101",
        ])
        .unwrap();
        let config = build_config(args).unwrap();
        assert_eq!(config.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.port, Some(33_101));
    }

    #[test]
    fn address_families_are_mutually_exclusive() {
        assert!(Args::try_parse_from(["diskferryd", "/s", "import", "--ipv4", "--ipv6"]).is_err());
        let config = build_config(parse(&["--ipv4"])).unwrap();
        assert_eq!(config.family, AddressFamily::V4);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let args = parse(&["--magic", "not valid"]);
        assert!(matches!(
            build_config(args),
            Err(ConfigError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn custom_expected_size_is_accepted() {
        let config = build_config(parse(&["--expected-size", "custom"])).unwrap();
        assert_eq!(config.expected_size, ExpectedSize::Custom);
        let config = build_config(parse(&["--expected-size", "2048"])).unwrap();
        assert_eq!(config.expected_size, ExpectedSize::Mebibytes(2048));
    }

    #[test]
    fn unknown_compress_method_is_rejected() {
        let args = parse(&["--compress", "zstd"]);
        assert!(matches!(
            build_config(args),
            Err(ConfigError::UnknownCompressMethod { .. })
        ));
    }

    #[test]
    fn verbosity_flags_map_to_levels() {
        let config = build_config(parse(&["--debug"])).unwrap();
        assert_eq!(config.verbosity, Verbosity::Debug);
        let config = build_config(parse(&["--verbose"])).unwrap();
        assert_eq!(config.verbosity, Verbosity::Info);
    }

    #[test]
    fn missing_positional_arguments_fail_to_parse() {
        assert!(Args::try_parse_from(["diskferryd"]).is_err());
        assert!(Args::try_parse_from(["diskferryd", "/s"]).is_err());
        assert!(Args::try_parse_from(["diskferryd", "/s", "sideways"]).is_err());
    }

    #[test]
    fn exit_code_from_clamps_values() {
        // std::process::ExitCode has no PartialEq; compare debug renderings.
        assert_eq!(
            format!("{:?}", exit_code_from(-1)),
            format!("{:?}", std::process::ExitCode::from(0))
        );
        assert_eq!(
            format!("{:?}", exit_code_from(300)),
            format!("{:?}", std::process::ExitCode::from(255))
        );
    }
}
