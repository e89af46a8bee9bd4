//! Builds the helper pipeline command.
//!
//! The pipeline is one `/bin/sh -c` child: the bulk copier, an optional
//! compression stage and the TLS socket relay, glued together with explicit
//! descriptor redirections. Import mode receives:
//!
//! ```text
//! relay 2>&R | decompress | { copier 2>&C & echo pid >&P; wait; }
//! ```
//!
//! and export mode sends the mirror image. The copier runs inside a grouped
//! background stage so its PID can be reported on the PID descriptor while
//! it still sits in the middle of the pipeline. `--cmd-prefix` and
//! `--cmd-suffix` are spliced verbatim around the pipeline; they are how
//! the orchestrator wires the actual block device in.

use std::fmt::Write as _;
use std::os::fd::RawFd;

use diskferry_core::config::{AddressFamily, Config, ConfigError, ExpectedSize, Mode};

/// Environment variable naming the size-report descriptor.
pub const EXP_SIZE_FD_VAR: &str = "EXP_SIZE_FD";

/// Environment variable carrying the transfer magic.
pub const MAGIC_VAR: &str = "TRANSFER_MAGIC";

/// Copier write block size.
const COPIER_BLOCK_SIZE: u32 = 1_048_576;

/// Descriptor numbers the child inherits for its report streams.
#[derive(Clone, Copy, Debug)]
pub struct ChildFds {
    /// Write end for the copier's stderr counters.
    pub copier_status: RawFd,
    /// Write end for the copier PID announcement.
    pub copier_pid: RawFd,
    /// Write end for the relay's stderr.
    pub relay_stderr: RawFd,
    /// Write end for the export helper's size report.
    pub size_report: RawFd,
}

/// A ready-to-spawn child command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildCommand {
    /// Argument vector, `argv[0]` first.
    pub argv: Vec<String>,
    /// Extra environment entries.
    pub env: Vec<(String, String)>,
}

/// Builds the pipeline command for `config` against the given descriptors.
///
/// # Errors
///
/// Returns [`ConfigError::MissingRemote`] when export mode lacks a remote
/// endpoint; the CLI front end rejects that earlier.
pub fn build(config: &Config, fds: &ChildFds) -> Result<ChildCommand, ConfigError> {
    let copier = copier_stage(fds);
    let relay = relay_stage(config, fds)?;

    let mut stages = Vec::new();
    match config.mode {
        Mode::Import => {
            stages.push(relay);
            if let Some(stage) = config.compress.decompress_stage() {
                stages.push(stage.to_owned());
            }
            stages.push(copier);
        }
        Mode::Export => {
            stages.push(copier);
            if let Some(stage) = config.compress.compress_stage() {
                stages.push(stage.to_owned());
            }
            stages.push(relay);
        }
    }

    let mut script = stages.join(" | ");
    if let Some(prefix) = &config.cmd_prefix {
        script = format!("{prefix} {script}");
    }
    if let Some(suffix) = &config.cmd_suffix {
        script = format!("{script} {suffix}");
    }

    let mut env = Vec::new();
    if config.expected_size == ExpectedSize::Custom {
        env.push((EXP_SIZE_FD_VAR.to_owned(), fds.size_report.to_string()));
    }
    if let Some(magic) = &config.magic {
        env.push((MAGIC_VAR.to_owned(), magic.clone()));
    }

    Ok(ChildCommand {
        argv: vec!["/bin/sh".to_owned(), "-c".to_owned(), script],
        env,
    })
}

/// The grouped copier stage with its PID announcement.
fn copier_stage(fds: &ChildFds) -> String {
    format!(
        "{{ dd bs={COPIER_BLOCK_SIZE} 2>&{status} & pid=$!; echo \"$pid\" >&{pid_fd}; wait \"$pid\"; }}",
        status = fds.copier_status,
        pid_fd = fds.copier_pid,
    )
}

fn relay_stage(config: &Config, fds: &ChildFds) -> Result<String, ConfigError> {
    let mut options = String::new();
    match config.family {
        AddressFamily::Any => {}
        AddressFamily::V4 => options.push_str(",pf=ip4"),
        AddressFamily::V6 => options.push_str(",pf=ip6"),
    }
    if let Some(cert) = &config.cert_path {
        let _ = write!(options, ",cert={}", cert.display());
    }
    if let Some(key) = &config.key_path {
        let _ = write!(options, ",key={}", key.display());
    }
    if let Some(ca) = &config.ca_path {
        let _ = write!(options, ",cafile={}", ca.display());
    }
    options.push_str(if config.ca_path.is_some() {
        ",verify=1"
    } else {
        ",verify=0"
    });

    let stage = match config.mode {
        Mode::Import => {
            let mut address = format!("OPENSSL-LISTEN:0,reuseaddr{options}");
            if let Some(bind) = &config.bind {
                let _ = write!(address, ",bind={bind}");
            }
            format!(
                "socat -d -d -u {} STDOUT 2>&{}",
                quote_script_word(&address),
                fds.relay_stderr
            )
        }
        Mode::Export => {
            let host = config.host.as_deref().ok_or(ConfigError::MissingRemote)?;
            let port = config.port.ok_or(ConfigError::MissingRemote)?;
            let mut address = format!("OPENSSL:{host}:{port}{options}");
            if let Some(bind) = &config.bind {
                let _ = write!(address, ",bind={bind}");
            }
            if config.connect_retries > 0 {
                let _ = write!(address, ",retry={}", config.connect_retries);
            }
            format!(
                "socat -d -d -u STDIN {} 2>&{}",
                quote_script_word(&address),
                fds.relay_stderr
            )
        }
    };
    Ok(stage)
}

/// Quotes one word for splicing into the `/bin/sh -c` script.
///
/// Relay addresses are `TYPE:target,option=value,...` tokens; those
/// characters, plus path and hostname punctuation, pass through untouched
/// so the assembled script stays readable in diagnostics. Any other word
/// is single-quoted, with embedded single quotes spliced in as `\'`
/// between quoted runs.
fn quote_script_word(word: &str) -> String {
    // Brackets stay out of the plain set: an unquoted [::1] is a glob.
    let plain = |c: char| c.is_ascii_alphanumeric() || ":,=./-_+@%".contains(c);
    if !word.is_empty() && word.chars().all(plain) {
        return word.to_owned();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for c in word.chars() {
        if c == '\'' {
            quoted.push_str(r"'\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskferry_core::config::{AddressFamily, CompressMethod, Verbosity};
    use std::path::PathBuf;

    const FDS: ChildFds = ChildFds {
        copier_status: 7,
        copier_pid: 8,
        relay_stderr: 9,
        size_report: 10,
    };

    fn config(mode: Mode) -> Config {
        Config {
            mode,
            status_path: PathBuf::from("/tmp/status"),
            connect_timeout: Config::connect_timeout_from_secs(60),
            connect_retries: 0,
            expected_size: ExpectedSize::Unknown,
            compress: CompressMethod::None,
            verbosity: Verbosity::Errors,
            key_path: None,
            cert_path: None,
            ca_path: None,
            bind: None,
            family: AddressFamily::Any,
            host: Some("198.51.100.7".to_owned()),
            port: Some(33_101),
            magic: None,
            cmd_prefix: None,
            cmd_suffix: None,
        }
    }

    fn script(command: &ChildCommand) -> &str {
        assert_eq!(command.argv[0], "/bin/sh");
        assert_eq!(command.argv[1], "-c");
        &command.argv[2]
    }

    #[test]
    fn import_pipeline_orders_relay_before_copier() {
        let command = build(&config(Mode::Import), &FDS).unwrap();
        let script = script(&command);
        let relay = script.find("socat").unwrap();
        let copier = script.find("dd bs=").unwrap();
        assert!(relay < copier);
        assert!(script.contains("OPENSSL-LISTEN:0"));
        assert!(script.contains("2>&9"));
    }

    #[test]
    fn export_pipeline_orders_copier_before_relay() {
        let command = build(&config(Mode::Export), &FDS).unwrap();
        let script = script(&command);
        let copier = script.find("dd bs=").unwrap();
        let relay = script.find("socat").unwrap();
        assert!(copier < relay);
        assert!(script.contains("OPENSSL:198.51.100.7:33101"));
    }

    #[test]
    fn copier_stage_reports_its_pid() {
        let command = build(&config(Mode::Export), &FDS).unwrap();
        let script = script(&command);
        assert!(script.contains("2>&7"));
        assert!(script.contains("echo \"$pid\" >&8"));
        assert!(script.contains("wait \"$pid\""));
    }

    #[test]
    fn compression_stages_face_the_right_way() {
        let mut import = config(Mode::Import);
        import.compress = CompressMethod::Gzip;
        let script_import = build(&import, &FDS).unwrap().argv[2].clone();
        assert!(script_import.contains("| gzip -d -c |"));

        let mut export = config(Mode::Export);
        export.compress = CompressMethod::GzipFast;
        let script_export = build(&export, &FDS).unwrap().argv[2].clone();
        assert!(script_export.contains("| gzip -1 -c |"));
    }

    #[test]
    fn prefix_and_suffix_are_spliced_verbatim() {
        let mut config = config(Mode::Export);
        config.cmd_prefix = Some("cat /dev/vg0/disk0 |".to_owned());
        config.cmd_suffix = Some("&& sync".to_owned());
        let command = build(&config, &FDS).unwrap();
        let script = script(&command);
        assert!(script.starts_with("cat /dev/vg0/disk0 | "));
        assert!(script.ends_with(" && sync"));
    }

    #[test]
    fn export_without_remote_is_rejected() {
        let mut config = config(Mode::Export);
        config.host = None;
        assert!(matches!(
            build(&config, &FDS),
            Err(ConfigError::MissingRemote)
        ));
    }

    #[test]
    fn custom_size_exports_the_descriptor_number() {
        let mut config = config(Mode::Export);
        config.expected_size = ExpectedSize::Custom;
        let command = build(&config, &FDS).unwrap();
        assert!(command
            .env
            .contains(&(EXP_SIZE_FD_VAR.to_owned(), "10".to_owned())));
    }

    #[test]
    fn fixed_size_does_not_export_the_descriptor() {
        let mut config = config(Mode::Export);
        config.expected_size = ExpectedSize::Mebibytes(100);
        let command = build(&config, &FDS).unwrap();
        assert!(command.env.iter().all(|(name, _)| name != EXP_SIZE_FD_VAR));
    }

    #[test]
    fn magic_travels_in_the_environment() {
        let mut config = config(Mode::Import);
        config.magic = Some("xfer-4711".to_owned());
        let command = build(&config, &FDS).unwrap();
        assert!(command
            .env
            .contains(&(MAGIC_VAR.to_owned(), "xfer-4711".to_owned())));
    }

    #[test]
    fn tls_material_lands_in_the_relay_address() {
        let mut config = config(Mode::Export);
        config.cert_path = Some(PathBuf::from("/etc/xfer/server.pem"));
        config.key_path = Some(PathBuf::from("/etc/xfer/server.key"));
        config.ca_path = Some(PathBuf::from("/etc/xfer/ca.pem"));
        config.family = AddressFamily::V6;
        let command = build(&config, &FDS).unwrap();
        let script = script(&command);
        assert!(script.contains("cert=/etc/xfer/server.pem"));
        assert!(script.contains("key=/etc/xfer/server.key"));
        assert!(script.contains("cafile=/etc/xfer/ca.pem"));
        assert!(script.contains("verify=1"));
        assert!(script.contains("pf=ip6"));
    }

    #[test]
    fn missing_ca_disables_verification() {
        let command = build(&config(Mode::Export), &FDS).unwrap();
        assert!(script(&command).contains("verify=0"));
    }

    #[test]
    fn connect_retries_reach_the_relay() {
        let mut config = config(Mode::Export);
        config.connect_retries = 3;
        let command = build(&config, &FDS).unwrap();
        assert!(script(&command).contains("retry=3"));
    }

    #[test]
    fn relay_address_tokens_stay_unquoted() {
        assert_eq!(
            quote_script_word("OPENSSL:host.example:443,verify=0"),
            "OPENSSL:host.example:443,verify=0"
        );
        assert_eq!(
            quote_script_word("cert=/etc/xfer/server.pem"),
            "cert=/etc/xfer/server.pem"
        );
    }

    #[test]
    fn suspect_script_words_are_single_quoted() {
        assert_eq!(quote_script_word("has space"), "'has space'");
        assert_eq!(quote_script_word("a$(b)"), "'a$(b)'");
        assert_eq!(quote_script_word("OPENSSL:[::1]:443"), "'OPENSSL:[::1]:443'");
        assert_eq!(quote_script_word(""), "''");
    }

    #[test]
    fn embedded_single_quotes_are_spliced() {
        assert_eq!(quote_script_word("it's"), r"'it'\''s'");
        assert_eq!(quote_script_word("a'b'c"), r"'a'\''b'\''c'");
    }
}
