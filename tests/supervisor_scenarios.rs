//! End-to-end supervision scenarios with scripted children.
//!
//! Each test runs the real spawn / poll / parse / reap path against a
//! `/bin/sh` script standing in for the helper pipeline. The scripts write
//! to the same numbered descriptors the production pipeline would, so
//! everything from line splitting to the status file is exercised.
//!
//! The signal bridge publishes process-global handler state, so the
//! scenarios are serialized.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use diskferry_core::config::{
    AddressFamily, CompressMethod, Config, ExpectedSize, Mode, Verbosity,
};
use diskferry_core::error::TransferError;
use diskferry_core::exit_code::ExitCode;
use diskferry_daemon::status_file::StatusWriter;
use diskferry_daemon::{probe, supervise_pipeline, TransferPipes};

static SCENARIO_LOCK: Mutex<()> = Mutex::new(());

fn base_config(mode: Mode, status_path: PathBuf) -> Config {
    Config {
        mode,
        status_path,
        connect_timeout: Some(Duration::from_secs(60)),
        connect_retries: 0,
        expected_size: ExpectedSize::Unknown,
        compress: CompressMethod::None,
        verbosity: Verbosity::Errors,
        key_path: None,
        cert_path: None,
        ca_path: None,
        bind: None,
        family: AddressFamily::Any,
        host: None,
        port: None,
        magic: None,
        cmd_prefix: None,
        cmd_suffix: None,
    }
}

fn sh_argv(script: String) -> Vec<String> {
    vec!["/bin/sh".to_owned(), "-c".to_owned(), script]
}

fn read_status(path: &std::path::Path) -> serde_json::Value {
    let data = std::fs::read_to_string(path).expect("status file readable");
    serde_json::from_str(&data).expect("status file is valid json")
}

#[test]
fn happy_import_reports_port_connection_and_progress() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status");
    let mut config = base_config(Mode::Import, status_path.clone());
    config.expected_size = ExpectedSize::Mebibytes(1);

    let pipes = TransferPipes::create().unwrap();
    let fds = pipes.child_fds();
    let script = format!(
        "trap '' USR1\n\
         echo \"$$\" >&{pid}\n\
         echo 'listening on AF=2 0.0.0.0:33101' >&{relay}\n\
         echo 'starting data transfer loop with FD 4' >&{relay}\n\
         echo '262144 bytes (262 kB, 256 KiB) copied, 1 s, 262 kB/s' >&{copier}\n\
         sleep 1\n\
         echo '1048576 bytes (1.0 MB, 1.0 MiB) copied, 2 s, 524 kB/s' >&{copier}\n\
         exit 0\n",
        pid = fds.copier_pid,
        relay = fds.relay_stderr,
        copier = fds.copier_status,
    );

    let mut status = StatusWriter::new(status_path.clone());
    let outcome =
        supervise_pipeline(&config, &mut status, &sh_argv(script), &[], pipes).unwrap();

    assert!(outcome.success());
    assert_eq!(outcome.exit_status, 0);

    let record = status.record();
    assert_eq!(record.listen_port(), Some(33101));
    assert!(record.connected());
    assert_eq!(record.progress_mbytes(), Some(1.0));
    assert!(record.progress_throughput().expect("two samples arrived") > 0.0);
    assert_eq!(record.progress_percent(), Some(100.0));

    // Finish the way the daemon would and check the persisted document.
    status.set_exit_status(outcome.exit_status, outcome.message);
    status.flush(true).unwrap();
    let json = read_status(&status_path);
    assert_eq!(json["listen_port"], 33101);
    assert_eq!(json["connected"], true);
    assert_eq!(json["exit_status"], 0);
    assert_eq!(json["error_message"], "");
}

#[test]
fn connect_timeout_escalates_to_sigterm() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status");
    let mut config = base_config(Mode::Import, status_path);
    config.connect_timeout = Some(Duration::from_secs(1));

    let pipes = TransferPipes::create().unwrap();
    let script = "trap '' USR1\nsleep 30\n".to_owned();

    let mut status = StatusWriter::new(config.status_path.clone());
    let outcome =
        supervise_pipeline(&config, &mut status, &sh_argv(script), &[], pipes).unwrap();

    assert_eq!(outcome.exit_status, -libc_sigterm());
    assert!(outcome.message.contains("signal"));
    assert!(status
        .record()
        .recent_output()
        .iter()
        .any(|line| line.contains("didn't establish connection in time (1s), sending SIGTERM")));
}

#[test]
fn external_sigterm_is_forwarded_to_the_child_group() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(Mode::Export, dir.path().join("status"));

    let pipes = TransferPipes::create().unwrap();
    // The child interrupts the supervisor, exactly like an operator would;
    // the bridge must relay the signal back to the child group, which ends
    // this sleep well before its 30 seconds.
    let script = "trap '' USR1\nsleep 1\nkill -TERM $PPID\nsleep 30\n".to_owned();

    let mut status = StatusWriter::new(config.status_path.clone());
    let started = std::time::Instant::now();
    let outcome =
        supervise_pipeline(&config, &mut status, &sh_argv(script), &[], pipes).unwrap();

    assert_eq!(outcome.exit_status, -libc_sigterm());
    // Well under the scripted 30s: the linger budget bounds the shutdown.
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[test]
fn custom_size_report_unblocks_percent() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(Mode::Import, dir.path().join("status"));
    config.expected_size = ExpectedSize::Custom;

    let pipes = TransferPipes::create().unwrap();
    let fds = pipes.child_fds();
    let script = format!(
        "trap '' USR1\n\
         echo '1048576 bytes (1.0 MB, 1.0 MiB) copied, 1 s, 1.0 MB/s' >&{copier}\n\
         sleep 1\n\
         echo '2097152' >&{size}\n\
         sleep 1\n\
         echo '2097152 bytes (2.1 MB, 2.0 MiB) copied, 2 s, 1.0 MB/s' >&{copier}\n\
         exit 0\n",
        copier = fds.copier_status,
        size = fds.size_report,
    );

    let mut status = StatusWriter::new(config.status_path.clone());
    let outcome =
        supervise_pipeline(&config, &mut status, &sh_argv(script), &[], pipes).unwrap();

    assert!(outcome.success());
    // Before the size report percent was unknowable; the final counter
    // line lands after it and completes the picture.
    assert_eq!(status.record().progress_percent(), Some(100.0));
    assert_eq!(status.record().progress_mbytes(), Some(2.0));
}

#[test]
fn missing_compressor_fails_before_any_spawn() {
    let error = probe::verify_program("diskferry-scenario-missing-gzip", "gzip")
        .expect_err("missing helper must fail the probe");
    let message = error.to_string();
    assert!(message.starts_with("Verification attempt of selected compression method gzip failed"));
    match error {
        TransferError::ToolUnavailable { .. } => {}
        other => panic!("unexpected error kind: {other}"),
    }
}

#[test]
fn child_killed_by_signal_is_reported_as_negative_status() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(Mode::Export, dir.path().join("status"));

    let pipes = TransferPipes::create().unwrap();
    let script = "kill -11 $$\n".to_owned();

    let mut status = StatusWriter::new(config.status_path.clone());
    let outcome =
        supervise_pipeline(&config, &mut status, &sh_argv(script), &[], pipes).unwrap();

    assert_eq!(outcome.exit_status, -11);
    assert_eq!(outcome.message, "Exited due to signal 11");
}

#[test]
fn configuration_failures_still_produce_a_status_file() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status");
    // Export without a remote endpoint fails in the command builder.
    let config = base_config(Mode::Export, status_path.clone());

    let code = diskferry_daemon::run(&config);
    assert_eq!(code, ExitCode::TransferFailed);

    let json = read_status(&status_path);
    assert_eq!(json["exit_status"], 1);
    assert_eq!(json["error_message"], "export mode requires --host and --port");
}

fn libc_sigterm() -> i32 {
    // SIGTERM is 15 on every platform this daemon targets.
    15
}
