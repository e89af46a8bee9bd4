#![deny(unsafe_code)]

//! Thin entry point for the transfer daemon.

use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let status = diskferry_daemon::cli::run(env::args_os());
    diskferry_daemon::cli::exit_code_from(status)
}
