#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Verbosity model and `tracing` initialisation for the diskferry binaries.
//!
//! The daemon logs through the standard `tracing` macros; this crate maps
//! the CLI verbosity flags onto a subscriber level and installs a compact
//! stderr subscriber. Diagnostics never go to stdout: stdout is inherited by
//! the child pipeline's shell glue.
//!
//! The mapping follows the CLI contract: errors only by default,
//! `--verbose` enables INFO, `--debug` enables everything.

use diskferry_core::config::Verbosity;
use tracing::level_filters::LevelFilter;

/// Maps a [`Verbosity`] onto the subscriber's maximum level.
#[must_use]
pub const fn level_filter(verbosity: Verbosity) -> LevelFilter {
    match verbosity {
        Verbosity::Errors => LevelFilter::ERROR,
        Verbosity::Info => LevelFilter::INFO,
        Verbosity::Debug => LevelFilter::TRACE,
    }
}

/// Installs the global stderr subscriber for the selected verbosity.
///
/// Safe to call more than once; only the first installation wins. This
/// matters for the test suites, where several cases may initialise logging.
pub fn init(verbosity: Verbosity) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
