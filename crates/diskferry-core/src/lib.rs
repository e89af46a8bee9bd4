#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Core data model for the diskferry transfer daemon.
//!
//! This crate holds the pieces of the daemon that are pure data and pure
//! computation: the immutable run [`config::Config`], the
//! [`status::StatusRecord`] persisted for the orchestrator, the
//! [`throughput::ThroughputWindow`] used to derive transfer rates from the
//! copier's counters, the [`linebuf::LineSplitter`] that turns descriptor
//! reads into lines, and the shared [`exit_code::ExitCode`] / error taxonomy.
//!
//! Everything that touches descriptors, processes, or signals lives in
//! `diskferry-daemon`; keeping this crate free of syscalls makes the
//! invariants here cheap to property-test.

/// Immutable run configuration and its validators.
pub mod config;
/// Error taxonomy shared across the workspace.
pub mod error;
/// Process exit codes reported to the orchestrator.
pub mod exit_code;
/// Byte-chunk to line conversion for descriptor streams.
pub mod linebuf;
/// The progress record persisted to the status file.
pub mod status;
/// Sliding-window throughput estimation.
pub mod throughput;
