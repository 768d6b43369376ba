//! Lightweight service supervisor for containers.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
// OpenSSL is only needed for static linking on Linux
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Change and task recording.
pub mod changelog;

/// Health check engine.
pub mod checks;

/// CLI parsing.
pub mod cli;

/// Constants and defaults.
pub mod constants;

/// Daemon composition.
pub mod daemon;

/// Errors.
pub mod error;

/// Interactive exec engine.
pub mod exec;

/// Health aggregation.
pub mod health;

/// Service ordering.
pub mod order;

/// Plan data model and merging.
pub mod plan;

/// User and group resolution.
pub mod privilege;

/// Child reaper.
pub mod reaper;

/// Plan storage.
pub mod store;

/// Service supervision.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
