//! Constants and default values for the warden daemon.
//!
//! This module centralizes the timing defaults, limits, and magic strings
//! used throughout the daemon to improve maintainability and clarity.

use std::time::Duration;

// ============================================================================
// Plan Defaults
// ============================================================================

/// Service name reserved for the daemon itself; plans may not define it.
pub const RESERVED_SERVICE_NAME: &str = "warden";

/// Default delay before the first restart of a failed service.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(500);

/// Default multiplier applied to the backoff delay after each failure.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Default cap on the computed backoff delay. Also serves as the reset
/// window: a service that stays up longer than this zeroes its counter.
pub const DEFAULT_BACKOFF_LIMIT: Duration = Duration::from_secs(30);

/// Default interval between runs of a health check.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(10);

/// Default per-run deadline for a health check probe.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of consecutive failures before a check goes down.
pub const DEFAULT_CHECK_THRESHOLD: u32 = 3;

// ============================================================================
// Service Supervision Timing
// ============================================================================

/// Grace period after SIGTERM before a stopping service is SIGKILLed.
/// A configured `kill-delay` of zero falls back to this value.
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(5);

/// Window after spawn during which an exit counts as a failed start.
pub const OKAY_DELAY: Duration = Duration::from_secs(1);

/// Extra slack granted on top of [`OKAY_DELAY`] when a caller blocks
/// waiting for a service to report running.
pub const START_WAIT_SLACK: Duration = Duration::from_secs(2);

/// Polling cadence for exit watchers and cancellable sleeps.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on how long `stop` waits for a service to reach a rest
/// state once the kill escalation has run its course.
pub const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Spawn Environment
// ============================================================================

/// PATH given to services and execs whose environment does not set one.
pub const DEFAULT_PATH_ENV: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// LANG given to services and execs whose environment does not set one.
pub const DEFAULT_LANG_ENV: &str = "C.UTF-8";

// ============================================================================
// Check Probe Limits
// ============================================================================

/// Maximum number of response-body lines kept when an HTTP probe fails.
pub const MAX_ERROR_LINES: usize = 20;

/// Maximum bytes kept per response-body line in a probe error.
pub const MAX_ERROR_LINE_BYTES: usize = 1024;

// ============================================================================
// Exec Engine Timing
// ============================================================================

/// How long an exec waits for its I/O streams to attach before failing.
pub const EXEC_ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code recorded when an exec times out or fails for an unknown reason.
pub const EXEC_UNKNOWN_EXIT_CODE: i32 = -1;
