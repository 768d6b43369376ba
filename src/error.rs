//! Error handling for warden.
use thiserror::Error;

/// Umbrella error for daemon-level operations.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Configuration plan error.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Child reaper error.
    #[error(transparent)]
    Reaper(#[from] ReaperError),

    /// Service supervision error.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Exec engine error.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading, combining, or validating a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Error reading a layer file or the layers directory.
    #[error("cannot read plan layer: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing layer YAML.
    #[error("cannot parse plan layer: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// The plan is semantically invalid; never retried, surfaced verbatim.
    #[error("{message}")]
    Format {
        /// Human-readable description of the problem.
        message: String,
    },
}

impl PlanError {
    /// Builds a [`PlanError::Format`] from a display message.
    pub fn format(message: impl Into<String>) -> Self {
        PlanError::Format {
            message: message.into(),
        }
    }
}

/// Errors raised by the process-wide child reaper.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// The platform cannot mark this process as a child subreaper. The
    /// daemon cannot continue without it.
    #[error("cannot set child subreaper: {0}")]
    Unsupported(String),

    /// The reaper loop is not running.
    #[error("reaper is not started")]
    NotStarted,

    /// A waiter is already registered for this PID.
    #[error("already waiting for PID {pid}")]
    AlreadyWaiting {
        /// The contested process ID.
        pid: i32,
    },

    /// Error spawning a child through the reaper.
    #[error("cannot start command: {0}")]
    SpawnError(#[from] std::io::Error),
}

/// Errors raised by the service manager.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A requested service does not exist in the current plan.
    #[error("service \"{service}\" does not exist")]
    NotFound {
        /// The unknown service name.
        service: String,
    },

    /// A service could not be spawned.
    #[error("cannot start service \"{service}\": {source}")]
    StartError {
        /// The service that failed to start.
        service: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A service exited inside the startup grace window.
    #[error("service \"{service}\" exited too quickly with code {code}")]
    ShortLived {
        /// The service that exited.
        service: String,
        /// The exit code it returned.
        code: i32,
    },

    /// A service was asked to transition from an incompatible state.
    #[error("service \"{service}\" is {status} and cannot be {verb}")]
    InvalidTransition {
        /// The service in question.
        service: String,
        /// Its current status.
        status: String,
        /// The rejected transition.
        verb: String,
    },

    /// A service did not reach the expected state in time.
    #[error("timed out waiting for service \"{service}\" to {verb}")]
    WaitTimeout {
        /// The service in question.
        service: String,
        /// What it was expected to do.
        verb: String,
    },

    /// Ordering failed for the requested names.
    #[error(transparent)]
    Order(#[from] PlanError),
}

/// Errors raised by the exec engine.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The request was malformed.
    #[error("cannot perform exec: {0}")]
    BadRequest(String),

    /// No execution matches the supplied stream identifier.
    #[error("unknown stream id")]
    UnknownStream,

    /// A stream was attached twice.
    #[error("stream \"{key}\" is already connected")]
    AlreadyConnected {
        /// The stream key that was attached twice.
        key: &'static str,
    },

    /// The I/O attach handshake or the child's wall clock ran out.
    #[error("{0}")]
    Timeout(String),

    /// The child could not be spawned.
    #[error("cannot start command: {0}")]
    SpawnError(#[from] std::io::Error),

    /// The reaper refused the spawn.
    #[error(transparent)]
    Reaper(#[from] ReaperError),
}

/// Error reported by a single check probe run. Counted against the check's
/// threshold; not surfaced to the operator until the threshold is reached.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProbeError {
    /// Short description of the failure.
    pub message: String,
    /// Optional multi-line context, e.g. a response-body or output excerpt.
    pub details: Option<String>,
}

impl ProbeError {
    /// Builds a probe error with no details.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    /// Builds a probe error carrying a details excerpt.
    pub fn with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Some(details.into()),
        }
    }
}
