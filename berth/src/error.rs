//! Error types for the berth library.
//!
//! Engine operations never panic and never use exceptions for control flow;
//! every failure branch is a typed variant here. The HTTP surface maps
//! variants to status codes via [`Error::code`].

use thiserror::Error;

use crate::port::Port;

/// Result type alias for operations that may fail with a berth error.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the berth library.
#[derive(Debug, Error)]
pub enum Error {
    /// An invalid port number was provided.
    #[error("invalid port {value}: {reason}")]
    InvalidPort {
        /// The invalid port value.
        value: u16,
        /// The reason the port is invalid.
        reason: String,
    },

    /// An invalid port range was specified.
    #[error("invalid port range {min}-{max}: {reason}")]
    InvalidPortRange {
        /// The minimum port in the range.
        min: u16,
        /// The maximum port in the range.
        max: u16,
        /// The reason the range is invalid.
        reason: String,
    },

    /// A request field failed validation.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// A description of the validation failure.
        message: String,
    },

    /// The service type is not in the catalog and auto-allocation is disabled.
    #[error("unknown service type '{name}' (auto-allocation disabled)")]
    UnknownServiceType {
        /// The unknown service type name.
        name: String,
    },

    /// The allocation retry loop exhausted every candidate port.
    #[error("no port available for service type '{service_type}' after {attempts} attempt(s)")]
    RangeExhausted {
        /// The service type whose range was exhausted.
        service_type: String,
        /// Number of candidates attempted before giving up.
        attempts: usize,
    },

    /// A release referenced a lock id with no backing allocation.
    #[error("invalid lock id: {lock_id}")]
    InvalidLockId {
        /// The offending lock id, as received.
        lock_id: String,
    },

    /// The requested resource does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// The resource that was not found.
        resource: String,
    },

    /// A port probe failed for a reason other than the port being in use.
    #[error("probe failed for port {port}: {source}")]
    ProbeFailed {
        /// The port that was being probed.
        port: Port,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Range synthesis could not find space for a new service type.
    #[error("no space for a new {chunk}-port range: {reason}")]
    NoSpace {
        /// The chunk size that was requested.
        chunk: u16,
        /// Why placement failed.
        reason: String,
    },

    /// The state snapshot failed its integrity check.
    #[error("state snapshot corrupt: {details}")]
    StateCorrupt {
        /// Details about the corruption.
        details: String,
    },

    /// The request carried no authentication token.
    #[error("authentication required")]
    AuthRequired,

    /// The request carried a token that did not match.
    #[error("invalid authentication token")]
    AuthInvalid,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error occurred.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The wire-level error code for this error.
    ///
    /// These are the stable strings clients and the intercept library match
    /// against; see the HTTP error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPort { .. } | Self::InvalidPortRange { .. } | Self::Validation { .. } => {
                "INVALID_INPUT"
            }
            Self::UnknownServiceType { .. } => "UNKNOWN_SERVICE_TYPE",
            Self::RangeExhausted { .. } | Self::NoSpace { .. } => "RANGE_EXHAUSTED",
            Self::InvalidLockId { .. } => "INVALID_LOCK_ID",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ProbeFailed { .. } => "CONFLICT",
            Self::StateCorrupt { .. } => "STATE_CORRUPT",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthInvalid => "AUTH_INVALID",
            Self::Io(_) | Self::Json(_) => "IO_FAILURE",
        }
    }

    /// Whether this error is an expected request-level outcome.
    ///
    /// Expected outcomes are reported to the client but not logged at error
    /// level by the daemon.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::InvalidPort { .. }
                | Self::InvalidPortRange { .. }
                | Self::Validation { .. }
                | Self::UnknownServiceType { .. }
                | Self::RangeExhausted { .. }
                | Self::InvalidLockId { .. }
                | Self::NotFound { .. }
                | Self::AuthRequired
                | Self::AuthInvalid
        )
    }
}

impl From<crate::port::InvalidPortError> for Error {
    fn from(err: crate::port::InvalidPortError) -> Self {
        Self::InvalidPort {
            value: err.value,
            reason: err.reason,
        }
    }
}

impl From<crate::port::InvalidPortRangeError> for Error {
    fn from(err: crate::port::InvalidPortRangeError) -> Self {
        Self::InvalidPortRange {
            min: err.min.value(),
            max: err.max.value(),
            reason: err.reason,
        }
    }
}
