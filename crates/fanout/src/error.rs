//! Error taxonomy for the scheduling engine.
//!
//! Remote mover failures are normalized once, at the [`MoverControl`]
//! boundary, into [`MoverError`]: connectivity-class failures (connection
//! refused/reset, marshalling, vanished endpoint) collapse into a single
//! retryable kind so callers can decide "try another mover" without
//! inspecting cause chains at every call site.
//!
//! [`MoverControl`]: crate::services::MoverControl

use thiserror::Error;

/// Failure of a single remote mover operation.
#[derive(Debug, Error, Clone)]
pub enum MoverError {
    /// The mover could not be reached at all. Retryable on another mover.
    #[error("mover unavailable: {reason}")]
    Connectivity { reason: String },

    /// The mover was reached but the operation failed.
    #[error("{message}")]
    Application { message: String },
}

impl MoverError {
    pub fn connectivity(reason: impl Into<String>) -> Self {
        Self::Connectivity {
            reason: reason.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// True when the sensible reaction is to try another mover.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }
}

/// Engine-level failures surfaced by the scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The destination has no usable dissemination host.
    #[error("no host available: {reason}")]
    NoHostAvailable { reason: String },

    /// No active, connected mover could be found for a group.
    #[error("no transfer server available: {reason}")]
    NoServerAvailable { reason: String },

    /// A forced-mover list specification could not be parsed.
    #[error("invalid mover list: {reason}")]
    InvalidMoverList { reason: String },

    /// A transfer group referenced by configuration does not exist or is
    /// inactive.
    #[error("transfer group {name} not available")]
    GroupNotAvailable { name: String },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error(transparent)]
    Mover(#[from] MoverError),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl SchedulerError {
    pub fn no_host(reason: impl Into<String>) -> Self {
        Self::NoHostAvailable {
            reason: reason.into(),
        }
    }

    pub fn no_server(reason: impl Into<String>) -> Self {
        Self::NoServerAvailable {
            reason: reason.into(),
        }
    }

    pub fn invalid_mover_list(reason: impl Into<String>) -> Self {
        Self::InvalidMoverList {
            reason: reason.into(),
        }
    }

    /// Capacity-class errors are delayed and retried at step granularity
    /// rather than failing the transfer.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::NoHostAvailable { .. } | Self::NoServerAvailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
