//! Error taxonomy shared by provider adapters, the coordinator and LAN sessions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a measurement run ended without a result.
///
/// Every adapter and LAN phase classifies its I/O faults into one of these
/// variants; nothing else crosses the coordinator boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeasurementError {
    /// Connect or handshake failure.
    #[error("{0}")]
    Unreachable(String),

    /// A probe or phase exceeded its bound.
    #[error("{0}")]
    Timeout(String),

    /// Version or handshake content was not what we expected.
    #[error("{0}")]
    ProtocolMismatch(String),

    /// Subprocess non-zero exit, HTTP non-2xx, malformed output.
    #[error("{0}")]
    BackendFailure(String),

    /// User- or system-initiated cancellation.
    #[error("cancelled")]
    Cancelled,
}

impl MeasurementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeasurementError::Unreachable(_) => ErrorKind::Unreachable,
            MeasurementError::Timeout(_) => ErrorKind::Timeout,
            MeasurementError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            MeasurementError::BackendFailure(_) => ErrorKind::BackendFailure,
            MeasurementError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MeasurementError::Cancelled)
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        MeasurementError::BackendFailure(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        MeasurementError::Timeout(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        MeasurementError::Unreachable(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        MeasurementError::ProtocolMismatch(msg.into())
    }
}

/// Serializable tag for [`MeasurementError`], carried on results so consumers
/// can tell a user cancellation apart from a real failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    Timeout,
    ProtocolMismatch,
    BackendFailure,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Unreachable => write!(f, "unreachable"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::ProtocolMismatch => write!(f, "protocol_mismatch"),
            ErrorKind::BackendFailure => write!(f, "backend_failure"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Precondition failures of a coordinator invocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("a measurement run is already in progress")]
    AlreadyRunning,

    #[error("no providers configured")]
    NoProviders,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
