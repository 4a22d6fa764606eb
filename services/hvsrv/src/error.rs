//! Error handling for the high-voltage service
//!
//! Every expected failure of the core (device silent, bad frame, file locked,
//! maintenance refused) is a typed `HvError`. Raw I/O and driver errors are
//! converted at the actor boundary and never escape as panics.

use errors::{ErrorCategory, VoltageError, VoltageErrorTrait};
use thiserror::Error;

/// High-voltage service error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HvError {
    /// Port open failure or address probe failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// CRC mismatch, length mismatch, exception response or malformed reply
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// No response within the allotted budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Destination file is held by another process
    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    /// Request rejected by an operating rule (e.g. maintenance while recording)
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Operation on a closed or never-opened port
    #[error("Port not open: {0}")]
    NotOpen(String),

    /// Database errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Invalid configuration or parameters
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Operation abandoned because its owner is shutting down
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// Result type alias for the high-voltage service
pub type HvResult<T> = std::result::Result<T, HvError>;

impl HvError {
    pub fn connection(msg: impl Into<String>) -> Self {
        HvError::ConnectionError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        HvError::ProtocolError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        HvError::Timeout(msg.into())
    }

    pub fn locked(msg: impl Into<String>) -> Self {
        HvError::ResourceLocked(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        HvError::PolicyViolation(msg.into())
    }

    pub fn not_open(msg: impl Into<String>) -> Self {
        HvError::NotOpen(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        HvError::StorageError(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        HvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        HvError::IoError(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        HvError::Cancelled(msg.into())
    }

    /// Failures that count toward the driver's reconnect threshold
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ProtocolError(_) | Self::NotOpen(_) | Self::IoError(_)
        )
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for HvError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => HvError::Timeout(err.to_string()),
            std::io::ErrorKind::PermissionDenied => HvError::ResourceLocked(err.to_string()),
            _ => HvError::IoError(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for HvError {
    fn from(err: sqlx::Error) -> Self {
        HvError::StorageError(err.to_string())
    }
}

impl From<csv::Error> for HvError {
    fn from(err: csv::Error) -> Self {
        match err.kind() {
            csv::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                HvError::ResourceLocked(err.to_string())
            },
            _ => HvError::IoError(format!("CSV: {err}")),
        }
    }
}

impl From<serde_json::Error> for HvError {
    fn from(err: serde_json::Error) -> Self {
        HvError::StorageError(format!("JSON: {err}"))
    }
}

impl From<tokio_serial::Error> for HvError {
    fn from(err: tokio_serial::Error) -> Self {
        HvError::ConnectionError(err.to_string())
    }
}

impl From<anyhow::Error> for HvError {
    fn from(err: anyhow::Error) -> Self {
        HvError::StorageError(format!("{err:#}"))
    }
}

// ============================================================================
// Conversion from HvError to VoltageError for process boundaries
// ============================================================================

impl From<HvError> for VoltageError {
    fn from(err: HvError) -> Self {
        match err {
            HvError::ConnectionError(msg) => VoltageError::ConnectionFailed {
                endpoint: "hvsrv".to_string(),
                reason: msg,
            },
            HvError::ProtocolError(msg) => VoltageError::Protocol {
                protocol: "modbus-rtu".to_string(),
                message: msg,
            },
            HvError::Timeout(msg) => VoltageError::Timeout(msg),
            HvError::ResourceLocked(msg) => VoltageError::ResourceBusy(msg),
            HvError::PolicyViolation(msg) => VoltageError::PolicyViolation(msg),
            HvError::NotOpen(msg) => VoltageError::Communication(msg),
            HvError::StorageError(msg) => VoltageError::Database(msg),
            HvError::ConfigError(msg) => VoltageError::Configuration(msg),
            HvError::IoError(msg) => VoltageError::Io(std::io::Error::other(msg)),
            HvError::Cancelled(msg) => VoltageError::Cancelled(msg),
        }
    }
}

// ============================================================================
// HvError implements VoltageErrorTrait
// ============================================================================

impl VoltageErrorTrait for HvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionError(_) => "HVSRV_CONNECTION_ERROR",
            Self::ProtocolError(_) => "HVSRV_PROTOCOL_ERROR",
            Self::Timeout(_) => "HVSRV_TIMEOUT",
            Self::ResourceLocked(_) => "HVSRV_RESOURCE_LOCKED",
            Self::PolicyViolation(_) => "HVSRV_POLICY_VIOLATION",
            Self::NotOpen(_) => "HVSRV_NOT_OPEN",
            Self::StorageError(_) => "HVSRV_STORAGE_ERROR",
            Self::ConfigError(_) => "HVSRV_CONFIG_ERROR",
            Self::IoError(_) => "HVSRV_IO_ERROR",
            Self::Cancelled(_) => "HVSRV_CANCELLED",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionError(_) | Self::NotOpen(_) => ErrorCategory::Connection,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::ResourceLocked(_) => ErrorCategory::ResourceBusy,
            Self::PolicyViolation(_) => ErrorCategory::Conflict,
            Self::StorageError(_) => ErrorCategory::Database,
            Self::ConfigError(_) => ErrorCategory::Configuration,
            Self::IoError(_) | Self::Cancelled(_) => ErrorCategory::Internal,
        }
    }
}
