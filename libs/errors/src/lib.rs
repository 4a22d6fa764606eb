//! Unified error handling for the high-voltage test services
//!
//! Services keep their own domain error types and convert into [`VoltageError`]
//! at process boundaries. [`VoltageErrorTrait`] gives every error a common
//! code, category and retry hint for logs and operator reports.

use thiserror::Error;

// ============================================================================
// VoltageError - Main error type
// ============================================================================

/// Main error type shared by all services
#[derive(Debug, Error)]
pub enum VoltageError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Database Errors
    // ======================================
    #[error("Database error: {0}")]
    Database(String),

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    // ======================================
    // Policy Errors
    // ======================================
    #[error("Operation rejected by policy: {0}")]
    PolicyViolation(String),

    // ======================================
    // Resource Errors
    // ======================================
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// Result type alias using VoltageError
pub type VoltageResult<T> = Result<T, VoltageError>;

// ============================================================================
// VoltageError implements VoltageErrorTrait
// ============================================================================

impl VoltageErrorTrait for VoltageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::PolicyViolation(_) => "POLICY_VIOLATION",
            Self::ResourceBusy(_) => "RESOURCE_BUSY",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Cancelled(_) => "CANCELLED",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Database(_) => ErrorCategory::Database,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::ConnectionFailed { .. } => ErrorCategory::Connection,
            Self::Communication(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::PolicyViolation(_) => ErrorCategory::Conflict,
            Self::ResourceBusy(_) => ErrorCategory::ResourceBusy,
            Self::Io(_)
            | Self::Serialization(_)
            | Self::StartupFailed(_)
            | Self::Cancelled(_) => ErrorCategory::Internal,
        }
    }
}

// ============================================================================
// Error capability trait
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Database,
    Network,
    Timeout,

    // Business logic layer
    Conflict,

    // Device communication layer
    Protocol,
    Connection,

    // System level
    Internal,
    ResourceBusy,
}

/// Error capability trait
///
/// Each service keeps its own domain-specific error type and gains a common
/// outward-facing interface by implementing this trait.
pub trait VoltageErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and reports)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::ResourceBusy
                | ErrorCategory::Protocol
        )
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Database => Level::ERROR,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol => Level::WARN,
            ErrorCategory::Conflict => Level::INFO,
            ErrorCategory::Configuration | ErrorCategory::ResourceBusy => Level::WARN,
        }
    }
}
