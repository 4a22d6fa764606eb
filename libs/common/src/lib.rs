//! Shared building blocks for the high-voltage test services
//!
//! - logging bootstrap (daily rolling files, SIGHUP reopen, archive compression)
//! - layered configuration loading
//! - SQLite client tuned for data logging
//! - shutdown signal handling
//! - hex rendering for frame traces

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod config_loader;
pub mod hex;
pub mod logging;
pub mod shutdown;
