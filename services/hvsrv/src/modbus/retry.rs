//! Uniform retry policy for driver operations

use std::time::Duration;

/// Attempts, pause between attempts and optional verify-after-write tolerance
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Accepted |readback - requested| after a write
    pub verify_tolerance: Option<f64>,
}

impl RetryPolicy {
    /// Register reads: one short retry
    pub fn reads() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(50),
            verify_tolerance: None,
        }
    }

    /// Setpoint writes, verified by reading the setpoint back
    pub fn writes() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
            verify_tolerance: Some(1.0),
        }
    }

    /// Coil writes are not retried
    pub fn coil() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
            verify_tolerance: None,
        }
    }

    pub fn attempts(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.max_attempts.max(1)
    }

    /// Sleep between attempts; no pause after the last one
    pub async fn pause(&self, attempt: u32) {
        if attempt < self.max_attempts && !self.backoff.is_zero() {
            tokio::time::sleep(self.backoff).await;
        }
    }

    pub fn verified(&self, requested: f64, readback: f64) -> bool {
        match self.verify_tolerance {
            Some(tol) => (readback - requested).abs() <= tol,
            None => true,
        }
    }
}
