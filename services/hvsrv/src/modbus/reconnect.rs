//! Reconnection helper with exponential backoff and jitter
//!
//! The whole attempt sequence races a [`CancellationToken`], so a
//! `disconnect()` issued while the link is being rebuilt ends it promptly.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HvError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconnectError {
    #[error("Maximum reconnection attempts exceeded: {last_error}")]
    MaxAttemptsExceeded { last_error: String },

    #[error("Reconnection cancelled")]
    Cancelled,
}

impl From<ReconnectError> for HvError {
    fn from(err: ReconnectError) -> Self {
        match err {
            ReconnectError::MaxAttemptsExceeded { .. } => HvError::connection(err.to_string()),
            ReconnectError::Cancelled => HvError::cancelled(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Gave up after `max_attempts`
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum attempts per reconnect (0 means unlimited)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// ±25% random spread on each delay
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub last_connected: Option<Instant>,
}

#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    current_attempt: u32,
    state: ConnectionState,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
            state: ConnectionState::Disconnected,
            stats: ReconnectStats::default(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.current_attempt = 0;
        self.stats.last_connected = Some(Instant::now());
        debug!("Connection marked as successful");
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        debug!("Connection marked as disconnected");
    }

    /// Delay before the current attempt: `initial * multiplier^(attempt-1)`,
    /// capped at `max_delay`
    pub fn calculate_next_delay(&self) -> Duration {
        let attempt = self.current_attempt.saturating_sub(1);
        let mut delay = self
            .policy
            .initial_delay
            .mul_f64(self.policy.backoff_multiplier.powi(attempt as i32));

        if delay > self.policy.max_delay {
            delay = self.policy.max_delay;
        }

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    /// Run `connect_fn` until it succeeds, the attempts run out or `cancel`
    /// fires. The first attempt starts immediately.
    pub async fn execute_reconnect<F, Fut, T>(
        &mut self,
        cancel: &CancellationToken,
        mut connect_fn: F,
    ) -> Result<T, ReconnectError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HvError>>,
    {
        self.current_attempt = 0;
        let mut last_error = String::from("no attempt made");

        loop {
            if self.policy.max_attempts > 0 && self.current_attempt >= self.policy.max_attempts {
                self.state = ConnectionState::Failed;
                warn!(
                    "Maximum reconnection attempts ({}) exceeded",
                    self.policy.max_attempts
                );
                return Err(ReconnectError::MaxAttemptsExceeded { last_error });
            }

            self.state = ConnectionState::Reconnecting;
            self.current_attempt += 1;
            self.stats.total_attempts += 1;

            info!(
                "Starting reconnection attempt {}/{}",
                self.current_attempt,
                if self.policy.max_attempts == 0 {
                    "∞".to_string()
                } else {
                    self.policy.max_attempts.to_string()
                }
            );

            if self.current_attempt > 1 {
                let delay = self.calculate_next_delay();
                debug!("Waiting {:?} before reconnection attempt", delay);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.state = ConnectionState::Disconnected;
                        return Err(ReconnectError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let start_time = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.state = ConnectionState::Disconnected;
                    return Err(ReconnectError::Cancelled);
                }
                r = connect_fn(self.current_attempt) => r,
            };

            match result {
                Ok(value) => {
                    info!(
                        "Reconnection successful after {:?} (attempt {})",
                        start_time.elapsed(),
                        self.current_attempt
                    );
                    self.mark_connected();
                    self.stats.successful_reconnects += 1;
                    return Ok(value);
                },
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", self.current_attempt, e);
                    self.stats.failed_reconnects += 1;
                    self.state = ConnectionState::Disconnected;
                    last_error = e.to_string();
                },
            }
        }
    }
}
