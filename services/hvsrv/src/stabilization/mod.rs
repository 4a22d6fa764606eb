//! Closed-loop current stabilization
//!
//! [`StabilizationController`] owns one control session. Each tick reads a
//! current (from the source itself or a meter channel), feeds it through a
//! [`Regulator`] and applies the resulting setpoint to a
//! [`VoltageSource`](crate::source::VoltageSource).

pub mod controller;
pub mod pid;
pub mod regulator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HvError, HvResult};

pub use controller::{StabilizationController, StabilizationEvent};
pub use pid::{PidController, PidTuning};
pub use regulator::{Regulator, TickAction};

const DEFAULT_FILTER_ALPHA: f64 = 0.3;
const MIN_PERIOD: Duration = Duration::from_secs(1);
/// Upper bound for any configured delay
const MAX_SECONDS: f64 = 86_400.0;

/// Seconds to a `Duration`. Non-finite input takes `fallback`; the rest is
/// clamped to `0..=MAX_SECONDS`.
fn seconds(value: f64, fallback: f64) -> Duration {
    let value = if value.is_finite() { value } else { fallback };
    Duration::from_secs_f64(value.clamp(0.0, MAX_SECONDS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Pid,
    /// Fixed 1 V steps toward the band
    Approach,
}

/// Where the controlled current is measured
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentSource {
    /// The voltage source's own current readback
    #[default]
    Source,
    /// A meter channel published on the [`MeterFeed`](crate::meter::MeterFeed)
    Meter(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationParams {
    /// µA
    pub target_current: f64,
    /// Deadband half-width in µA
    pub stability_range: f64,
    pub start_voltage: f64,
    /// Tick period in seconds
    pub adjust_frequency: f64,
    /// Largest setpoint change per tick in volts
    pub max_adjust_voltage: f64,
    pub algorithm: Algorithm,
    pub current_source: CurrentSource,
    pub tuning: PidTuning,
    pub filter_alpha: f64,
    pub slope_alpha: f64,
    pub coarse_enter_mult: f64,
    pub coarse_exit_mult: f64,
    /// Seconds to wait after a setpoint change before adjusting again
    pub settle_time: f64,
    /// Seconds of sign-flip history used for oscillation damping
    pub flip_window: f64,
    /// Meter readings older than this many seconds are ignored
    pub meter_timeout: f64,
}

impl Default for StabilizationParams {
    fn default() -> Self {
        Self {
            target_current: 1000.0,
            stability_range: 5.0,
            start_voltage: 100.0,
            adjust_frequency: 1.0,
            max_adjust_voltage: 50.0,
            algorithm: Algorithm::Pid,
            current_source: CurrentSource::Source,
            tuning: PidTuning::default(),
            filter_alpha: DEFAULT_FILTER_ALPHA,
            slope_alpha: 0.4,
            coarse_enter_mult: 6.0,
            coarse_exit_mult: 2.5,
            settle_time: 1.2,
            flip_window: 12.0,
            meter_timeout: 3.0,
        }
    }
}

impl StabilizationParams {
    /// Replace out-of-range tuning values with their working fallbacks
    pub fn normalized(mut self) -> Self {
        if !(self.filter_alpha > 0.0 && self.filter_alpha < 1.0) {
            self.filter_alpha = DEFAULT_FILTER_ALPHA;
        }
        if !(self.slope_alpha > 0.0 && self.slope_alpha <= 1.0) {
            self.slope_alpha = 0.4;
        }
        if self.coarse_exit_mult >= self.coarse_enter_mult {
            self.coarse_exit_mult = (self.coarse_enter_mult * 0.5).max(1.5);
        }
        let defaults = Self::default();
        if !self.adjust_frequency.is_finite() || self.adjust_frequency <= 0.0 {
            self.adjust_frequency = defaults.adjust_frequency;
        }
        if !self.settle_time.is_finite() {
            self.settle_time = defaults.settle_time;
        }
        if !self.flip_window.is_finite() {
            self.flip_window = defaults.flip_window;
        }
        if !self.meter_timeout.is_finite() {
            self.meter_timeout = defaults.meter_timeout;
        }
        if !self.stability_range.is_finite() {
            self.stability_range = defaults.stability_range;
        }
        self.stability_range = self.stability_range.max(0.0);
        self
    }

    /// Tick period, never shorter than one second
    pub fn period(&self) -> Duration {
        seconds(self.adjust_frequency, 1.0).max(MIN_PERIOD)
    }

    pub fn settle(&self) -> Duration {
        seconds(self.settle_time, 1.2)
    }

    pub fn flip_window_duration(&self) -> Duration {
        seconds(self.flip_window, 12.0)
    }

    pub fn meter_max_age(&self) -> Duration {
        seconds(self.meter_timeout, 3.0)
    }

    /// Values no session can run with
    pub fn check(&self) -> HvResult<()> {
        if !self.target_current.is_finite() || !self.stability_range.is_finite() {
            return Err(HvError::config(
                "target_current and stability_range must be finite",
            ));
        }
        if self.target_current < 0.0 || self.stability_range < 0.0 {
            return Err(HvError::config(
                "target_current and stability_range must be >= 0",
            ));
        }
        if !self.start_voltage.is_finite() {
            return Err(HvError::config("start_voltage must be finite"));
        }
        if !self.max_adjust_voltage.is_finite() || self.max_adjust_voltage <= 0.0 {
            return Err(HvError::config("max_adjust_voltage must be positive"));
        }
        Ok(())
    }
}
