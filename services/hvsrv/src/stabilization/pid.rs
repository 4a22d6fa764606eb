//! PID with deadband, anti-windup and zero-crossing reset

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidTuning {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_limit: f64,
}

impl Default for PidTuning {
    fn default() -> Self {
        Self {
            kp: 0.05,
            ki: 0.01,
            kd: 0.0,
            integral_limit: 1e6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PidController {
    tuning: PidTuning,
    output_limit: f64,
    integral: f64,
    previous_error: f64,
}

impl PidController {
    /// `output_limit` bounds the magnitude of a single output
    pub fn new(tuning: PidTuning, output_limit: f64) -> Self {
        Self {
            tuning,
            output_limit: output_limit.abs(),
            integral: 0.0,
            previous_error: 0.0,
        }
    }

    pub fn output_limit(&self) -> f64 {
        self.output_limit
    }

    pub fn set_output_limit(&mut self, limit: f64) {
        self.output_limit = limit.abs();
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
    }

    /// Effective integral bound: the configured limit, widened so the
    /// integral term alone can reach twice the output limit
    fn integral_limit(&self) -> f64 {
        if self.tuning.ki != 0.0 {
            self.tuning
                .integral_limit
                .max((2.0 * self.output_limit / self.tuning.ki).abs())
        } else {
            self.tuning.integral_limit
        }
    }

    /// One controller step. Inside the deadband the output is 0 and the
    /// integral decays by 10 %.
    pub fn calculate(&mut self, setpoint: f64, measured: f64, dt: f64, deadband: f64) -> f64 {
        let dt = if dt > 0.0 { dt } else { 1.0 };
        let error = setpoint - measured;

        if deadband > 0.0 && error.abs() <= deadband {
            self.integral *= 0.9;
            self.previous_error = error;
            return 0.0;
        }

        // Sign change means we overshot
        if self.previous_error != 0.0 && error * self.previous_error < 0.0 {
            self.integral = 0.0;
        }

        let p = self.tuning.kp * error;
        let d = self.tuning.kd * (error - self.previous_error) / dt;

        let limit = self.integral_limit();
        let candidate = (self.integral + error * dt).clamp(-limit, limit);

        let output = p + d + self.tuning.ki * candidate;
        let saturated = output.clamp(-self.output_limit, self.output_limit);

        let pushing_further = (saturated >= self.output_limit && error > 0.0)
            || (saturated <= -self.output_limit && error < 0.0);
        if output == saturated || !pushing_further {
            self.integral = candidate;
        }

        self.previous_error = error;
        saturated
    }
}
