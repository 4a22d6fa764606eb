//! Per-tick control decision
//!
//! `Regulator` holds all loop state (filter, slope estimate, coarse/fine
//! mode, oscillation history, PID) and turns one current reading into a
//! [`TickAction`]. It performs no I/O: the controller applies the proposed
//! setpoint and calls [`Regulator::commit`] only when the source accepted
//! it.

use std::collections::VecDeque;

use tokio::time::Instant;

use super::pid::PidController;
use super::{Algorithm, StabilizationParams};

const SLOPE_MIN: f64 = 1e-9;
const SLOPE_MAX: f64 = 1e6;
const APPROACH_STEP: f64 = 1.0;
const MIN_STEP: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Approach,
    Coarse,
    Fine,
}

impl StepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approach => "approach",
            Self::Coarse => "coarse",
            Self::Fine => "fine",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    /// Inside the deadband; `entered` is true on the first tick of a stay
    Stable { entered: bool },
    /// Outside the band but no change this tick (settling or zero step)
    Hold,
    /// Apply `voltage` (= polarity · `set_u`)
    Adjust {
        du: f64,
        set_u: f64,
        voltage: f64,
        mode: StepMode,
    },
}

#[derive(Debug)]
pub struct Regulator {
    params: StabilizationParams,
    pid: PidController,
    polarity: f64,
    set_u: f64,
    filtered: Option<f64>,
    slope: Option<f64>,
    slope_base: Option<(f64, f64)>,
    coarse: bool,
    flips: VecDeque<Instant>,
    last_sign: i8,
    last_set: Instant,
    stable_notified: bool,
}

impl Regulator {
    pub fn new(params: StabilizationParams) -> Self {
        let params = params.normalized();
        let pid = PidController::new(params.tuning, params.max_adjust_voltage);
        Self {
            params,
            pid,
            polarity: 1.0,
            set_u: 0.0,
            filtered: None,
            slope: None,
            slope_base: None,
            coarse: false,
            flips: VecDeque::new(),
            last_sign: 0,
            last_set: Instant::now(),
            stable_notified: false,
        }
    }

    pub fn params(&self) -> &StabilizationParams {
        &self.params
    }

    /// Start a session at `start_voltage`, which has just been applied
    pub fn begin(&mut self, start_voltage: f64, now: Instant) {
        self.pid.reset();
        self.polarity = if start_voltage < 0.0 { -1.0 } else { 1.0 };
        self.set_u = start_voltage.abs();
        self.filtered = None;
        self.slope = None;
        self.slope_base = None;
        self.coarse = false;
        self.flips.clear();
        self.last_sign = 0;
        self.last_set = now;
        self.stable_notified = false;
    }

    pub fn set_u(&self) -> f64 {
        self.set_u
    }

    pub fn voltage(&self) -> f64 {
        self.polarity * self.set_u
    }

    pub fn slope(&self) -> Option<f64> {
        self.slope
    }

    pub fn is_coarse(&self) -> bool {
        self.coarse
    }

    pub fn flip_count(&self) -> usize {
        self.flips.len()
    }

    pub fn pid(&self) -> &PidController {
        &self.pid
    }

    /// Record that the source accepted the setpoint from an `Adjust`
    pub fn commit(&mut self, set_u: f64, now: Instant) {
        self.set_u = set_u;
        self.last_set = now;
    }

    pub fn tick(&mut self, current_ua: f64, now: Instant) -> TickAction {
        let target = self.params.target_current;
        let deadband = self.params.stability_range;
        let dt = self.params.period().as_secs_f64();
        let error = target - current_ua;

        if deadband > 0.0 && error.abs() <= deadband {
            let entered = !self.stable_notified;
            self.stable_notified = true;
            self.pid.calculate(target, current_ua, dt, deadband);
            return TickAction::Stable { entered };
        }
        self.stable_notified = false;

        match self.params.algorithm {
            Algorithm::Approach => self.approach_step(current_ua),
            Algorithm::Pid => self.pid_step(current_ua, error, now),
        }
    }

    fn approach_step(&self, current_ua: f64) -> TickAction {
        let target = self.params.target_current;
        let deadband = self.params.stability_range;
        let max = self.params.max_adjust_voltage;

        let mut du = if current_ua < target - deadband {
            APPROACH_STEP
        } else if current_ua > target + deadband {
            -APPROACH_STEP
        } else {
            0.0
        };
        if max > 0.0 {
            du = du.clamp(-max, max);
        }
        self.propose(du, StepMode::Approach)
    }

    fn pid_step(&mut self, current_ua: f64, error: f64, now: Instant) -> TickAction {
        let target = self.params.target_current;
        let deadband = self.params.stability_range;
        let dt = self.params.period().as_secs_f64();

        let alpha = self.params.filter_alpha;
        let filtered = match self.filtered {
            Some(prev) => alpha * current_ua + (1.0 - alpha) * prev,
            None => current_ua,
        };
        self.filtered = Some(filtered);

        // dI/du from the last operating point, only when u actually moved
        if let Some((last_u, last_i)) = self.slope_base {
            let du = self.set_u - last_u;
            if du.abs() > 1e-9 {
                let slope = (filtered - last_i) / du;
                if slope > SLOPE_MIN && slope < SLOPE_MAX {
                    let a = self.params.slope_alpha;
                    self.slope = Some(match self.slope {
                        Some(est) => a * slope + (1.0 - a) * est,
                        None => slope,
                    });
                }
            }
        }

        let abs_err = error.abs();
        let db = if deadband > 0.0 { deadband } else { 1e-9 };
        let enter = self.params.coarse_enter_mult * db;
        let exit = self.params.coarse_exit_mult * db;
        if self.coarse {
            if abs_err < exit {
                self.coarse = false;
            }
        } else if abs_err > enter {
            self.coarse = true;
        }

        let sign: i8 = if error > 0.0 {
            1
        } else if error < 0.0 {
            -1
        } else {
            0
        };
        if self.last_sign != 0 && sign != 0 && sign != self.last_sign && abs_err > db {
            self.flips.push_back(now);
        }
        self.last_sign = sign;
        let window = self.params.flip_window_duration();
        while self
            .flips
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > window)
        {
            self.flips.pop_front();
        }

        let max_step = self.pid.output_limit();
        let eff_max = max_step * self.damping();

        let settling = now.saturating_duration_since(self.last_set) < self.params.settle();
        let (mut du, mode) = if settling {
            (0.0, StepMode::Fine)
        } else if self.coarse && eff_max > 0.0 {
            let raw = match self.slope {
                Some(slope) if slope > 0.0 => error / slope,
                _ => eff_max / enter.max(1e-9) * error,
            };
            (raw.clamp(-eff_max, eff_max), StepMode::Coarse)
        } else {
            (
                self.pid.calculate(target, filtered, dt, deadband),
                StepMode::Fine,
            )
        };

        // Higher u means more current
        if (error < 0.0 && du > 0.0) || (error > 0.0 && du < 0.0) {
            du = 0.0;
        }

        if du != 0.0 {
            let min_step = if eff_max > 0.0 {
                MIN_STEP.min(eff_max)
            } else {
                MIN_STEP
            };
            if du.abs() < min_step {
                du = min_step.copysign(du);
            }
        }

        self.slope_base = Some((self.set_u, filtered));
        self.propose(du, mode)
    }

    /// Step scale from recent sign flips: 1.0 below three flips, then
    /// halving per flip down to 0.1
    fn damping(&self) -> f64 {
        let flips = self.flips.len();
        if flips >= 3 {
            0.5f64.powi(flips as i32 - 2).max(0.1)
        } else {
            1.0
        }
    }

    fn propose(&self, du: f64, mode: StepMode) -> TickAction {
        if du == 0.0 {
            return TickAction::Hold;
        }
        let set_u = (self.set_u + du).max(0.0);
        TickAction::Adjust {
            du,
            set_u,
            voltage: self.polarity * set_u,
            mode,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn params(algorithm: Algorithm) -> StabilizationParams {
        StabilizationParams {
            target_current: 100.0,
            stability_range: 2.0,
            start_voltage: 500.0,
            max_adjust_voltage: 20.0,
            algorithm,
            ..StabilizationParams::default()
        }
    }

    fn started(algorithm: Algorithm) -> (Regulator, Instant) {
        let mut reg = Regulator::new(params(algorithm));
        let t0 = Instant::now();
        reg.begin(500.0, t0);
        let ready = t0 + reg.params().settle() + Duration::from_millis(1);
        (reg, ready)
    }

    fn apply(reg: &mut Regulator, action: &TickAction, now: Instant) {
        if let TickAction::Adjust { set_u, .. } = action {
            reg.commit(*set_u, now);
        }
    }

    // ========================================================================
    // Approach
    // ========================================================================

    #[test]
    fn test_approach_steps_one_volt() {
        let (mut reg, now) = started(Algorithm::Approach);

        let up = reg.tick(80.0, now);
        assert!(matches!(up, TickAction::Adjust { du, voltage, .. } if du == 1.0 && voltage == 501.0));
        apply(&mut reg, &up, now);

        let down = reg.tick(120.0, now);
        assert!(matches!(down, TickAction::Adjust { du, voltage, .. } if du == -1.0 && voltage == 500.0));
    }

    #[test]
    fn test_approach_step_clamped_by_max_adjust() {
        let mut p = params(Algorithm::Approach);
        p.max_adjust_voltage = 0.25;
        let mut reg = Regulator::new(p);
        reg.begin(10.0, Instant::now());
        let action = reg.tick(0.0, Instant::now());
        assert!(matches!(action, TickAction::Adjust { du, .. } if du == 0.25));
    }

    // ========================================================================
    // Deadband
    // ========================================================================

    #[test]
    fn test_stable_reported_once_per_entry() {
        let (mut reg, now) = started(Algorithm::Pid);
        assert_eq!(reg.tick(99.0, now), TickAction::Stable { entered: true });
        assert_eq!(reg.tick(101.0, now), TickAction::Stable { entered: false });

        let _ = reg.tick(150.0, now);
        assert_eq!(reg.tick(100.0, now), TickAction::Stable { entered: true });
    }

    // ========================================================================
    // PID path
    // ========================================================================

    #[test]
    fn test_large_error_enters_coarse_mode() {
        let (mut reg, now) = started(Algorithm::Pid);
        // |e| = 50 > 6 * 2
        let action = reg.tick(50.0, now);
        assert!(reg.is_coarse());
        match action {
            TickAction::Adjust { du, mode, .. } => {
                assert_eq!(mode, StepMode::Coarse);
                // no slope yet: 20 / 12 * 50, clamped to 20
                assert_eq!(du, 20.0);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_coarse_hysteresis() {
        let (mut reg, now) = started(Algorithm::Pid);
        reg.tick(50.0, now);
        assert!(reg.is_coarse());
        // 8 is below the enter threshold (12) but above exit (5)
        reg.tick(92.0, now);
        assert!(reg.is_coarse());
        reg.tick(96.0, now);
        assert!(!reg.is_coarse());
    }

    #[test]
    fn test_settle_time_holds() {
        let mut reg = Regulator::new(params(Algorithm::Pid));
        let t0 = Instant::now();
        reg.begin(500.0, t0);
        assert_eq!(reg.tick(50.0, t0 + Duration::from_millis(500)), TickAction::Hold);
    }

    #[test]
    fn test_slope_estimate_drives_coarse_step() {
        let (mut reg, now) = started(Algorithm::Pid);
        let first = reg.tick(50.0, now);
        apply(&mut reg, &first, now);
        assert_eq!(reg.set_u(), 520.0);

        // after +20 V the filtered current moved by 0.3 * 20 = 6 µA
        let later = now + Duration::from_secs(2);
        let second = reg.tick(70.0, later);
        let slope = reg.slope().unwrap();
        assert!((slope - 0.3).abs() < 1e-9);
        assert!(matches!(second, TickAction::Adjust { du, .. } if du == 20.0));
    }

    #[test]
    fn test_fine_step_raised_to_minimum() {
        let (mut reg, now) = started(Algorithm::Pid);
        // fine mode, small positive error: PID output 0.05*4 + 0.01*4 = 0.24,
        // raised to the 1 V minimum
        match reg.tick(96.0, now) {
            TickAction::Adjust { du, mode, .. } => {
                assert_eq!(mode, StepMode::Fine);
                assert_eq!(du, 1.0);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sign_flips_shrink_step() {
        let (mut reg, now) = started(Algorithm::Pid);
        let mut t = now;
        for current in [50.0, 150.0, 50.0, 150.0] {
            t += Duration::from_secs(2);
            let _ = reg.tick(current, t);
        }
        assert_eq!(reg.flip_count(), 3);
        assert!((reg.damping() - 0.5).abs() < 1e-9);

        // flips expire after the window
        t += Duration::from_secs(30);
        let _ = reg.tick(150.0, t);
        assert_eq!(reg.flip_count(), 0);
    }

    #[test]
    fn test_setpoint_never_negative() {
        let mut reg = Regulator::new(params(Algorithm::Approach));
        let t0 = Instant::now();
        reg.begin(0.0, t0);
        assert!(matches!(
            reg.tick(500.0, t0),
            TickAction::Adjust { set_u, .. } if set_u == 0.0
        ));
    }

    #[test]
    fn test_negative_polarity() {
        let mut reg = Regulator::new(params(Algorithm::Approach));
        let t0 = Instant::now();
        reg.begin(-300.0, t0);
        assert_eq!(reg.voltage(), -300.0);
        assert!(matches!(
            reg.tick(10.0, t0),
            TickAction::Adjust { voltage, .. } if voltage == -301.0
        ));
    }
}
