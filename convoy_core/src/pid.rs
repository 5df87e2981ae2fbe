//! Longitudinal and lateral PID controllers.
//!
//! Gains come in urban and highway sets; the motion planner picks per frame
//! based on current speed. State is per vehicle and persists across frames,
//! reset on re-registration or after a speed discontinuity.

use serde::{Deserialize, Serialize};

use crate::constants::pid;

/// One `[kp, ki, kd]` gain triple.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl From<[f64; 3]> for PidGains {
    fn from(g: [f64; 3]) -> Self {
        Self {
            kp: g[0],
            ki: g[1],
            kd: g[2],
        }
    }
}

/// Urban and highway gain sets for both control axes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GainSchedule {
    pub longitudinal_urban: PidGains,
    pub longitudinal_highway: PidGains,
    pub lateral_urban: PidGains,
    pub lateral_highway: PidGains,
}

impl Default for GainSchedule {
    fn default() -> Self {
        Self {
            longitudinal_urban: pid::LONGITUDINAL_PARAM.into(),
            longitudinal_highway: pid::LONGITUDINAL_HIGHWAY_PARAM.into(),
            lateral_urban: pid::LATERAL_PARAM.into(),
            lateral_highway: pid::LATERAL_HIGHWAY_PARAM.into(),
        }
    }
}

/// Persistent controller state for one vehicle.
#[derive(Debug, Clone, Default)]
pub struct PidState {
    pub velocity_integral: f64,
    pub previous_velocity_error: f64,
    pub steering_integral: f64,
    pub previous_steering_error: f64,
    /// Steer command issued last frame, used to rate-limit steering.
    pub previous_steer: f64,
    /// Speed measured last frame, used to detect discontinuities.
    pub previous_speed: f64,
}

impl PidState {
    /// Clears accumulators after a teleport or re-registration.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Final control command handed to the physics layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleControl {
    /// Throttle in `[0, 1]`.
    pub throttle: f64,
    /// Brake in `[0, 1]`.
    pub brake: f64,
    /// Steering in `[-1, 1]`, positive right.
    pub steer: f64,
}

impl VehicleControl {
    /// Full brake, zero throttle, steering held.
    pub fn emergency_stop(steer: f64) -> Self {
        Self {
            throttle: 0.0,
            brake: 1.0,
            steer,
        }
    }
}

/// One longitudinal step. Returns `(throttle, brake)`.
pub fn run_longitudinal(
    state: &mut PidState,
    gains: &PidGains,
    dt: f64,
    current_speed: f64,
    target_speed: f64,
) -> (f64, f64) {
    let error = target_speed - current_speed;
    state.velocity_integral += error * dt;
    let derivative = (error - state.previous_velocity_error) / dt;
    state.previous_velocity_error = error;

    let output = gains.kp * error + gains.ki * state.velocity_integral + gains.kd * derivative;
    // Expression in [-1, 1]; positive drives, negative brakes.
    let output = (output / target_speed.max(1e-3)).clamp(-1.0, 1.0);

    if output >= 0.0 {
        (output.min(pid::MAX_THROTTLE), 0.0)
    } else {
        (0.0, (-output).min(pid::MAX_BRAKE))
    }
}

/// One lateral step. Returns the steer command.
///
/// `heading_error` is the signed angle, radians, from the vehicle heading to
/// the direction of the target waypoint, positive when the target is to the
/// right.
pub fn run_lateral(state: &mut PidState, gains: &PidGains, dt: f64, heading_error: f64) -> f64 {
    state.steering_integral = (state.steering_integral + heading_error * dt).clamp(-1.0, 1.0);
    let derivative = (heading_error - state.previous_steering_error) / dt;
    state.previous_steering_error = heading_error;

    let raw = gains.kp * heading_error + gains.ki * state.steering_integral + gains.kd * derivative;
    let bounded = raw.clamp(-pid::MAX_STEERING, pid::MAX_STEERING);

    // Rate-limit against last frame's command to avoid steering snaps.
    let limited = bounded.clamp(
        state.previous_steer - pid::MAX_STEERING_DIFF,
        state.previous_steer + pid::MAX_STEERING_DIFF,
    );
    state.previous_steer = limited;
    limited
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn below_target_produces_throttle() {
        let mut state = PidState::default();
        let gains: PidGains = pid::LONGITUDINAL_PARAM.into();
        let (throttle, brake) = run_longitudinal(&mut state, &gains, 0.05, 5.0, 10.0);
        assert!(throttle > 0.0);
        assert_relative_eq!(brake, 0.0);
        assert!(throttle <= pid::MAX_THROTTLE);
    }

    #[test]
    fn above_target_produces_brake() {
        let mut state = PidState::default();
        let gains: PidGains = pid::LONGITUDINAL_PARAM.into();
        let (throttle, brake) = run_longitudinal(&mut state, &gains, 0.05, 15.0, 10.0);
        assert_relative_eq!(throttle, 0.0);
        assert!(brake > 0.0);
        assert!(brake <= pid::MAX_BRAKE);
    }

    #[test]
    fn steering_is_rate_limited_between_frames() {
        let mut state = PidState::default();
        let gains: PidGains = pid::LATERAL_PARAM.into();
        let first = run_lateral(&mut state, &gains, 0.05, 1.5);
        assert_relative_eq!(first, pid::MAX_STEERING_DIFF);
        let second = run_lateral(&mut state, &gains, 0.05, 1.5);
        assert!(second <= 2.0 * pid::MAX_STEERING_DIFF + 1e-12);
    }

    #[test]
    fn reset_clears_accumulated_state() {
        let mut state = PidState::default();
        let gains: PidGains = pid::LONGITUDINAL_PARAM.into();
        run_longitudinal(&mut state, &gains, 0.05, 5.0, 10.0);
        assert!(state.velocity_integral != 0.0);
        state.reset();
        assert_relative_eq!(state.velocity_integral, 0.0);
        assert_relative_eq!(state.previous_velocity_error, 0.0);
    }
}
