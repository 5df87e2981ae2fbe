//! Per-vehicle behavior parameters.
//!
//! Parameters are set from outside between frames and are read-only while a
//! frame is in flight. The table holds a global default plus per-actor
//! overrides; stages resolve through [`Parameters::for_actor`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::simulation_state::ActorId;

/// Forced lane-change directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaneChange {
    Left,
    Right,
}

/// Tunable behavior of one vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleParameters {
    /// Percentage shaved off (positive) or added to (negative) the posted
    /// speed limit.
    pub speed_limit_delta_pct: f64,
    /// Exact desired speed in m/s; overrides the limit-derived target.
    pub desired_speed: Option<f64>,
    /// Minimum following distance behind a lead vehicle, meters.
    pub following_distance: f64,
    /// Whether rule-triggered lane changes are allowed at all.
    pub auto_lane_change: bool,
    /// One-shot forced lane change, consumed when executed.
    pub force_lane_change: Option<LaneChange>,
    /// Percentage chance per opportunity of drifting back to the right lane.
    pub keep_right_pct: f64,
    /// Percentage chance per opportunity of a spontaneous left change.
    pub random_left_pct: f64,
    /// Percentage chance per opportunity of a spontaneous right change.
    pub random_right_pct: f64,
    /// Percentage chance per frame of ignoring all other vehicles.
    pub ignore_vehicles_pct: f64,
    /// Percentage chance of driving through a stopping light.
    pub run_light_pct: f64,
    /// Percentage chance of skipping the unsignalised-junction protocol.
    pub run_sign_pct: f64,
    /// Lateral offset from the lane centerline, meters, positive right.
    pub lane_offset: f64,
    /// Actors this vehicle never negotiates with.
    pub collision_exempt: HashSet<ActorId>,
}

impl Default for VehicleParameters {
    fn default() -> Self {
        Self {
            speed_limit_delta_pct: 0.0,
            desired_speed: None,
            following_distance: 2.0,
            auto_lane_change: true,
            force_lane_change: None,
            keep_right_pct: 0.0,
            random_left_pct: 0.0,
            random_right_pct: 0.0,
            ignore_vehicles_pct: 0.0,
            run_light_pct: 0.0,
            run_sign_pct: 0.0,
            lane_offset: 0.0,
            collision_exempt: HashSet::new(),
        }
    }
}

impl VehicleParameters {
    pub fn with_speed_delta(mut self, pct: f64) -> Self {
        self.speed_limit_delta_pct = pct;
        self
    }

    pub fn with_desired_speed(mut self, speed: f64) -> Self {
        self.desired_speed = Some(speed);
        self
    }

    pub fn with_following_distance(mut self, meters: f64) -> Self {
        self.following_distance = meters;
        self
    }

    pub fn with_ignore_vehicles(mut self, pct: f64) -> Self {
        self.ignore_vehicles_pct = pct;
        self
    }

    pub fn with_run_light(mut self, pct: f64) -> Self {
        self.run_light_pct = pct;
        self
    }

    pub fn without_auto_lane_change(mut self) -> Self {
        self.auto_lane_change = false;
        self
    }

    /// Desired cruise speed given the posted limit, m/s.
    pub fn target_speed(&self, speed_limit: f64) -> f64 {
        match self.desired_speed {
            Some(exact) => exact,
            None => speed_limit * (1.0 - self.speed_limit_delta_pct / 100.0),
        }
    }
}

/// Default plus per-actor overrides.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    default: VehicleParameters,
    overrides: HashMap<ActorId, VehicleParameters>,
}

impl Parameters {
    pub fn new(default: VehicleParameters) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn set(&mut self, actor: ActorId, parameters: VehicleParameters) {
        self.overrides.insert(actor, parameters);
    }

    pub fn remove(&mut self, actor: ActorId) {
        self.overrides.remove(&actor);
    }

    pub fn for_actor(&self, actor: ActorId) -> &VehicleParameters {
        self.overrides.get(&actor).unwrap_or(&self.default)
    }

    /// Clears a consumed one-shot lane-change directive.
    pub fn clear_force_lane_change(&mut self, actor: ActorId) {
        if let Some(parameters) = self.overrides.get_mut(&actor) {
            parameters.force_lane_change = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn speed_delta_scales_the_limit() {
        let parameters = VehicleParameters::default().with_speed_delta(30.0);
        assert_relative_eq!(parameters.target_speed(10.0), 7.0);
    }

    #[test]
    fn exact_speed_overrides_the_limit() {
        let parameters = VehicleParameters::default()
            .with_speed_delta(30.0)
            .with_desired_speed(25.0);
        assert_relative_eq!(parameters.target_speed(10.0), 25.0);
    }

    #[test]
    fn overrides_fall_back_to_the_default() {
        let mut table = Parameters::new(VehicleParameters::default().with_speed_delta(10.0));
        table.set(5, VehicleParameters::default().with_speed_delta(50.0));
        assert_relative_eq!(table.for_actor(5).speed_limit_delta_pct, 50.0);
        assert_relative_eq!(table.for_actor(6).speed_limit_delta_pct, 10.0);
    }
}
