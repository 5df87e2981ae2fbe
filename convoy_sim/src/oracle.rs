//! Ground-truth vehicle physics for scenario runs.
//!
//! The oracle owns every vehicle's true kinematic state and integrates the
//! manager's control commands with a deliberately simple model: constant
//! gains for throttle and brake, yaw rate proportional to steering. The
//! manager treats these states as ground truth; nothing here feeds back
//! into its internals except through the per-frame snapshot.

use std::collections::{BTreeMap, HashMap};

use convoy_core::{ActorId, ControlSink, KinematicState, SimulationState, VehicleControl};
use nalgebra::{Rotation3, Vector3};

/// Full-throttle acceleration, m/s^2.
const THROTTLE_ACCEL: f64 = 3.5;
/// Full-brake deceleration, m/s^2.
const BRAKE_DECEL: f64 = 8.0;
/// Linear drag coefficient, 1/s.
const DRAG: f64 = 0.05;
/// Yaw rate at full steering, rad/s.
const MAX_YAW_RATE: f64 = 1.2;
/// Below this speed steering authority fades linearly to zero.
const STEER_FADE_SPEED: f64 = 2.0;

/// True state of one simulated vehicle.
#[derive(Debug, Clone)]
pub struct GroundTruthVehicle {
    pub position: Vector3<f64>,
    pub heading: Vector3<f64>,
    pub speed: f64,
    pub speed_limit: f64,
}

/// Ground-truth physics engine and snapshot source.
#[derive(Debug, Default)]
pub struct Oracle {
    vehicles: BTreeMap<ActorId, GroundTruthVehicle>,
    pending: HashMap<ActorId, VehicleControl>,
    frame: u64,
    time: f64,
}

impl Oracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_vehicle(
        &mut self,
        actor: ActorId,
        position: Vector3<f64>,
        heading: Vector3<f64>,
        speed: f64,
        speed_limit: f64,
    ) {
        self.vehicles.insert(
            actor,
            GroundTruthVehicle {
                position,
                heading: heading.normalize(),
                speed,
                speed_limit,
            },
        );
    }

    pub fn despawn_vehicle(&mut self, actor: ActorId) {
        self.vehicles.remove(&actor);
        self.pending.remove(&actor);
    }

    pub fn vehicle(&self, actor: ActorId) -> Option<&GroundTruthVehicle> {
        self.vehicles.get(&actor)
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Distance between two vehicles, infinity when either is missing.
    pub fn gap(&self, a: ActorId, b: ActorId) -> f64 {
        match (self.vehicles.get(&a), self.vehicles.get(&b)) {
            (Some(va), Some(vb)) => (va.position - vb.position).norm(),
            _ => f64::INFINITY,
        }
    }

    /// Immutable snapshot for the upcoming manager tick.
    pub fn snapshot(&self, dt: f64) -> SimulationState {
        let mut snapshot = SimulationState::new(self.frame, dt);
        for (&actor, vehicle) in &self.vehicles {
            snapshot.insert(
                actor,
                KinematicState::new(vehicle.position, vehicle.heading)
                    .with_velocity(vehicle.heading * vehicle.speed)
                    .with_speed_limit(vehicle.speed_limit),
            );
        }
        snapshot
    }

    /// Integrates all vehicles one step with their latest controls.
    pub fn step(&mut self, dt: f64) {
        for (actor, vehicle) in self.vehicles.iter_mut() {
            let control = self.pending.get(actor).copied().unwrap_or_default();
            let accel =
                control.throttle * THROTTLE_ACCEL - control.brake * BRAKE_DECEL - DRAG * vehicle.speed;
            vehicle.speed = (vehicle.speed + accel * dt).max(0.0);

            // Positive steer turns right, a clockwise rotation seen from +z.
            let authority = (vehicle.speed / STEER_FADE_SPEED).min(1.0);
            let yaw = -control.steer * MAX_YAW_RATE * authority * dt;
            if yaw.abs() > 0.0 {
                vehicle.heading =
                    Rotation3::from_axis_angle(&Vector3::z_axis(), yaw) * vehicle.heading;
            }
            vehicle.position += vehicle.heading * vehicle.speed * dt;
        }
        self.pending.clear();
        self.frame += 1;
        self.time += dt;
    }
}

impl ControlSink for Oracle {
    fn apply_control(&mut self, actor: ActorId, control: VehicleControl) {
        self.pending.insert(actor, control);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_accelerates_and_brake_stops() {
        let mut oracle = Oracle::new();
        oracle.spawn_vehicle(1, Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0), 0.0, 13.89);
        for _ in 0..40 {
            oracle.apply_control(
                1,
                VehicleControl {
                    throttle: 0.8,
                    brake: 0.0,
                    steer: 0.0,
                },
            );
            oracle.step(0.05);
        }
        let cruising = oracle.vehicle(1).unwrap().speed;
        assert!(cruising > 4.0);
        for _ in 0..40 {
            oracle.apply_control(1, VehicleControl::emergency_stop(0.0));
            oracle.step(0.05);
        }
        assert!(oracle.vehicle(1).unwrap().speed < 0.01);
    }

    #[test]
    fn controls_apply_for_a_single_step_only() {
        let mut oracle = Oracle::new();
        oracle.spawn_vehicle(1, Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0), 0.0, 13.89);
        oracle.apply_control(
            1,
            VehicleControl {
                throttle: 1.0,
                brake: 0.0,
                steer: 0.0,
            },
        );
        oracle.step(0.05);
        let after_one = oracle.vehicle(1).unwrap().speed;
        assert!(after_one > 0.0);
        // No fresh control: only drag acts.
        oracle.step(0.05);
        assert!(oracle.vehicle(1).unwrap().speed <= after_one);
    }

    #[test]
    fn right_steer_rotates_clockwise() {
        let mut oracle = Oracle::new();
        oracle.spawn_vehicle(1, Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0), 10.0, 13.89);
        oracle.apply_control(
            1,
            VehicleControl {
                throttle: 0.0,
                brake: 0.0,
                steer: 0.5,
            },
        );
        oracle.step(0.1);
        // Turning right from east means heading dips toward negative y.
        assert!(oracle.vehicle(1).unwrap().heading.y < 0.0);
    }
}
