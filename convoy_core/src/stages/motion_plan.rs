//! Motion-plan stage: turns a path and hazard flags into a control command.
//!
//! Hazards arrive on one merged channel; the planner does not care which
//! stage raised one, only that the commanded longitudinal acceleration must
//! not be positive that frame. Deceleration is bounded per frame so a hazard
//! never commands an instantaneous stop, except for the emergency branch
//! when the remaining margin is below the critical braking threshold.

use nalgebra::Vector3;

use crate::constants::{motion_plan, speed};
use crate::local_map::LocalMap;
use crate::parameters::VehicleParameters;
use crate::pid::{self, GainSchedule, VehicleControl};
use crate::registry::VehicleRecord;
use crate::simulation_state::KinematicState;
use crate::stages::{CollisionFrame, LocalizationFrame, TrafficLightFrame};

/// Read-only inputs shared by every vehicle's plan step.
pub struct MotionPlanInput<'a> {
    pub local_map: &'a LocalMap,
    pub dt: f64,
    pub gains: &'a GainSchedule,
}

/// Plans one vehicle's control for this frame, updating its PID state.
pub fn plan(
    record: &mut VehicleRecord,
    state: &KinematicState,
    parameters: &VehicleParameters,
    localization: &LocalizationFrame,
    collision: &CollisionFrame,
    light: &TrafficLightFrame,
    input: &MotionPlanInput<'_>,
) -> VehicleControl {
    // Off-graph vehicles and vehicles the physics layer is not integrating
    // coast under no-op control.
    if localization.off_graph || record.buffer.is_empty() || !state.physics_enabled {
        return VehicleControl::default();
    }

    let vehicle_speed = state.speed();
    if (vehicle_speed - record.pid_state.previous_speed).abs() > motion_plan::SPEED_DISCONTINUITY {
        record.pid_state.reset();
    }

    let highway = vehicle_speed > speed::HIGHWAY_SPEED;
    let lateral_gains = if highway {
        &input.gains.lateral_highway
    } else {
        &input.gains.lateral_urban
    };
    let longitudinal_gains = if highway {
        &input.gains.longitudinal_highway
    } else {
        &input.gains.longitudinal_urban
    };

    let steer = {
        let error = heading_error(record, state, parameters, input, vehicle_speed);
        pid::run_lateral(&mut record.pid_state, lateral_gains, input.dt, error)
    };

    let hazard = collision.hazard || light.hazard || localization.dead_end;
    if hazard && collision.available_distance_margin < motion_plan::CRITICAL_BRAKING_MARGIN {
        record.pid_state.previous_speed = vehicle_speed;
        return VehicleControl::emergency_stop(steer);
    }

    // The binding limit is the lower of the snapshot's limit and the one
    // posted on the path segment the vehicle is on.
    let mut posted = state.speed_limit;
    if let Some(front) = record.buffer.front() {
        posted = posted.min(input.local_map.waypoint(front).speed_limit);
    }
    let mut target = parameters.target_speed(posted);
    target = target.min(turn_speed_cap(record, state, input, vehicle_speed));

    if collision.hazard && collision.obstacle_speed >= 0.0 {
        // Follow the obstacle: match its speed, with a little approach
        // allowance proportional to the spare margin.
        let spare = collision.available_distance_margin.max(0.0);
        let follow_window = (vehicle_speed * motion_plan::FOLLOW_LEAD_FACTOR)
            .max(motion_plan::MIN_FOLLOW_LEAD_DISTANCE);
        let approach = if spare > follow_window {
            motion_plan::RELATIVE_APPROACH_SPEED
        } else {
            0.0
        };
        target = target.min(collision.obstacle_speed.max(0.0) + approach);
    }

    if hazard {
        // Never accelerate under a hazard, and shed speed gradually.
        target = target.min(vehicle_speed * (1.0 - motion_plan::PERC_MAX_SLOWDOWN));
    }

    let (mut throttle, brake) = pid::run_longitudinal(
        &mut record.pid_state,
        longitudinal_gains,
        input.dt,
        vehicle_speed,
        target,
    );
    if hazard {
        throttle = 0.0;
    }
    record.pid_state.previous_speed = vehicle_speed;
    VehicleControl {
        throttle,
        brake,
        steer,
    }
}

/// Signed angle from the vehicle heading to the steering target, radians,
/// positive when the target lies to the right. A configured lane offset
/// shifts the target laterally off the centerline.
fn heading_error(
    record: &VehicleRecord,
    state: &KinematicState,
    parameters: &VehicleParameters,
    input: &MotionPlanInput<'_>,
    vehicle_speed: f64,
) -> f64 {
    let look_ahead = (vehicle_speed * motion_plan::TARGET_WAYPOINT_TIME_HORIZON)
        .max(motion_plan::MIN_TARGET_WAYPOINT_DISTANCE);
    let mut target = waypoint_at(record, input.local_map, &state.position, look_ahead);
    if parameters.lane_offset != 0.0 {
        // Positive offset shifts the target to the vehicle's right.
        let rightward = state.heading.cross(&Vector3::z());
        target += rightward * parameters.lane_offset;
    }
    let to_target = target - state.position;
    if to_target.norm() < 1e-6 {
        return 0.0;
    }
    let cross = state.heading.cross(&to_target);
    // Right-handed frame with z up; negative z cross means rightward.
    (-cross.z).atan2(state.heading.dot(&to_target))
}

/// Position of the buffer waypoint roughly `distance` meters ahead.
fn waypoint_at(
    record: &VehicleRecord,
    map: &LocalMap,
    position: &Vector3<f64>,
    distance: f64,
) -> Vector3<f64> {
    let mut covered = 0.0;
    let mut previous: Option<Vector3<f64>> = None;
    let mut last = *position;
    for id in record.buffer.iter() {
        let point = map.waypoint(id).position;
        covered += match previous {
            Some(prev) => (point - prev).norm(),
            None => (point - position).norm(),
        };
        previous = Some(point);
        last = point;
        if covered >= distance {
            break;
        }
    }
    last
}

/// Maximum speed the upcoming curvature allows, from the circumradius of
/// three path samples.
fn turn_speed_cap(
    record: &VehicleRecord,
    state: &KinematicState,
    input: &MotionPlanInput<'_>,
    vehicle_speed: f64,
) -> f64 {
    let look_ahead = (vehicle_speed * motion_plan::TARGET_WAYPOINT_TIME_HORIZON)
        .max(motion_plan::MIN_TARGET_WAYPOINT_DISTANCE);
    let p0 = state.position;
    let p1 = waypoint_at(record, input.local_map, &state.position, look_ahead);
    let p2 = waypoint_at(record, input.local_map, &state.position, 2.0 * look_ahead);
    match circumradius(&p0, &p1, &p2) {
        Some(radius) => (radius * motion_plan::FRICTION * motion_plan::GRAVITY).sqrt(),
        None => f64::INFINITY,
    }
}

/// Radius of the circle through three points, `None` when collinear.
fn circumradius(p0: &Vector3<f64>, p1: &Vector3<f64>, p2: &Vector3<f64>) -> Option<f64> {
    let a = (p1 - p0).norm();
    let b = (p2 - p1).norm();
    let c = (p2 - p0).norm();
    let area = 0.5 * (p1 - p0).cross(&(p2 - p0)).norm();
    if area < 1e-6 {
        return None;
    }
    Some(a * b * c / (4.0 * area))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_map::WaypointId;
    use crate::road_graph::{RoadGraph, RoadNode};
    use approx::assert_relative_eq;

    fn straight_map(count: usize) -> LocalMap {
        let mut graph = RoadGraph::new();
        let heading = Vector3::new(1.0, 0.0, 0.0);
        let mut previous = None;
        for i in 0..count {
            let node =
                graph.add_node(RoadNode::new(Vector3::new(i as f64 * 5.0, 0.0, 0.0), heading));
            if let Some(prev) = previous {
                graph.link(prev, node);
            }
            previous = Some(node);
        }
        LocalMap::build_from(&graph).unwrap()
    }

    fn record_on(ids: &[u32]) -> VehicleRecord {
        let mut record = VehicleRecord::default();
        for &id in ids {
            record.buffer.push_back(WaypointId(id));
        }
        record
    }

    fn plan_input<'a>(map: &'a LocalMap, gains: &'a GainSchedule) -> MotionPlanInput<'a> {
        MotionPlanInput {
            local_map: map,
            dt: 0.05,
            gains,
        }
    }

    #[test]
    fn clear_road_produces_throttle_and_straight_steer() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(5.0, 0.0, 0.0))
            .with_speed_limit(13.89);
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert!(control.throttle > 0.0);
        assert_relative_eq!(control.brake, 0.0);
        assert_relative_eq!(control.steer, 0.0);
    }

    #[test]
    fn off_graph_vehicle_gets_no_op_control() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        let localization = LocalizationFrame {
            off_graph: true,
            ..LocalizationFrame::default()
        };
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &localization,
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert_eq!(control, VehicleControl::default());
    }

    #[test]
    fn hazard_never_commands_throttle() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(8.0, 0.0, 0.0));
        let collision = CollisionFrame {
            hazard: true,
            available_distance_margin: 12.0,
            obstacle_speed: 6.0,
        };
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &collision,
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert_relative_eq!(control.throttle, 0.0);
        assert!(control.brake >= 0.0);
    }

    #[test]
    fn critical_margin_forces_an_emergency_stop() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(8.0, 0.0, 0.0));
        let collision = CollisionFrame {
            hazard: true,
            available_distance_margin: 0.1,
            obstacle_speed: 0.0,
        };
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &collision,
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert_relative_eq!(control.throttle, 0.0);
        assert_relative_eq!(control.brake, 1.0);
    }

    #[test]
    fn dead_end_sheds_speed() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(8.0, 0.0, 0.0));
        let localization = LocalizationFrame {
            dead_end: true,
            ..LocalizationFrame::default()
        };
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &localization,
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert_relative_eq!(control.throttle, 0.0);
        assert!(control.brake > 0.0);
    }

    #[test]
    fn red_light_hazard_decelerates() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(8.0, 0.0, 0.0));
        let light = TrafficLightFrame { hazard: true };
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &CollisionFrame::default(),
            &light,
            &plan_input(&map, &gains),
        );
        assert_relative_eq!(control.throttle, 0.0);
        assert!(control.brake > 0.0);
    }

    #[test]
    fn lane_offset_steers_off_the_centerline() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(5.0, 0.0, 0.0));
        let parameters = VehicleParameters {
            lane_offset: 1.0,
            ..VehicleParameters::default()
        };
        let control = plan(
            &mut record,
            &state,
            &parameters,
            &LocalizationFrame::default(),
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert!(control.steer > 0.0);
    }

    #[test]
    fn disabled_physics_suppresses_control() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        let mut state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(5.0, 0.0, 0.0));
        state.physics_enabled = false;
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert_eq!(control, VehicleControl::default());
    }

    #[test]
    fn posted_lane_limit_caps_the_target_speed() {
        let mut graph = RoadGraph::new();
        let heading = Vector3::new(1.0, 0.0, 0.0);
        let mut previous = None;
        for i in 0..10 {
            let node = graph.add_node(
                RoadNode::new(Vector3::new(i as f64 * 5.0, 0.0, 0.0), heading)
                    .with_speed_limit(5.0),
            );
            if let Some(prev) = previous {
                graph.link(prev, node);
            }
            previous = Some(node);
        }
        let map = LocalMap::build_from(&graph).unwrap();
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        // The snapshot carries a generous limit, the lane a 5 m/s one.
        let state = KinematicState::new(Vector3::zeros(), heading)
            .with_velocity(Vector3::new(10.0, 0.0, 0.0))
            .with_speed_limit(20.0);
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert_relative_eq!(control.throttle, 0.0);
        assert!(control.brake > 0.0);
    }

    #[test]
    fn teleport_resets_pid_state() {
        let map = straight_map(10);
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        record.pid_state.velocity_integral = 5.0;
        record.pid_state.previous_speed = 2.0;
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(20.0, 0.0, 0.0));
        plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &plan_input(&map, &gains),
        );
        assert!(record.pid_state.velocity_integral.abs() < 5.0);
        assert_relative_eq!(record.pid_state.previous_speed, 20.0);
    }

    #[test]
    fn curvature_caps_the_target_speed() {
        // Sharp 90 degree bend: straight east, then straight north.
        let mut graph = RoadGraph::new();
        let east = Vector3::new(1.0, 0.0, 0.0);
        let north = Vector3::new(0.0, 1.0, 0.0);
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(graph.add_node(RoadNode::new(
                Vector3::new(i as f64 * 3.0, 0.0, 0.0),
                east,
            )));
        }
        for i in 1..3 {
            ids.push(graph.add_node(RoadNode::new(
                Vector3::new(6.0, i as f64 * 3.0, 0.0),
                north,
            )));
        }
        for i in 0..ids.len() - 1 {
            graph.link(ids[i], ids[i + 1]);
        }
        let map = LocalMap::build_from(&graph).unwrap();
        let gains = GainSchedule::default();
        let mut record = record_on(&[1, 2, 3, 4]);
        let state = KinematicState::new(Vector3::zeros(), east)
            .with_velocity(Vector3::new(15.0, 0.0, 0.0))
            .with_speed_limit(30.0);
        let input = plan_input(&map, &gains);
        let cap = turn_speed_cap(&record, &state, &input, state.speed());
        assert!(cap < 15.0);
        let control = plan(
            &mut record,
            &state,
            &VehicleParameters::default(),
            &LocalizationFrame::default(),
            &CollisionFrame::default(),
            &TrafficLightFrame::default(),
            &input,
        );
        assert!(control.brake > 0.0);
    }
}
