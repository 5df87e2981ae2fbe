//! Localization stage: keeps each vehicle's path buffer filled to its
//! horizon and advances it as the vehicle moves.
//!
//! Runs as a parallel pass over all registered vehicles; each call mutates
//! only its own vehicle's record, so vehicles never contend. Lane-change
//! vetting reads the previous frame's occupancy index, which is the freshest
//! consistent view available before this stage completes.

use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::constants::{lane_change, path_buffer, speed};
use crate::local_map::{LocalMap, WaypointId};
use crate::parameters::{LaneChange, VehicleParameters};
use crate::registry::VehicleRecord;
use crate::simulation_state::{ActorId, KinematicState};
use crate::stages::{roll, LocalizationFrame};
use crate::track_traffic::TrackTraffic;

/// Read-only inputs shared by every vehicle's localization update.
pub struct LocalizationInput<'a> {
    pub local_map: &'a LocalMap,
    /// Occupancy index built at the end of the previous frame, if any.
    pub previous_traffic: Option<&'a TrackTraffic>,
    /// Current frame id, for lane-change spacing.
    pub frame: u64,
    /// Configured minimum horizon, meters.
    pub min_horizon: f64,
}

/// Updates one vehicle's buffer and reports its localization flags.
pub fn update(
    actor: ActorId,
    record: &mut VehicleRecord,
    state: &KinematicState,
    parameters: &VehicleParameters,
    input: &LocalizationInput<'_>,
    rng: &mut ChaCha8Rng,
) -> LocalizationFrame {
    let mut frame = LocalizationFrame::default();
    let map = input.local_map;
    let vehicle_speed = state.speed();

    let horizon_rate = if vehicle_speed > speed::HIGHWAY_SPEED {
        path_buffer::HIGH_SPEED_HORIZON_RATE
    } else {
        path_buffer::HORIZON_RATE
    };
    let horizon = (vehicle_speed * horizon_rate).max(input.min_horizon);

    // A stale front entry means the vehicle teleported or just spawned;
    // rebuild from scratch instead of chasing the old path.
    if let Some(front) = record.buffer.front() {
        let gap = (map.waypoint(front).position - state.position).norm();
        if gap > path_buffer::MAX_START_DISTANCE {
            trace!(actor, gap, "stale buffer, rebuilding");
            record.buffer.clear();
        }
    }

    // Drop entries the vehicle has already passed. An entry is behind once
    // the vector toward it opposes the vehicle heading.
    while record.buffer.len() > 1 {
        let Some(front) = record.buffer.front() else {
            break;
        };
        let to_front = map.waypoint(front).position - state.position;
        if state.heading.dot(&to_front) <= 0.0 {
            record.buffer.pop_front();
        } else {
            break;
        }
    }

    if record.buffer.is_empty() {
        match map.nearest_waypoint(&state.position) {
            Some(start) => record.buffer.push_back(start),
            None => {
                frame.off_graph = true;
                return frame;
            }
        }
    }

    maybe_assign_lane_change(actor, record, state, parameters, input, rng, &mut frame);

    // Extend to the horizon along the straightest continuation.
    let mut length = buffer_length(map, record);
    while length < horizon {
        let Some(back) = record.buffer.back() else {
            break;
        };
        let Some(next) = map.straightest_successor(back) else {
            frame.dead_end = true;
            break;
        };
        length += map.distance_between(back, next);
        record.buffer.push_back(next);
    }

    frame.approaching_junction = junction_ahead(map, record);
    frame
}

/// Sum of segment lengths along the buffer.
fn buffer_length(map: &LocalMap, record: &VehicleRecord) -> f64 {
    let mut length = 0.0;
    let mut previous: Option<WaypointId> = None;
    for id in record.buffer.iter() {
        if let Some(prev) = previous {
            length += map.distance_between(prev, id);
        }
        previous = Some(id);
    }
    length
}

/// Junction id of the buffer entry at the junction look-ahead distance.
fn junction_ahead(map: &LocalMap, record: &VehicleRecord) -> Option<u32> {
    let mut covered = 0.0;
    let mut previous: Option<WaypointId> = None;
    for id in record.buffer.iter() {
        if let Some(prev) = previous {
            covered += map.distance_between(prev, id);
        }
        previous = Some(id);
        let waypoint = map.waypoint(id);
        if waypoint.is_junction {
            return waypoint.junction_id;
        }
        if covered >= path_buffer::JUNCTION_LOOK_AHEAD {
            break;
        }
    }
    None
}

/// Assigns a lane change when directed or rolled, and the target lane is
/// geometrically available and clear of nearby traffic.
fn maybe_assign_lane_change(
    actor: ActorId,
    record: &mut VehicleRecord,
    state: &KinematicState,
    parameters: &VehicleParameters,
    input: &LocalizationInput<'_>,
    rng: &mut ChaCha8Rng,
    frame: &mut LocalizationFrame,
) {
    let forced = parameters.force_lane_change;
    if forced.is_none() && !parameters.auto_lane_change {
        return;
    }
    if state.speed() < lane_change::MIN_LANE_CHANGE_SPEED {
        return;
    }
    // Space consecutive changes out; the distance check is approximated by
    // frames elapsed at current speed.
    if let Some(last) = record.last_lane_change_frame {
        let elapsed = input.frame.saturating_sub(last) as f64;
        if elapsed * state.speed() * 0.05 < lane_change::INTER_LANE_CHANGE_DISTANCE {
            return;
        }
    }

    let direction = match forced {
        Some(direction) => direction,
        None => {
            if roll(rng, parameters.keep_right_pct) {
                LaneChange::Right
            } else if roll(rng, parameters.random_left_pct) {
                LaneChange::Left
            } else if roll(rng, parameters.random_right_pct) {
                LaneChange::Right
            } else {
                return;
            }
        }
    };

    let Some(front) = record.buffer.front() else {
        return;
    };
    let waypoint = input.local_map.waypoint(front);
    // Junction lanes never change laterally.
    if waypoint.is_junction {
        return;
    }
    let target = match direction {
        LaneChange::Left => waypoint.left,
        LaneChange::Right => waypoint.right,
    };
    let Some(target) = target else {
        return;
    };

    if let Some(traffic) = input.previous_traffic {
        let target_position = input.local_map.waypoint(target).position;
        let blockers = traffic.neighbors_within(
            actor,
            &target_position,
            lane_change::MINIMUM_LANE_CHANGE_DISTANCE,
            crate::constants::collision::VERTICAL_OVERLAP_THRESHOLD,
        );
        if !blockers.is_empty() {
            trace!(actor, ?direction, "lane change blocked by traffic");
            return;
        }
    }

    // Merge point a speed-scaled distance down the target lane, so the shift
    // is gradual at speed.
    let change_over = (state.speed() * 1.5).clamp(
        lane_change::MIN_CHANGE_OVER_DISTANCE,
        lane_change::MAX_CHANGE_OVER_DISTANCE,
    );
    let merge_path = input.local_map.look_ahead(target, change_over);
    record.buffer.clear();
    record.buffer.push_back(target);
    for id in merge_path {
        record.buffer.push_back(id);
    }
    record.last_lane_change_frame = Some(input.frame);
    frame.lane_change_executed = forced.is_some();
    trace!(actor, ?direction, "lane change assigned");
}
