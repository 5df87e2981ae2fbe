//! Traffic-light stage: gates vehicles on signals and on unsignalised
//! junctions.
//!
//! Signal gating is a pure per-vehicle check and runs in the parallel pass.
//! Unsignalised junctions need shared queue state, so they resolve serially
//! in ascending actor order after the parallel pass; the order makes the
//! queues reproducible. Hazards from both paths merge into the same channel
//! the collision stage uses.

use std::collections::{HashMap, HashSet, VecDeque};

use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::constants::{motion_plan, path_buffer, traffic_light};
use crate::local_map::LocalMap;
use crate::parameters::VehicleParameters;
use crate::path_buffer::PathBuffer;
use crate::signals::{LightId, LightRegistry};
use crate::simulation_state::{ActorId, KinematicState};
use crate::stages::roll;

/// Whether a stopping light gates this vehicle's path right now.
///
/// Checks the light the snapshot says is gating the vehicle, then scans the
/// buffer over the braking distance for control-zone waypoints. A passing
/// run-light roll ignores the signal for this frame.
pub fn light_hazard(
    buffer: &PathBuffer,
    state: &KinematicState,
    lights: &LightRegistry,
    parameters: &VehicleParameters,
    map: &LocalMap,
    rng: &mut ChaCha8Rng,
) -> bool {
    let Some(light) = gating_light(buffer, state, lights, map) else {
        return false;
    };
    let stopping = lights
        .state(light)
        .map(|s| s.demands_stop())
        .unwrap_or(false);
    if !stopping {
        return false;
    }
    !roll(rng, parameters.run_light_pct)
}

/// The light whose control zone the vehicle is approaching, if any.
pub fn gating_light(
    buffer: &PathBuffer,
    state: &KinematicState,
    lights: &LightRegistry,
    map: &LocalMap,
) -> Option<LightId> {
    if let Some(light) = state.gating_light {
        return Some(light);
    }
    // Scan as far as the vehicle needs to brake from current speed, never
    // less than the guaranteed buffer horizon, so a stopped vehicle keeps
    // seeing the zone it is held at.
    let braking = state.speed().powi(2)
        / (2.0 * motion_plan::FRICTION * motion_plan::GRAVITY);
    let scan = (braking + path_buffer::JUNCTION_LOOK_AHEAD)
        .max(path_buffer::MINIMUM_HORIZON_LENGTH);
    let mut covered = 0.0;
    let mut previous = None;
    for id in buffer.iter() {
        if let Some(prev) = previous {
            covered += map.distance_between(prev, id);
        }
        previous = Some(id);
        if covered > scan {
            break;
        }
        if let Some(light) = lights.light_at(id) {
            return Some(light);
        }
    }
    None
}

/// FIFO arbitration for junctions without signals.
///
/// A vehicle approaching such a junction joins the entry queue; it may enter
/// only once it has rested for the minimum stop time and sits at the queue
/// front. Entry is kept until the vehicle leaves the junction's vicinity.
#[derive(Debug, Default)]
pub struct JunctionArbiter {
    queues: HashMap<u32, VecDeque<ActorId>>,
    rest_time: HashMap<ActorId, f64>,
    granted: HashSet<ActorId>,
    member_of: HashMap<ActorId, u32>,
}

impl JunctionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves one vehicle. Call in ascending actor order every frame.
    /// Returns the junction hazard for the vehicle.
    pub fn resolve(
        &mut self,
        actor: ActorId,
        junction: Option<u32>,
        vehicle_speed: f64,
        dt: f64,
        skip_protocol: bool,
    ) -> bool {
        let Some(junction) = junction else {
            self.forget(actor);
            return false;
        };
        if skip_protocol {
            self.forget(actor);
            return false;
        }
        if self.granted.contains(&actor) {
            return false;
        }

        match self.member_of.get(&actor) {
            Some(&current) if current == junction => {}
            Some(_) => {
                // Switched junctions without passing through open road.
                self.forget(actor);
                self.enqueue(actor, junction);
            }
            None => self.enqueue(actor, junction),
        }

        if vehicle_speed < traffic_light::EPSILON_STOP_SPEED {
            *self.rest_time.entry(actor).or_insert(0.0) += dt;
        } else {
            self.rest_time.insert(actor, 0.0);
        }

        let at_front = self
            .queues
            .get(&junction)
            .and_then(|queue| queue.front())
            .is_some_and(|&front| front == actor);
        let rested = self
            .rest_time
            .get(&actor)
            .is_some_and(|&t| t >= traffic_light::MINIMUM_STOP_TIME);

        if at_front && rested {
            trace!(actor, junction, "junction entry granted");
            self.granted.insert(actor);
            false
        } else {
            true
        }
    }

    fn enqueue(&mut self, actor: ActorId, junction: u32) {
        self.queues.entry(junction).or_default().push_back(actor);
        self.member_of.insert(actor, junction);
    }

    /// Drops all state for an actor, on leaving a junction or deregistering.
    pub fn forget(&mut self, actor: ActorId) {
        if let Some(junction) = self.member_of.remove(&actor) {
            if let Some(queue) = self.queues.get_mut(&junction) {
                queue.retain(|&entry| entry != actor);
            }
        }
        self.rest_time.remove(&actor);
        self.granted.remove(&actor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_map::WaypointId;
    use crate::road_graph::{RoadGraph, RoadNode};
    use crate::signals::LightState;
    use crate::stages::actor_rng;
    use nalgebra::Vector3;

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

    fn buffer_through(ids: &[u32]) -> PathBuffer {
        let mut buffer = PathBuffer::new();
        for &id in ids {
            buffer.push_back(WaypointId(id));
        }
        buffer
    }

    #[test]
    fn red_light_in_the_zone_raises_hazard() {
        let map = straight_map(10);
        let mut lights = LightRegistry::new();
        lights.add_light(1, vec![WaypointId(2)]);
        lights.set_state(1, LightState::Red);
        let buffer = buffer_through(&[0, 1, 2, 3]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        let parameters = VehicleParameters::default();
        let mut rng = actor_rng(0, 1, 1);
        assert!(light_hazard(
            &buffer,
            &state,
            &lights,
            &parameters,
            &map,
            &mut rng
        ));
    }

    #[test]
    fn green_light_clears_the_hazard() {
        let map = straight_map(10);
        let mut lights = LightRegistry::new();
        lights.add_light(1, vec![WaypointId(2)]);
        lights.set_state(1, LightState::Green);
        let buffer = buffer_through(&[0, 1, 2, 3]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        let parameters = VehicleParameters::default();
        let mut rng = actor_rng(0, 1, 1);
        assert!(!light_hazard(
            &buffer,
            &state,
            &lights,
            &parameters,
            &map,
            &mut rng
        ));
    }

    #[test]
    fn lights_beyond_braking_distance_are_not_scanned() {
        let map = straight_map(20);
        let mut lights = LightRegistry::new();
        lights.add_light(1, vec![WaypointId(15)]);
        lights.set_state(1, LightState::Red);
        let buffer = buffer_through(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        // At rest the scan window is the minimum horizon; 75 m is far past it.
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        let parameters = VehicleParameters::default();
        let mut rng = actor_rng(0, 1, 1);
        assert!(!light_hazard(
            &buffer,
            &state,
            &lights,
            &parameters,
            &map,
            &mut rng
        ));
    }

    #[test]
    fn stationary_scan_still_covers_the_minimum_horizon() {
        let map = straight_map(20);
        let mut lights = LightRegistry::new();
        lights.add_light(1, vec![WaypointId(3)]);
        lights.set_state(1, LightState::Red);
        // Zone 15 m out, at the horizon edge; a vehicle held at rest must
        // keep seeing it.
        let buffer = buffer_through(&[0, 1, 2, 3, 4]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        let parameters = VehicleParameters::default();
        let mut rng = actor_rng(0, 1, 1);
        assert!(light_hazard(
            &buffer,
            &state,
            &lights,
            &parameters,
            &map,
            &mut rng
        ));
    }

    #[test]
    fn snapshot_gating_light_overrides_the_buffer_scan() {
        let map = straight_map(20);
        let mut lights = LightRegistry::new();
        lights.add_light(4, vec![WaypointId(15)]);
        lights.set_state(4, LightState::Red);
        // The zone is far beyond the scan window, but the snapshot already
        // places the vehicle inside the control zone.
        let buffer = buffer_through(&[0, 1, 2]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_gating_light(4);
        let parameters = VehicleParameters::default();
        let mut rng = actor_rng(0, 1, 1);
        assert!(light_hazard(
            &buffer,
            &state,
            &lights,
            &parameters,
            &map,
            &mut rng
        ));
    }

    #[test]
    fn run_light_roll_skips_the_signal() {
        let map = straight_map(10);
        let mut lights = LightRegistry::new();
        lights.add_light(1, vec![WaypointId(2)]);
        lights.set_state(1, LightState::Red);
        let buffer = buffer_through(&[0, 1, 2, 3]);
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        let parameters = VehicleParameters::default().with_run_light(100.0);
        let mut rng = actor_rng(0, 1, 1);
        assert!(!light_hazard(
            &buffer,
            &state,
            &lights,
            &parameters,
            &map,
            &mut rng
        ));
    }

    #[test]
    fn junction_queue_grants_in_arrival_order_after_resting() {
        let mut arbiter = JunctionArbiter::new();
        let dt = 0.5;
        // Both approach; both stopped. Actor 1 queued first.
        for _ in 0..3 {
            assert!(arbiter.resolve(1, Some(7), 0.0, dt, false));
            assert!(arbiter.resolve(2, Some(7), 0.0, dt, false));
        }
        // After 2.0 s of rest actor 1 is granted, actor 2 still waits.
        assert!(!arbiter.resolve(1, Some(7), 0.0, dt, false));
        assert!(arbiter.resolve(2, Some(7), 0.0, dt, false));
        // Actor 1 leaves; actor 2 advances to the front and is granted.
        assert!(!arbiter.resolve(1, None, 5.0, dt, false));
        assert!(!arbiter.resolve(2, Some(7), 0.0, dt, false));
    }

    #[test]
    fn moving_resets_the_rest_clock() {
        let mut arbiter = JunctionArbiter::new();
        let dt = 0.8;
        assert!(arbiter.resolve(1, Some(3), 0.0, dt, false));
        assert!(arbiter.resolve(1, Some(3), 0.0, dt, false));
        // Crept forward; the stop must be continuous.
        assert!(arbiter.resolve(1, Some(3), 1.0, dt, false));
        assert!(arbiter.resolve(1, Some(3), 0.0, dt, false));
        assert!(arbiter.resolve(1, Some(3), 0.0, dt, false));
        assert!(!arbiter.resolve(1, Some(3), 0.0, dt, false));
    }

    #[test]
    fn run_sign_skips_the_protocol() {
        let mut arbiter = JunctionArbiter::new();
        assert!(!arbiter.resolve(1, Some(3), 4.0, 0.05, true));
    }
}
