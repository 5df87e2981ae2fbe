//! Collision stage: pairwise hazard detection and right-of-way arbitration.
//!
//! The stage runs in three phases with barriers between them:
//!
//! 1. **Assess** (parallel, read-only): each vehicle gathers neighbors from
//!    the occupancy index, matches overlapping paths through the per-waypoint
//!    passing index, classifies each neighbor as a lead vehicle to follow or
//!    a crossing path, and estimates arrival times at contested regions.
//! 2. **Claim** (parallel, commutative): every vehicle approaching a
//!    contested region files a claim; the lock table keeps the claim with the
//!    smallest `(arrival, actor)` key, so the winner is independent of
//!    scheduling.
//! 3. **Finalize** (parallel, read-only): a vehicle that does not hold a
//!    region on its path records a hazard plus the distance margin left
//!    before the obstacle, for follow-speed control downstream.
//!
//! Losing a claim is the expected yield branch, never an error.

use std::collections::HashMap;

use rand_chacha::ChaCha8Rng;

use crate::collision_lock::{LockTable, RegionId};
use crate::constants::collision;
use crate::local_map::{LocalMap, WaypointId};
use crate::parameters::VehicleParameters;
use crate::path_buffer::PathBuffer;
use crate::simulation_state::{ActorId, SimulationState};
use crate::stages::{roll, CollisionFrame};
use crate::track_traffic::TrackTraffic;

/// Read-only inputs shared by all three phases.
pub struct CollisionInput<'a> {
    pub local_map: &'a LocalMap,
    pub snapshot: &'a SimulationState,
    pub traffic: &'a TrackTraffic,
    pub locks: &'a LockTable,
    /// Global scale on the neighbor-discovery radius.
    pub hazard_distance_multiplier: f64,
}

/// A pending claim on a contested region.
#[derive(Debug, Clone)]
pub struct RegionProposal {
    pub region: RegionId,
    pub other: ActorId,
    /// Estimated seconds until this vehicle reaches the region.
    pub arrival: f64,
    /// Road distance to the region along this vehicle's buffer, meters.
    pub distance: f64,
    pub other_speed: f64,
}

/// A lead vehicle directly ahead on this vehicle's own path.
#[derive(Debug, Clone)]
pub struct FollowTarget {
    pub other: ActorId,
    pub distance: f64,
    pub other_speed: f64,
}

/// Phase-1 output for one vehicle.
#[derive(Debug, Clone, Default)]
pub struct Assessment {
    pub follow: Option<FollowTarget>,
    pub proposals: Vec<RegionProposal>,
}

/// Candidate radius for neighbor discovery, scaled by speed.
fn collision_radius(vehicle_speed: f64) -> f64 {
    if vehicle_speed < collision::STOPPED_VELOCITY_THRESHOLD {
        collision::COLLISION_RADIUS_STOP
    } else {
        (vehicle_speed * collision::COLLISION_RADIUS_RATE).max(collision::COLLISION_RADIUS_MIN)
    }
}

/// Phase 1: assess one vehicle against its neighbors.
///
/// The ignore-vehicles roll is drawn first on the vehicle's frame stream;
/// when it passes, the vehicle skips negotiation entirely while remaining
/// visible to everyone else.
pub fn assess(
    actor: ActorId,
    buffer: &PathBuffer,
    parameters: &VehicleParameters,
    buffers: &HashMap<ActorId, &PathBuffer>,
    input: &CollisionInput<'_>,
    rng: &mut ChaCha8Rng,
) -> Assessment {
    let mut assessment = Assessment::default();
    if roll(rng, parameters.ignore_vehicles_pct) {
        return assessment;
    }
    let Some(state) = input.snapshot.state(actor) else {
        return assessment;
    };
    let vehicle_speed = state.speed();
    let neighbors = input.traffic.neighbors_within(
        actor,
        &state.position,
        collision_radius(vehicle_speed) * input.hazard_distance_multiplier,
        collision::VERTICAL_OVERLAP_THRESHOLD,
    );

    for other in neighbors {
        if parameters.collision_exempt.contains(&other) {
            continue;
        }
        let Some(other_state) = input.snapshot.state(other) else {
            continue;
        };
        let Some(other_buffer) = buffers.get(&other) else {
            continue;
        };

        // A neighbor ahead on our own path, moving our way, is a lead
        // vehicle; everything else with a shared waypoint is a crossing.
        let to_other = other_state.position - state.position;
        let ahead = state.heading.dot(&to_other) > 0.0;
        let same_direction = state.heading.dot(&other_state.heading) > 0.0;
        let on_our_path = other_buffer
            .front()
            .is_some_and(|front| buffer.contains(front));

        if ahead && same_direction && on_our_path {
            let distance = to_other.norm();
            let closer = assessment
                .follow
                .as_ref()
                .is_none_or(|current| distance < current.distance);
            if closer {
                assessment.follow = Some(FollowTarget {
                    other,
                    distance,
                    other_speed: other_state.speed(),
                });
            }
            continue;
        }

        // Paths conflict either at a literally shared waypoint, found through
        // the per-waypoint passing index, or, inside a junction, at distinct
        // connector waypoints carrying the same junction id.
        let conflict = first_shared_waypoint(input.local_map, buffer, |id| {
            input.traffic.passing_vehicles(id).contains(&other)
        })
        .map(|(shared, along)| {
            let region = match input.local_map.waypoint(shared).junction_id {
                Some(junction) => RegionId::Junction(junction),
                None => RegionId::Waypoint(shared),
            };
            (region, along)
        })
        .or_else(|| {
            first_shared_waypoint(input.local_map, buffer, |id| {
                match input.local_map.waypoint(id).junction_id {
                    Some(junction) => other_buffer.iter().any(|other_id| {
                        input.local_map.waypoint(other_id).junction_id == Some(junction)
                    }),
                    None => false,
                }
            })
            .map(|(entry, along)| {
                let junction = input
                    .local_map
                    .waypoint(entry)
                    .junction_id
                    .unwrap_or_default();
                (RegionId::Junction(junction), along)
            })
        });

        if let Some((region, along_buffer)) = conflict {
            // Distance is measured from the vehicle itself, not the buffer
            // front, so arrival estimates order correctly.
            let to_front = buffer
                .front()
                .map(|front| (input.local_map.waypoint(front).position - state.position).norm())
                .unwrap_or(0.0);
            let distance = to_front + along_buffer;
            let arrival = distance / vehicle_speed.max(collision::MIN_ARRIVAL_SPEED);
            assessment.proposals.push(RegionProposal {
                region,
                other,
                arrival,
                distance,
                other_speed: other_state.speed(),
            });
        }
    }
    assessment
}

/// First waypoint on `buffer` for which `shared` holds, with the road
/// distance to it from the buffer front.
fn first_shared_waypoint(
    map: &LocalMap,
    buffer: &PathBuffer,
    shared: impl Fn(WaypointId) -> bool,
) -> Option<(WaypointId, f64)> {
    let mut covered = 0.0;
    let mut previous: Option<WaypointId> = None;
    for id in buffer.iter() {
        if let Some(prev) = previous {
            covered += map.distance_between(prev, id);
        }
        previous = Some(id);
        if shared(id) {
            return Some((id, covered));
        }
    }
    None
}

/// Phase 2: file this vehicle's claims. Safe to run in parallel; the table's
/// keep-better rule makes the outcome order-independent.
pub fn claim(actor: ActorId, assessment: &Assessment, input: &CollisionInput<'_>) {
    for proposal in &assessment.proposals {
        input.locks.claim(
            proposal.region,
            actor,
            proposal.other,
            proposal.arrival,
            input.snapshot.frame,
        );
    }
}

/// Phase 3: resolve hazards from lock ownership and follow targets.
pub fn finalize(
    actor: ActorId,
    assessment: &Assessment,
    parameters: &VehicleParameters,
    input: &CollisionInput<'_>,
) -> CollisionFrame {
    let mut frame = CollisionFrame::default();
    let reference = parameters
        .following_distance
        .max(collision::MIN_REFERENCE_DISTANCE);

    if let Some(follow) = &assessment.follow {
        frame.hazard = true;
        frame.available_distance_margin = follow.distance - reference;
        frame.obstacle_speed = follow.other_speed;
    }

    for proposal in &assessment.proposals {
        if input.locks.holds(&proposal.region, actor) {
            continue;
        }
        let margin = proposal.distance - reference;
        if margin < frame.available_distance_margin {
            frame.available_distance_margin = margin;
            frame.obstacle_speed = proposal.other_speed;
        }
        frame.hazard = true;
    }
    frame
}
