//! The fixed per-frame pipeline stages.
//!
//! The stage sequence is known at compile time, so each stage is a plain
//! function over explicit input and output structs rather than a trait
//! object. Per-vehicle outputs are written into slots of index-aligned
//! vectors over the frame's sorted actor list; the orchestrator enforces a
//! hard barrier between stages by collecting each pass before the next runs.

pub mod collision;
pub mod localization;
pub mod motion_plan;
pub mod traffic_light;

use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::simulation_state::ActorId;

/// Per-vehicle result of the localization stage.
#[derive(Debug, Clone, Default)]
pub struct LocalizationFrame {
    /// Junction the vehicle's look-ahead point has entered, if any.
    pub approaching_junction: Option<u32>,
    /// Vehicle has no nearest waypoint; motion output is suppressed.
    pub off_graph: bool,
    /// The buffer could not be extended to the horizon.
    pub dead_end: bool,
    /// A lane change was assigned this frame; the orchestrator clears any
    /// one-shot forced directive when this is set.
    pub lane_change_executed: bool,
}

/// Per-vehicle result of the collision stage.
#[derive(Debug, Clone)]
pub struct CollisionFrame {
    pub hazard: bool,
    /// Road distance the vehicle may still travel before reaching the
    /// obstacle, minus its configured following distance.
    pub available_distance_margin: f64,
    /// Speed of the obstacle vehicle, m/s; negative when there is none.
    pub obstacle_speed: f64,
}

impl Default for CollisionFrame {
    fn default() -> Self {
        Self {
            hazard: false,
            available_distance_margin: f64::MAX,
            obstacle_speed: -1.0,
        }
    }
}

/// Per-vehicle result of the traffic-light stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficLightFrame {
    pub hazard: bool,
}

/// Deterministic per-actor random stream for one frame.
///
/// Seeded from a mix of the manager seed, the frame id and the actor id, so
/// draws depend only on frame inputs and never on thread scheduling.
pub fn actor_rng(seed: u64, frame: u64, actor: ActorId) -> ChaCha8Rng {
    let mut mixed = seed ^ frame.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    mixed ^= actor.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    mixed = mixed.wrapping_mul(0x94d0_49bb_1331_11eb);
    ChaCha8Rng::seed_from_u64(mixed)
}

/// Rolls a percentage chance in `[0, 100]` on the given stream.
pub fn roll(rng: &mut ChaCha8Rng, percentage: f64) -> bool {
    use rand::Rng;
    if percentage <= 0.0 {
        return false;
    }
    if percentage >= 100.0 {
        return true;
    }
    rng.gen_range(0.0..100.0) < percentage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_streams_replay_exactly() {
        use rand::Rng;
        let mut a = actor_rng(7, 100, 3);
        let mut b = actor_rng(7, 100, 3);
        for _ in 0..16 {
            assert_eq!(a.gen::<u64>(), b.gen::<u64>());
        }
    }

    #[test]
    fn actor_streams_differ_across_actors_and_frames() {
        use rand::Rng;
        let x = actor_rng(7, 100, 3).gen::<u64>();
        assert_ne!(x, actor_rng(7, 100, 4).gen::<u64>());
        assert_ne!(x, actor_rng(7, 101, 3).gen::<u64>());
        assert_ne!(x, actor_rng(8, 100, 3).gen::<u64>());
    }

    #[test]
    fn roll_extremes_are_exact() {
        let mut rng = actor_rng(1, 1, 1);
        assert!(!roll(&mut rng, 0.0));
        assert!(roll(&mut rng, 100.0));
    }
}
