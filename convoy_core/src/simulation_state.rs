//! Per-frame snapshot of the world as the pipeline sees it.
//!
//! The snapshot is captured once at frame start and never mutated while the
//! stages run, so parallel passes all observe the same world. Stages read it
//! through shared references only.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::signals::LightId;

/// Stable identifier of a simulated actor.
pub type ActorId = u64;

/// Kinematic state of one actor at the snapshot instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinematicState {
    /// World position, meters.
    pub position: Vector3<f64>,
    /// Unit facing direction.
    pub heading: Vector3<f64>,
    /// Velocity vector, m/s.
    pub velocity: Vector3<f64>,
    /// Posted limit at the actor's location, m/s.
    pub speed_limit: f64,
    /// Whether the physics layer is integrating this actor.
    pub physics_enabled: bool,
    /// Traffic light currently gating this actor, when it is inside a
    /// control zone.
    pub gating_light: Option<LightId>,
}

impl KinematicState {
    pub fn new(position: Vector3<f64>, heading: Vector3<f64>) -> Self {
        Self {
            position,
            heading,
            velocity: Vector3::zeros(),
            speed_limit: 13.89,
            physics_enabled: true,
            gating_light: None,
        }
    }

    pub fn with_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_speed_limit(mut self, limit: f64) -> Self {
        self.speed_limit = limit;
        self
    }

    pub fn with_gating_light(mut self, light: LightId) -> Self {
        self.gating_light = Some(light);
        self
    }

    /// Scalar speed, m/s.
    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }
}

/// Immutable world snapshot for one frame.
#[derive(Debug, Clone, Default)]
pub struct SimulationState {
    /// Monotonically increasing frame counter from the simulation clock.
    pub frame: u64,
    /// Seconds since the previous snapshot.
    pub dt: f64,
    states: HashMap<ActorId, KinematicState>,
}

impl SimulationState {
    pub fn new(frame: u64, dt: f64) -> Self {
        Self {
            frame,
            dt,
            states: HashMap::new(),
        }
    }

    pub fn insert(&mut self, actor: ActorId, state: KinematicState) {
        self.states.insert(actor, state);
    }

    /// State of an actor, or `None` when the actor has no live entry this
    /// frame (a deregistration race; callers skip silently).
    pub fn state(&self, actor: ActorId) -> Option<&KinematicState> {
        self.states.get(&actor)
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.states.contains_key(&actor)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn speed_is_the_velocity_norm() {
        let state = KinematicState::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))
            .with_velocity(Vector3::new(3.0, 4.0, 0.0));
        assert_relative_eq!(state.speed(), 5.0);
    }

    #[test]
    fn missing_actor_reads_as_none() {
        let snapshot = SimulationState::new(1, 0.05);
        assert!(snapshot.state(42).is_none());
    }
}
