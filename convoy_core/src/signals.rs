//! Traffic light registry.
//!
//! Lights are external collaborators; the manager only needs to know which
//! light gates which stretch of road and whether that light currently demands
//! a stop. The registry is part of the static episode setup, light states are
//! updated between frames by the caller.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::local_map::WaypointId;

/// Stable identifier of a traffic light.
pub type LightId = u32;

/// Phase of a traffic light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightState {
    Red,
    Yellow,
    Green,
    /// Light exists but is switched off; treated as a stop sign.
    Off,
}

impl LightState {
    /// Whether a vehicle approaching this light must stop.
    pub fn demands_stop(self) -> bool {
        !matches!(self, LightState::Green)
    }
}

/// All traffic lights of the episode plus their current states.
#[derive(Debug, Clone, Default)]
pub struct LightRegistry {
    /// Waypoints inside each light's control zone.
    zones: HashMap<LightId, Vec<WaypointId>>,
    /// Reverse index for path-intersection queries.
    zone_of: HashMap<WaypointId, LightId>,
    states: HashMap<LightId, LightState>,
}

impl LightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a light and the waypoints it controls. A waypoint belongs to
    /// at most one light; later registrations win.
    pub fn add_light(&mut self, light: LightId, zone: Vec<WaypointId>) {
        for &waypoint in &zone {
            self.zone_of.insert(waypoint, light);
        }
        self.zones.insert(light, zone);
        self.states.entry(light).or_insert(LightState::Red);
    }

    pub fn set_state(&mut self, light: LightId, state: LightState) {
        self.states.insert(light, state);
    }

    pub fn state(&self, light: LightId) -> Option<LightState> {
        self.states.get(&light).copied()
    }

    /// Light controlling `waypoint`, if any.
    pub fn light_at(&self, waypoint: WaypointId) -> Option<LightId> {
        self.zone_of.get(&waypoint).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
