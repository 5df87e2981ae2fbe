//! Live set of vehicles under traffic-manager control.

use std::collections::HashMap;

use crate::error::TrafficError;
use crate::path_buffer::PathBuffer;
use crate::pid::PidState;
use crate::simulation_state::ActorId;

/// Everything the manager owns about one registered vehicle.
#[derive(Debug, Default)]
pub struct VehicleRecord {
    pub buffer: PathBuffer,
    pub pid_state: PidState,
    /// Last frame in which a live snapshot entry was seen for this vehicle.
    pub last_seen_frame: u64,
    /// Frame of the most recent lane-change assignment, used for spacing.
    pub last_lane_change_frame: Option<u64>,
}

/// Single owner of the actor-to-record association.
///
/// Stages borrow records for the duration of a frame and never cache actor
/// identity beyond it.
#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<ActorId, VehicleRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, actor: ActorId) -> Result<(), TrafficError> {
        if self.records.contains_key(&actor) {
            return Err(TrafficError::AlreadyRegistered(actor));
        }
        self.records.insert(actor, VehicleRecord::default());
        Ok(())
    }

    pub fn deregister(&mut self, actor: ActorId) -> Result<(), TrafficError> {
        self.records
            .remove(&actor)
            .map(|_| ())
            .ok_or(TrafficError::UnknownActor(actor))
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.records.contains_key(&actor)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, actor: ActorId) -> Option<&VehicleRecord> {
        self.records.get(&actor)
    }

    pub fn record_mut(&mut self, actor: ActorId) -> Option<&mut VehicleRecord> {
        self.records.get_mut(&actor)
    }

    /// Actor ids in ascending order; the frame's canonical iteration order.
    pub fn sorted_ids(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Mutable references to all records, in ascending actor order, for the
    /// parallel per-vehicle passes.
    pub fn records_mut_sorted(&mut self) -> Vec<(ActorId, &mut VehicleRecord)> {
        let mut entries: Vec<(ActorId, &mut VehicleRecord)> = self
            .records
            .iter_mut()
            .map(|(&actor, record)| (actor, record))
            .collect();
        entries.sort_unstable_by_key(|(actor, _)| *actor);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_registration_is_an_error() {
        let mut registry = Registry::new();
        registry.register(1).unwrap();
        assert!(matches!(
            registry.register(1),
            Err(TrafficError::AlreadyRegistered(1))
        ));
    }

    #[test]
    fn deregistering_an_unknown_actor_is_an_error() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.deregister(9),
            Err(TrafficError::UnknownActor(9))
        ));
    }

    #[test]
    fn sorted_ids_are_ascending() {
        let mut registry = Registry::new();
        for id in [5, 1, 9, 2] {
            registry.register(id).unwrap();
        }
        assert_eq!(registry.sorted_ids(), vec![1, 2, 5, 9]);
    }
}
