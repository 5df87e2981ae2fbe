//! Reverse index from road space to the vehicles occupying it.
//!
//! Rebuilt from scratch every frame, in ascending actor order, after the
//! localization stage has refreshed all path buffers. A full rebuild of a
//! few-thousand-entry index is cheap and keeps the structure deterministic
//! regardless of how the parallel passes were scheduled.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::local_map::WaypointId;
use crate::simulation_state::ActorId;

/// Cell key over the horizontal plane.
fn cell_key(position: &Vector3<f64>, cell: f64) -> (i64, i64) {
    (
        (position.x / cell).floor() as i64,
        (position.y / cell).floor() as i64,
    )
}

/// Per-frame occupancy index.
#[derive(Debug, Default)]
pub struct TrackTraffic {
    /// Vehicles whose buffers pass through each waypoint.
    passing: HashMap<WaypointId, Vec<ActorId>>,
    /// Vehicles bucketed by position for radius queries.
    occupancy: HashMap<(i64, i64), Vec<ActorId>>,
    positions: HashMap<ActorId, Vector3<f64>>,
    cell_size: f64,
}

impl TrackTraffic {
    pub fn new(cell_size: f64) -> Self {
        Self {
            passing: HashMap::new(),
            occupancy: HashMap::new(),
            positions: HashMap::new(),
            cell_size,
        }
    }

    /// Records one vehicle's position and buffered waypoints. Call in
    /// ascending actor order so bucket contents are reproducible.
    pub fn insert(
        &mut self,
        actor: ActorId,
        position: Vector3<f64>,
        buffer: impl Iterator<Item = WaypointId>,
    ) {
        self.occupancy
            .entry(cell_key(&position, self.cell_size))
            .or_default()
            .push(actor);
        self.positions.insert(actor, position);
        for waypoint in buffer {
            self.passing.entry(waypoint).or_default().push(actor);
        }
    }

    /// Vehicles whose buffers pass through `waypoint`.
    pub fn passing_vehicles(&self, waypoint: WaypointId) -> &[ActorId] {
        self.passing
            .get(&waypoint)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Other vehicles within `radius` of `position`, horizontally and within
    /// `z_tolerance` vertically, in ascending actor order.
    pub fn neighbors_within(
        &self,
        actor: ActorId,
        position: &Vector3<f64>,
        radius: f64,
        z_tolerance: f64,
    ) -> Vec<ActorId> {
        let span = (radius / self.cell_size).ceil() as i64;
        let center = cell_key(position, self.cell_size);
        let mut found = Vec::new();
        for dx in -span..=span {
            for dy in -span..=span {
                let Some(bucket) = self.occupancy.get(&(center.0 + dx, center.1 + dy)) else {
                    continue;
                };
                for &other in bucket {
                    if other == actor {
                        continue;
                    }
                    let other_position = &self.positions[&other];
                    if (other_position.z - position.z).abs() > z_tolerance {
                        continue;
                    }
                    let planar = Vector3::new(
                        other_position.x - position.x,
                        other_position.y - position.y,
                        0.0,
                    )
                    .norm();
                    if planar <= radius {
                        found.push(other);
                    }
                }
            }
        }
        found.sort_unstable();
        found
    }

    pub fn position(&self, actor: ActorId) -> Option<&Vector3<f64>> {
        self.positions.get(&actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbors_are_radius_filtered_and_sorted() {
        let mut traffic = TrackTraffic::new(16.0);
        traffic.insert(3, Vector3::new(0.0, 0.0, 0.0), std::iter::empty());
        traffic.insert(1, Vector3::new(10.0, 0.0, 0.0), std::iter::empty());
        traffic.insert(2, Vector3::new(100.0, 0.0, 0.0), std::iter::empty());
        traffic.insert(4, Vector3::new(5.0, 5.0, 0.0), std::iter::empty());
        let neighbors = traffic.neighbors_within(3, &Vector3::zeros(), 20.0, 4.0);
        assert_eq!(neighbors, vec![1, 4]);
    }

    #[test]
    fn vertical_separation_excludes_stacked_vehicles() {
        let mut traffic = TrackTraffic::new(16.0);
        traffic.insert(1, Vector3::new(0.0, 0.0, 0.0), std::iter::empty());
        traffic.insert(2, Vector3::new(1.0, 0.0, 10.0), std::iter::empty());
        let neighbors = traffic.neighbors_within(1, &Vector3::zeros(), 20.0, 4.0);
        assert!(neighbors.is_empty());
    }

    #[test]
    fn passing_vehicles_tracks_buffer_membership() {
        let mut traffic = TrackTraffic::new(16.0);
        traffic.insert(
            1,
            Vector3::zeros(),
            [WaypointId(5), WaypointId(6)].into_iter(),
        );
        traffic.insert(2, Vector3::zeros(), [WaypointId(6)].into_iter());
        assert_eq!(traffic.passing_vehicles(WaypointId(6)), &[1, 2]);
        assert_eq!(traffic.passing_vehicles(WaypointId(5)), &[1]);
        assert!(traffic.passing_vehicles(WaypointId(9)).is_empty());
    }
}
