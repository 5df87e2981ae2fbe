//! Spatially indexed, immutable view of the road network.
//!
//! Built once per episode from a [`RoadGraph`]; every per-frame query the
//! pipeline makes (nearest waypoint, bounded look-ahead) goes through here.
//! Waypoints live in a flat arena and are referenced by [`WaypointId`]
//! handles, so the cyclic lane topology never creates ownership cycles.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::{debug, warn};

use crate::constants::map;
use crate::error::TrafficError;
use crate::road_graph::RoadGraph;

/// Handle to a waypoint in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaypointId(pub u32);

/// One oriented point on a lane, owned by the arena.
#[derive(Debug, Clone)]
pub struct Waypoint {
    pub position: Vector3<f64>,
    pub heading: Vector3<f64>,
    pub road_id: u32,
    pub section_id: u32,
    pub lane_id: i32,
    pub speed_limit: f64,
    pub is_junction: bool,
    pub junction_id: Option<u32>,
    pub successors: Vec<WaypointId>,
    pub left: Option<WaypointId>,
    pub right: Option<WaypointId>,
}

/// Cell key for the uniform spatial hash.
fn grid_key(position: &Vector3<f64>, cell: f64) -> (i64, i64) {
    (
        (position.x / cell).floor() as i64,
        (position.y / cell).floor() as i64,
    )
}

/// Immutable spatial index over the road network.
pub struct LocalMap {
    waypoints: Vec<Waypoint>,
    grid: HashMap<(i64, i64), Vec<WaypointId>>,
    search_radius: f64,
    cell_size: f64,
}

impl LocalMap {
    /// Builds the arena and spatial hash from a road graph.
    ///
    /// Consecutive nodes farther apart than the map resolution are densified
    /// with interpolated waypoints so look-ahead distances stay meaningful on
    /// sparse inputs. Fails if the graph is empty or contains dangling
    /// references.
    pub fn build_from(graph: &RoadGraph) -> Result<Self, TrafficError> {
        if graph.is_empty() {
            return Err(TrafficError::invalid_graph("graph has no nodes"));
        }
        let node_count = graph.len() as u32;
        for (index, node) in graph.nodes().iter().enumerate() {
            for &reference in node
                .successors
                .iter()
                .chain(node.predecessors.iter())
                .chain(node.left.iter())
                .chain(node.right.iter())
            {
                if reference >= node_count {
                    warn!(node = index, reference, "dangling node reference");
                    return Err(TrafficError::DanglingReference(reference));
                }
            }
        }

        // Seed the arena with one waypoint per graph node. Handles are the
        // node indices, so topology carries over directly.
        let mut waypoints: Vec<Waypoint> = graph
            .nodes()
            .iter()
            .map(|node| Waypoint {
                position: node.position,
                heading: node.heading,
                road_id: node.road_id,
                section_id: node.section_id,
                lane_id: node.lane_id,
                speed_limit: node.speed_limit,
                is_junction: node.is_junction,
                junction_id: node.junction_id,
                successors: node.successors.iter().map(|&i| WaypointId(i)).collect(),
                left: node.left.map(WaypointId),
                right: node.right.map(WaypointId),
            })
            .collect();

        densify(&mut waypoints, map::MAP_RESOLUTION);

        let cell_size = map::GRID_CELL_SIZE;
        let mut grid: HashMap<(i64, i64), Vec<WaypointId>> = HashMap::new();
        for (index, waypoint) in waypoints.iter().enumerate() {
            grid.entry(grid_key(&waypoint.position, cell_size))
                .or_default()
                .push(WaypointId(index as u32));
        }

        debug!(
            nodes = graph.len(),
            waypoints = waypoints.len(),
            cells = grid.len(),
            "local map built"
        );

        Ok(Self {
            waypoints,
            grid,
            search_radius: map::NEAREST_SEARCH_RADIUS,
            cell_size,
        })
    }

    pub fn waypoint(&self, id: WaypointId) -> &Waypoint {
        &self.waypoints[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Nearest waypoint to `position`, or `None` when the position is farther
    /// than the search radius from every waypoint. Vertical separation beyond
    /// the z tolerance disqualifies a candidate so stacked roads resolve to
    /// the correct level.
    pub fn nearest_waypoint(&self, position: &Vector3<f64>) -> Option<WaypointId> {
        let cell_span = (self.search_radius / self.cell_size).ceil() as i64;
        let center = grid_key(position, self.cell_size);
        let mut best: Option<(WaypointId, f64)> = None;
        for dx in -cell_span..=cell_span {
            for dy in -cell_span..=cell_span {
                let Some(bucket) = self.grid.get(&(center.0 + dx, center.1 + dy)) else {
                    continue;
                };
                for &id in bucket {
                    let waypoint = self.waypoint(id);
                    if (waypoint.position.z - position.z).abs() > map::NEAREST_Z_TOLERANCE {
                        continue;
                    }
                    let planar = Vector3::new(
                        waypoint.position.x - position.x,
                        waypoint.position.y - position.y,
                        0.0,
                    )
                    .norm();
                    if planar > self.search_radius {
                        continue;
                    }
                    match best {
                        Some((_, current)) if current <= planar => {}
                        _ => best = Some((id, planar)),
                    }
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// Walks successors from `start` until `distance` meters are covered or a
    /// dead end is reached. At splits the straightest-angle continuation is
    /// taken, so the walk is deterministic. `start` itself is not included.
    pub fn look_ahead(&self, start: WaypointId, distance: f64) -> Vec<WaypointId> {
        let mut result = Vec::new();
        let mut current = start;
        let mut covered = 0.0;
        while covered < distance {
            let Some(next) = self.straightest_successor(current) else {
                break;
            };
            covered += (self.waypoint(next).position - self.waypoint(current).position).norm();
            result.push(next);
            current = next;
        }
        result
    }

    /// The successor whose heading deviates least from the current heading.
    pub fn straightest_successor(&self, id: WaypointId) -> Option<WaypointId> {
        let waypoint = self.waypoint(id);
        let mut best: Option<(WaypointId, f64)> = None;
        for &succ in &waypoint.successors {
            let dot = waypoint.heading.dot(&self.waypoint(succ).heading);
            match best {
                // Ties on angle fall to the lower handle for stability.
                Some((best_id, best_dot))
                    if best_dot > dot || (best_dot == dot && best_id < succ) => {}
                _ => best = Some((succ, dot)),
            }
        }
        best.map(|(id, _)| id)
    }

    /// Distance along the lane between two waypoints' positions.
    pub fn distance_between(&self, a: WaypointId, b: WaypointId) -> f64 {
        (self.waypoint(a).position - self.waypoint(b).position).norm()
    }
}

/// Inserts interpolated waypoints on links longer than `resolution`.
///
/// Interpolated points inherit lane metadata from the link's source node and
/// carry no lateral neighbors; lane changes only initiate from the original
/// samples.
fn densify(waypoints: &mut Vec<Waypoint>, resolution: f64) {
    let original_count = waypoints.len();
    for source_index in 0..original_count {
        let successors = waypoints[source_index].successors.clone();
        for (slot, &succ) in successors.iter().enumerate() {
            let from = waypoints[source_index].position;
            let to = waypoints[succ.0 as usize].position;
            let span = (to - from).norm();
            if span <= resolution {
                continue;
            }
            let segments = (span / resolution).ceil() as usize;
            let mut previous: Option<WaypointId> = None;
            for step in 1..segments {
                let t = step as f64 / segments as f64;
                let template = &waypoints[source_index];
                let interpolated = Waypoint {
                    position: from + (to - from) * t,
                    heading: template.heading,
                    road_id: template.road_id,
                    section_id: template.section_id,
                    lane_id: template.lane_id,
                    speed_limit: template.speed_limit,
                    is_junction: template.is_junction,
                    junction_id: template.junction_id,
                    successors: vec![succ],
                    left: None,
                    right: None,
                };
                let id = WaypointId(waypoints.len() as u32);
                waypoints.push(interpolated);
                match previous {
                    Some(prev) => waypoints[prev.0 as usize].successors = vec![id],
                    None => waypoints[source_index].successors[slot] = id,
                }
                previous = Some(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road_graph::RoadNode;
    use approx::assert_relative_eq;

    fn straight_line(spacing: f64, count: usize) -> RoadGraph {
        let mut graph = RoadGraph::new();
        let heading = Vector3::new(1.0, 0.0, 0.0);
        let mut previous = None;
        for i in 0..count {
            let node = graph.add_node(RoadNode::new(
                Vector3::new(i as f64 * spacing, 0.0, 0.0),
                heading,
            ));
            if let Some(prev) = previous {
                graph.link(prev, node);
            }
            previous = Some(node);
        }
        graph
    }

    #[test]
    fn empty_graph_is_rejected() {
        assert!(LocalMap::build_from(&RoadGraph::new()).is_err());
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let mut graph = straight_line(5.0, 3);
        graph.link(2, 99);
        assert!(matches!(
            LocalMap::build_from(&graph),
            Err(TrafficError::DanglingReference(99))
        ));
    }

    #[test]
    fn nearest_waypoint_snaps_to_the_closest_sample() {
        let map = LocalMap::build_from(&straight_line(5.0, 10)).unwrap();
        let found = map
            .nearest_waypoint(&Vector3::new(11.0, 1.0, 0.0))
            .unwrap();
        assert_relative_eq!(map.waypoint(found).position.x, 10.0);
    }

    #[test]
    fn nearest_waypoint_reports_no_match_far_from_graph() {
        let map = LocalMap::build_from(&straight_line(5.0, 10)).unwrap();
        assert!(map
            .nearest_waypoint(&Vector3::new(0.0, 500.0, 0.0))
            .is_none());
    }

    #[test]
    fn nearest_waypoint_ignores_stacked_roads() {
        let mut graph = straight_line(5.0, 4);
        // A parallel road 10 m overhead, laterally closer to the query point.
        let overhead = graph.add_node(RoadNode::new(
            Vector3::new(6.0, 0.5, 10.0),
            Vector3::new(1.0, 0.0, 0.0),
        ));
        graph.link(overhead, 0);
        let map = LocalMap::build_from(&graph).unwrap();
        let found = map.nearest_waypoint(&Vector3::new(6.0, 0.5, 0.0)).unwrap();
        assert_relative_eq!(map.waypoint(found).position.z, 0.0);
    }

    #[test]
    fn look_ahead_covers_the_requested_distance() {
        let map = LocalMap::build_from(&straight_line(5.0, 20)).unwrap();
        let path = map.look_ahead(WaypointId(0), 30.0);
        assert_eq!(path.len(), 6);
        assert_eq!(path.last(), Some(&WaypointId(6)));
    }

    #[test]
    fn look_ahead_stops_at_dead_ends() {
        let map = LocalMap::build_from(&straight_line(5.0, 4)).unwrap();
        let path = map.look_ahead(WaypointId(0), 100.0);
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn splits_resolve_to_the_straightest_branch() {
        let mut graph = straight_line(5.0, 2);
        let straight = graph.add_node(RoadNode::new(
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        ));
        let turning = graph.add_node(RoadNode::new(
            Vector3::new(10.0, 2.0, 0.0),
            Vector3::new(0.5, 0.5, 0.0).normalize(),
        ));
        graph.link(1, straight);
        graph.link(1, turning);
        let map = LocalMap::build_from(&graph).unwrap();
        assert_eq!(
            map.straightest_successor(WaypointId(1)),
            Some(WaypointId(straight))
        );
    }

    #[test]
    fn sparse_links_are_densified() {
        let map = LocalMap::build_from(&straight_line(20.0, 2)).unwrap();
        // One 20 m link at 5 m resolution gains three interior points.
        assert_eq!(map.len(), 5);
        let path = map.look_ahead(WaypointId(0), 20.0);
        let mut previous = map.waypoint(WaypointId(0)).position;
        for id in path {
            let next = map.waypoint(id).position;
            assert!((next - previous).norm() <= 5.0 + 1e-9);
            previous = next;
        }
    }
}
