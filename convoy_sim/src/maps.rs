//! Programmatic road-network builders for scenarios and tests.

use convoy_core::{RoadGraph, RoadNode};
use nalgebra::Vector3;

/// Lane width used by all builders, meters.
pub const LANE_WIDTH: f64 = 3.5;

/// Node spacing used by all builders, meters.
pub const SPACING: f64 = 5.0;

/// A straight eastbound road with `lanes` parallel lanes of `length` meters.
///
/// Lane 0 runs along y = 0; each further lane sits `LANE_WIDTH` to the
/// right (negative y). Lateral neighbors are linked for lane changes.
pub fn straight_road(lanes: usize, length: f64) -> RoadGraph {
    let mut graph = RoadGraph::new();
    let heading = Vector3::new(1.0, 0.0, 0.0);
    let count = (length / SPACING).ceil() as usize + 1;
    let mut rows = Vec::with_capacity(lanes);
    for lane in 0..lanes {
        let y = -(lane as f64) * LANE_WIDTH;
        let mut row = Vec::with_capacity(count);
        for i in 0..count {
            let s = i as f64 * SPACING;
            row.push(graph.add_node(
                RoadNode::new(Vector3::new(s, y, 0.0), heading).with_lane(1, 0, lane as i32 + 1),
            ));
        }
        for i in 0..count - 1 {
            graph.link(row[i], row[i + 1]);
        }
        rows.push(row);
    }
    for lane in 0..lanes.saturating_sub(1) {
        for i in 0..count {
            graph.link_lateral(rows[lane][i], rows[lane + 1][i]);
        }
    }
    graph
}

/// A four-way junction: two single-lane roads crossing at the origin.
///
/// Each through-movement gets its own connector waypoint at the center,
/// carrying junction id 1, so eastbound and northbound paths conflict
/// spatially without sharing a waypoint. Arms extend `arm_length` meters.
pub fn four_way_junction(arm_length: f64) -> RoadGraph {
    let mut graph = RoadGraph::new();
    let east = Vector3::new(1.0, 0.0, 0.0);
    let north = Vector3::new(0.0, 1.0, 0.0);
    let count = (arm_length / SPACING).ceil() as usize;

    let mut eastbound = Vec::new();
    for i in 0..count {
        let x = -(count as f64 - i as f64) * SPACING;
        eastbound.push(graph.add_node(
            RoadNode::new(Vector3::new(x, 0.0, 0.0), east).with_lane(1, 0, 1),
        ));
    }
    let east_connector =
        graph.add_node(RoadNode::new(Vector3::zeros(), east).with_junction(1));
    eastbound.push(east_connector);
    for i in 1..=count {
        eastbound.push(graph.add_node(
            RoadNode::new(Vector3::new(i as f64 * SPACING, 0.0, 0.0), east).with_lane(2, 0, 1),
        ));
    }

    let mut northbound = Vec::new();
    for i in 0..count {
        let y = -(count as f64 - i as f64) * SPACING;
        northbound.push(graph.add_node(
            RoadNode::new(Vector3::new(0.0, y, 0.0), north).with_lane(3, 0, 1),
        ));
    }
    let north_connector =
        graph.add_node(RoadNode::new(Vector3::zeros(), north).with_junction(1));
    northbound.push(north_connector);
    for i in 1..=count {
        northbound.push(graph.add_node(
            RoadNode::new(Vector3::new(0.0, i as f64 * SPACING, 0.0), north).with_lane(4, 0, 1),
        ));
    }

    for i in 0..eastbound.len() - 1 {
        graph.link(eastbound[i], eastbound[i + 1]);
    }
    for i in 0..northbound.len() - 1 {
        graph.link(northbound[i], northbound[i + 1]);
    }
    graph
}

/// A closed ring of radius `radius` meters, single counterclockwise lane.
pub fn ring_road(radius: f64) -> RoadGraph {
    let mut graph = RoadGraph::new();
    let count = ((2.0 * std::f64::consts::PI * radius) / SPACING).ceil() as usize;
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let theta = 2.0 * std::f64::consts::PI * i as f64 / count as f64;
        let position = Vector3::new(radius * theta.cos(), radius * theta.sin(), 0.0);
        let heading = Vector3::new(-theta.sin(), theta.cos(), 0.0);
        ids.push(graph.add_node(
            RoadNode::new(position, heading).with_lane(9, 0, 1),
        ));
    }
    for i in 0..count {
        graph.link(ids[i], ids[(i + 1) % count]);
    }
    graph
}
