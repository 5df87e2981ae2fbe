//! Static road network description.
//!
//! A [`RoadGraph`] is handed to the manager once per episode, before any
//! vehicles register. It is the interchange format between whatever produced
//! the map (a parser, an editor, a test builder) and the spatially indexed
//! [`LocalMap`](crate::local_map::LocalMap) the pipeline actually queries.
//! Node references use plain indices into the node list; validation of those
//! indices happens when the local map is built.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Index of a node within a [`RoadGraph`]'s node list.
pub type NodeIndex = u32;

/// One oriented sample point on a lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadNode {
    /// World position of the lane centerline sample, meters.
    pub position: Vector3<f64>,
    /// Unit direction of travel at this point.
    pub heading: Vector3<f64>,
    /// Road this lane belongs to.
    pub road_id: u32,
    /// Section within the road.
    pub section_id: u32,
    /// Signed lane id within the section.
    pub lane_id: i32,
    /// Posted speed limit at this point, m/s.
    pub speed_limit: f64,
    /// Whether this node lies inside a junction.
    pub is_junction: bool,
    /// Junction identifier, when `is_junction` is set.
    pub junction_id: Option<u32>,
    /// Nodes reachable by continuing forward.
    pub successors: Vec<NodeIndex>,
    /// Nodes from which this one is reachable.
    pub predecessors: Vec<NodeIndex>,
    /// Lateral neighbor to the left, if a legal lane change exists.
    pub left: Option<NodeIndex>,
    /// Lateral neighbor to the right, if a legal lane change exists.
    pub right: Option<NodeIndex>,
}

impl RoadNode {
    /// Creates a free-standing node with no topology attached.
    pub fn new(position: Vector3<f64>, heading: Vector3<f64>) -> Self {
        Self {
            position,
            heading,
            road_id: 0,
            section_id: 0,
            lane_id: 0,
            speed_limit: 13.89,
            is_junction: false,
            junction_id: None,
            successors: Vec::new(),
            predecessors: Vec::new(),
            left: None,
            right: None,
        }
    }

    pub fn with_lane(mut self, road_id: u32, section_id: u32, lane_id: i32) -> Self {
        self.road_id = road_id;
        self.section_id = section_id;
        self.lane_id = lane_id;
        self
    }

    pub fn with_speed_limit(mut self, limit: f64) -> Self {
        self.speed_limit = limit;
        self
    }

    pub fn with_junction(mut self, junction_id: u32) -> Self {
        self.is_junction = true;
        self.junction_id = Some(junction_id);
        self
    }

}

/// A directed graph of lane sample points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoadGraph {
    nodes: Vec<RoadNode>,
}

impl RoadGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its index.
    pub fn add_node(&mut self, node: RoadNode) -> NodeIndex {
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeIndex
    }

    /// Connects `from -> to` in both adjacency directions.
    pub fn link(&mut self, from: NodeIndex, to: NodeIndex) {
        if let Some(node) = self.nodes.get_mut(from as usize) {
            if !node.successors.contains(&to) {
                node.successors.push(to);
            }
        }
        if let Some(node) = self.nodes.get_mut(to as usize) {
            if !node.predecessors.contains(&from) {
                node.predecessors.push(from);
            }
        }
    }

    /// Marks `right_of` as the right-hand lateral neighbor of `node`, and
    /// `node` as the left-hand neighbor of `right_of`.
    pub fn link_lateral(&mut self, node: NodeIndex, right_of: NodeIndex) {
        if let Some(n) = self.nodes.get_mut(node as usize) {
            n.right = Some(right_of);
        }
        if let Some(n) = self.nodes.get_mut(right_of as usize) {
            n.left = Some(node);
        }
    }

    pub fn node(&self, index: NodeIndex) -> Option<&RoadNode> {
        self.nodes.get(index as usize)
    }

    pub fn nodes(&self) -> &[RoadNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
