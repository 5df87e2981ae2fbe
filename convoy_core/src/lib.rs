//! Traffic manager core: a per-frame, multi-stage pipeline that drives a
//! large population of simulated vehicles over a static road network.
//!
//! One [`TrafficManager::tick`](manager::TrafficManager::tick) consumes an
//! immutable [`SimulationState`](simulation_state::SimulationState) snapshot
//! and produces a control command per registered vehicle:
//!
//! - localization keeps each vehicle's rolling waypoint buffer filled,
//! - the collision stage arbitrates right-of-way through region locks,
//! - the traffic-light stage gates on signals and junction queues,
//! - the motion planner turns path and hazards into throttle, brake and
//!   steering via gain-scheduled PID controllers.
//!
//! Everything is deterministic for a given seed, snapshot sequence and
//! configuration, regardless of worker-thread scheduling.

pub mod collision_lock;
pub mod constants;
pub mod error;
pub mod local_map;
pub mod manager;
pub mod parameters;
pub mod path_buffer;
pub mod pid;
pub mod registry;
pub mod road_graph;
pub mod signals;
pub mod simulation_state;
pub mod stages;
pub mod track_traffic;

pub use error::TrafficError;
pub use local_map::{LocalMap, Waypoint, WaypointId};
pub use manager::{
    ControlSink, FrameDiagnostics, FrameOutput, TickMode, TrafficManager, TrafficManagerConfig,
};
pub use parameters::{LaneChange, VehicleParameters};
pub use pid::VehicleControl;
pub use road_graph::{RoadGraph, RoadNode};
pub use signals::{LightId, LightRegistry, LightState};
pub use simulation_state::{ActorId, KinematicState, SimulationState};
