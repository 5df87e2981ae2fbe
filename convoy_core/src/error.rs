//! Error types for the traffic manager.

use thiserror::Error;

/// Errors raised while building or driving the pipeline.
///
/// Nothing here is fatal to a running simulation: per-vehicle faults degrade
/// to "this vehicle coasts this frame" and are reported through
/// [`FrameDiagnostics`](crate::manager::FrameDiagnostics) instead.
#[derive(Debug, Error)]
pub enum TrafficError {
    /// The road graph handed to the map builder is structurally broken.
    #[error("invalid road graph: {0}")]
    InvalidRoadGraph(String),

    /// A link in the road graph points at a node that does not exist.
    #[error("dangling node reference: {0}")]
    DanglingReference(u32),

    /// An operation referenced an actor the registry does not know.
    #[error("unknown actor: {0}")]
    UnknownActor(u64),

    /// An actor was registered twice without an intervening deregistration.
    #[error("actor already registered: {0}")]
    AlreadyRegistered(u64),

    /// The worker thread pool could not be built.
    #[error("worker pool: {0}")]
    WorkerPool(String),
}

impl TrafficError {
    /// Creates an invalid-road-graph error.
    pub fn invalid_graph(msg: impl Into<String>) -> Self {
        Self::InvalidRoadGraph(msg.into())
    }
}
