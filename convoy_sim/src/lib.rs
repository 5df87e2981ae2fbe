//! Deterministic scenario harness for the convoy traffic manager.
//!
//! The harness closes the loop the manager itself never owns: a ground-truth
//! oracle integrates the controls each tick and feeds the next snapshot back
//! in. Scenarios assert driving behavior against oracle state, so a pass
//! means vehicles actually stopped, yielded, or crossed, not merely that the
//! manager said they would.

pub mod maps;
pub mod oracle;
pub mod runner;
pub mod scenarios;

pub use runner::{seed_sequence, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
