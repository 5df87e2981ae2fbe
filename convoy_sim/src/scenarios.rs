//! Scenario catalog.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The seeded scenarios the harness can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioId {
    /// Two vehicles share a lane; the faster one must follow, not collide.
    LaneFollowing,
    /// Two vehicles contest a junction; earlier arrival crosses first.
    JunctionContention,
    /// One vehicle ignores everyone and never yields.
    IgnoreVehicles,
    /// A red light stops traffic until it turns green.
    RedLight,
    /// A forced lane change moves a vehicle to the neighbor lane.
    LaneChange,
    /// Deregistering a lock holder releases the junction for the other.
    Deregistration,
    /// The same seed replays bit-identical controls across thread counts.
    DeterminismReplay,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::LaneFollowing,
            ScenarioId::JunctionContention,
            ScenarioId::IgnoreVehicles,
            ScenarioId::RedLight,
            ScenarioId::LaneChange,
            ScenarioId::Deregistration,
            ScenarioId::DeterminismReplay,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::LaneFollowing => "lane_following",
            ScenarioId::JunctionContention => "junction_contention",
            ScenarioId::IgnoreVehicles => "ignore_vehicles",
            ScenarioId::RedLight => "red_light",
            ScenarioId::LaneChange => "lane_change",
            ScenarioId::Deregistration => "deregistration",
            ScenarioId::DeterminismReplay => "determinism_replay",
        }
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lane_following" => Ok(ScenarioId::LaneFollowing),
            "junction_contention" => Ok(ScenarioId::JunctionContention),
            "ignore_vehicles" => Ok(ScenarioId::IgnoreVehicles),
            "red_light" => Ok(ScenarioId::RedLight),
            "lane_change" => Ok(ScenarioId::LaneChange),
            "deregistration" => Ok(ScenarioId::Deregistration),
            "determinism_replay" => Ok(ScenarioId::DeterminismReplay),
            other => Err(format!("unknown scenario '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
    }
}
