//! Tuning constants for the traffic manager, grouped by concern.
//!
//! These are policy defaults, not physical truths; the handful that callers
//! commonly need to vary are mirrored as fields of
//! [`TrafficManagerConfig`](crate::manager::TrafficManagerConfig).

/// Local map construction and spatial queries.
pub mod map {
    /// Target spacing between consecutive waypoints on a lane, in meters.
    /// Sparser input segments are densified to roughly this resolution.
    pub const MAP_RESOLUTION: f64 = 5.0;

    /// Edge length of a spatial-hash grid cell, in meters.
    pub const GRID_CELL_SIZE: f64 = 16.0;

    /// Beyond this radius a nearest-waypoint query reports no match.
    pub const NEAREST_SEARCH_RADIUS: f64 = 30.0;

    /// Vertical tolerance for nearest-waypoint matches; keeps vehicles on an
    /// overpass from snapping onto the road below.
    pub const NEAREST_Z_TOLERANCE: f64 = 4.0;
}

/// Path buffer maintenance.
pub mod path_buffer {
    /// Minimum look-ahead horizon, in meters.
    pub const MINIMUM_HORIZON_LENGTH: f64 = 15.0;

    /// Horizon grows with speed at this rate (seconds of look-ahead).
    pub const HORIZON_RATE: f64 = 2.0;

    /// Horizon rate once the vehicle is at highway speed.
    pub const HIGH_SPEED_HORIZON_RATE: f64 = 4.0;

    /// If the buffer front is farther than this from the vehicle, the buffer
    /// is assumed stale (teleport, spawn) and rebuilt from scratch.
    pub const MAX_START_DISTANCE: f64 = 20.0;

    /// Distance ahead of the vehicle used to detect junction entrances.
    pub const JUNCTION_LOOK_AHEAD: f64 = 5.0;
}

/// Speed regime thresholds.
pub mod speed {
    /// Above this speed (m/s) the highway PID gain sets apply.
    pub const HIGHWAY_SPEED: f64 = 60.0 / 3.6;
}

/// Lane changes.
pub mod lane_change {
    /// Minimum clearance to an obstacle before a lane change is attempted.
    pub const MINIMUM_LANE_CHANGE_DISTANCE: f64 = 20.0;

    /// Lane changes are not attempted below this speed (m/s).
    pub const MIN_LANE_CHANGE_SPEED: f64 = 5.0;

    /// Distance covered while merging into the target lane, clamped.
    pub const MIN_CHANGE_OVER_DISTANCE: f64 = 5.0;
    pub const MAX_CHANGE_OVER_DISTANCE: f64 = 20.0;

    /// Minimum travel after a lane change before another may start.
    pub const INTER_LANE_CHANGE_DISTANCE: f64 = 10.0;
}

/// Collision detection and right-of-way arbitration.
pub mod collision {
    /// Base radius, in meters, within which neighbors become candidates.
    pub const COLLISION_RADIUS_MIN: f64 = 20.0;

    /// Candidate radius grows with speed at this rate.
    pub const COLLISION_RADIUS_RATE: f64 = 2.65;

    /// Candidate radius when the vehicle is nearly stopped.
    pub const COLLISION_RADIUS_STOP: f64 = 8.0;

    /// Neighbors farther apart vertically than this never interact.
    pub const VERTICAL_OVERLAP_THRESHOLD: f64 = 4.0;

    /// Speed below which a vehicle counts as stopped for radius selection.
    pub const STOPPED_VELOCITY_THRESHOLD: f64 = 2.0;

    /// Floor applied to the configured follow distance when computing the
    /// margin handed to the motion planner.
    pub const MIN_REFERENCE_DISTANCE: f64 = 0.5;

    /// Floor on speeds used for arrival-time estimates, m/s.
    pub const MIN_ARRIVAL_SPEED: f64 = 0.1;

    /// Default number of frames a collision lock may be held before it is
    /// force-released, regardless of holder progress.
    pub const LOCK_HOLD_FRAMES: u64 = 200;

    /// Number of stripes in the contested-region lock table.
    pub const LOCK_STRIPES: usize = 16;
}

/// Traffic lights and unsignalised junctions.
pub mod traffic_light {
    /// A vehicle must rest at an unsignalised junction for at least this many
    /// seconds before it may claim entry.
    pub const MINIMUM_STOP_TIME: f64 = 2.0;

    /// Speed under which a vehicle counts as stopped at a junction, m/s.
    pub const EPSILON_STOP_SPEED: f64 = 0.05;
}

/// Motion planning.
pub mod motion_plan {
    /// Follow distance grows with speed at this rate.
    pub const FOLLOW_LEAD_FACTOR: f64 = 2.0;

    /// Minimum follow distance behind a lead vehicle, in meters.
    pub const MIN_FOLLOW_LEAD_DISTANCE: f64 = 2.0;

    /// Below this margin the planner commands an emergency stop.
    pub const CRITICAL_BRAKING_MARGIN: f64 = 0.2;

    /// Speed used to creep toward a lead vehicle that is still far away.
    pub const RELATIVE_APPROACH_SPEED: f64 = 12.0 / 3.6;

    /// Fraction of current speed a vehicle may shed per frame; bounds the
    /// deceleration profile so hazards never cause instantaneous stops.
    pub const PERC_MAX_SLOWDOWN: f64 = 0.08;

    /// Seconds of look-ahead for the steering target waypoint.
    pub const TARGET_WAYPOINT_TIME_HORIZON: f64 = 0.3;

    /// Floor on the steering target distance, in meters.
    pub const MIN_TARGET_WAYPOINT_DISTANCE: f64 = 3.0;

    /// Tire friction coefficient used for curve speed limits.
    pub const FRICTION: f64 = 0.6;

    /// Gravitational acceleration, m/s^2.
    pub const GRAVITY: f64 = 9.81;

    /// A jump in measured speed beyond this, m/s, resets PID state to avoid
    /// integral windup after teleports.
    pub const SPEED_DISCONTINUITY: f64 = 10.0;
}

/// PID controller limits and default gain sets `[kp, ki, kd]`.
pub mod pid {
    pub const MAX_THROTTLE: f64 = 0.85;
    pub const MAX_BRAKE: f64 = 0.7;
    pub const MAX_STEERING: f64 = 0.8;

    /// Steering output may move at most this far between frames.
    pub const MAX_STEERING_DIFF: f64 = 0.15;

    /// Default frame period, seconds.
    pub const DT: f64 = 0.05;

    pub const LONGITUDINAL_PARAM: [f64; 3] = [12.0, 0.05, 0.02];
    pub const LONGITUDINAL_HIGHWAY_PARAM: [f64; 3] = [20.0, 0.05, 0.01];
    pub const LATERAL_PARAM: [f64; 3] = [4.0, 0.02, 0.08];
    pub const LATERAL_HIGHWAY_PARAM: [f64; 3] = [2.0, 0.02, 0.04];
}
