//! Pipeline orchestrator: one full pass of all stages per simulation frame.
//!
//! Stage order, with hard barriers between the steps:
//!
//! 1. lock sweep (serial)
//! 2. localization (parallel per vehicle)
//! 3. occupancy rebuild (serial, ascending actor order)
//! 4. collision assess / claim / finalize (parallel, with barriers)
//! 5. traffic-light gating (parallel) and junction queues (serial)
//! 6. motion plan (parallel per vehicle)
//!
//! Parallel passes write into index-aligned slots over the frame's sorted
//! actor list and all randomness comes from per-actor seeded streams, so a
//! tick is a pure function of the snapshot sequence and the configuration.

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collision_lock::{LockTable, RegionId};
use crate::constants::{collision as collision_consts, map as map_consts, path_buffer};
use crate::error::TrafficError;
use crate::local_map::LocalMap;
use crate::parameters::{Parameters, VehicleParameters};
use crate::pid::{GainSchedule, VehicleControl};
use crate::registry::Registry;
use crate::signals::{LightRegistry, LightState};
use crate::simulation_state::{ActorId, SimulationState};
use crate::stages::{
    actor_rng, collision, localization, motion_plan, roll, traffic_light, CollisionFrame,
    LocalizationFrame, TrafficLightFrame,
};
use crate::track_traffic::TrackTraffic;

// Stage salts keep the per-actor random streams of different stages
// uncorrelated while staying derived from the one configured seed.
const LOCALIZATION_STREAM: u64 = 0x4c4f_4341;
const COLLISION_STREAM: u64 = 0x434f_4c4c;
const LIGHT_STREAM: u64 = 0x4c49_4754;

/// How `tick` treats repeated frame ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickMode {
    /// Every call runs the full pipeline.
    Synchronous,
    /// A call with the same frame id as the previous one is a no-op.
    BestEffort,
}

/// Global configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct TrafficManagerConfig {
    /// Seed for all stochastic behavior; identical seeds replay identically.
    pub seed: u64,
    /// Minimum path-buffer horizon, meters.
    pub min_horizon: f64,
    /// Scale on the collision-stage neighbor radius.
    pub hazard_distance_multiplier: f64,
    /// PID gain tables for both speed regimes.
    pub gains: GainSchedule,
    /// Frames a collision lock may be held before force release.
    pub lock_hold_frames: u64,
    /// Worker threads for the parallel passes; 0 uses the process-wide pool.
    pub worker_threads: usize,
    pub tick_mode: TickMode,
}

impl Default for TrafficManagerConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            min_horizon: path_buffer::MINIMUM_HORIZON_LENGTH,
            hazard_distance_multiplier: 1.0,
            gains: GainSchedule::default(),
            lock_hold_frames: collision_consts::LOCK_HOLD_FRAMES,
            worker_threads: 0,
            tick_mode: TickMode::Synchronous,
        }
    }
}

/// Aggregate per-frame fault counts. Faults degrade individual vehicles,
/// never the tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDiagnostics {
    /// Registered vehicles with no live snapshot entry this frame.
    pub vehicles_skipped: usize,
    /// Locks dropped because their holder disappeared or overstayed.
    pub locks_force_released: usize,
    /// Vehicles whose buffer hit a graph dead end.
    pub dead_ends: usize,
    /// Vehicles with no nearest waypoint.
    pub off_graph: usize,
}

/// Result of one tick.
#[derive(Debug, Clone, Default)]
pub struct FrameOutput {
    pub controls: BTreeMap<ActorId, VehicleControl>,
    pub diagnostics: FrameDiagnostics,
}

/// Outbound apply-control collaborator.
pub trait ControlSink {
    fn apply_control(&mut self, actor: ActorId, control: VehicleControl);
}

/// The traffic manager itself.
pub struct TrafficManager {
    local_map: LocalMap,
    config: TrafficManagerConfig,
    registry: Registry,
    parameters: Parameters,
    lights: LightRegistry,
    locks: LockTable,
    arbiter: traffic_light::JunctionArbiter,
    pool: Option<rayon::ThreadPool>,
    previous_traffic: Option<TrackTraffic>,
    last_frame: Option<u64>,
    /// Force releases from deregistrations between ticks, reported with the
    /// next frame's diagnostics.
    pending_force_released: usize,
}

impl TrafficManager {
    pub fn new(local_map: LocalMap, config: TrafficManagerConfig) -> Result<Self, TrafficError> {
        let pool = if config.worker_threads > 0 {
            let built = rayon::ThreadPoolBuilder::new()
                .num_threads(config.worker_threads)
                .build()
                .map_err(|e| TrafficError::WorkerPool(e.to_string()))?;
            Some(built)
        } else {
            None
        };
        info!(
            waypoints = local_map.len(),
            seed = config.seed,
            threads = config.worker_threads,
            "traffic manager ready"
        );
        Ok(Self {
            local_map,
            locks: LockTable::new(config.lock_hold_frames),
            config,
            registry: Registry::new(),
            parameters: Parameters::default(),
            lights: LightRegistry::new(),
            arbiter: traffic_light::JunctionArbiter::new(),
            pool,
            previous_traffic: None,
            last_frame: None,
            pending_force_released: 0,
        })
    }

    pub fn local_map(&self) -> &LocalMap {
        &self.local_map
    }

    /// Puts a vehicle under manager control. Re-registration after a
    /// deregistration starts from a clean record, PID state included.
    pub fn register_vehicle(
        &mut self,
        actor: ActorId,
        parameters: VehicleParameters,
    ) -> Result<(), TrafficError> {
        self.registry.register(actor)?;
        self.parameters.set(actor, parameters);
        debug!(actor, "vehicle registered");
        Ok(())
    }

    /// Removes a vehicle and force-releases any locks it holds.
    pub fn deregister_vehicle(&mut self, actor: ActorId) -> Result<(), TrafficError> {
        self.registry.deregister(actor)?;
        self.parameters.remove(actor);
        self.arbiter.forget(actor);
        let released = self.locks.release_holder(actor);
        self.pending_force_released += released;
        debug!(actor, released, "vehicle deregistered");
        Ok(())
    }

    pub fn set_parameters(
        &mut self,
        actor: ActorId,
        parameters: VehicleParameters,
    ) -> Result<(), TrafficError> {
        if !self.registry.contains(actor) {
            return Err(TrafficError::UnknownActor(actor));
        }
        self.parameters.set(actor, parameters);
        Ok(())
    }

    /// Traffic lights are external; the episode setup registers them here
    /// and updates their states between frames.
    pub fn add_light(&mut self, light: u32, zone: Vec<crate::local_map::WaypointId>) {
        self.lights.add_light(light, zone);
    }

    pub fn set_light_state(&mut self, light: u32, state: LightState) {
        self.lights.set_state(light, state);
    }

    /// Number of active collision locks, exposed for harness assertions.
    pub fn active_locks(&self) -> usize {
        self.locks.active_locks()
    }

    pub fn locks_held_by(&self, actor: ActorId) -> usize {
        self.locks.locks_held_by(actor)
    }

    /// A vehicle's buffered waypoints, front first, for inspection.
    pub fn path_of(&self, actor: ActorId) -> Option<Vec<crate::local_map::WaypointId>> {
        self.registry
            .record(actor)
            .map(|record| record.buffer.iter().collect())
    }

    fn install<R: Send>(&self, work: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }

    /// Runs the full pipeline for one frame.
    pub fn tick(&mut self, snapshot: &SimulationState) -> FrameOutput {
        if self.config.tick_mode == TickMode::BestEffort && self.last_frame == Some(snapshot.frame)
        {
            debug!(frame = snapshot.frame, "duplicate frame skipped");
            return FrameOutput::default();
        }
        self.last_frame = Some(snapshot.frame);

        let mut diagnostics = FrameDiagnostics {
            locks_force_released: std::mem::take(&mut self.pending_force_released),
            ..FrameDiagnostics::default()
        };

        let ids = self.registry.sorted_ids();
        diagnostics.vehicles_skipped = ids
            .iter()
            .filter(|&&actor| !snapshot.contains(actor))
            .count();

        let localization_frames = self.run_localization(&ids, snapshot);
        for frame in &localization_frames {
            if frame.dead_end {
                diagnostics.dead_ends += 1;
            }
            if frame.off_graph {
                diagnostics.off_graph += 1;
            }
        }

        let traffic = self.rebuild_traffic(&ids, snapshot);
        diagnostics.locks_force_released += self.sweep_locks(snapshot);

        let collision_frames = self.run_collision(&ids, snapshot, &traffic);
        let light_frames = self.run_traffic_light(&ids, snapshot, &localization_frames);
        let controls = self.run_motion_plan(
            &ids,
            snapshot,
            &localization_frames,
            &collision_frames,
            &light_frames,
        );

        // Consume one-shot lane-change directives that executed this frame.
        for (index, &actor) in ids.iter().enumerate() {
            if localization_frames[index].lane_change_executed {
                self.parameters.clear_force_lane_change(actor);
            }
            if snapshot.contains(actor) {
                if let Some(record) = self.registry.record_mut(actor) {
                    record.last_seen_frame = snapshot.frame;
                }
            }
        }
        self.previous_traffic = Some(traffic);

        debug!(
            frame = snapshot.frame,
            vehicles = ids.len(),
            skipped = diagnostics.vehicles_skipped,
            locks = self.locks.active_locks(),
            "tick complete"
        );
        FrameOutput {
            controls,
            diagnostics,
        }
    }

    /// Runs a tick and pushes every control to the outbound sink.
    pub fn tick_into(&mut self, snapshot: &SimulationState, sink: &mut dyn ControlSink) -> FrameOutput {
        let output = self.tick(snapshot);
        for (&actor, &control) in &output.controls {
            sink.apply_control(actor, control);
        }
        output
    }

    fn run_localization(
        &mut self,
        ids: &[ActorId],
        snapshot: &SimulationState,
    ) -> Vec<LocalizationFrame> {
        let seed = self.config.seed ^ LOCALIZATION_STREAM;
        let input = localization::LocalizationInput {
            local_map: &self.local_map,
            previous_traffic: self.previous_traffic.as_ref(),
            frame: snapshot.frame,
            min_horizon: self.config.min_horizon,
        };
        let parameters = &self.parameters;
        let mut entries = self.registry.records_mut_sorted();
        debug_assert_eq!(entries.len(), ids.len());
        let work = |entries: &mut [(ActorId, &mut crate::registry::VehicleRecord)]| {
            entries
                .par_iter_mut()
                .map(|(actor, record)| {
                    run_localization_one(*actor, record, snapshot, parameters, &input, seed)
                })
                .collect()
        };
        match &self.pool {
            Some(pool) => pool.install(|| work(&mut entries)),
            None => work(&mut entries),
        }
    }

    /// Serial rebuild keeps bucket contents in ascending actor order, so
    /// downstream neighbor queries are reproducible.
    fn rebuild_traffic(&self, ids: &[ActorId], snapshot: &SimulationState) -> TrackTraffic {
        let mut traffic = TrackTraffic::new(map_consts::GRID_CELL_SIZE);
        for &actor in ids {
            let Some(state) = snapshot.state(actor) else {
                continue;
            };
            let Some(record) = self.registry.record(actor) else {
                continue;
            };
            traffic.insert(actor, state.position, record.buffer.iter());
        }
        traffic
    }

    /// Releases locks whose holder has passed the region, overstayed the
    /// hold limit, or vanished. Returns the force-release count.
    fn sweep_locks(&mut self, snapshot: &SimulationState) -> usize {
        let mut forced = 0;
        let registry = &self.registry;
        let map = &self.local_map;
        let locks = &self.locks;
        locks.sweep(|region, lock| {
            let Some(record) = registry.record(lock.holder) else {
                forced += 1;
                return true;
            };
            if locks.expired(lock.claimed_frame, snapshot.frame) {
                warn!(holder = lock.holder, ?region, "lock hold limit exceeded");
                forced += 1;
                return true;
            }
            let passed = match region {
                RegionId::Waypoint(waypoint) => !record.buffer.contains(*waypoint),
                RegionId::Junction(junction) => !record
                    .buffer
                    .iter()
                    .any(|id| map.waypoint(id).junction_id == Some(*junction)),
            };
            passed
        });
        forced
    }

    fn run_collision(
        &self,
        ids: &[ActorId],
        snapshot: &SimulationState,
        traffic: &TrackTraffic,
    ) -> Vec<CollisionFrame> {
        let seed = self.config.seed ^ COLLISION_STREAM;
        let input = collision::CollisionInput {
            local_map: &self.local_map,
            snapshot,
            traffic,
            locks: &self.locks,
            hazard_distance_multiplier: self.config.hazard_distance_multiplier,
        };
        let buffers: HashMap<ActorId, &crate::path_buffer::PathBuffer> = ids
            .iter()
            .filter_map(|&actor| {
                self.registry
                    .record(actor)
                    .map(|record| (actor, &record.buffer))
            })
            .collect();

        // Phase 1: pure assessment.
        let assessments: Vec<collision::Assessment> = self.install(|| {
            ids.par_iter()
                .map(|&actor| {
                    let Some(buffer) = buffers.get(&actor) else {
                        return collision::Assessment::default();
                    };
                    let mut rng = actor_rng(seed, snapshot.frame, actor);
                    collision::assess(
                        actor,
                        buffer,
                        self.parameters.for_actor(actor),
                        &buffers,
                        &input,
                        &mut rng,
                    )
                })
                .collect()
        });

        // Phase 2: commutative claims; outcome independent of scheduling.
        self.install(|| {
            ids.par_iter().zip(assessments.par_iter()).for_each(
                |(&actor, assessment)| collision::claim(actor, assessment, &input),
            )
        });

        // Phase 3: read ownership, emit hazards.
        self.install(|| {
            ids.par_iter()
                .zip(assessments.par_iter())
                .map(|(&actor, assessment)| {
                    collision::finalize(actor, assessment, self.parameters.for_actor(actor), &input)
                })
                .collect()
        })
    }

    fn run_traffic_light(
        &mut self,
        ids: &[ActorId],
        snapshot: &SimulationState,
        localization_frames: &[LocalizationFrame],
    ) -> Vec<TrafficLightFrame> {
        let seed = self.config.seed ^ LIGHT_STREAM;
        let lights = &self.lights;
        let map = &self.local_map;
        let parameters = &self.parameters;
        let registry = &self.registry;

        // Parallel part: signal gating per vehicle.
        let gate: Vec<(bool, bool)> = self.install(|| {
            ids.par_iter()
                .map(|&actor| {
                    let (Some(record), Some(state)) =
                        (registry.record(actor), snapshot.state(actor))
                    else {
                        return (false, false);
                    };
                    let vehicle_parameters = parameters.for_actor(actor);
                    let mut rng = actor_rng(seed, snapshot.frame, actor);
                    let signalised =
                        traffic_light::gating_light(&record.buffer, state, lights, map).is_some();
                    let hazard = traffic_light::light_hazard(
                        &record.buffer,
                        state,
                        lights,
                        vehicle_parameters,
                        map,
                        &mut rng,
                    );
                    (hazard, signalised)
                })
                .collect()
        });

        // Serial part: unsignalised junction queues, in ascending actor
        // order. The run-sign roll is drawn after the gating draws on the
        // same stream.
        let mut frames = Vec::with_capacity(ids.len());
        for (index, &actor) in ids.iter().enumerate() {
            let (light_hazard, signalised) = gate[index];
            let junction = if signalised {
                None
            } else {
                localization_frames[index].approaching_junction
            };
            let junction_hazard = match snapshot.state(actor) {
                Some(state) => {
                    let mut rng = actor_rng(seed.wrapping_add(1), snapshot.frame, actor);
                    let skip = roll(&mut rng, self.parameters.for_actor(actor).run_sign_pct);
                    self.arbiter
                        .resolve(actor, junction, state.speed(), snapshot.dt, skip)
                }
                None => false,
            };
            frames.push(TrafficLightFrame {
                hazard: light_hazard || junction_hazard,
            });
        }
        frames
    }

    fn run_motion_plan(
        &mut self,
        ids: &[ActorId],
        snapshot: &SimulationState,
        localization_frames: &[LocalizationFrame],
        collision_frames: &[CollisionFrame],
        light_frames: &[TrafficLightFrame],
    ) -> BTreeMap<ActorId, VehicleControl> {
        let input = motion_plan::MotionPlanInput {
            local_map: &self.local_map,
            dt: if snapshot.dt > 0.0 {
                snapshot.dt
            } else {
                crate::constants::pid::DT
            },
            gains: &self.config.gains,
        };
        let parameters = &self.parameters;
        let mut entries = self.registry.records_mut_sorted();
        let work = |entries: &mut [(ActorId, &mut crate::registry::VehicleRecord)]| {
            entries
                .par_iter_mut()
                .enumerate()
                .map(|(index, (actor, record))| {
                    let state = snapshot.state(*actor)?;
                    Some(motion_plan::plan(
                        record,
                        state,
                        parameters.for_actor(*actor),
                        &localization_frames[index],
                        &collision_frames[index],
                        &light_frames[index],
                        &input,
                    ))
                })
                .collect()
        };
        let planned: Vec<Option<VehicleControl>> = match &self.pool {
            Some(pool) => pool.install(|| work(&mut entries)),
            None => work(&mut entries),
        };

        ids.iter()
            .zip(planned)
            .filter_map(|(&actor, control)| control.map(|c| (actor, c)))
            .collect()
    }
}

fn run_localization_one(
    actor: ActorId,
    record: &mut crate::registry::VehicleRecord,
    snapshot: &SimulationState,
    parameters: &Parameters,
    input: &localization::LocalizationInput<'_>,
    seed: u64,
) -> LocalizationFrame {
    let Some(state) = snapshot.state(actor) else {
        // Stale registration: skip silently, keep last frame's buffer.
        return LocalizationFrame::default();
    };
    let mut rng = actor_rng(seed, snapshot.frame, actor);
    localization::update(
        actor,
        record,
        state,
        parameters.for_actor(actor),
        input,
        &mut rng,
    )
}
