//! Right-of-way claims over contested road regions.
//!
//! The table is sharded over a fixed number of stripes so claims on unrelated
//! regions never contend for the same mutex. Claiming is non-blocking and
//! commutative: whichever thread order the claims arrive in, the surviving
//! holder is the one with the smallest `(arrival, actor)` key, so frame
//! outcomes are reproducible.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use tracing::trace;

use crate::constants::collision;
use crate::local_map::WaypointId;
use crate::simulation_state::ActorId;

/// A contested stretch of road.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionId {
    /// A whole junction, claimed as one unit.
    Junction(u32),
    /// A single shared waypoint outside any junction.
    Waypoint(WaypointId),
}

/// Ordering key for claims: earlier arrival wins, actor id breaks ties.
pub type ClaimKey = (f64, ActorId);

fn better(a: ClaimKey, b: ClaimKey) -> bool {
    a.0 < b.0 || (a.0 == b.0 && a.1 < b.1)
}

/// An active right-of-way claim.
#[derive(Debug, Clone)]
pub struct CollisionLock {
    pub holder: ActorId,
    /// The vehicle that lost the negotiation when the lock was granted.
    pub yielding: ActorId,
    /// Frame at which the claim was first granted.
    pub claimed_frame: u64,
    /// Holder's arrival estimate at grant time, seconds.
    pub arrival_estimate: f64,
}

/// Sharded table of active locks.
pub struct LockTable {
    stripes: Vec<Mutex<HashMap<RegionId, CollisionLock>>>,
    hold_limit_frames: u64,
}

impl LockTable {
    pub fn new(hold_limit_frames: u64) -> Self {
        let stripes = (0..collision::LOCK_STRIPES)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            stripes,
            hold_limit_frames,
        }
    }

    fn stripe(&self, region: &RegionId) -> &Mutex<HashMap<RegionId, CollisionLock>> {
        let mut hasher = DefaultHasher::new();
        region.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % self.stripes.len()]
    }

    /// Attempts to claim `region` for `actor`. Returns true when `actor`
    /// holds the region after the call.
    ///
    /// A claim displaces an existing same-frame claim with a worse key; a
    /// holder carried over from an earlier frame always keeps the region, so
    /// right-of-way never flip-flops while a crossing is underway.
    pub fn claim(
        &self,
        region: RegionId,
        actor: ActorId,
        yielding: ActorId,
        arrival: f64,
        frame: u64,
    ) -> bool {
        let mut stripe = match self.stripe(&region).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match stripe.get_mut(&region) {
            None => {
                stripe.insert(
                    region,
                    CollisionLock {
                        holder: actor,
                        yielding,
                        claimed_frame: frame,
                        arrival_estimate: arrival,
                    },
                );
                true
            }
            Some(existing) if existing.holder == actor => {
                existing.yielding = yielding;
                true
            }
            Some(existing) => {
                let prior_frame = existing.claimed_frame < frame;
                if !prior_frame
                    && better((arrival, actor), (existing.arrival_estimate, existing.holder))
                {
                    trace!(?region, from = existing.holder, to = actor, "lock displaced");
                    *existing = CollisionLock {
                        holder: actor,
                        yielding,
                        claimed_frame: frame,
                        arrival_estimate: arrival,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether `actor` holds `region` right now.
    pub fn holds(&self, region: &RegionId, actor: ActorId) -> bool {
        let stripe = match self.stripe(region).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stripe.get(region).is_some_and(|lock| lock.holder == actor)
    }

    /// Drops every lock for which `release` returns true. Returns how many
    /// were dropped. Runs serially at frame start, before any claims.
    pub fn sweep(&self, mut release: impl FnMut(&RegionId, &CollisionLock) -> bool) -> usize {
        let mut released = 0;
        for stripe in &self.stripes {
            let mut stripe = match stripe.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            stripe.retain(|region, lock| {
                if release(region, lock) {
                    released += 1;
                    false
                } else {
                    true
                }
            });
        }
        released
    }

    /// Drops every lock held by `actor`. Returns how many were dropped.
    pub fn release_holder(&self, actor: ActorId) -> usize {
        self.sweep(|_, lock| lock.holder == actor)
    }

    /// Whether a lock claimed at `claimed_frame` has exceeded the hold limit
    /// by frame `now`.
    pub fn expired(&self, claimed_frame: u64, now: u64) -> bool {
        now.saturating_sub(claimed_frame) > self.hold_limit_frames
    }

    /// Total number of active locks, for diagnostics and tests.
    pub fn active_locks(&self) -> usize {
        self.stripes
            .iter()
            .map(|stripe| match stripe.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }

    /// Number of active locks referencing `actor` as holder.
    pub fn locks_held_by(&self, actor: ActorId) -> usize {
        let mut count = 0;
        for stripe in &self.stripes {
            let stripe = match stripe.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            count += stripe.values().filter(|lock| lock.holder == actor).count();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> RegionId {
        RegionId::Junction(1)
    }

    #[test]
    fn first_claim_wins_an_empty_region() {
        let table = LockTable::new(200);
        assert!(table.claim(region(), 1, 2, 5.0, 10));
        assert!(table.holds(&region(), 1));
    }

    #[test]
    fn earlier_arrival_displaces_a_same_frame_claim() {
        let table = LockTable::new(200);
        assert!(table.claim(region(), 2, 1, 5.2, 10));
        assert!(table.claim(region(), 1, 2, 5.0, 10));
        assert!(table.holds(&region(), 1));
        assert!(!table.holds(&region(), 2));
    }

    #[test]
    fn claim_order_does_not_change_the_winner() {
        let table = LockTable::new(200);
        assert!(table.claim(region(), 1, 2, 5.0, 10));
        assert!(!table.claim(region(), 2, 1, 5.2, 10));
        assert!(table.holds(&region(), 1));
    }

    #[test]
    fn ties_break_on_lower_actor_id() {
        let table = LockTable::new(200);
        table.claim(region(), 9, 3, 5.0, 10);
        table.claim(region(), 3, 9, 5.0, 10);
        assert!(table.holds(&region(), 3));
    }

    #[test]
    fn prior_frame_holder_is_never_displaced() {
        let table = LockTable::new(200);
        table.claim(region(), 2, 1, 5.2, 10);
        assert!(!table.claim(region(), 1, 2, 0.1, 11));
        assert!(table.holds(&region(), 2));
    }

    #[test]
    fn release_holder_drops_all_of_an_actors_locks() {
        let table = LockTable::new(200);
        table.claim(RegionId::Junction(1), 1, 2, 5.0, 10);
        table.claim(RegionId::Waypoint(WaypointId(8)), 1, 3, 2.0, 10);
        table.claim(RegionId::Junction(2), 4, 1, 1.0, 10);
        assert_eq!(table.release_holder(1), 2);
        assert_eq!(table.active_locks(), 1);
        assert_eq!(table.locks_held_by(1), 0);
    }

    #[test]
    fn expiry_respects_the_hold_limit() {
        let table = LockTable::new(200);
        assert!(!table.expired(10, 210));
        assert!(table.expired(10, 211));
    }
}
