//! Per-vehicle rolling horizon of upcoming waypoints.

use std::collections::VecDeque;

use crate::local_map::WaypointId;

/// Ordered look-ahead window for one vehicle.
///
/// Only the localization stage mutates a vehicle's buffer; every other stage
/// reads it. Entries at the front are closest to the vehicle.
#[derive(Debug, Clone, Default)]
pub struct PathBuffer {
    entries: VecDeque<WaypointId>,
}

impl PathBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn front(&self) -> Option<WaypointId> {
        self.entries.front().copied()
    }

    pub fn back(&self) -> Option<WaypointId> {
        self.entries.back().copied()
    }

    pub fn push_back(&mut self, id: WaypointId) {
        self.entries.push_back(id);
    }

    pub fn pop_front(&mut self) -> Option<WaypointId> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: WaypointId) -> bool {
        self.entries.contains(&id)
    }

    /// Position of `id` within the buffer, front = 0.
    pub fn index_of(&self, id: WaypointId) -> Option<usize> {
        self.entries.iter().position(|&entry| entry == id)
    }

    pub fn get(&self, index: usize) -> Option<WaypointId> {
        self.entries.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = WaypointId> + '_ {
        self.entries.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_front_to_back() {
        let mut buffer = PathBuffer::new();
        buffer.push_back(WaypointId(3));
        buffer.push_back(WaypointId(4));
        buffer.push_back(WaypointId(5));
        assert_eq!(buffer.front(), Some(WaypointId(3)));
        assert_eq!(buffer.index_of(WaypointId(5)), Some(2));
        buffer.pop_front();
        assert_eq!(buffer.front(), Some(WaypointId(4)));
        assert_eq!(buffer.len(), 2);
    }
}
