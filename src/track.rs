// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-room recognition cooldowns and anonymous guest tracking.
//!
//! Both tables are ephemeral maps keyed on monotonic timestamps. The
//! dispatcher guards them with one mutex and runs their housekeeping under
//! the same lock.

use base::time::Duration;
use base::FastHashMap;

/// Pixel quantum for the guest spatial key.
const GUEST_CELL_PX: f32 = 50.0;

/// Suppresses repeat presence writes for a student seen again in the same
/// room within the window.
pub struct CooldownTable {
    window: Duration,
    by_room: FastHashMap<i32, FastHashMap<i32, Duration>>,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        CooldownTable {
            window,
            by_room: FastHashMap::default(),
        }
    }

    /// True iff the student was marked within the window before `now`.
    pub fn is_hot(&self, room_id: i32, student_id: i32, now: Duration) -> bool {
        match self.by_room.get(&room_id).and_then(|m| m.get(&student_id)) {
            None => false,
            Some(&last) => now - last < self.window,
        }
    }

    pub fn mark(&mut self, room_id: i32, student_id: i32, now: Duration) {
        self.by_room
            .entry(room_id)
            .or_default()
            .insert(student_id, now);
    }

    /// Total entries across rooms, for the opportunistic-sweep heuristic.
    pub fn len(&self) -> usize {
        self.by_room.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries older than twice the window, and then empty rooms.
    pub fn sweep(&mut self, now: Duration) {
        let horizon = self.window * 2;
        for m in self.by_room.values_mut() {
            m.retain(|_, &mut last| now - last <= horizon);
        }
        self.by_room.retain(|_, m| !m.is_empty());
    }
}

/// The quantized bbox centroid: "roughly the same spot" for unknown faces
/// across the presence window. Coarse by design; two strangers in the same
/// cell count once.
pub fn spatial_key(bbox: &[f32; 4]) -> (i32, i32) {
    let x = ((bbox[0] + bbox[2]) / 2.0 / GUEST_CELL_PX) as i32 * GUEST_CELL_PX as i32;
    let y = ((bbox[1] + bbox[3]) / 2.0 / GUEST_CELL_PX) as i32 * GUEST_CELL_PX as i32;
    (x, y)
}

/// Counts unmatched faces per room by spatial cell.
pub struct GuestTracker {
    timeout: Duration,
    by_room: FastHashMap<i32, FastHashMap<(i32, i32), Duration>>,
}

impl GuestTracker {
    pub fn new(timeout: Duration) -> Self {
        GuestTracker {
            timeout,
            by_room: FastHashMap::default(),
        }
    }

    pub fn update(&mut self, room_id: i32, key: (i32, i32), now: Duration) {
        self.by_room.entry(room_id).or_default().insert(key, now);
    }

    /// Cells seen within the presence window.
    pub fn active_count(&self, room_id: i32, now: Duration) -> usize {
        match self.by_room.get(&room_id) {
            None => 0,
            Some(m) => m.values().filter(|&&last| now - last <= self.timeout).count(),
        }
    }

    pub fn sweep(&mut self, now: Duration) {
        let timeout = self.timeout;
        for m in self.by_room.values_mut() {
            m.retain(|_, &mut last| now - last <= timeout);
        }
        self.by_room.retain(|_, m| !m.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = base::time::TIME_UNITS_PER_SEC;

    #[test]
    fn cooldown_window() {
        let mut t = CooldownTable::new(Duration::seconds(10));
        assert!(!t.is_hot(1, 7, Duration(0)));
        t.mark(1, 7, Duration(0));
        assert!(t.is_hot(1, 7, Duration(2 * SEC)));
        assert!(t.is_hot(1, 7, Duration(10 * SEC - 1)));
        assert!(!t.is_hot(1, 7, Duration(10 * SEC)));

        // Rooms are independent.
        assert!(!t.is_hot(2, 7, Duration(2 * SEC)));
    }

    #[test]
    fn cooldown_sweep() {
        let mut t = CooldownTable::new(Duration::seconds(10));
        t.mark(1, 7, Duration(0));
        t.mark(1, 8, Duration(15 * SEC));
        t.mark(2, 7, Duration(0));
        assert_eq!(t.len(), 3);

        // At t=21s, entries from t=0 are past 2x the window; room 2 empties
        // out entirely.
        t.sweep(Duration(21 * SEC));
        assert_eq!(t.len(), 1);
        assert!(!t.by_room.contains_key(&2));
        assert!(t.by_room.contains_key(&1));
    }

    #[test]
    fn nearby_bboxes_share_a_key() {
        // Both centroids quantize to (150, 150).
        let a = spatial_key(&[100.0, 100.0, 200.0, 200.0]);
        let b = spatial_key(&[105.0, 102.0, 201.0, 198.0]);
        assert_eq!(a, (150, 150));
        assert_eq!(a, b);

        // A face across the room lands elsewhere.
        let c = spatial_key(&[400.0, 100.0, 500.0, 200.0]);
        assert_ne!(a, c);
    }

    #[test]
    fn guest_counting() {
        let mut g = GuestTracker::new(Duration::seconds(30));
        let now = Duration(0);
        g.update(1, spatial_key(&[100.0, 100.0, 200.0, 200.0]), now);
        g.update(1, spatial_key(&[105.0, 102.0, 201.0, 198.0]), now + Duration::seconds(1));
        assert_eq!(g.active_count(1, now + Duration::seconds(1)), 1);

        g.update(1, spatial_key(&[400.0, 100.0, 500.0, 200.0]), now);
        assert_eq!(g.active_count(1, now + Duration::seconds(1)), 2);

        // The timeout boundary is inclusive.
        assert_eq!(g.active_count(1, Duration::seconds(30)), 2);
        assert_eq!(g.active_count(1, Duration(30 * SEC + 1)), 1);

        // Sweep drops the stale cell and empty rooms.
        g.sweep(Duration(62 * SEC));
        assert_eq!(g.active_count(1, Duration(62 * SEC)), 0);
        assert!(g.by_room.is_empty());
    }
}
