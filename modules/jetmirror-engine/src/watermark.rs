use std::collections::BTreeMap;

use jetmirror_events::Position;

/// Low-water mark over an unordered-completion window.
///
/// Tracks the multiset of positions dispatched but not yet completed. The
/// resume cursor is the smallest of those; with nothing in flight it is one
/// past the highest position seen. Resubscribing from the cursor replays
/// every event that had not completed, and nothing before it.
///
/// Not synchronized. The dispatcher keeps it under the same lock as the
/// per-key queues so registration and completion stay consistent.
#[derive(Debug, Default, Clone)]
pub struct LowWaterMark {
    in_flight: BTreeMap<Position, usize>,
    highest_seen: Option<Position>,
    floor: Option<Position>,
}

impl LowWaterMark {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker that never reports a cursor below `floor`, typically the
    /// cursor persisted by an earlier run.
    pub fn starting_at(floor: Option<Position>) -> Self {
        Self {
            floor,
            ..Self::default()
        }
    }

    /// An event at `position` has been accepted and is not yet complete.
    pub fn begin(&mut self, position: Position) {
        *self.in_flight.entry(position).or_insert(0) += 1;
        self.see(position);
    }

    /// An event previously passed to `begin` reached a terminal outcome.
    /// Unknown positions are ignored.
    pub fn complete(&mut self, position: Position) {
        if let Some(count) = self.in_flight.get_mut(&position) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&position);
            }
        }
    }

    /// An event that is complete on receipt (ignored, undecodable, dropped).
    pub fn observe(&mut self, position: Position) {
        self.see(position);
    }

    pub fn raise_floor(&mut self, floor: Position) {
        self.floor = Some(self.floor.map_or(floor, |f| f.max(floor)));
    }

    /// Lowest position not yet known to be complete, or `None` when nothing
    /// has been seen and no floor is set.
    pub fn cursor(&self) -> Option<Position> {
        let mark = match self.in_flight.keys().next() {
            Some(&lowest) => Some(lowest),
            None => self.highest_seen.map(Position::next),
        };
        match (mark, self.floor) {
            (Some(mark), Some(floor)) => Some(mark.max(floor)),
            (mark, floor) => mark.or(floor),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.values().sum()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn see(&mut self, position: Position) {
        self.highest_seen = Some(self.highest_seen.map_or(position, |h| h.max(position)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i64) -> Position {
        Position(n)
    }

    #[test]
    fn empty_tracker_has_no_cursor() {
        assert_eq!(LowWaterMark::new().cursor(), None);
    }

    #[test]
    fn cursor_holds_at_lowest_incomplete() {
        let mut wm = LowWaterMark::new();
        wm.begin(p(10));
        wm.begin(p(20));
        wm.begin(p(30));

        wm.complete(p(20));
        wm.complete(p(30));
        assert_eq!(wm.cursor(), Some(p(10)));

        wm.complete(p(10));
        assert_eq!(wm.cursor(), Some(p(31)));
        assert!(wm.is_idle());
    }

    #[test]
    fn duplicate_positions_need_every_completion() {
        let mut wm = LowWaterMark::new();
        wm.begin(p(5));
        wm.begin(p(5));
        assert_eq!(wm.in_flight(), 2);

        wm.complete(p(5));
        assert_eq!(wm.cursor(), Some(p(5)));

        wm.complete(p(5));
        assert_eq!(wm.cursor(), Some(p(6)));
    }

    #[test]
    fn observed_positions_advance_when_nothing_blocks() {
        let mut wm = LowWaterMark::new();
        wm.begin(p(3));
        wm.observe(p(9));
        assert_eq!(wm.cursor(), Some(p(3)));

        wm.complete(p(3));
        assert_eq!(wm.cursor(), Some(p(10)));
    }

    #[test]
    fn floor_clamps_redelivered_positions() {
        let mut wm = LowWaterMark::starting_at(Some(p(100)));
        assert_eq!(wm.cursor(), Some(p(100)));

        wm.begin(p(40));
        assert_eq!(wm.cursor(), Some(p(100)));

        wm.complete(p(40));
        wm.raise_floor(p(50));
        assert_eq!(wm.cursor(), Some(p(100)));
    }

    #[test]
    fn completing_unknown_position_is_harmless() {
        let mut wm = LowWaterMark::new();
        wm.begin(p(1));
        wm.complete(p(99));
        assert_eq!(wm.cursor(), Some(p(1)));
    }
}
