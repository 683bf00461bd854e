use std::{
    cmp::Ordering,
    collections::BTreeMap,
    ops::Bound,
};

use crate::{
    range::{AccessRange, Address},
    state::AccessState,
};

// Comparison of access map ranges:
//
//  a)  Two non-empty, non-overlapping ranges (stored entries). The "less"
//      comparison `a.end <= b.begin` suffices.
//
//  b)  A non-empty range vs an empty point range passed to a lookup. The
//      comparison from a) almost works, except when the point coincides with
//      the beginning of a stored range: the lower bound of such a point is
//      that range itself, so the comparison gains `a.begin < b.begin`, which
//      does not change a).
//
// Overlapping ranges compare as equal; the map maintains the non-overlap
// invariant, so stored keys are always totally ordered.
#[derive(Clone, Copy, Debug)]
struct MapKey(AccessRange);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MapKey {}

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.end <= other.0.begin && self.0.begin < other.0.begin {
            Ordering::Less
        } else if other.0.end <= self.0.begin && other.0.begin < self.0.begin {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn point(index: Address) -> MapKey {
    MapKey(AccessRange::new(index, index))
}

/// Rejection cause of a map mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("range overlaps existing entry {0:?}")]
    Overlap(AccessRange),
    #[error("range is empty or ill-formed")]
    EmptyRange,
}

/// Ordered map from non-overlapping, non-empty address ranges to access
/// states.
#[derive(Clone, Debug, Default)]
pub struct AccessMap {
    map: BTreeMap<MapKey, AccessState>,
}

/// Operations passed to [`AccessMap::infill_update_range`].
pub trait InfillUpdateOps {
    /// State for a gap inside the walked range; `None` leaves the gap empty.
    fn infill(&mut self, gap: AccessRange) -> Option<AccessState>;
    /// Update an existing entry, already split to lie within the range.
    fn update(&mut self, range: AccessRange, state: &mut AccessState);
}

impl AccessMap {
    pub fn new() -> Self {
        AccessMap {
            map: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (AccessRange, &AccessState)> {
        self.map.iter().map(|(k, v)| (k.0, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (AccessRange, &mut AccessState)> {
        self.map.iter_mut().map(|(k, v)| (k.0, v))
    }

    /// State stored under exactly this range.
    pub fn state(&self, range: &AccessRange) -> Option<&AccessState> {
        self.map
            .get_key_value(&MapKey(*range))
            .filter(|(k, _)| k.0 == *range)
            .map(|(_, v)| v)
    }

    pub fn state_mut(&mut self, range: &AccessRange) -> Option<&mut AccessState> {
        // The overlap-equal comparator would also find a neighbour; check
        // for the exact key first.
        let exact = matches!(
            self.map.get_key_value(&MapKey(*range)),
            Some((k, _)) if k.0 == *range
        );
        if exact {
            self.map.get_mut(&MapKey(*range))
        } else {
            None
        }
    }

    /// First stored range whose end is greater than `index`; the containing
    /// range when `index` falls inside one.
    pub fn lower_bound(&self, index: Address) -> Option<AccessRange> {
        self.map
            .range((Bound::Included(point(index)), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.0)
    }

    /// Next stored range strictly after the given stored range.
    pub fn next_range(&self, after: &AccessRange) -> Option<AccessRange> {
        self.map
            .range((Bound::Excluded(MapKey(*after)), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.0)
    }

    /// Entries intersecting `range`, in address order. Empty for ill-formed
    /// ranges.
    pub fn iter_range<'a>(
        &'a self,
        range: &AccessRange,
    ) -> impl Iterator<Item = (AccessRange, &'a AccessState)> + 'a {
        let end = range.end;
        let valid = range.non_empty();
        self.map
            .range((Bound::Included(point(range.begin)), Bound::Unbounded))
            .take_while(move |(k, _)| valid && k.0.begin < end)
            .map(|(k, v)| (k.0, v))
    }

    /// Insert a new entry. Overlapping or ill-formed ranges are rejected
    /// and leave the map unchanged.
    pub fn insert(&mut self, range: AccessRange, state: AccessState) -> Result<(), InsertError> {
        if !range.non_empty() {
            return Err(InsertError::EmptyRange);
        }
        if let Some(existing) = self.lower_bound(range.begin) {
            if existing.intersects(&range) {
                return Err(InsertError::Overlap(existing));
            }
        }
        self.map.insert(MapKey(range), state);
        Ok(())
    }

    pub fn erase(&mut self, range: &AccessRange) -> Option<AccessState> {
        let exact = matches!(
            self.map.get_key_value(&MapKey(*range)),
            Some((k, _)) if k.0 == *range
        );
        if exact {
            self.map.remove(&MapKey(*range))
        } else {
            None
        }
    }

    /// Split the entry stored under `range` at `index`. Both halves carry a
    /// copy of the payload. Splitting at a boundary or outside the range is
    /// a no-op. Returns the range now covering the lower part.
    pub fn split(&mut self, range: AccessRange, index: Address) -> AccessRange {
        if !range.includes(index) || index == range.begin {
            return range;
        }
        let state = match self.erase(&range) {
            Some(state) => state,
            None => return range,
        };
        let lower = AccessRange::new(range.begin, index);
        let upper = AccessRange::new(index, range.end);
        self.map.insert(MapKey(upper), state.clone());
        self.map.insert(MapKey(lower), state);
        lower
    }

    /// Split the entry at the bounds of its intersection with `clip`,
    /// returning the range of the piece inside `clip`. `None` when the entry
    /// and `clip` are disjoint.
    pub fn split_bounds(&mut self, range: AccessRange, clip: &AccessRange) -> Option<AccessRange> {
        let piece = range & *clip;
        if piece.is_empty() {
            return None;
        }
        let mut pos = range;
        if piece.begin != pos.begin {
            self.split(pos, piece.begin);
            pos = AccessRange::new(piece.begin, pos.end);
        }
        if piece.end != pos.end {
            self.split(pos, piece.end);
            pos = AccessRange::new(pos.begin, piece.end);
        }
        Some(pos)
    }

    /// Fill the gaps of `range` with copies of `state`, leaving existing
    /// entries untouched.
    pub fn update_range_value(&mut self, range: AccessRange, state: &AccessState) {
        if !range.non_empty() {
            return;
        }
        let mut current = range.begin;
        while current < range.end {
            match self.lower_bound(current) {
                Some(entry) if entry.includes(current) => {
                    current = entry.end;
                }
                Some(entry) => {
                    let gap = AccessRange::new(current, entry.begin.min(range.end));
                    let _ = self.insert(gap, state.clone());
                    current = gap.end;
                }
                None => {
                    let _ = self.insert(AccessRange::new(current, range.end), state.clone());
                    current = range.end;
                }
            }
        }
    }

    /// Walk `range`, infilling gaps and updating existing entries. Entries
    /// straddling the range bounds are split at the intersection points so
    /// the update is confined to the range.
    pub fn infill_update_range<O: InfillUpdateOps>(&mut self, range: AccessRange, ops: &mut O) {
        if !range.non_empty() {
            return;
        }

        // Split the lower-bound entry so that an entry starts exactly at
        // range.begin.
        if let Some(entry) = self.lower_bound(range.begin) {
            if entry.begin < range.begin && entry.includes(range.begin) {
                self.split(entry, range.begin);
            }
        }

        let mut current = range.begin;
        while current < range.end {
            match self.lower_bound(current) {
                Some(entry) if entry.begin <= current => {
                    debug_assert!(entry.begin == current);
                    // Confine the update to the walked range.
                    let entry = if entry.end > range.end {
                        self.split(entry, range.end)
                    } else {
                        entry
                    };
                    if let Some(state) = self.state_mut(&entry) {
                        ops.update(entry, state);
                    }
                    current = entry.end;
                }
                Some(entry) => {
                    let gap = AccessRange::new(current, entry.begin.min(range.end));
                    if let Some(state) = ops.infill(gap) {
                        let _ = self.insert(gap, state);
                    }
                    current = gap.end;
                }
                None => {
                    let gap = AccessRange::new(current, range.end);
                    if let Some(state) = ops.infill(gap) {
                        let _ = self.insert(gap, state);
                    }
                    current = range.end;
                }
            }
        }
    }

    /// Merge runs of directly adjacent entries with equal payloads.
    pub fn consolidate(&mut self) {
        let keys: Vec<AccessRange> = self.map.keys().map(|k| k.0).collect();
        let mut i = 0;
        while i < keys.len() {
            let mut j = i;
            while j + 1 < keys.len()
                && keys[j + 1].begin == keys[j].end
                && self.state(&keys[j + 1]) == self.state(&keys[j])
            {
                j += 1;
            }
            if j > i {
                let merged = AccessRange::new(keys[i].begin, keys[j].end);
                let state = self.map.remove(&MapKey(keys[j])).unwrap();
                for key in &keys[i..j] {
                    self.map.remove(&MapKey(*key));
                }
                self.map.insert(MapKey(merged), state);
            }
            i = j + 1;
        }
    }
}

/// Cursor caching the lower bound for a moving index.
///
/// The locator must not be used across map mutations; create a new one
/// instead.
#[derive(Clone, Copy, Debug)]
pub struct Locator<'a> {
    map: &'a AccessMap,
    /// Current location in the map's address space.
    pub index: Address,
    /// Lower bound for the current index; `None` is the end sentinel.
    pub lower_bound: Option<AccessRange>,
    /// Whether the current index is inside the lower-bound range.
    pub inside_lower_bound_range: bool,
}

impl<'a> Locator<'a> {
    pub fn new(map: &'a AccessMap, index: Address) -> Self {
        let lower_bound = map.lower_bound(index);
        Locator {
            map,
            index,
            lower_bound,
            inside_lower_bound_range: lower_bound.map_or(false, |r| r.includes(index)),
        }
    }

    /// Move to `seek_to`, preferring a local advance over a full lower-bound
    /// query.
    pub fn seek(&mut self, seek_to: Address) {
        if self.try_seek_local(seek_to) {
            return;
        }
        self.index = seek_to;
        self.lower_bound = self.map.lower_bound(seek_to);
        self.inside_lower_bound_range = self
            .lower_bound
            .map_or(false, |r| r.includes(self.index));
    }

    fn try_seek_local(&mut self, seek_to: Address) -> bool {
        let is_lower_bound_for = |bound: Option<AccessRange>, index: Address| match bound {
            None => true,
            Some(range) => index < range.end,
        };

        if self.index == seek_to {
            return true;
        }
        // Only forward movement can reuse the cached bound.
        if self.index < seek_to {
            if is_lower_bound_for(self.lower_bound, seek_to) {
                self.index = seek_to;
                self.inside_lower_bound_range = self
                    .lower_bound
                    .map_or(false, |r| r.includes(seek_to));
                return true;
            }
            let next = self
                .lower_bound
                .and_then(|r| self.map.next_range(&r));
            if self.lower_bound.is_some() && is_lower_bound_for(next, seek_to) {
                self.index = seek_to;
                self.lower_bound = next;
                self.inside_lower_bound_range =
                    next.map_or(false, |r| r.includes(seek_to));
                return true;
            }
        }
        false
    }

    /// Distance to the next change in the map: the end of the current range
    /// or the beginning of the next one. Zero at the end of the map.
    pub fn distance_to_edge(&self) -> Address {
        match self.lower_bound {
            None => 0,
            Some(range) => {
                let edge = if self.inside_lower_bound_range {
                    range.end
                } else {
                    range.begin
                };
                edge - self.index
            }
        }
    }
}

/// Synchronized traversal of two maps, yielding maximal sub-ranges over
/// which neither map transitions between entries.
#[derive(Clone, Copy, Debug)]
pub struct ParallelIterator<'a, 'b> {
    pub pos_a: Locator<'a>,
    pub pos_b: Locator<'b>,
    pub range: AccessRange,
}

impl<'a, 'b> ParallelIterator<'a, 'b> {
    pub fn new(map_a: &'a AccessMap, map_b: &'b AccessMap, index: Address) -> Self {
        let pos_a = Locator::new(map_a, index);
        let pos_b = Locator::new(map_b, index);
        let delta = Self::compute_delta(&pos_a, &pos_b);
        ParallelIterator {
            pos_a,
            pos_b,
            range: AccessRange::new(index, index + delta),
        }
    }

    /// Advance to the next spot where one of the maps changes.
    pub fn advance(&mut self) {
        let start = self.range.end;
        let delta = self.range.distance();
        debug_assert!(delta != 0, "advancing past the end");

        self.pos_a.seek(self.pos_a.index + delta);
        self.pos_b.seek(self.pos_b.index + delta);

        let delta = Self::compute_delta(&self.pos_a, &self.pos_b);
        self.range = AccessRange::new(start, start + delta);
    }

    /// True once both locators have run off the end of their maps.
    pub fn at_end(&self) -> bool {
        self.range.is_empty()
    }

    fn compute_delta(pos_a: &Locator<'_>, pos_b: &Locator<'_>) -> Address {
        let delta_a = pos_a.distance_to_edge();
        let delta_b = pos_b.distance_to_edge();

        // Zero distance means "at end"; it must not clamp the other side.
        if delta_a == 0 {
            delta_b
        } else if delta_b == 0 {
            delta_a
        } else {
            delta_a.min(delta_b)
        }
    }
}
