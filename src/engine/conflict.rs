use std::convert::Infallible;

use ulid::Ulid;

use crate::model::*;

/// Source of persisted intervals for the conflict checker.
///
/// Implementations return every interval of granularity `G` on `item_id`
/// that overlaps `candidate` (see [`overlaps`]), leaving out the record
/// `exclude` when given. Intervals on other items are never returned.
pub trait IntervalStore {
    type Error;

    fn find_intervals<G: Grain>(
        &self,
        item_id: Ulid,
        candidate: &Window<G::Point>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Interval<G::Point>>, Self::Error>;
}

/// Whether `candidate` intersects `existing`.
///
/// Both windows are closed, so touching endpoints conflict. A missing end
/// on either side extends that window to infinity.
pub fn overlaps<T: Copy + Ord>(candidate: &Window<T>, existing: &Window<T>) -> bool {
    match candidate.end {
        None => point_conflicts(candidate.start, existing),
        Some(end) => range_conflicts(candidate.start, end, existing),
    }
}

/// Open-ended candidate starting at `p`: anything not finished before `p`
/// is in the way.
fn point_conflicts<T: Copy + Ord>(p: T, existing: &Window<T>) -> bool {
    match existing.end {
        None => true,
        Some(existing_end) => p <= existing_end,
    }
}

fn range_conflicts<T: Copy + Ord>(start: T, end: T, existing: &Window<T>) -> bool {
    match existing.end {
        None => end >= existing.start,
        Some(existing_end) => {
            existing.contains(start)
                || existing.contains(end)
                || (start <= existing.start && end >= existing_end)
        }
    }
}

/// Conflict query over one granularity. No start means nothing to check.
pub fn find_conflicts<G: Grain, S: IntervalStore + ?Sized>(
    store: &S,
    item_id: Ulid,
    start: Option<G::Point>,
    end: Option<G::Point>,
    exclude: Option<Ulid>,
) -> Result<Vec<Interval<G::Point>>, S::Error> {
    let Some(start) = start else {
        return Ok(Vec::new());
    };
    store.find_intervals::<G>(item_id, &Window::new(start, end), exclude)
}

/// A flat list of lend records, possibly spanning many items.
impl IntervalStore for [LendRecord] {
    type Error = Infallible;

    fn find_intervals<G: Grain>(
        &self,
        item_id: Ulid,
        candidate: &Window<G::Point>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Interval<G::Point>>, Infallible> {
        Ok(self
            .iter()
            .filter(|lend| lend.item_id == item_id && Some(lend.id) != exclude)
            .filter_map(G::interval)
            .filter(|existing| overlaps(candidate, &existing.window))
            .collect())
    }
}

impl IntervalStore for ItemState {
    type Error = Infallible;

    fn find_intervals<G: Grain>(
        &self,
        item_id: Ulid,
        candidate: &Window<G::Point>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Interval<G::Point>>, Infallible> {
        if item_id != self.id {
            return Ok(Vec::new());
        }
        Ok(self
            .intervals::<G>()
            .filter(|existing| Some(existing.record_id) != exclude)
            .filter(|existing| overlaps(candidate, &existing.window))
            .collect())
    }
}
