use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Reservation dates are day-grained.
pub type Day = NaiveDate;

/// Actual checkout/return times are instant-grained.
pub type Timestamp = NaiveDateTime;

/// Candidate interval `[start, end]`, closed on both sides.
/// `end == None` means open-ended: the window runs to infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window<T> {
    pub start: T,
    pub end: Option<T>,
}

impl<T: Copy + Ord> Window<T> {
    pub fn new(start: T, end: Option<T>) -> Self {
        Self { start, end }
    }

    pub fn closed(start: T, end: T) -> Self {
        Self { start, end: Some(end) }
    }

    pub fn open(start: T) -> Self {
        Self { start, end: None }
    }

    /// Inclusive on both ends; an absent end never excludes anything.
    pub fn contains(&self, t: T) -> bool {
        self.start <= t && self.end.is_none_or(|end| t <= end)
    }
}

/// Renders `start to end`, using `infinity` for an open end.
impl<T: fmt::Display> fmt::Display for Window<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            Some(end) => write!(f, "{} to {}", self.start, end),
            None => write!(f, "{} to infinity", self.start),
        }
    }
}

/// A persisted interval, derived from one lend record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval<T> {
    pub record_id: Ulid,
    pub item_id: Ulid,
    pub window: Window<T>,
}

/// Selects one granularity of a lend record. Reservation and lend
/// intervals have different point types, so they can never be compared
/// against each other.
pub trait Grain {
    type Point: Copy + Ord + fmt::Display + fmt::Debug;

    /// The record's interval at this granularity, or `None` if the record
    /// has no start here.
    fn window(lend: &LendRecord) -> Option<Window<Self::Point>>;

    fn interval(lend: &LendRecord) -> Option<Interval<Self::Point>> {
        Self::window(lend).map(|window| Interval {
            record_id: lend.id,
            item_id: lend.item_id,
            window,
        })
    }
}

/// `due_out` / `due_back`.
#[derive(Debug, Clone, Copy)]
pub struct ReservationGrain;

/// `out` / `back`.
#[derive(Debug, Clone, Copy)]
pub struct LendGrain;

impl Grain for ReservationGrain {
    type Point = Day;

    fn window(lend: &LendRecord) -> Option<Window<Day>> {
        lend.due_out.map(|start| Window::new(start, lend.due_back))
    }
}

impl Grain for LendGrain {
    type Point = Timestamp;

    fn window(lend: &LendRecord) -> Option<Window<Timestamp>> {
        lend.out.map(|start| Window::new(start, lend.back))
    }
}

/// A lend of one item to one user. Carries both the reservation pair and
/// the actual checkout pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendRecord {
    pub id: Ulid,
    pub item_id: Ulid,
    pub user_id: Ulid,
    pub due_out: Option<Day>,
    pub due_back: Option<Day>,
    pub out: Option<Timestamp>,
    pub back: Option<Timestamp>,
}

/// Partial edit of a lend. `None` leaves a field as stored;
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LendChanges {
    pub user_id: Option<Ulid>,
    pub due_out: Option<Option<Day>>,
    pub due_back: Option<Option<Day>>,
    pub out: Option<Option<Timestamp>>,
    pub back: Option<Option<Timestamp>>,
}

impl LendChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, lend: &LendRecord) -> LendRecord {
        LendRecord {
            id: lend.id,
            item_id: lend.item_id,
            user_id: self.user_id.unwrap_or(lend.user_id),
            due_out: self.due_out.unwrap_or(lend.due_out),
            due_back: self.due_back.unwrap_or(lend.due_back),
            out: self.out.unwrap_or(lend.out),
            back: self.back.unwrap_or(lend.back),
        }
    }
}

/// Partial edit of a tag; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagChanges {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Partial edit of an item; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_lendable: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ItemState {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub is_lendable: bool,
    /// All lends of this item, sorted by id (ULIDs sort by creation time).
    pub lends: Vec<LendRecord>,
    /// Ids of the tags on this item, sorted.
    pub tags: Vec<Ulid>,
}

impl ItemState {
    pub fn new(id: Ulid, name: String, description: String, is_lendable: bool) -> Self {
        Self {
            id,
            name,
            description,
            is_lendable,
            lends: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Returns false if the tag was already there.
    pub fn add_tag(&mut self, tag_id: Ulid) -> bool {
        match self.tags.binary_search(&tag_id) {
            Ok(_) => false,
            Err(pos) => {
                self.tags.insert(pos, tag_id);
                true
            }
        }
    }

    /// Returns false if the item did not carry the tag.
    pub fn remove_tag(&mut self, tag_id: Ulid) -> bool {
        match self.tags.binary_search(&tag_id) {
            Ok(pos) => {
                self.tags.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn has_tag(&self, tag_id: &Ulid) -> bool {
        self.tags.binary_search(tag_id).is_ok()
    }

    /// Insert or replace a lend, keeping id order.
    pub fn upsert_lend(&mut self, lend: LendRecord) {
        match self.lends.binary_search_by_key(&lend.id, |l| l.id) {
            Ok(pos) => self.lends[pos] = lend,
            Err(pos) => self.lends.insert(pos, lend),
        }
    }

    pub fn remove_lend(&mut self, id: Ulid) -> Option<LendRecord> {
        let pos = self.lends.binary_search_by_key(&id, |l| l.id).ok()?;
        Some(self.lends.remove(pos))
    }

    pub fn lend(&self, id: &Ulid) -> Option<&LendRecord> {
        self.lends
            .binary_search_by_key(id, |l| l.id)
            .ok()
            .map(|pos| &self.lends[pos])
    }

    /// Every interval of granularity `G` on this item.
    pub fn intervals<'a, G: Grain + 'a>(
        &'a self,
    ) -> impl Iterator<Item = Interval<G::Point>> + 'a {
        self.lends.iter().filter_map(G::interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
}

/// What a note is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoteSubject {
    Item(Ulid),
    User(Ulid),
    Lend(Ulid),
}

impl NoteSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            NoteSubject::Item(_) => "item",
            NoteSubject::User(_) => "user",
            NoteSubject::Lend(_) => "lend",
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            NoteSubject::Item(id) | NoteSubject::User(id) | NoteSubject::Lend(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: Ulid,
    pub subject: NoteSubject,
    pub author_id: Ulid,
    pub note_text: String,
    pub note_date: Timestamp,
    pub is_complaint: bool,
}

/// A descriptive label for items. Names are unique, compared without case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub id: Ulid,
    pub name: String,
    pub description: String,
}

/// Every state change, in the order it happened. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ItemCreated {
        id: Ulid,
        name: String,
        description: String,
        is_lendable: bool,
    },
    ItemUpdated {
        id: Ulid,
        name: String,
        description: String,
        is_lendable: bool,
    },
    ItemDeleted {
        id: Ulid,
    },
    UserCreated {
        id: Ulid,
        name: String,
    },
    UserDeleted {
        id: Ulid,
    },
    LendCreated(LendRecord),
    LendUpdated(LendRecord),
    LendDeleted {
        id: Ulid,
        item_id: Ulid,
    },
    NoteAdded(Note),
    NoteDeleted {
        id: Ulid,
    },
    TagCreated(TagInfo),
    TagUpdated(TagInfo),
    TagDeleted {
        id: Ulid,
    },
    ItemTagged {
        item_id: Ulid,
        tag_id: Ulid,
    },
    ItemUntagged {
        item_id: Ulid,
        tag_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub is_lendable: bool,
    pub lend_count: usize,
}

/// One row of the item/tag relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemTag {
    pub item_id: Ulid,
    pub tag_id: Ulid,
}

impl ItemInfo {
    pub fn from_state(item: &ItemState) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            description: item.description.clone(),
            is_lendable: item.is_lendable,
            lend_count: item.lends.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> Day {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    fn lend(id: Ulid, due_out: Option<Day>, due_back: Option<Day>) -> LendRecord {
        LendRecord {
            id,
            item_id: Ulid::new(),
            user_id: Ulid::new(),
            due_out,
            due_back,
            out: None,
            back: None,
        }
    }

    #[test]
    fn window_contains_is_inclusive() {
        let w = Window::closed(day(1), day(5));
        assert!(w.contains(day(1)));
        assert!(w.contains(day(5)));
        assert!(!w.contains(day(6)));
    }

    #[test]
    fn open_window_contains_everything_after_start() {
        let w = Window::open(day(10));
        assert_eq!(w.end, None);
        assert!(!w.contains(day(9)));
        assert!(w.contains(day(31)));
    }

    #[test]
    fn window_display_uses_infinity() {
        assert_eq!(Window::open(day(1)).to_string(), "2021-03-01 to infinity");
        assert_eq!(
            Window::closed(day(1), day(5)).to_string(),
            "2021-03-01 to 2021-03-05"
        );
    }

    #[test]
    fn grain_without_start_has_no_interval() {
        let l = lend(Ulid::new(), None, Some(day(3)));
        assert!(ReservationGrain::window(&l).is_none());
        assert!(LendGrain::window(&l).is_none());
    }

    #[test]
    fn grain_carries_record_identity() {
        let id = Ulid::new();
        let l = lend(id, Some(day(1)), None);
        let iv = ReservationGrain::interval(&l).unwrap();
        assert_eq!(iv.record_id, id);
        assert_eq!(iv.item_id, l.item_id);
        assert_eq!(iv.window, Window::open(day(1)));
    }

    #[test]
    fn upsert_keeps_id_order_and_replaces() {
        let mut item = ItemState::new(Ulid::new(), "Laptop".into(), String::new(), true);
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        item.upsert_lend(lend(ids[2], Some(day(3)), None));
        item.upsert_lend(lend(ids[0], Some(day(1)), None));
        item.upsert_lend(lend(ids[1], Some(day(2)), None));
        let order: Vec<Ulid> = item.lends.iter().map(|l| l.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(order, sorted);

        item.upsert_lend(lend(ids[1], Some(day(20)), None));
        assert_eq!(item.lends.len(), 3);
        assert_eq!(item.lend(&ids[1]).unwrap().due_out, Some(day(20)));
    }

    #[test]
    fn remove_nonexistent_lend_returns_none() {
        let mut item = ItemState::new(Ulid::new(), "Tripod".into(), String::new(), true);
        item.upsert_lend(lend(Ulid::new(), Some(day(1)), None));
        assert!(item.remove_lend(Ulid::new()).is_none());
        assert_eq!(item.lends.len(), 1);
    }

    #[test]
    fn intervals_skip_records_without_start() {
        let mut item = ItemState::new(Ulid::new(), "Camera".into(), String::new(), true);
        item.upsert_lend(lend(Ulid::new(), Some(day(1)), Some(day(2))));
        item.upsert_lend(lend(Ulid::new(), None, None));
        assert_eq!(item.intervals::<ReservationGrain>().count(), 1);
        assert_eq!(item.intervals::<LendGrain>().count(), 0);
    }

    #[test]
    fn lend_changes_keep_unnamed_fields() {
        let mut stored = lend(Ulid::new(), Some(day(1)), Some(day(4)));
        stored.out = Some(day(1).and_hms_opt(9, 0, 0).unwrap());

        let changes = LendChanges {
            due_back: Some(None),
            back: Some(Some(day(2).and_hms_opt(17, 0, 0).unwrap())),
            ..Default::default()
        };
        assert!(!changes.is_empty());
        let edited = changes.apply(&stored);
        assert_eq!(edited.id, stored.id);
        assert_eq!(edited.user_id, stored.user_id);
        assert_eq!(edited.due_out, Some(day(1)));
        assert_eq!(edited.due_back, None);
        assert_eq!(edited.out, stored.out);
        assert_eq!(edited.back, Some(day(2).and_hms_opt(17, 0, 0).unwrap()));
        assert!(LendChanges::default().is_empty());
    }

    #[test]
    fn tags_stay_sorted_and_unique() {
        let mut item = ItemState::new(Ulid::new(), "Camera".into(), String::new(), true);
        let a = Ulid::new();
        let b = Ulid::new();
        assert!(item.add_tag(b));
        assert!(item.add_tag(a));
        assert!(!item.add_tag(b));
        assert_eq!(item.tags, vec![a, b]);
        assert!(item.has_tag(&a));

        assert!(item.remove_tag(a));
        assert!(!item.remove_tag(a));
        assert_eq!(item.tags, vec![b]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::LendCreated(LendRecord {
            id: Ulid::new(),
            item_id: Ulid::new(),
            user_id: Ulid::new(),
            due_out: Some(day(1)),
            due_back: None,
            out: Some(day(2).and_hms_opt(9, 30, 0).unwrap()),
            back: None,
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
