use ulid::Ulid;

use crate::model::*;

use super::conflict::find_conflicts;
use super::validate::{LendCandidate, Violation};
use super::{Engine, EngineError, SharedItemState};

impl Engine {
    fn item_handles(&self) -> Vec<SharedItemState> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_items(&self) -> Vec<ItemInfo> {
        let mut out = Vec::new();
        for item in self.item_handles() {
            out.push(ItemInfo::from_state(&*item.read().await));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Items carrying the tag named `name` (any case). An unknown tag name
    /// matches nothing.
    pub async fn list_items_tagged(&self, name: &str) -> Vec<ItemInfo> {
        let Some(tag_id) = self.tag_by_name(name).map(|t| t.id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for item in self.item_handles() {
            let guard = item.read().await;
            if guard.has_tag(&tag_id) {
                out.push(ItemInfo::from_state(&guard));
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_item_info(&self, id: Ulid) -> Result<ItemInfo, EngineError> {
        let item = self.get_item(&id).ok_or(EngineError::NotFound(id))?;
        let guard = item.read().await;
        Ok(ItemInfo::from_state(&guard))
    }

    pub fn list_users(&self) -> Vec<UserInfo> {
        let mut out: Vec<UserInfo> = self.users.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn list_tags(&self) -> Vec<TagInfo> {
        let mut out: Vec<TagInfo> = self.tags.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn tag_by_name(&self, name: &str) -> Option<TagInfo> {
        self.tags
            .iter()
            .find(|e| e.value().name.eq_ignore_ascii_case(name))
            .map(|e| e.value().clone())
    }

    /// The item/tag relation, narrowed to one item and/or one tag.
    pub async fn list_item_tags(
        &self,
        item_id: Option<Ulid>,
        tag_id: Option<Ulid>,
    ) -> Result<Vec<ItemTag>, EngineError> {
        let handles = match item_id {
            Some(id) => vec![self.get_item(&id).ok_or(EngineError::NotFound(id))?],
            None => self.item_handles(),
        };
        let mut out = Vec::new();
        for item in handles {
            let guard = item.read().await;
            out.extend(
                guard
                    .tags
                    .iter()
                    .filter(|t| tag_id.is_none_or(|want| **t == want))
                    .map(|&tag_id| ItemTag {
                        item_id: guard.id,
                        tag_id,
                    }),
            );
        }
        out.sort_by_key(|r| (r.item_id, r.tag_id));
        Ok(out)
    }

    /// Lends of one item, or of every item when `item_id` is `None`.
    pub async fn list_lends(&self, item_id: Option<Ulid>) -> Result<Vec<LendRecord>, EngineError> {
        let handles = match item_id {
            Some(id) => vec![self.get_item(&id).ok_or(EngineError::NotFound(id))?],
            None => self.item_handles(),
        };
        let mut out = Vec::new();
        for item in handles {
            out.extend(item.read().await.lends.iter().cloned());
        }
        out.sort_by_key(|l| l.id);
        Ok(out)
    }

    pub async fn get_lend(&self, id: Ulid) -> Result<LendRecord, EngineError> {
        let item_id = self.item_for_lend(&id).ok_or(EngineError::NotFound(id))?;
        let item = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        guard.lend(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Notes on one subject, oldest first.
    pub fn list_notes(&self, subject: NoteSubject) -> Vec<Note> {
        let mut out: Vec<Note> = self
            .notes
            .iter()
            .filter(|e| e.value().subject == subject)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.note_date.cmp(&b.note_date).then(a.id.cmp(&b.id)));
        out
    }

    /// Dry-run the lend rules. An empty result means the lend would be
    /// accepted as of now.
    pub async fn check_lend(
        &self,
        candidate: &LendCandidate,
    ) -> Result<Vec<Violation>, EngineError> {
        let item = self
            .get_item(&candidate.item_id)
            .ok_or(EngineError::NotFound(candidate.item_id))?;
        let guard = item.read().await;
        match self.check_candidate(&guard, candidate) {
            Ok(()) => Ok(Vec::new()),
            Err(EngineError::Invalid(errors)) => Ok(errors.into_vec()),
            Err(e) => Err(e),
        }
    }

    /// Existing intervals of granularity `G` on an item that overlap the
    /// given window.
    pub async fn conflicts<G: Grain>(
        &self,
        item_id: Ulid,
        start: Option<G::Point>,
        end: Option<G::Point>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Interval<G::Point>>, EngineError> {
        let item = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        match find_conflicts::<G, ItemState>(&guard, item_id, start, end, exclude) {
            Ok(hits) => Ok(hits),
            Err(never) => match never {},
        }
    }
}
