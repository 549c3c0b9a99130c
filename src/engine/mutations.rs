use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::LendCandidate;
use super::{Engine, EngineError, WalCommand};

pub(crate) fn now() -> Timestamp {
    chrono::Utc::now().naive_utc()
}

fn check_tag_fields(name: &str, description: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::BadField("tag name must not be empty"));
    }
    if name.chars().count() > MAX_TAG_NAME_LEN {
        return Err(EngineError::LimitExceeded("tag name too long"));
    }
    if description.chars().count() > MAX_TAG_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("tag description too long"));
    }
    Ok(())
}

fn check_item_fields(name: &str, description: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::BadField("item name must not be empty"));
    }
    if name.chars().count() > MAX_ITEM_NAME_LEN {
        return Err(EngineError::LimitExceeded("item name too long"));
    }
    if description.chars().count() > MAX_ITEM_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("item description too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_item(
        &self,
        id: Ulid,
        name: String,
        description: String,
        is_lendable: bool,
    ) -> Result<(), EngineError> {
        check_item_fields(&name, &description)?;
        if self.items.len() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        if self.items.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ItemCreated {
            id,
            name: name.clone(),
            description: description.clone(),
            is_lendable,
        };
        self.wal_append(&event).await?;
        let item = ItemState::new(id, name, description, is_lendable);
        self.items.insert(id, Arc::new(RwLock::new(item)));
        Ok(())
    }

    /// Apply a partial edit under the item's write lock.
    pub async fn update_item(
        &self,
        id: Ulid,
        changes: ItemChanges,
    ) -> Result<ItemInfo, EngineError> {
        let item = self.get_item(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = item.write().await;
        if !self.items.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let name = changes.name.unwrap_or_else(|| guard.name.clone());
        let description = changes.description.unwrap_or_else(|| guard.description.clone());
        let is_lendable = changes.is_lendable.unwrap_or(guard.is_lendable);
        check_item_fields(&name, &description)?;

        let event = Event::ItemUpdated {
            id,
            name,
            description,
            is_lendable,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(ItemInfo::from_state(&guard))
    }

    /// Delete an item together with its lends and their notes.
    pub async fn delete_item(&self, id: Ulid) -> Result<(), EngineError> {
        let item = self.get_item(&id).ok_or(EngineError::NotFound(id))?;
        let guard = item.write().await;
        // Lost a race with another delete.
        if !self.items.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::ItemDeleted { id };
        self.wal_append(&event).await?;
        self.forget_item(&guard);
        debug!(item_id = %id, lends = guard.lends.len(), "item deleted");
        Ok(())
    }

    pub async fn create_user(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::BadField("user name must not be empty"));
        }
        if name.chars().count() > MAX_USER_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_global(&Event::UserCreated { id, name }).await
    }

    /// A user who still has lends or authored notes cannot be deleted.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.lends.iter().any(|e| e.value().user_id == id)
            || self.notes.iter().any(|e| e.value().author_id == id)
        {
            return Err(EngineError::InUse(id));
        }
        self.persist_global(&Event::UserDeleted { id }).await
    }

    /// Validate and store a new lend. The item stays write-locked from the
    /// conflict check through the WAL append, so two overlapping lends on
    /// one item cannot both get in.
    pub async fn create_lend(&self, lend: LendRecord) -> Result<(), EngineError> {
        if self.lends.contains_key(&lend.id) {
            return Err(EngineError::AlreadyExists(lend.id));
        }
        if !self.users.contains_key(&lend.user_id) {
            return Err(EngineError::NotFound(lend.user_id));
        }
        let item = self
            .get_item(&lend.item_id)
            .ok_or(EngineError::NotFound(lend.item_id))?;
        let mut guard = item.write().await;
        if !self.items.contains_key(&lend.item_id) {
            return Err(EngineError::NotFound(lend.item_id));
        }
        if guard.lends.len() >= MAX_LENDS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many lends on item"));
        }
        // Re-check under the lock: the id may have landed on this item meanwhile.
        if guard.lend(&lend.id).is_some() {
            return Err(EngineError::AlreadyExists(lend.id));
        }

        self.check_candidate(&guard, &LendCandidate::from_record(&lend, None))?;

        debug!(lend_id = %lend.id, item_id = %lend.item_id, "lend created");
        let event = Event::LendCreated(lend);
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Edit a lend in place. The stored version of the lend is excluded from
    /// conflict checks.
    pub async fn update_lend(
        &self,
        id: Ulid,
        changes: LendChanges,
    ) -> Result<LendRecord, EngineError> {
        if let Some(user_id) = changes.user_id
            && !self.users.contains_key(&user_id)
        {
            return Err(EngineError::NotFound(user_id));
        }
        let (_, mut guard) = self.resolve_lend_write(&id).await?;
        let current = guard.lend(&id).ok_or(EngineError::NotFound(id))?;
        let updated = changes.apply(current);

        self.check_candidate(&guard, &LendCandidate::from_record(&updated, Some(id)))?;

        debug!(lend_id = %id, item_id = %updated.item_id, "lend updated");
        let event = Event::LendUpdated(updated.clone());
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(updated)
    }

    /// Returns the id of the item the lend belonged to.
    pub async fn delete_lend(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (item_id, mut guard) = self.resolve_lend_write(&id).await?;
        if guard.lend(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::LendDeleted { id, item_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(item_id)
    }

    pub async fn add_note(
        &self,
        id: Ulid,
        subject: NoteSubject,
        author_id: Ulid,
        note_text: String,
        is_complaint: bool,
    ) -> Result<Note, EngineError> {
        if note_text.trim().is_empty() {
            return Err(EngineError::BadField("note text must not be empty"));
        }
        if note_text.chars().count() > MAX_NOTE_TEXT_LEN {
            return Err(EngineError::LimitExceeded("note text too long"));
        }
        if is_complaint && !matches!(subject, NoteSubject::Lend(_)) {
            return Err(EngineError::BadField("only lend notes can be complaints"));
        }
        if self.notes.len() >= MAX_NOTES {
            return Err(EngineError::LimitExceeded("too many notes"));
        }
        if self.notes.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.users.contains_key(&author_id) {
            return Err(EngineError::NotFound(author_id));
        }
        // Item and lend notes go in under the owning item's read lock; item
        // and lend deletes drop notes while holding the write lock.
        let owner = match subject {
            NoteSubject::Item(sid) => Some(sid),
            NoteSubject::Lend(sid) => self.item_for_lend(&sid),
            NoteSubject::User(_) => None,
        };
        let item = owner.and_then(|id| self.get_item(&id));
        let _guard = match &item {
            Some(item) => Some(item.read().await),
            None => None,
        };
        let subject_exists = match subject {
            NoteSubject::Item(sid) => self.items.contains_key(&sid),
            NoteSubject::User(sid) => self.users.contains_key(&sid),
            NoteSubject::Lend(sid) => {
                self.lends.contains_key(&sid)
                    && owner.is_some_and(|id| self.items.contains_key(&id))
            }
        };
        if !subject_exists {
            return Err(EngineError::NotFound(subject.id()));
        }

        let note = Note {
            id,
            subject,
            author_id,
            note_text,
            note_date: now(),
            is_complaint,
        };
        self.persist_global(&Event::NoteAdded(note.clone())).await?;
        Ok(note)
    }

    pub async fn delete_note(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.notes.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_global(&Event::NoteDeleted { id }).await
    }

    pub async fn create_tag(
        &self,
        id: Ulid,
        name: String,
        description: String,
    ) -> Result<(), EngineError> {
        check_tag_fields(&name, &description)?;
        let _writes = self.tag_writes.lock().await;
        if self.tags.len() >= MAX_TAGS {
            return Err(EngineError::LimitExceeded("too many tags"));
        }
        if self.tags.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.check_tag_name_free(&name, None)?;
        let tag = TagInfo {
            id,
            name,
            description,
        };
        self.persist_global(&Event::TagCreated(tag)).await
    }

    pub async fn update_tag(&self, id: Ulid, changes: TagChanges) -> Result<TagInfo, EngineError> {
        let _writes = self.tag_writes.lock().await;
        let current = self
            .tags
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let tag = TagInfo {
            id,
            name: changes.name.unwrap_or(current.name),
            description: changes.description.unwrap_or(current.description),
        };
        check_tag_fields(&tag.name, &tag.description)?;
        self.check_tag_name_free(&tag.name, Some(id))?;
        self.persist_global(&Event::TagUpdated(tag.clone())).await?;
        Ok(tag)
    }

    /// Delete a tag and take it off every item that carries it.
    pub async fn delete_tag(&self, id: Ulid) -> Result<(), EngineError> {
        let _writes = self.tag_writes.lock().await;
        if !self.tags.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.wal_append(&Event::TagDeleted { id }).await?;
        self.tags.remove(&id);

        let handles: Vec<super::SharedItemState> =
            self.items.iter().map(|e| e.value().clone()).collect();
        let mut untagged = 0usize;
        for item in handles {
            if item.write().await.remove_tag(id) {
                untagged += 1;
            }
        }
        debug!(tag_id = %id, items = untagged, "tag deleted");
        Ok(())
    }

    fn check_tag_name_free(&self, name: &str, except: Option<Ulid>) -> Result<(), EngineError> {
        let taken = self.tags.iter().any(|e| {
            Some(e.value().id) != except && e.value().name.eq_ignore_ascii_case(name)
        });
        if taken {
            return Err(EngineError::NameTaken(name.to_string()));
        }
        Ok(())
    }

    pub async fn tag_item(&self, item_id: Ulid, tag_id: Ulid) -> Result<(), EngineError> {
        let item = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let mut guard = item.write().await;
        if !self.items.contains_key(&item_id) {
            return Err(EngineError::NotFound(item_id));
        }
        if !self.tags.contains_key(&tag_id) {
            return Err(EngineError::NotFound(tag_id));
        }
        if guard.has_tag(&tag_id) {
            return Err(EngineError::AlreadyExists(tag_id));
        }
        self.persist_and_apply(&mut guard, &Event::ItemTagged { item_id, tag_id })
            .await
    }

    pub async fn untag_item(&self, item_id: Ulid, tag_id: Ulid) -> Result<(), EngineError> {
        let item = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let mut guard = item.write().await;
        if !self.items.contains_key(&item_id) || !guard.has_tag(&tag_id) {
            return Err(EngineError::NotFound(tag_id));
        }
        self.persist_and_apply(&mut guard, &Event::ItemUntagged { item_id, tag_id })
            .await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    ///
    /// The snapshot is not atomic: writers keep going while items are read
    /// one by one. The WAL writer holds on to every append committed after
    /// `BeginCompact` and writes it after the snapshot. Replaying that tail
    /// over a snapshot that already reflects part of it rebuilds the same
    /// state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _one_at_a_time = self.compaction.lock().await;

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::BeginCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?;

        let mut events = Vec::new();

        let mut users: Vec<UserInfo> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserCreated {
            id: u.id,
            name: u.name,
        }));

        let mut tags: Vec<TagInfo> = self.tags.iter().map(|e| e.value().clone()).collect();
        tags.sort_by_key(|t| t.id);
        events.extend(tags.into_iter().map(Event::TagCreated));

        // Collect the Arcs first; DashMap refs must not be held across an await.
        let mut items: Vec<(Ulid, super::SharedItemState)> = self
            .items
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        items.sort_by_key(|(id, _)| *id);
        for (_, item) in items {
            let guard = item.read().await;
            events.push(Event::ItemCreated {
                id: guard.id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                is_lendable: guard.is_lendable,
            });
            events.extend(guard.lends.iter().cloned().map(Event::LendCreated));
            events.extend(guard.tags.iter().map(|&tag_id| Event::ItemTagged {
                item_id: guard.id,
                tag_id,
            }));
        }

        let mut notes: Vec<Note> = self.notes.iter().map(|e| e.value().clone()).collect();
        notes.sort_by_key(|n| n.id);
        events.extend(notes.into_iter().map(Event::NoteAdded));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
