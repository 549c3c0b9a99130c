mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;
mod validate;

pub use conflict::{find_conflicts, overlaps, IntervalStore};
pub use error::EngineError;
pub use validate::{
    validate_lend, EndpointOrder, LendCandidate, LendError, ValidationErrors, Violation,
    ViolationKind,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start keeping a copy of every committed append, so the compacted
    /// file can carry whatever lands after the snapshot was taken.
    BeginCompact {
        response: oneshot::Sender<()>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then fsyncs once and answers every sender in the batch.
///
/// Between `BeginCompact` and `Compact` the committed appends are also kept
/// in `tail` and written after the snapshot, so nothing acknowledged during
/// compaction is lost.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut tail: Option<Vec<Event>> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Compaction must see every append queued before it.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let (Ok(()), Some(tail)) = (&result, tail.as_mut()) {
                    tail.extend(batch.iter().map(|(event, _)| event.clone()));
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, &mut tail, other);
                }
            }
            other => handle_non_append(&mut wal, &mut tail, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so no half-written batch leaks
    // into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, tail: &mut Option<Vec<Event>>, cmd: WalCommand) {
    match cmd {
        WalCommand::BeginCompact { response } => {
            tail.get_or_insert_with(Vec::new);
            let _ = response.send(());
        }
        WalCommand::Compact { mut events, response } => {
            events.extend(tail.take().unwrap_or_default());
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Which item and user a lend belongs to.
#[derive(Debug, Clone, Copy)]
pub(super) struct LendRef {
    pub item_id: Ulid,
    pub user_id: Ulid,
}

/// The lend store: items with their lends behind per-item locks, plus
/// users and notes. Every change goes through the WAL first.
pub struct Engine {
    pub items: DashMap<Ulid, SharedItemState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: lend id → owning item and user.
    pub(super) lends: DashMap<Ulid, LendRef>,
    pub(super) users: DashMap<Ulid, UserInfo>,
    pub(super) notes: DashMap<Ulid, Note>,
    pub(super) tags: DashMap<Ulid, TagInfo>,
    /// Serializes tag writes so names stay unique.
    pub(super) tag_writes: Mutex<()>,
    /// One compaction at a time.
    pub(super) compaction: Mutex<()>,
    pub order: EndpointOrder,
}

/// Apply an item-scoped event. Caller holds the item lock.
fn apply_to_item(
    item: &mut ItemState,
    event: &Event,
    lends: &DashMap<Ulid, LendRef>,
    notes: &DashMap<Ulid, Note>,
) {
    match event {
        Event::ItemUpdated {
            name,
            description,
            is_lendable,
            ..
        } => {
            item.name = name.clone();
            item.description = description.clone();
            item.is_lendable = *is_lendable;
        }
        Event::LendCreated(lend) | Event::LendUpdated(lend) => {
            lends.insert(
                lend.id,
                LendRef {
                    item_id: lend.item_id,
                    user_id: lend.user_id,
                },
            );
            item.upsert_lend(lend.clone());
        }
        Event::LendDeleted { id, .. } => {
            item.remove_lend(*id);
            lends.remove(id);
            notes.retain(|_, n| n.subject != NoteSubject::Lend(*id));
        }
        Event::ItemTagged { tag_id, .. } => {
            item.add_tag(*tag_id);
        }
        Event::ItemUntagged { tag_id, .. } => {
            item.remove_tag(*tag_id);
        }
        // Handled at the map level, not here
        Event::ItemCreated { .. }
        | Event::ItemDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserDeleted { .. }
        | Event::NoteAdded(_)
        | Event::NoteDeleted { .. }
        | Event::TagCreated(_)
        | Event::TagUpdated(_)
        | Event::TagDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, order: EndpointOrder) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            items: DashMap::new(),
            wal_tx,
            lends: DashMap::new(),
            users: DashMap::new(),
            notes: DashMap::new(),
            tags: DashMap::new(),
            tag_writes: Mutex::new(()),
            compaction: Mutex::new(()),
            order,
        };

        // We're the sole owner of every Arc during replay, so try_write never
        // contends. Blocking locks are off limits: this runs inside a runtime.
        for event in &events {
            match event {
                Event::ItemCreated {
                    id,
                    name,
                    description,
                    is_lendable,
                } => {
                    let item = ItemState::new(*id, name.clone(), description.clone(), *is_lendable);
                    engine.items.insert(*id, Arc::new(RwLock::new(item)));
                }
                Event::ItemDeleted { id } => {
                    if let Some(item) = engine.get_item(id) {
                        let guard = item.try_read().expect("replay: uncontended read");
                        engine.forget_item(&guard);
                    }
                }
                Event::TagDeleted { id } => {
                    engine.tags.remove(id);
                    for entry in engine.items.iter() {
                        let item = entry.value();
                        let mut guard = item.try_write().expect("replay: uncontended write");
                        guard.remove_tag(*id);
                    }
                }
                // A tagging that raced with the tag's deletion.
                Event::ItemTagged { tag_id, .. } if !engine.tags.contains_key(tag_id) => {}
                other => match event_item_id(other) {
                    Some(item_id) => {
                        if let Some(item) = engine.get_item(&item_id) {
                            let mut guard = item.try_write().expect("replay: uncontended write");
                            apply_to_item(&mut guard, other, &engine.lends, &engine.notes);
                        }
                    }
                    None => engine.apply_global(other),
                },
            }
        }
        if !events.is_empty() {
            info!("replayed {} events from {}", events.len(), wal_path.display());
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_item(&self, id: &Ulid) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    pub fn item_for_lend(&self, lend_id: &Ulid) -> Option<Ulid> {
        self.lends.get(lend_id).map(|e| e.value().item_id)
    }

    /// WAL-append then apply to the locked item.
    pub(super) async fn persist_and_apply(
        &self,
        item: &mut ItemState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_item(item, event, &self.lends, &self.notes);
        Ok(())
    }

    /// WAL-append then apply a user or note event.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_global(event);
        Ok(())
    }

    fn apply_global(&self, event: &Event) {
        match event {
            Event::UserCreated { id, name } => {
                self.users.insert(
                    *id,
                    UserInfo {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
                self.notes.retain(|_, n| n.subject != NoteSubject::User(*id));
            }
            Event::NoteAdded(note) => {
                self.notes.insert(note.id, note.clone());
            }
            Event::NoteDeleted { id } => {
                self.notes.remove(id);
            }
            Event::TagCreated(tag) | Event::TagUpdated(tag) => {
                self.tags.insert(tag.id, tag.clone());
            }
            _ => {}
        }
    }

    /// Drop an item along with its lends and every note hanging off either.
    pub(super) fn forget_item(&self, item: &ItemState) {
        for lend in &item.lends {
            self.lends.remove(&lend.id);
        }
        self.notes.retain(|_, n| match n.subject {
            NoteSubject::Item(id) => id != item.id,
            NoteSubject::Lend(id) => item.lend(&id).is_none(),
            NoteSubject::User(_) => true,
        });
        self.items.remove(&item.id);
    }

    /// Lookup lend → item, acquire the item's write lock.
    ///
    /// The item may have been deleted while we waited for the lock; its
    /// state then still holds the lend, so the lend index is checked again.
    pub(super) async fn resolve_lend_write(
        &self,
        lend_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ItemState>), EngineError> {
        let item_id = self
            .item_for_lend(lend_id)
            .ok_or(EngineError::NotFound(*lend_id))?;
        let item = self
            .get_item(&item_id)
            .ok_or(EngineError::NotFound(item_id))?;
        let guard = item.write_owned().await;
        if !self.items.contains_key(&item_id) || !self.lends.contains_key(lend_id) {
            return Err(EngineError::NotFound(*lend_id));
        }
        Ok((item_id, guard))
    }

    /// Run the lend rules against the item's current lends.
    pub(super) fn check_candidate(
        &self,
        item: &ItemState,
        candidate: &LendCandidate,
    ) -> Result<(), EngineError> {
        match validate_lend(candidate, item, self.order) {
            Ok(()) => Ok(()),
            Err(LendError::Invalid(errors)) => {
                for v in errors.violations() {
                    metrics::counter!(
                        crate::observability::VALIDATION_FAILURES_TOTAL,
                        "kind" => v.kind().as_str()
                    )
                    .increment(1);
                }
                let conflicting: Vec<Ulid> = errors
                    .violations()
                    .iter()
                    .flat_map(Violation::conflicting_records)
                    .collect();
                debug!(
                    item_id = %candidate.item_id,
                    violations = errors.len(),
                    ?conflicting,
                    "lend rejected"
                );
                Err(EngineError::Invalid(errors))
            }
            Err(LendError::Store(never)) => match never {},
        }
    }
}

/// The item an item-scoped event applies to.
fn event_item_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ItemUpdated { id, .. } => Some(*id),
        Event::LendCreated(lend) | Event::LendUpdated(lend) => Some(lend.item_id),
        Event::LendDeleted { item_id, .. } => Some(*item_id),
        Event::ItemTagged { item_id, .. } | Event::ItemUntagged { item_id, .. } => Some(*item_id),
        Event::ItemCreated { .. }
        | Event::ItemDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserDeleted { .. }
        | Event::NoteAdded(_)
        | Event::NoteDeleted { .. }
        | Event::TagCreated(_)
        | Event::TagUpdated(_)
        | Event::TagDeleted { .. } => None,
    }
}
