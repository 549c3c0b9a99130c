use super::*;
use chrono::{NaiveDate, NaiveDateTime};
use tokio_test::{assert_err, assert_ok};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("lendtrack_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(y: i32, m: u32, d: u32) -> Day {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(0, 0, 0).unwrap()
}

/// Engine with one user and one item.
async fn setup(name: &str) -> (Engine, Ulid, Ulid) {
    let engine = Engine::new(test_wal_path(name), EndpointOrder::Strict).unwrap();
    let user = Ulid::new();
    engine.create_user(user, "Ada".into()).await.unwrap();
    let item = Ulid::new();
    engine
        .create_item(item, "Tripod".into(), "carbon, 1.6m".into(), true)
        .await
        .unwrap();
    (engine, user, item)
}

fn lend(item_id: Ulid, user_id: Ulid) -> LendRecord {
    LendRecord {
        id: Ulid::new(),
        item_id,
        user_id,
        due_out: None,
        due_back: None,
        out: None,
        back: None,
    }
}

fn invalid_kinds(result: Result<(), EngineError>) -> Vec<ViolationKind> {
    match result {
        Err(EngineError::Invalid(errors)) => errors.kinds(),
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn create_and_list_item() {
    let (engine, _, item) = setup("create_item.wal").await;
    let items = engine.list_items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, item);
    assert_eq!(items[0].name, "Tripod");
    assert!(items[0].is_lendable);
    assert_eq!(items[0].lend_count, 0);
}

#[tokio::test]
async fn item_field_lengths_are_enforced() {
    let engine = Engine::new(test_wal_path("item_fields.wal"), EndpointOrder::Strict).unwrap();
    let r = engine.create_item(Ulid::new(), "x".repeat(51), String::new(), true).await;
    assert!(matches!(r, Err(EngineError::LimitExceeded(_))));
    let r = engine.create_item(Ulid::new(), "  ".into(), String::new(), true).await;
    assert!(matches!(r, Err(EngineError::BadField(_))));
    let r = engine.create_item(Ulid::new(), "Cable".into(), "d".repeat(2001), true).await;
    assert!(matches!(r, Err(EngineError::LimitExceeded(_))));
    assert_ok!(engine.create_item(Ulid::new(), "x".repeat(50), "d".repeat(2000), true).await);
}

#[tokio::test]
async fn partial_item_update_keeps_other_fields() {
    let (engine, _, item) = setup("update_item.wal").await;
    let changes = ItemChanges {
        is_lendable: Some(false),
        ..Default::default()
    };
    let info = engine.update_item(item, changes).await.unwrap();
    assert_eq!(info.name, "Tripod");
    assert_eq!(info.description, "carbon, 1.6m");
    assert!(!info.is_lendable);

    let bad = ItemChanges {
        name: Some(String::new()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_item(item, bad).await,
        Err(EngineError::BadField(_))
    ));
    assert_eq!(engine.get_item_info(item).await.unwrap(), info);
}

#[tokio::test]
async fn duplicate_item_rejected() {
    let (engine, _, item) = setup("dup_item.wal").await;
    let r = engine.create_item(item, "Again".into(), String::new(), true).await;
    assert!(matches!(r, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn lend_requires_existing_item_and_user() {
    let (engine, user, item) = setup("lend_refs.wal").await;
    let mut l = lend(Ulid::new(), user);
    l.out = Some(at(2020, 1, 1));
    assert!(matches!(engine.create_lend(l).await, Err(EngineError::NotFound(_))));

    let mut l = lend(item, Ulid::new());
    l.out = Some(at(2020, 1, 1));
    assert!(matches!(engine.create_lend(l).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn scenario_a_point_inside_existing_lend() {
    let (engine, user, item) = setup("scenario_a.wal").await;
    let mut existing = lend(item, user);
    existing.out = Some(at(2020, 1, 10));
    existing.back = Some(at(2020, 1, 20));
    engine.create_lend(existing).await.unwrap();

    let mut candidate = lend(item, user);
    candidate.out = Some(at(2020, 1, 15));
    assert_eq!(
        invalid_kinds(engine.create_lend(candidate).await),
        vec![ViolationKind::LendConflict]
    );
}

#[tokio::test]
async fn scenario_b_open_lend_blocks_later_checkout() {
    let (engine, user, item) = setup("scenario_b.wal").await;
    let mut existing = lend(item, user);
    existing.out = Some(at(2020, 1, 10));
    engine.create_lend(existing).await.unwrap();

    let mut candidate = lend(item, user);
    candidate.out = Some(at(2020, 2, 1));
    assert_eq!(
        invalid_kinds(engine.create_lend(candidate).await),
        vec![ViolationKind::LendConflict]
    );
}

#[tokio::test]
async fn scenario_c_back_to_back_reservations() {
    let (engine, user, item) = setup("scenario_c.wal").await;
    let mut first = lend(item, user);
    first.due_out = Some(date(2021, 3, 1));
    first.due_back = Some(date(2021, 3, 5));
    assert_ok!(engine.create_lend(first).await);

    let mut second = lend(item, user);
    second.due_out = Some(date(2021, 3, 6));
    second.due_back = Some(date(2021, 3, 10));
    assert_ok!(engine.create_lend(second).await);
    assert_eq!(engine.list_lends(Some(item)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn scenario_d_no_dates() {
    let (engine, user, item) = setup("scenario_d.wal").await;
    assert_eq!(
        invalid_kinds(engine.create_lend(lend(item, user)).await),
        vec![ViolationKind::MissingBothDates]
    );
    assert!(engine.list_lends(Some(item)).await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_e_unchanged_update_passes() {
    let (engine, user, item) = setup("scenario_e.wal").await;
    let mut existing = lend(item, user);
    existing.out = Some(at(2020, 5, 1));
    existing.back = Some(at(2020, 5, 3));
    let id = existing.id;
    engine.create_lend(existing.clone()).await.unwrap();

    let updated = engine.update_lend(id, LendChanges::default()).await.unwrap();
    assert_eq!(updated, existing);
}

#[tokio::test]
async fn touching_reservations_conflict() {
    let (engine, user, item) = setup("touching.wal").await;
    let mut first = lend(item, user);
    first.due_out = Some(date(2021, 3, 1));
    first.due_back = Some(date(2021, 3, 3));
    engine.create_lend(first).await.unwrap();

    let mut second = lend(item, user);
    second.due_out = Some(date(2021, 3, 3));
    second.due_back = Some(date(2021, 3, 5));
    assert_eq!(
        invalid_kinds(engine.create_lend(second).await),
        vec![ViolationKind::ReservationConflict]
    );
}

#[tokio::test]
async fn same_dates_on_different_items_do_not_conflict() {
    let (engine, user, item) = setup("two_items.wal").await;
    let other = Ulid::new();
    engine.create_item(other, "Tripod 2".into(), String::new(), true).await.unwrap();

    for item_id in [item, other] {
        let mut l = lend(item_id, user);
        l.due_out = Some(date(2021, 3, 1));
        l.due_back = Some(date(2021, 3, 9));
        assert_ok!(engine.create_lend(l).await);
    }
}

#[tokio::test]
async fn update_into_a_conflict_is_rejected() {
    let (engine, user, item) = setup("update_conflict.wal").await;
    let mut first = lend(item, user);
    first.due_out = Some(date(2021, 3, 1));
    first.due_back = Some(date(2021, 3, 5));
    engine.create_lend(first).await.unwrap();

    let mut second = lend(item, user);
    second.due_out = Some(date(2021, 3, 10));
    second.due_back = Some(date(2021, 3, 12));
    let second_id = second.id;
    engine.create_lend(second).await.unwrap();

    let changes = LendChanges {
        due_out: Some(Some(date(2021, 3, 4))),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_lend(second_id, changes).await,
        Err(EngineError::Invalid(_))
    ));
    // Stored value untouched.
    let stored = engine.get_lend(second_id).await.unwrap();
    assert_eq!(stored.due_out, Some(date(2021, 3, 10)));
}

#[tokio::test]
async fn returning_an_item_closes_the_lend() {
    let (engine, user, item) = setup("return.wal").await;
    let mut open = lend(item, user);
    open.out = Some(at(2020, 1, 10));
    let id = open.id;
    engine.create_lend(open).await.unwrap();

    let changes = LendChanges {
        back: Some(Some(at(2020, 1, 12))),
        ..Default::default()
    };
    let updated = engine.update_lend(id, changes).await.unwrap();
    assert_eq!(updated.back, Some(at(2020, 1, 12)));

    let mut next = lend(item, user);
    next.out = Some(at(2020, 1, 13));
    assert_ok!(engine.create_lend(next).await);
}

#[tokio::test]
async fn update_with_unknown_user_fails() {
    let (engine, user, item) = setup("update_user.wal").await;
    let mut l = lend(item, user);
    l.due_out = Some(date(2021, 1, 1));
    let id = l.id;
    engine.create_lend(l).await.unwrap();

    let changes = LendChanges {
        user_id: Some(Ulid::new()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_lend(id, changes).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn strict_order_rejects_zero_length_reservation() {
    let (engine, user, item) = setup("strict.wal").await;
    let mut l = lend(item, user);
    l.due_out = Some(date(2021, 1, 1));
    l.due_back = Some(date(2021, 1, 1));
    assert_eq!(
        invalid_kinds(engine.create_lend(l).await),
        vec![ViolationKind::ReservationOrderInvalid]
    );
}

#[tokio::test]
async fn inclusive_order_accepts_zero_length_reservation() {
    let engine = Engine::new(test_wal_path("inclusive.wal"), EndpointOrder::AllowEqual).unwrap();
    let user = Ulid::new();
    engine.create_user(user, "Grace".into()).await.unwrap();
    let item = Ulid::new();
    engine.create_item(item, "Mic".into(), String::new(), true).await.unwrap();

    let mut l = lend(item, user);
    l.due_out = Some(date(2021, 1, 1));
    l.due_back = Some(date(2021, 1, 1));
    assert_ok!(engine.create_lend(l).await);
}

#[tokio::test]
async fn check_lend_reports_without_storing() {
    let (engine, user, item) = setup("check.wal").await;
    let mut existing = lend(item, user);
    existing.due_out = Some(date(2021, 3, 1));
    engine.create_lend(existing).await.unwrap();

    let mut candidate = LendCandidate::new(item);
    candidate.due_out = Some(date(2021, 4, 1));
    candidate.back = Some(at(2021, 4, 2));
    let violations = engine.check_lend(&candidate).await.unwrap();
    let kinds: Vec<_> = violations.iter().map(Violation::kind).collect();
    assert_eq!(
        kinds,
        vec![ViolationKind::BackRequiresOut, ViolationKind::ReservationConflict]
    );
    assert_eq!(engine.list_lends(Some(item)).await.unwrap().len(), 1);

    let mut fine = LendCandidate::new(item);
    fine.out = Some(at(2021, 4, 1));
    assert!(engine.check_lend(&fine).await.unwrap().is_empty());
}

#[tokio::test]
async fn conflicts_query_respects_exclusion() {
    let (engine, user, item) = setup("conflicts_query.wal").await;
    let mut existing = lend(item, user);
    existing.out = Some(at(2020, 1, 10));
    existing.back = Some(at(2020, 1, 20));
    let id = existing.id;
    engine.create_lend(existing).await.unwrap();

    let hits = engine
        .conflicts::<LendGrain>(item, Some(at(2020, 1, 1)), Some(at(2020, 1, 10)), None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record_id, id);

    let hits = engine
        .conflicts::<LendGrain>(item, Some(at(2020, 1, 1)), Some(at(2020, 1, 10)), Some(id))
        .await
        .unwrap();
    assert!(hits.is_empty());

    let hits = engine
        .conflicts::<LendGrain>(item, None, Some(at(2020, 1, 10)), None)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn concurrent_overlapping_lends_only_one_wins() {
    let (engine, user, item) = setup("race.wal").await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut l = lend(item, user);
            l.out = Some(at(2020, 3, 1));
            engine.create_lend(l).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.list_lends(Some(item)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_lend_frees_the_slot() {
    let (engine, user, item) = setup("delete_lend.wal").await;
    let mut first = lend(item, user);
    first.out = Some(at(2020, 1, 1));
    let id = first.id;
    engine.create_lend(first).await.unwrap();

    assert_eq!(engine.delete_lend(id).await.unwrap(), item);
    assert!(matches!(engine.get_lend(id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.delete_lend(id).await, Err(EngineError::NotFound(_))));

    let mut second = lend(item, user);
    second.out = Some(at(2020, 1, 1));
    assert_ok!(engine.create_lend(second).await);
}

#[tokio::test]
async fn user_with_lends_cannot_be_deleted() {
    let (engine, user, item) = setup("user_in_use.wal").await;
    let mut l = lend(item, user);
    l.due_out = Some(date(2021, 1, 1));
    let id = l.id;
    engine.create_lend(l).await.unwrap();

    assert!(matches!(engine.delete_user(user).await, Err(EngineError::InUse(_))));
    engine.delete_lend(id).await.unwrap();
    assert_ok!(engine.delete_user(user).await);
    assert!(engine.list_users().is_empty());
}

#[tokio::test]
async fn notes_attach_to_existing_subjects() {
    let (engine, user, item) = setup("notes.wal").await;
    let mut l = lend(item, user);
    l.out = Some(at(2020, 1, 1));
    let lend_id = l.id;
    engine.create_lend(l).await.unwrap();

    assert_ok!(
        engine
            .add_note(Ulid::new(), NoteSubject::Item(item), user, "lens cap missing".into(), false)
            .await
    );
    let complaint = engine
        .add_note(Ulid::new(), NoteSubject::Lend(lend_id), user, "returned wet".into(), true)
        .await
        .unwrap();
    assert!(complaint.is_complaint);

    let r = engine
        .add_note(Ulid::new(), NoteSubject::User(user), user, "prefers mornings".into(), true)
        .await;
    assert!(matches!(r, Err(EngineError::BadField(_))));
    let r = engine
        .add_note(Ulid::new(), NoteSubject::Item(Ulid::new()), user, "ghost".into(), false)
        .await;
    assert!(matches!(r, Err(EngineError::NotFound(_))));
    let r = engine
        .add_note(Ulid::new(), NoteSubject::Item(item), user, "".into(), false)
        .await;
    assert_err!(r);

    assert_eq!(engine.list_notes(NoteSubject::Item(item)).len(), 1);
    assert_eq!(engine.list_notes(NoteSubject::Lend(lend_id)).len(), 1);
}

#[tokio::test]
async fn deleting_item_cascades_to_lends_and_notes() {
    let (engine, user, item) = setup("cascade.wal").await;
    let mut l = lend(item, user);
    l.out = Some(at(2020, 1, 1));
    let lend_id = l.id;
    engine.create_lend(l).await.unwrap();
    engine
        .add_note(Ulid::new(), NoteSubject::Item(item), user, "scratched".into(), false)
        .await
        .unwrap();
    engine
        .add_note(Ulid::new(), NoteSubject::Lend(lend_id), user, "late".into(), true)
        .await
        .unwrap();

    engine.delete_item(item).await.unwrap();
    assert!(engine.list_items().await.is_empty());
    assert!(matches!(engine.get_lend(lend_id).await, Err(EngineError::NotFound(_))));
    assert!(engine.list_notes(NoteSubject::Item(item)).is_empty());
    assert!(engine.list_notes(NoteSubject::Lend(lend_id)).is_empty());
    // The user no longer has lends but still authored nothing left behind.
    assert_ok!(engine.delete_user(user).await);
}

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let user = Ulid::new();
    let item = Ulid::new();
    let lend_id;
    {
        let engine = Engine::new(path.clone(), EndpointOrder::Strict).unwrap();
        engine.create_user(user, "Linus".into()).await.unwrap();
        engine.create_item(item, "Drill".into(), String::new(), true).await.unwrap();
        let mut l = lend(item, user);
        l.due_out = Some(date(2021, 6, 1));
        l.due_back = Some(date(2021, 6, 3));
        lend_id = l.id;
        engine.create_lend(l).await.unwrap();
        engine
            .update_lend(
                lend_id,
                LendChanges {
                    out: Some(Some(at(2021, 6, 1))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine
            .update_item(
                item,
                ItemChanges {
                    name: Some("Drill (cordless)".into()),
                    description: Some("18V".into()),
                    is_lendable: Some(false),
                },
            )
            .await
            .unwrap();
        engine
            .add_note(Ulid::new(), NoteSubject::User(user), user, "reliable".into(), false)
            .await
            .unwrap();
    }

    let engine = Engine::new(path, EndpointOrder::Strict).unwrap();
    let items = engine.list_items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "Drill (cordless)");
    assert!(!items[0].is_lendable);
    let stored = engine.get_lend(lend_id).await.unwrap();
    assert_eq!(stored.due_out, Some(date(2021, 6, 1)));
    assert_eq!(stored.out, Some(at(2021, 6, 1)));
    assert_eq!(engine.list_notes(NoteSubject::User(user)).len(), 1);

    // Conflict checks see the replayed lend.
    let mut clash = lend(item, user);
    clash.due_out = Some(date(2021, 6, 2));
    assert_eq!(
        invalid_kinds(engine.create_lend(clash).await),
        vec![ViolationKind::ReservationConflict]
    );
}

#[tokio::test]
async fn replay_honours_deletes() {
    let path = test_wal_path("replay_deletes.wal");
    let user = Ulid::new();
    let item = Ulid::new();
    {
        let engine = Engine::new(path.clone(), EndpointOrder::Strict).unwrap();
        engine.create_user(user, "Barbara".into()).await.unwrap();
        engine.create_item(item, "Scope".into(), String::new(), true).await.unwrap();
        let mut l = lend(item, user);
        l.out = Some(at(2020, 1, 1));
        engine.create_lend(l).await.unwrap();
        engine.delete_item(item).await.unwrap();
    }
    let engine = Engine::new(path, EndpointOrder::Strict).unwrap();
    assert!(engine.list_items().await.is_empty());
    assert!(engine.list_lends(None).await.unwrap().is_empty());
    assert_ok!(engine.delete_user(user).await);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let user = Ulid::new();
    let item = Ulid::new();
    let keep;
    {
        let engine = Engine::new(path.clone(), EndpointOrder::Strict).unwrap();
        engine.create_user(user, "Edsger".into()).await.unwrap();
        engine.create_item(item, "Laptop".into(), String::new(), true).await.unwrap();
        for day in 1..=5 {
            let mut l = lend(item, user);
            l.out = Some(at(2020, 1, day * 2));
            l.back = Some(at(2020, 1, day * 2) + chrono::Duration::hours(1));
            let id = l.id;
            engine.create_lend(l).await.unwrap();
            engine.delete_lend(id).await.unwrap();
        }
        let mut l = lend(item, user);
        l.out = Some(at(2020, 2, 1));
        keep = l.id;
        engine.create_lend(l).await.unwrap();
        engine
            .add_note(Ulid::new(), NoteSubject::Lend(keep), user, "charger included".into(), false)
            .await
            .unwrap();

        assert!(engine.wal_appends_since_compact().await >= 14);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = Engine::new(path, EndpointOrder::Strict).unwrap();
    let lends = engine.list_lends(Some(item)).await.unwrap();
    assert_eq!(lends.len(), 1);
    assert_eq!(lends[0].id, keep);
    assert_eq!(engine.list_notes(NoteSubject::Lend(keep)).len(), 1);
    assert_eq!(engine.list_users().len(), 1);
}

// ── Races with deletes and compaction ────────────────────────

#[tokio::test]
async fn lend_writes_queued_behind_item_delete_fail() {
    let (engine, user, item) = setup("delete_race.wal").await;
    let engine = Arc::new(engine);
    let mut first = lend(item, user);
    first.due_out = Some(date(2021, 1, 1));
    first.due_back = Some(date(2021, 1, 3));
    let first_id = first.id;
    engine.create_lend(first).await.unwrap();
    let mut second = lend(item, user);
    second.due_out = Some(date(2021, 2, 1));
    second.due_back = Some(date(2021, 2, 3));
    let second_id = second.id;
    engine.create_lend(second).await.unwrap();

    let handle = engine.get_item(&item).unwrap();
    let held = handle.write().await;
    let pause = || tokio::time::sleep(std::time::Duration::from_millis(20));

    let deleting = tokio::spawn({
        let engine = engine.clone();
        async move { engine.delete_item(item).await }
    });
    pause().await;
    let updating = tokio::spawn({
        let engine = engine.clone();
        let changes = LendChanges {
            due_back: Some(Some(date(2021, 1, 5))),
            ..Default::default()
        };
        async move { engine.update_lend(first_id, changes).await }
    });
    pause().await;
    let removing = tokio::spawn({
        let engine = engine.clone();
        async move { engine.delete_lend(second_id).await }
    });
    pause().await;
    let noting = tokio::spawn({
        let engine = engine.clone();
        let subject = NoteSubject::Lend(first_id);
        async move { engine.add_note(Ulid::new(), subject, user, "late".into(), false).await }
    });
    pause().await;
    drop(held);

    assert_ok!(deleting.await.unwrap());
    assert!(matches!(updating.await.unwrap(), Err(EngineError::NotFound(_))));
    assert!(matches!(removing.await.unwrap(), Err(EngineError::NotFound(_))));
    assert!(matches!(noting.await.unwrap(), Err(EngineError::NotFound(_))));

    assert!(engine.list_lends(None).await.unwrap().is_empty());
    assert!(engine.list_notes(NoteSubject::Lend(first_id)).is_empty());
    assert_ok!(engine.delete_user(user).await);
}

#[tokio::test]
async fn appends_during_compaction_survive_restart() {
    let path = test_wal_path("compact_race.wal");
    let item = Ulid::new();
    let late = Ulid::new();
    {
        let engine = Arc::new(Engine::new(path.clone(), EndpointOrder::Strict).unwrap());
        engine
            .create_item(item, "Lens".into(), String::new(), true)
            .await
            .unwrap();

        // Stall the compaction on the item after it has read the users.
        let handle = engine.get_item(&item).unwrap();
        let held = handle.write().await;
        let compacting = tokio::spawn({
            let engine = engine.clone();
            async move { engine.compact_wal().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        engine.create_user(late, "Late".into()).await.unwrap();
        drop(held);
        assert_ok!(compacting.await.unwrap());
        assert_eq!(engine.list_users().len(), 1);
    }

    let engine = Engine::new(path, EndpointOrder::Strict).unwrap();
    let users = engine.list_users();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, late);
    assert_eq!(engine.list_items().await.len(), 1);
}

#[tokio::test]
async fn lend_writes_during_compaction_survive_restart() {
    let path = test_wal_path("compact_race_lends.wal");
    let user = Ulid::new();
    let (first, second) = {
        let (a, b) = (Ulid::new(), Ulid::new());
        (a.min(b), a.max(b))
    };
    let kept = {
        let engine = Arc::new(Engine::new(path.clone(), EndpointOrder::Strict).unwrap());
        engine.create_user(user, "Ada".into()).await.unwrap();
        engine.create_item(first, "Lens".into(), String::new(), true).await.unwrap();
        engine.create_item(second, "Flash".into(), String::new(), true).await.unwrap();
        let mut kept = lend(second, user);
        kept.out = Some(at(2020, 1, 1));
        engine.create_lend(kept.clone()).await.unwrap();

        // Items are snapshotted in id order, so this parks the compaction
        // before it reaches `second`.
        let handle = engine.get_item(&first).unwrap();
        let held = handle.write().await;
        let compacting = tokio::spawn({
            let engine = engine.clone();
            async move { engine.compact_wal().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let changes = LendChanges {
            back: Some(Some(at(2020, 1, 2))),
            ..Default::default()
        };
        kept = engine.update_lend(kept.id, changes).await.unwrap();
        let mut later = lend(second, user);
        later.out = Some(at(2020, 3, 1));
        engine.create_lend(later).await.unwrap();
        drop(held);
        assert_ok!(compacting.await.unwrap());
        kept
    };

    let engine = Engine::new(path, EndpointOrder::Strict).unwrap();
    assert_eq!(engine.get_lend(kept.id).await.unwrap(), kept);
    assert_eq!(engine.list_lends(Some(second)).await.unwrap().len(), 2);
    assert!(engine.list_lends(Some(first)).await.unwrap().is_empty());
}

// ── Tags ─────────────────────────────────────────────────────

#[tokio::test]
async fn tags_attach_to_items_and_filter_them() {
    let (engine, _, item) = setup("tags.wal").await;
    let bare = Ulid::new();
    engine
        .create_item(bare, "Cable".into(), String::new(), true)
        .await
        .unwrap();
    let tag = Ulid::new();
    engine
        .create_tag(tag, "Camera".into(), "anything with a lens".into())
        .await
        .unwrap();

    assert_ok!(engine.tag_item(item, tag).await);
    assert!(matches!(
        engine.tag_item(item, tag).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.tag_item(item, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));

    let tagged = engine.list_items_tagged("camera").await;
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].id, item);
    assert!(engine.list_items_tagged("nope").await.is_empty());
    assert_eq!(
        engine.list_item_tags(None, Some(tag)).await.unwrap(),
        vec![ItemTag { item_id: item, tag_id: tag }]
    );

    assert_ok!(engine.untag_item(item, tag).await);
    assert!(matches!(
        engine.untag_item(item, tag).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.list_items_tagged("Camera").await.is_empty());
}

#[tokio::test]
async fn tag_names_are_unique_and_bounded() {
    let engine = Engine::new(test_wal_path("tag_names.wal"), EndpointOrder::Strict).unwrap();
    let laptop = Ulid::new();
    engine
        .create_tag(laptop, "laptop".into(), String::new())
        .await
        .unwrap();

    let r = engine.create_tag(Ulid::new(), "LAPTOP".into(), String::new()).await;
    assert!(matches!(r, Err(EngineError::NameTaken(_))));
    let r = engine.create_tag(Ulid::new(), "x".repeat(31), String::new()).await;
    assert!(matches!(r, Err(EngineError::LimitExceeded(_))));
    let r = engine.create_tag(Ulid::new(), " ".into(), String::new()).await;
    assert!(matches!(r, Err(EngineError::BadField(_))));

    let audio = Ulid::new();
    engine.create_tag(audio, "audio".into(), String::new()).await.unwrap();
    let rename = TagChanges {
        name: Some("Laptop".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_tag(audio, rename).await,
        Err(EngineError::NameTaken(_))
    ));
    // Renaming a tag to itself in another case is fine.
    let recase = TagChanges {
        name: Some("Laptop".into()),
        description: Some("portable computers".into()),
    };
    let updated = engine.update_tag(laptop, recase).await.unwrap();
    assert_eq!(updated.name, "Laptop");
    let names: Vec<String> = engine.list_tags().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["Laptop", "audio"]);
}

#[tokio::test]
async fn deleting_tag_untags_every_item() {
    let (engine, _, item) = setup("tag_delete.wal").await;
    let other = Ulid::new();
    engine
        .create_item(other, "Mic".into(), String::new(), true)
        .await
        .unwrap();
    let tag = Ulid::new();
    engine.create_tag(tag, "loaner".into(), String::new()).await.unwrap();
    engine.tag_item(item, tag).await.unwrap();
    engine.tag_item(other, tag).await.unwrap();

    engine.delete_tag(tag).await.unwrap();
    assert!(engine.list_tags().is_empty());
    assert!(engine.list_item_tags(None, None).await.unwrap().is_empty());
    assert!(matches!(engine.delete_tag(tag).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn tags_survive_compaction_and_restart() {
    let path = test_wal_path("tags_restart.wal");
    let item = Ulid::new();
    let kept = Ulid::new();
    let dropped = Ulid::new();
    {
        let engine = Engine::new(path.clone(), EndpointOrder::Strict).unwrap();
        engine.create_item(item, "Drone".into(), String::new(), true).await.unwrap();
        engine.create_tag(kept, "aerial".into(), String::new()).await.unwrap();
        engine.create_tag(dropped, "fragile".into(), String::new()).await.unwrap();
        engine.tag_item(item, kept).await.unwrap();
        engine.tag_item(item, dropped).await.unwrap();
        engine.delete_tag(dropped).await.unwrap();
        engine.compact_wal().await.unwrap();
    }
    {
        let engine = Engine::new(path.clone(), EndpointOrder::Strict).unwrap();
        assert_eq!(
            engine.list_item_tags(Some(item), None).await.unwrap(),
            vec![ItemTag { item_id: item, tag_id: kept }]
        );
        engine.untag_item(item, kept).await.unwrap();
    }
    let engine = Engine::new(path, EndpointOrder::Strict).unwrap();
    assert!(engine.list_item_tags(Some(item), None).await.unwrap().is_empty());
    assert_eq!(engine.list_tags().len(), 1);
}
