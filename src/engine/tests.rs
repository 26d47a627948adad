use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use super::*;
use crate::booking::{BookingDesk, BookingError, GuestForm};
use crate::mailer::{
    DeliveryError, DeliveryStatus, LogTransport, Mailer, RenderedMessage, TemplateSet, Transport,
};
use crate::model::StayRange;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("innkeep_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn range(start: &str, end: &str) -> StayRange {
    StayRange::new(start.parse().unwrap(), end.parse().unwrap())
}

fn guest() -> GuestForm {
    GuestForm {
        first_name: "John".into(),
        last_name: "Smith".into(),
        email: "John@Smith.com".into(),
        phone: "555-0100".into(),
    }
}

fn details() -> GuestDetails {
    GuestDetails {
        first_name: "john".into(),
        last_name: "smith".into(),
        email: "john@smith.com".into(),
        phone: "555-0100".into(),
    }
}

fn make_desk(engine: Arc<Engine>) -> BookingDesk {
    let mailer = Mailer::start(2, TemplateSet::builtin(), Arc::new(LogTransport));
    BookingDesk::new(engine, mailer, "stay@innkeep.local".into())
}

async fn engine_with_room(wal: &str, name: &str) -> (Arc<Engine>, Ulid) {
    let engine = Arc::new(Engine::new(test_wal_path(wal)).unwrap());
    let room_id = Ulid::new();
    engine.create_room(room_id, name).await.unwrap();
    (engine, room_id)
}

#[tokio::test]
async fn adjacent_stays_do_not_block() {
    let (engine, room_id) = engine_with_room("adjacency.wal", "Generals Quarters").await;
    engine
        .add_restriction(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"))
        .await
        .unwrap();

    // Checkout day is free for a new check-in.
    assert!(engine
        .is_available(room_id, range("2024-06-15", "2024-06-20"))
        .await
        .unwrap());
    // One night of overlap blocks.
    assert!(!engine
        .is_available(room_id, range("2024-06-14", "2024-06-16"))
        .await
        .unwrap());
    // Ending on the restriction's first day is also free.
    assert!(engine
        .is_available(room_id, range("2024-06-05", "2024-06-10"))
        .await
        .unwrap());
}

#[tokio::test]
async fn is_available_unknown_room_is_an_error() {
    let engine = Arc::new(Engine::new(test_wal_path("unknown_room.wal")).unwrap());
    let err = engine
        .is_available(Ulid::new(), range("2024-06-10", "2024-06-15"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn search_returns_exactly_the_unblocked_rooms() {
    let engine = Arc::new(Engine::new(test_wal_path("search.wal")).unwrap());
    let blocked = Ulid::new();
    let free_a = Ulid::new();
    let free_b = Ulid::new();
    engine.create_room(blocked, "Colonels Suite").await.unwrap();
    engine.create_room(free_a, "Generals Quarters").await.unwrap();
    engine.create_room(free_b, "Majors Suite").await.unwrap();

    engine
        .add_restriction(Ulid::new(), blocked, range("2024-06-12", "2024-06-18"))
        .await
        .unwrap();

    let stay = range("2024-06-10", "2024-06-15");
    let rooms = engine.find_available_rooms(stay).await.unwrap();
    let names: Vec<_> = rooms.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["generals quarters", "majors suite"]);

    // Every returned room individually passes the per-room check.
    for room in &rooms {
        assert!(engine.is_available(room.id, stay).await.unwrap());
    }
    assert!(!engine.is_available(blocked, stay).await.unwrap());
}

#[tokio::test]
async fn search_with_no_restrictions_returns_whole_catalog() {
    let engine = Arc::new(Engine::new(test_wal_path("search_empty.wal")).unwrap());
    for name in ["alpha", "bravo", "charlie"] {
        engine.create_room(Ulid::new(), name).await.unwrap();
    }
    let rooms = engine
        .find_available_rooms(range("2024-06-10", "2024-06-15"))
        .await
        .unwrap();
    assert_eq!(rooms.len(), 3);
}

#[tokio::test]
async fn commit_writes_reservation_and_linked_restriction() {
    let (engine, room_id) = engine_with_room("commit_pair.wal", "Generals Quarters").await;
    let desk = make_desk(engine.clone());

    let receipt = desk
        .book_room(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"), &guest())
        .await
        .unwrap();

    let view = engine.get_reservation(receipt.reservation_id).await.unwrap();
    assert_eq!(view.reservation.room_id, room_id);
    assert_eq!(view.room_name, "generals quarters");
    // Name and email are normalized on write.
    assert_eq!(view.reservation.first_name, "john");
    assert_eq!(view.reservation.email, "john@smith.com");
    assert!(!view.reservation.processed);

    let restrictions = engine
        .restrictions_for_room(room_id, range("2024-06-01", "2024-07-01"))
        .await
        .unwrap();
    assert_eq!(restrictions.len(), 1);
    assert_eq!(restrictions[0].id, receipt.restriction_id);
    assert_eq!(restrictions[0].reservation_id, Some(receipt.reservation_id));
    assert_eq!(restrictions[0].stay, range("2024-06-10", "2024-06-15"));
}

#[tokio::test]
async fn concurrent_commits_exactly_one_wins() {
    let (engine, room_id) = engine_with_room("race.wal", "Generals Quarters").await;
    let desk = Arc::new(make_desk(engine.clone()));

    let stay = range("2024-06-10", "2024-06-15");
    let g = guest();
    let a = desk.book_room(Ulid::new(), room_id, stay, &g);
    let b = desk.book_room(Ulid::new(), room_id, stay, &g);
    let (ra, rb) = tokio::join!(a, b);

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one commit must win: {ra:?} {rb:?}");
    let loser = if ra.is_err() { ra } else { rb };
    assert!(matches!(loser, Err(BookingError::Conflict)));

    // The room holds exactly one restriction afterwards.
    let restrictions = engine
        .restrictions_for_room(room_id, range("2024-06-01", "2024-07-01"))
        .await
        .unwrap();
    assert_eq!(restrictions.len(), 1);
}

#[tokio::test]
async fn invalid_form_writes_nothing() {
    let (engine, room_id) = engine_with_room("validation.wal", "Generals Quarters").await;
    let desk = make_desk(engine.clone());

    let mut form = guest();
    form.last_name = String::new();
    let err = desk
        .book_room(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"), &form)
        .await
        .unwrap_err();
    match err {
        BookingError::Input(errors) => {
            assert!(errors.contains_key("last_name"));
        }
        other => panic!("expected Input error, got {other:?}"),
    }

    assert!(engine.list_reservations().await.is_empty());
    assert!(engine
        .restrictions_for_room(room_id, range("2024-06-01", "2024-07-01"))
        .await
        .unwrap()
        .is_empty());
}

struct FailingTransport;

#[async_trait::async_trait]
impl Transport for FailingTransport {
    async fn deliver(&self, _message: &RenderedMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::Transport("smtp unreachable".into()))
    }
}

#[tokio::test]
async fn notification_failure_never_fails_the_booking() {
    let (engine, room_id) = engine_with_room("notify_fail.wal", "Generals Quarters").await;
    let mailer = Mailer::start(2, TemplateSet::builtin(), Arc::new(FailingTransport));
    let desk = BookingDesk::new(engine.clone(), mailer.clone(), "stay@innkeep.local".into());

    let receipt = desk
        .book_room(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"), &guest())
        .await
        .expect("booking must commit even when mail delivery fails");

    // The reservation is durable regardless of the mail outcome.
    assert!(engine.get_reservation(receipt.reservation_id).await.is_some());

    // The delivery status settles to failed.
    for _ in 0..50 {
        if mailer.status(&receipt.reservation_id) == Some(DeliveryStatus::Failed) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("delivery status never settled");
}

#[tokio::test]
async fn cancel_frees_the_dates() {
    let (engine, room_id) = engine_with_room("cancel.wal", "Generals Quarters").await;
    let desk = make_desk(engine.clone());

    let stay = range("2024-06-10", "2024-06-15");
    let receipt = desk.book_room(Ulid::new(), room_id, stay, &guest()).await.unwrap();
    assert!(!engine.is_available(room_id, stay).await.unwrap());

    engine.cancel_reservation(receipt.reservation_id).await.unwrap();

    assert!(engine.is_available(room_id, stay).await.unwrap());
    assert!(engine.get_reservation(receipt.reservation_id).await.is_none());
    assert!(engine
        .restrictions_for_room(room_id, range("2024-06-01", "2024-07-01"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn booking_restriction_refuses_direct_removal() {
    let (engine, room_id) = engine_with_room("linked.wal", "Generals Quarters").await;
    let desk = make_desk(engine.clone());

    let receipt = desk
        .book_room(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"), &guest())
        .await
        .unwrap();

    let err = engine.remove_restriction(receipt.restriction_id).await.unwrap_err();
    assert!(matches!(err, EngineError::BookingLinked(_)));

    // A standalone block removes fine.
    let block_id = Ulid::new();
    engine
        .add_restriction(block_id, room_id, range("2024-07-01", "2024-07-05"))
        .await
        .unwrap();
    engine.remove_restriction(block_id).await.unwrap();
}

#[tokio::test]
async fn processed_flag_filters_new_reservations() {
    let (engine, room_id) = engine_with_room("processed.wal", "Generals Quarters").await;
    let desk = make_desk(engine.clone());

    let first = desk
        .book_room(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"), &guest())
        .await
        .unwrap();
    let second = desk
        .book_room(Ulid::new(), room_id, range("2024-07-10", "2024-07-15"), &guest())
        .await
        .unwrap();

    assert_eq!(engine.new_reservations().await.len(), 2);

    engine.set_processed(first.reservation_id, true).await.unwrap();

    let fresh = engine.new_reservations().await;
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].reservation.id, second.reservation_id);
    assert_eq!(engine.list_reservations().await.len(), 2);
}

#[tokio::test]
async fn update_guest_rewrites_contact_fields() {
    let (engine, room_id) = engine_with_room("update_guest.wal", "Generals Quarters").await;
    let desk = make_desk(engine.clone());

    let receipt = desk
        .book_room(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"), &guest())
        .await
        .unwrap();

    engine
        .update_guest(
            receipt.reservation_id,
            &GuestDetails {
                first_name: "Jane".into(),
                last_name: "Smith".into(),
                email: "Jane@Smith.com".into(),
                phone: "555-0101".into(),
            },
        )
        .await
        .unwrap();

    let view = engine.get_reservation(receipt.reservation_id).await.unwrap();
    assert_eq!(view.reservation.first_name, "jane");
    assert_eq!(view.reservation.email, "jane@smith.com");
    assert_eq!(view.reservation.phone, "555-0101");
}

#[tokio::test]
async fn delete_never_orphans_a_racing_booking() {
    // A delete and a commit race on the same room; whichever order they
    // serialize in, at most one wins and no reservation outlives its room.
    for i in 0..25 {
        let engine = Arc::new(Engine::new(test_wal_path(&format!("delete_race_{i}.wal"))).unwrap());
        let room_id = Ulid::new();
        engine.create_room(room_id, "Corner Room").await.unwrap();

        let reservation_id = Ulid::new();
        let stay = range("2024-06-10", "2024-06-15");
        let e1 = engine.clone();
        let e2 = engine.clone();
        let commit = tokio::spawn(async move {
            e1.commit_booking(reservation_id, Ulid::new(), room_id, stay, &details())
                .await
        });
        let delete = tokio::spawn(async move { e2.delete_room(room_id).await });
        let (commit, delete) = (commit.await.unwrap(), delete.await.unwrap());

        assert!(
            !(commit.is_ok() && delete.is_ok()),
            "iteration {i}: both commit and delete succeeded"
        );
        if commit.is_ok() {
            assert!(engine.get_room(&room_id).is_some(), "iteration {i}");
            assert!(engine.get_reservation(reservation_id).await.is_some());
        } else {
            assert!(
                engine.get_reservation(reservation_id).await.is_none(),
                "iteration {i}: orphan reservation survived its room"
            );
        }
    }
}

#[tokio::test]
async fn duplicate_room_id_keeps_the_first_create() {
    let engine = Arc::new(Engine::new(test_wal_path("dup_room.wal")).unwrap());
    let id = Ulid::new();

    let a = engine.create_room(id, "First Name");
    let b = engine.create_room(id, "Second Name");
    let (ra, rb) = tokio::join!(a, b);

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one create must win: {ra:?} {rb:?}");
    let loser = if ra.is_err() { ra } else { rb };
    assert!(matches!(loser, Err(EngineError::AlreadyExists(_))));
    assert_eq!(engine.rooms.len(), 1);
}

#[tokio::test]
async fn duplicate_reservation_id_is_rejected() {
    let (engine, room_id) = engine_with_room("dup_reservation.wal", "Generals Quarters").await;
    let reservation_id = Ulid::new();
    let g = details();

    // Disjoint stays, so only the id collision can reject one of them.
    let a = engine.commit_booking(
        reservation_id,
        Ulid::new(),
        room_id,
        range("2024-06-10", "2024-06-15"),
        &g,
    );
    let b = engine.commit_booking(
        reservation_id,
        Ulid::new(),
        room_id,
        range("2024-07-10", "2024-07-15"),
        &g,
    );
    let (ra, rb) = tokio::join!(a, b);

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one commit must win: {ra:?} {rb:?}");
    let loser = if ra.is_err() { ra } else { rb };
    assert!(matches!(loser, Err(EngineError::AlreadyExists(_))));

    let restrictions = engine
        .restrictions_for_room(room_id, range("2024-06-01", "2024-08-01"))
        .await
        .unwrap();
    assert_eq!(restrictions.len(), 1);
}

#[tokio::test]
async fn delete_room_refuses_while_restricted() {
    let (engine, room_id) = engine_with_room("room_in_use.wal", "Generals Quarters").await;
    engine
        .add_restriction(Ulid::new(), room_id, range("2024-06-10", "2024-06-15"))
        .await
        .unwrap();

    let err = engine.delete_room(room_id).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomInUse(_)));
}

#[tokio::test]
async fn duplicate_room_name_lookup_and_rename() {
    let (engine, room_id) = engine_with_room("rename.wal", "Generals Quarters").await;

    // Lookup is case-insensitive because names are stored lowercased.
    assert!(engine.find_room_by_name("GENERALS QUARTERS").await.is_some());

    engine.rename_room(room_id, "Majors Suite").await.unwrap();
    assert!(engine.find_room_by_name("generals quarters").await.is_none());
    assert_eq!(
        engine.find_room_by_name("majors suite").await.unwrap().id,
        room_id
    );
}

#[tokio::test]
async fn replay_restores_rooms_reservations_and_blocks() {
    let path = test_wal_path("replay.wal");
    let room_id = Ulid::new();
    let reservation_id = Ulid::new();
    let stay = range("2024-06-10", "2024-06-15");

    {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        engine.create_room(room_id, "Generals Quarters").await.unwrap();
        let desk = make_desk(engine.clone());
        desk.book_room(reservation_id, room_id, stay, &guest()).await.unwrap();
        engine
            .add_restriction(Ulid::new(), room_id, range("2024-08-01", "2024-08-05"))
            .await
            .unwrap();
    }

    let revived = Arc::new(Engine::new(path).unwrap());
    assert!(!revived.is_available(room_id, stay).await.unwrap());
    assert!(!revived
        .is_available(room_id, range("2024-08-02", "2024-08-03"))
        .await
        .unwrap());
    assert!(revived
        .is_available(room_id, range("2024-06-20", "2024-06-25"))
        .await
        .unwrap());

    let view = revived.get_reservation(reservation_id).await.unwrap();
    assert_eq!(view.reservation.stay, stay);
    assert_eq!(view.room_name, "generals quarters");
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let room_id = Ulid::new();
    let reservation_id = Ulid::new();
    let stay = range("2024-06-10", "2024-06-15");

    {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        engine.create_room(room_id, "Generals Quarters").await.unwrap();
        let desk = make_desk(engine.clone());
        desk.book_room(reservation_id, room_id, stay, &guest()).await.unwrap();

        // Churn some blocks so compaction has something to shed.
        for _ in 0..5 {
            let id = Ulid::new();
            engine
                .add_restriction(id, room_id, range("2024-09-01", "2024-09-05"))
                .await
                .unwrap();
            engine.remove_restriction(id).await.unwrap();
        }
        engine.compact_wal().await.unwrap();
    }

    let revived = Arc::new(Engine::new(path).unwrap());
    assert!(!revived.is_available(room_id, stay).await.unwrap());
    let view = revived.get_reservation(reservation_id).await.unwrap();
    assert_eq!(view.reservation.id, reservation_id);
    let restrictions = revived
        .restrictions_for_room(room_id, range("2024-01-01", "2025-01-01"))
        .await
        .unwrap();
    assert_eq!(restrictions.len(), 1);
}
