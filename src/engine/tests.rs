use super::*;
use super::conflict::{check_no_conflict, validate_span};
use crate::clock::FixedClock;
use crate::limits::*;
use crate::notify::{ChangeFilter, FeedEvent};
use chrono::NaiveDate;

fn t(s: &str) -> TimeOfDay {
    s.parse().unwrap()
}

fn span(a: &str, b: &str) -> Span {
    Span::new(t(a), t(b))
}

fn june(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("courtside_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: PathBuf) -> Engine {
    let clock = Arc::new(FixedClock::at(june(10), 12, 0).unwrap());
    Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap()
}

async fn with_court(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine.create_court(id, name.into(), Discipline::Tennis).await.unwrap();
    id
}

fn row(user: UserId, court: Ulid, date: NaiveDate, s: Span) -> NewReservation {
    NewReservation { user_id: user, court_id: court, date, span: s }
}

// ── Pure checks ──────────────────────────────────────────

#[test]
fn validate_span_bounds() {
    assert!(validate_span(&span("16:00", "17:30")).is_ok());
    assert!(validate_span(&span("16:00", "19:00")).is_ok());
    let inverted = Span { start: t("17:30"), end: t("16:00") };
    assert!(matches!(validate_span(&inverted), Err(StoreError::InvalidSpan(_))));
    let too_long = span("08:30", "11:31");
    assert_eq!(too_long.duration_minutes(), MAX_BOOKING_MINUTES + 1);
    assert!(matches!(validate_span(&too_long), Err(StoreError::LimitExceeded(_))));
}

#[test]
fn conflict_reports_blocking_row() {
    let key = CourtDay::new(Ulid::new(), june(10));
    let mut sheet = DaySheet::new(key);
    let blocker = Reservation {
        id: Ulid::new(),
        user_id: Ulid::new(),
        court_id: key.court_id,
        date: key.date,
        span: span("13:00", "14:30"),
        status: ReservationStatus::Active,
        created_at: Default::default(),
    };
    sheet.insert(blocker.clone());
    match check_no_conflict(&sheet, &span("14:00", "15:30")) {
        Err(StoreError::Conflict(id)) => assert_eq!(id, blocker.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(check_no_conflict(&sheet, &span("14:30", "16:00")).is_ok());
}

// ── Async engine tests ───────────────────────────────────

#[tokio::test]
async fn create_and_list_courts() {
    let engine = open(test_wal_path("courts.wal"));
    let b = with_court(&engine, "Court B").await;
    let a = with_court(&engine, "Court A").await;

    let names: Vec<String> = engine.list_courts().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["Court A", "Court B"]);
    assert_eq!(engine.get_court(&a).unwrap().name, "Court A");
    assert!(matches!(
        engine.create_court(b, "dup".into(), Discipline::Padel).await,
        Err(StoreError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.create_court(Ulid::new(), String::new(), Discipline::Padel).await,
        Err(StoreError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn insert_and_query_reservations() {
    let engine = open(test_wal_path("insert_query.wal"));
    let court = with_court(&engine, "Court 1").await;
    let user = Ulid::new();

    let r = engine
        .insert_reservation(row(user, court, june(10), span("16:00", "19:00")))
        .await
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Active);
    assert_eq!(r.created_at, engine.clock.now());

    let active = engine.active_reservations(court, june(10)).await;
    assert_eq!(active, vec![r.clone()]);
    assert!(engine.active_reservations(court, june(11)).await.is_empty());
    assert_eq!(engine.get_reservation(&r.id).await, Some(r.clone()));
    assert_eq!(engine.user_reservations(user).await, vec![r]);
    assert!(engine.user_reservations(Ulid::new()).await.is_empty());
}

#[tokio::test]
async fn insert_unknown_court_fails() {
    let engine = open(test_wal_path("unknown_court.wal"));
    let result = engine
        .insert_reservation(row(Ulid::new(), Ulid::new(), june(10), span("16:00", "17:30")))
        .await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn overlapping_insert_rejected() {
    let engine = open(test_wal_path("overlap.wal"));
    let court = with_court(&engine, "Court 1").await;
    let first = engine
        .insert_reservation(row(Ulid::new(), court, june(10), span("13:00", "14:30")))
        .await
        .unwrap();

    let err = engine
        .insert_reservation(row(Ulid::new(), court, june(10), span("13:00", "16:00")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(id) if id == first.id));

    // adjacent is fine, as is another court or date
    engine
        .insert_reservation(row(Ulid::new(), court, june(10), span("14:30", "16:00")))
        .await
        .unwrap();
    let other = with_court(&engine, "Court 2").await;
    engine
        .insert_reservation(row(Ulid::new(), other, june(10), span("13:00", "14:30")))
        .await
        .unwrap();
    engine
        .insert_reservation(row(Ulid::new(), court, june(11), span("13:00", "14:30")))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_inserts_exactly_one_wins() {
    let engine = Arc::new(open(test_wal_path("race.wal")));
    let court = with_court(&engine, "Court 1").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .insert_reservation(row(Ulid::new(), court, june(10), span("19:00", "20:30")))
                .await
        }));
    }
    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(StoreError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(engine.active_reservations(court, june(10)).await.len(), 1);
}

#[tokio::test]
async fn cancellation_frees_the_span() {
    let engine = open(test_wal_path("cancel.wal"));
    let court = with_court(&engine, "Court 1").await;
    let user = Ulid::new();
    let r = engine
        .insert_reservation(row(user, court, june(10), span("16:00", "17:30")))
        .await
        .unwrap();

    let cancelled = engine
        .update_reservation_status(r.id, user, ReservationStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert!(engine.active_reservations(court, june(10)).await.is_empty());
    // still visible in the member's history
    assert_eq!(engine.user_reservations(user).await[0].status, ReservationStatus::Cancelled);

    engine
        .insert_reservation(row(Ulid::new(), court, june(10), span("16:00", "17:30")))
        .await
        .unwrap();
}

#[tokio::test]
async fn status_update_checks_owner_and_transition() {
    let engine = open(test_wal_path("status_rules.wal"));
    let court = with_court(&engine, "Court 1").await;
    let owner = Ulid::new();
    let r = engine
        .insert_reservation(row(owner, court, june(10), span("10:00", "11:30")))
        .await
        .unwrap();

    let stranger = engine
        .update_reservation_status(r.id, Ulid::new(), ReservationStatus::Cancelled)
        .await;
    assert!(matches!(stranger, Err(StoreError::NotFound(_))));
    assert!(matches!(
        engine.update_reservation_status(Ulid::new(), owner, ReservationStatus::Cancelled).await,
        Err(StoreError::NotFound(_))
    ));

    // same status twice is a no-op
    let same = engine
        .update_reservation_status(r.id, owner, ReservationStatus::Active)
        .await
        .unwrap();
    assert_eq!(same.status, ReservationStatus::Active);

    engine
        .update_reservation_status(r.id, owner, ReservationStatus::Cancelled)
        .await
        .unwrap();
    assert!(matches!(
        engine.update_reservation_status(r.id, owner, ReservationStatus::Active).await,
        Err(StoreError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn all_active_spans_every_court_and_date() {
    let engine = open(test_wal_path("all_active.wal"));
    let c1 = with_court(&engine, "Court 1").await;
    let c2 = with_court(&engine, "Court 2").await;
    let user = Ulid::new();
    let late = engine.insert_reservation(row(user, c1, june(11), span("08:30", "10:00"))).await.unwrap();
    let early = engine.insert_reservation(row(user, c2, june(10), span("16:00", "17:30"))).await.unwrap();
    let gone = engine.insert_reservation(row(user, c1, june(10), span("08:30", "10:00"))).await.unwrap();
    engine
        .update_reservation_status(gone.id, user, ReservationStatus::Cancelled)
        .await
        .unwrap();

    let ids: Vec<Ulid> = engine.all_active_reservations().await.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
}

#[tokio::test]
async fn profile_is_provisioned_once() {
    let engine = open(test_wal_path("profile.wal"));
    let user = Ulid::new();
    let defaults = ProfileDefaults { email: "ana@club.test".into(), full_name: Some("Ana".into()) };

    let first = engine.get_or_create_profile(user, defaults.clone()).await.unwrap();
    assert_eq!(first.email, "ana@club.test");
    assert_eq!(first.street, "");
    assert!(!first.club_card_verified);

    let again = engine
        .get_or_create_profile(user, ProfileDefaults { email: "other@club.test".into(), full_name: None })
        .await
        .unwrap();
    assert_eq!(again, first);
}

#[tokio::test]
async fn changes_reach_subscribers() {
    let engine = open(test_wal_path("feed.wal"));
    let court = with_court(&engine, "Court 1").await;
    let user = Ulid::new();
    let mut day = engine.notify.subscribe(ChangeFilter::CourtDay(CourtDay::new(court, june(10))));
    let mut all = engine.notify.subscribe(ChangeFilter::StatusActive);

    let r = engine.insert_reservation(row(user, court, june(10), span("16:00", "17:30"))).await.unwrap();
    match day.recv().await {
        Some(FeedEvent::Changed(c)) => {
            assert_eq!(c.op, ChangeOp::Insert);
            assert_eq!(c.reservation_id, r.id);
        }
        other => panic!("expected change, got {other:?}"),
    }

    engine
        .update_reservation_status(r.id, user, ReservationStatus::Cancelled)
        .await
        .unwrap();
    assert!(matches!(day.recv().await, Some(FeedEvent::Changed(c)) if c.op == ChangeOp::Update));
    assert!(matches!(all.recv().await, Some(FeedEvent::Changed(c)) if c.op == ChangeOp::Insert));
    assert!(
        matches!(all.recv().await, Some(FeedEvent::Changed(c)) if c.status == ReservationStatus::Cancelled)
    );
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let user = Ulid::new();
    let (court, kept, cancelled) = {
        let engine = open(path.clone());
        let court = with_court(&engine, "Court 1").await;
        engine
            .get_or_create_profile(user, ProfileDefaults { email: "m@club.test".into(), full_name: None })
            .await
            .unwrap();
        let kept = engine.insert_reservation(row(user, court, june(10), span("16:00", "17:30"))).await.unwrap();
        let cancelled = engine.insert_reservation(row(user, court, june(10), span("19:00", "20:30"))).await.unwrap();
        engine
            .update_reservation_status(cancelled.id, user, ReservationStatus::Cancelled)
            .await
            .unwrap();
        (court, kept, cancelled)
    };

    let engine = open(path);
    assert_eq!(engine.court_count(), 1);
    assert!(engine.get_profile(&user).is_some());
    assert_eq!(engine.active_reservations(court, june(10)).await, vec![kept]);
    assert_eq!(
        engine.get_reservation(&cancelled.id).await.unwrap().status,
        ReservationStatus::Cancelled
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_engine.wal");
    let user = Ulid::new();
    let court;
    {
        let engine = open(path.clone());
        court = with_court(&engine, "Court 1").await;
        for _ in 0..5 {
            let r = engine.insert_reservation(row(user, court, june(12), span("08:30", "10:00"))).await.unwrap();
            engine
                .update_reservation_status(r.id, user, ReservationStatus::Cancelled)
                .await
                .unwrap();
        }
        engine.insert_reservation(row(user, court, june(12), span("08:30", "10:00"))).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 12);

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() <= before);
    }

    let engine = open(path);
    assert_eq!(engine.reservation_count(), 6);
    assert_eq!(engine.active_reservations(court, june(12)).await.len(), 1);
    assert_eq!(engine.user_reservations(user).await.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_keeps_concurrent_inserts() {
    let path = test_wal_path("compact_concurrent.wal");
    let n = 400;
    let court;
    {
        let engine = Arc::new(open(path.clone()));
        court = with_court(&engine, "Court 1").await;

        let mut writers = Vec::new();
        for i in 0..n {
            let engine = engine.clone();
            let date = june(1) + chrono::Duration::days(i);
            writers.push(tokio::spawn(async move {
                engine
                    .insert_reservation(row(Ulid::new(), court, date, span("08:30", "10:00")))
                    .await
            }));
        }
        let compactor = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..40 {
                    engine.compact_wal().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for w in writers {
            w.await.unwrap().unwrap();
        }
        compactor.await.unwrap();
        assert_eq!(engine.reservation_count(), n as usize);
    }

    let engine = open(path);
    assert_eq!(engine.reservation_count(), n as usize);
    assert_eq!(engine.all_active_reservations().await.len(), n as usize);
    assert_eq!(engine.active_reservations(court, june(1)).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_court_creation_logs_once() {
    let engine = Arc::new(open(test_wal_path("court_race.wal")));
    let id = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_court(id, format!("Court {i}"), Discipline::Padel).await
        }));
    }
    let mut created = Vec::new();
    let mut duplicates = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(court) => created.push(court),
            Err(StoreError::AlreadyExists(dup)) => {
                assert_eq!(dup, id);
                duplicates += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((created.len(), duplicates), (1, 7));
    assert_eq!(engine.get_court(&id).unwrap().name, created[0].name);
    assert_eq!(engine.wal_appends_since_compact().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_profile_provisioning_logs_once() {
    let engine = Arc::new(open(test_wal_path("profile_race.wal")));
    let user = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let defaults = ProfileDefaults { email: format!("m{i}@club.test"), full_name: None };
            engine.get_or_create_profile(user, defaults).await.unwrap()
        }));
    }
    let mut profiles = Vec::new();
    for h in handles {
        profiles.push(h.await.unwrap());
    }
    assert!(profiles.iter().all(|p| *p == profiles[0]));
    assert_eq!(engine.wal_appends_since_compact().await, 1);
}

#[tokio::test]
async fn day_limit_counts_active_rows() {
    let engine = open(test_wal_path("day_limit.wal"));
    let court = with_court(&engine, "Court 1").await;
    let user = Ulid::new();
    let minute = |m: u32| TimeOfDay::hm(m / 60, m % 60).unwrap();
    for m in 0..MAX_RESERVATIONS_PER_DAY as u32 {
        engine
            .insert_reservation(row(user, court, june(13), Span::new(minute(m), minute(m + 1))))
            .await
            .unwrap();
    }
    let next = Span::new(t("20:30"), t("22:00"));
    let err = engine.insert_reservation(row(user, court, june(13), next)).await.unwrap_err();
    assert!(matches!(err, StoreError::LimitExceeded(_)));

    let first = engine.active_reservations(court, june(13)).await[0].id;
    engine
        .update_reservation_status(first, user, ReservationStatus::Cancelled)
        .await
        .unwrap();
    engine.insert_reservation(row(user, court, june(13), next)).await.unwrap();
}

#[tokio::test]
async fn cancelled_history_never_blocks_a_free_slot() {
    let engine = open(test_wal_path("cancel_history.wal"));
    let court = with_court(&engine, "Court 1").await;
    let churner = Ulid::new();
    for _ in 0..MAX_RESERVATIONS_PER_DAY + 8 {
        let r = engine
            .insert_reservation(row(churner, court, june(13), span("08:30", "10:00")))
            .await
            .unwrap();
        engine
            .update_reservation_status(r.id, churner, ReservationStatus::Cancelled)
            .await
            .unwrap();
    }
    assert!(engine.active_reservations(court, june(13)).await.is_empty());

    let other = engine
        .insert_reservation(row(Ulid::new(), court, june(13), span("16:00", "19:00")))
        .await
        .unwrap();
    assert_eq!(other.status, ReservationStatus::Active);
}
