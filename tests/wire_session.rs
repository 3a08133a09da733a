use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use courtside::booking::Booking;
use courtside::clock::{Clock, FixedClock};
use courtside::config::ClubConfig;
use courtside::engine::Engine;
use courtside::notify::NotifyHub;
use courtside::store::ReservationStore;
use courtside::wire;

const PASSWORD: &str = "courtside";

// ── Test infrastructure ──────────────────────────────────────

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 10).unwrap()
}

/// A server whose clock reads 2025-06-10 14:45.
async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("courtside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let clock: Arc<dyn Clock> = Arc::new(FixedClock::at(today(), 14, 45).unwrap());
    let engine = Arc::new(Engine::new(dir.join("courtside.wal"), Arc::new(NotifyHub::new()), clock.clone()).unwrap());
    let store: Arc<dyn ReservationStore> = engine.clone();
    let booking = Booking::new(store, clock, ClubConfig::default());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            let booking = booking.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, booking, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

/// Log in as `user`; member sessions use their id as the login name.
async fn connect(addr: SocketAddr, user: &str) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("club")
        .user(user)
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn connect_member(addr: SocketAddr) -> (Ulid, tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    let member = Ulid::new();
    let (client, rx) = connect(addr, &member.to_string()).await;
    (member, client, rx)
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn create_court(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO courts (id, name, discipline) VALUES ('{id}', 'Court {id}', 'tennis')"
        ))
        .await
        .unwrap();
    id
}

fn book_sql(court: Ulid, slots: &[&str]) -> String {
    let values: Vec<String> = slots
        .iter()
        .map(|s| format!("('{court}', '2025-06-10', '{s}')"))
        .collect();
    format!("INSERT INTO reservations (court_id, date, slot) VALUES {}", values.join(", "))
}

async fn recv_notification(rx: &mut mpsc::UnboundedReceiver<Notification>, timeout: Duration) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn courts_round_trip_over_the_wire() {
    let (addr, engine) = start_test_server().await;
    let (_, client, _rx) = connect_member(addr).await;

    let court = create_court(&client).await;
    let listed = rows(&client, "SELECT * FROM courts").await;

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(court.to_string().as_str()));
    assert_eq!(listed[0].get("discipline"), Some("tennis"));
    assert_eq!(engine.court_count(), 1);

    // same id twice
    let dup = format!("INSERT INTO courts (id, name, discipline) VALUES ('{court}', 'Again', 'padel')");
    assert_eq!(sqlstate(&client, &dup).await, "23505");
}

#[tokio::test]
async fn booking_two_slots_blocks_them() {
    let (addr, _engine) = start_test_server().await;
    let (member, client, _rx) = connect_member(addr).await;
    let court = create_court(&client).await;

    let booked = rows(&client, &book_sql(court, &["16:00", "17:30"])).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("start_time"), Some("16:00"));
    assert_eq!(booked[0].get("end_time"), Some("19:00"));
    assert_eq!(booked[0].get("status"), Some("active"));
    assert_eq!(booked[0].get("user_id"), Some(member.to_string().as_str()));

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE court_id = '{court}' AND date = '2025-06-10'"),
    )
    .await;
    let state = |label: &str| {
        let row = slots.iter().find(|r| r.get("slot") == Some(label)).unwrap();
        (row.get("available").unwrap().to_string(), row.get("occupied").unwrap().to_string())
    };
    assert_eq!(state("16:00"), ("f".to_string(), "t".to_string()));
    assert_eq!(state("17:30"), ("f".to_string(), "t".to_string()));
    assert_eq!(state("19:00"), ("t".to_string(), "f".to_string()));
    // 14:30 has already started at 14:45
    assert_eq!(state("14:30"), ("f".to_string(), "f".to_string()));

    let mine = rows(&client, &format!("SELECT * FROM reservations WHERE user_id = '{member}'")).await;
    assert_eq!(mine.len(), 1);
}

#[tokio::test]
async fn second_member_gets_exclusion_violation() {
    let (addr, _engine) = start_test_server().await;
    let (_, alice, _rx1) = connect_member(addr).await;
    let (_, bob, _rx2) = connect_member(addr).await;
    let court = create_court(&alice).await;

    rows(&alice, &book_sql(court, &["17:30"])).await;
    assert_eq!(sqlstate(&bob, &book_sql(court, &["16:00", "17:30"])).await, "23P01");
    assert_eq!(sqlstate(&bob, &book_sql(court, &["17:30"])).await, "23P01");

    let taken = rows(
        &bob,
        &format!("SELECT * FROM reservations WHERE court_id = '{court}' AND date = '2025-06-10'"),
    )
    .await;
    assert_eq!(taken.len(), 1);
}

#[tokio::test]
async fn booking_rules_surface_as_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let (_, client, _rx) = connect_member(addr).await;
    let court = create_court(&client).await;

    // past slot
    assert_eq!(sqlstate(&client, &book_sql(court, &["13:00"])).await, "22023");
    // not adjacent
    assert_eq!(sqlstate(&client, &book_sql(court, &["16:00", "19:00"])).await, "22023");
    // beyond the booking window
    let late = format!("INSERT INTO reservations (court_id, date, slot) VALUES ('{court}', '2025-07-30', '16:00')");
    assert_eq!(sqlstate(&client, &late).await, "22023");
    // unknown court
    assert_eq!(sqlstate(&client, &book_sql(Ulid::new(), &["16:00"])).await, "22023");
    // malformed SQL and unknown tables
    assert_eq!(sqlstate(&client, "SELEC nothing").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM bookings").await, "42P01");
}

#[tokio::test]
async fn anonymous_session_reads_but_cannot_book() {
    let (addr, _engine) = start_test_server().await;
    let (_, member, _rx1) = connect_member(addr).await;
    let court = create_court(&member).await;

    let (guest, _rx2) = connect(addr, "guest").await;
    assert_eq!(rows(&guest, "SELECT * FROM courts").await.len(), 1);
    assert_eq!(sqlstate(&guest, &book_sql(court, &["16:00"])).await, "28000");
}

#[tokio::test]
async fn cancel_is_owner_only() {
    let (addr, engine) = start_test_server().await;
    let (_, alice, _rx1) = connect_member(addr).await;
    let (_, bob, _rx2) = connect_member(addr).await;
    let court = create_court(&alice).await;

    let booked = rows(&alice, &book_sql(court, &["16:00"])).await;
    let id: Ulid = booked[0].get("id").unwrap().parse().unwrap();

    let cancel = format!("DELETE FROM reservations WHERE id = '{id}'");
    assert_eq!(sqlstate(&bob, &cancel).await, "42501");
    assert!(engine.get_reservation(&id).await.unwrap().is_active());

    alice.batch_execute(&cancel).await.unwrap();
    assert!(!engine.get_reservation(&id).await.unwrap().is_active());
    // repeat is a no-op
    alice.batch_execute(&cancel).await.unwrap();

    assert_eq!(
        sqlstate(&alice, &format!("DELETE FROM reservations WHERE id = '{}'", Ulid::new())).await,
        "02000"
    );

    // the freed span can be booked again
    rows(&bob, &book_sql(court, &["16:00"])).await;
}

#[tokio::test]
async fn agenda_marks_own_rows() {
    let (addr, _engine) = start_test_server().await;
    let (_, alice, _rx1) = connect_member(addr).await;
    let (_, bob, _rx2) = connect_member(addr).await;
    let court = create_court(&alice).await;

    rows(&alice, &book_sql(court, &["16:00"])).await;
    rows(&bob, &book_sql(court, &["19:00"])).await;

    let board = rows(&alice, "SELECT * FROM agenda").await;
    let badges: Vec<(&str, &str, &str)> = board
        .iter()
        .map(|r| {
            (
                r.get("start_time").unwrap(),
                r.get("badge").unwrap(),
                r.get("cancellable").unwrap(),
            )
        })
        .collect();
    assert_eq!(badges, vec![("16:00", "yours", "t"), ("19:00", "taken", "f")]);
    assert!(board.iter().all(|r| r.get("section") == Some("upcoming")));
}

#[tokio::test]
async fn listen_receives_court_day_changes() {
    let (addr, _engine) = start_test_server().await;
    let (_, watcher, mut rx) = connect_member(addr).await;
    let (_, booker, _rx2) = connect_member(addr).await;
    let court = create_court(&watcher).await;

    let channel = format!("court_{}_20250610", court).to_lowercase();
    watcher.batch_execute(&format!("LISTEN {channel}")).await.unwrap();

    let booked = rows(&booker, &book_sql(court, &["16:00"])).await;
    let id = booked[0].get("id").unwrap().to_string();

    // queued changes go out ahead of the watcher's next statement
    rows(&watcher, "SELECT * FROM courts").await;
    let n = recv_notification(&mut rx, Duration::from_secs(2))
        .await
        .expect("no notification");
    assert_eq!(n.channel(), channel);
    let payload: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
    assert_eq!(payload["reservation_id"], serde_json::Value::String(id));
    assert_eq!(payload["status"], "active");
}

#[tokio::test]
async fn other_days_and_unlisten_stay_quiet() {
    let (addr, _engine) = start_test_server().await;
    let (_, watcher, mut rx) = connect_member(addr).await;
    let (_, booker, _rx2) = connect_member(addr).await;
    let court = create_court(&watcher).await;

    watcher
        .batch_execute(&format!("LISTEN court_{court}_20250611"))
        .await
        .unwrap();
    rows(&booker, &book_sql(court, &["16:00"])).await;
    rows(&watcher, "SELECT * FROM courts").await;
    assert!(recv_notification(&mut rx, Duration::from_millis(200)).await.is_none());

    watcher.batch_execute("LISTEN reservations").await.unwrap();
    watcher.batch_execute("UNLISTEN reservations").await.unwrap();
    rows(&booker, &book_sql(court, &["19:00"])).await;
    rows(&watcher, "SELECT * FROM courts").await;
    assert!(recv_notification(&mut rx, Duration::from_millis(200)).await.is_none());

    assert_eq!(sqlstate(&watcher, "LISTEN court_bogus").await, "42602");
}

#[tokio::test]
async fn reservations_channel_sees_cancellations() {
    let (addr, _engine) = start_test_server().await;
    let (_, watcher, mut rx) = connect_member(addr).await;
    let (_, booker, _rx2) = connect_member(addr).await;
    let court = create_court(&watcher).await;

    let booked = rows(&booker, &book_sql(court, &["16:00"])).await;
    let id = booked[0].get("id").unwrap().to_string();

    watcher.batch_execute("LISTEN reservations").await.unwrap();
    booker
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();
    rows(&watcher, "SELECT * FROM courts").await;

    let n = recv_notification(&mut rx, Duration::from_secs(2))
        .await
        .expect("no notification");
    assert_eq!(n.channel(), "reservations");
    let payload: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
    assert_eq!(payload["status"], "cancelled");
}
