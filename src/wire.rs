use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::ClubPasswordSource;
use crate::booking::{Agenda, AgendaEntry, Booking, BookingError, ReservationBoard, Selection};
use crate::engine::{Engine, StoreError};
use crate::identity::{AuthUser, StaticIdentity};
use crate::limits::MAX_LISTENS_PER_CONNECTION;
use crate::model::*;
use crate::notify::{FeedEvent, Subscription};
use crate::observability;
use crate::sql::{self, Command, ReservationQuery};

/// Backend process ids handed out in notifications, one per connection.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    booking: Booking,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CourtsideFactory::new(engine, booking, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Per-connection query handler: runs commands and owns the LISTEN set.
pub struct CourtsideHandler {
    engine: Arc<Engine>,
    booking: Booking,
    pid: i32,
    /// Lowercased channel name → live feed.
    listens: Mutex<HashMap<String, Subscription>>,
    query_parser: Arc<CourtsideQueryParser>,
}

impl CourtsideHandler {
    pub fn new(engine: Arc<Engine>, booking: Booking) -> Self {
        Self {
            engine,
            booking,
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            listens: Mutex::new(HashMap::new()),
            query_parser: Arc::new(CourtsideQueryParser),
        }
    }

    fn listens(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subscription>> {
        self.listens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The member behind this session: the login name, if it is a member id.
    fn identity<C: ClientInfo>(client: &C) -> StaticIdentity {
        let user = client
            .metadata()
            .get("user")
            .and_then(|u| Ulid::from_string(u).ok());
        StaticIdentity(user.map(AuthUser::new))
    }

    /// Collect queued changes for every channel this connection listens on.
    fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let mut out = Vec::new();
        for (channel, sub) in self.listens().iter_mut() {
            while let Some(event) = sub.try_recv() {
                let payload = match event {
                    FeedEvent::Changed(change) => serde_json::to_string(&change),
                    FeedEvent::Lagged(n) => serde_json::to_string(&serde_json::json!({ "lagged": n })),
                };
                match payload {
                    Ok(payload) => out.push(NotificationResponse::new(self.pid, channel.clone(), payload)),
                    Err(e) => tracing::warn!("dropping notification on {channel}: {e}"),
                }
            }
        }
        out
    }

    /// Deliver pending notifications ahead of the next response.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for n in self.pending_notifications() {
            client.send(PgWireBackendMessage::NotificationResponse(n)).await?;
        }
        Ok(())
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(client, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command<C: ClientInfo>(&self, client: &C, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertCourts { courts } => {
                let count = courts.len();
                for (id, name, discipline) in courts {
                    self.engine
                        .create_court(id, name, discipline)
                        .await
                        .map_err(store_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::SelectCourts => {
                let schema = Arc::new(courts_schema());
                let rows: Vec<PgWireResult<_>> = self
                    .engine
                    .list_courts()
                    .into_iter()
                    .map(|court| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&court.id.to_string())?;
                        encoder.encode_field(&court.name)?;
                        encoder.encode_field(&court.discipline.as_str())?;
                        encoder.encode_field(&court.created_at.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlots { court_id, date } => {
                let day = self
                    .booking
                    .availability(court_id, date)
                    .await
                    .map_err(booking_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = day
                    .slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.slot.to_string())?;
                        encoder.encode_field(&slot.span.end.to_string())?;
                        encoder.encode_field(&slot.available)?;
                        encoder.encode_field(&slot.occupied)?;
                        encoder.encode_field(&slot.past)?;
                        encoder.encode_field(&slot.reservation_id.map(|id| id.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectReservations { query } => {
                let store = self.booking.store();
                let rows = match query {
                    ReservationQuery::AllActive => store.all_active_reservations().await,
                    ReservationQuery::CourtDay(key) => store.active_reservations(key.court_id, key.date).await,
                    ReservationQuery::User(user) => store.user_reservations(user).await,
                }
                .map_err(store_err)?;
                Ok(reservation_rows(&rows))
            }
            Command::SelectAgenda => {
                let viewer = Self::identity(client).0.map(|u| u.id);
                let board = ReservationBoard::open(&self.booking, viewer)
                    .await
                    .map_err(booking_err)?;
                Ok(agenda_rows(board.agenda()))
            }
            Command::InsertReservation { court_id, date, slots } => {
                let identity = Self::identity(client);
                if identity.0.is_none() {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                }
                let selection = Selection::from_slots(self.booking.grid(), &slots).map_err(booking_err)?;
                let reservation = self
                    .booking
                    .commit(&identity, court_id, date, &selection)
                    .await
                    .map_err(booking_err)?;
                Ok(reservation_rows(std::slice::from_ref(&reservation)))
            }
            Command::CancelReservation { id } => {
                let identity = Self::identity(client);
                if identity.0.is_none() {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                }
                self.booking.cancel(&identity, id).await.map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Listen { channel, filter } => {
                let key = channel.to_ascii_lowercase();
                let mut listens = self.listens();
                if !listens.contains_key(&key) {
                    if listens.len() >= MAX_LISTENS_PER_CONNECTION {
                        return Err(user_error("54000", format!(
                            "too many channels (max {MAX_LISTENS_PER_CONNECTION})"
                        )));
                    }
                    listens.insert(key, self.booking.store().subscribe(filter));
                    metrics::gauge!(observability::LISTENS_ACTIVE).increment(1.0);
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                if self.listens().remove(&channel.to_ascii_lowercase()).is_some() {
                    metrics::gauge!(observability::LISTENS_ACTIVE).decrement(1.0);
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                let dropped = {
                    let mut listens = self.listens();
                    let n = listens.len();
                    listens.clear();
                    n
                };
                metrics::gauge!(observability::LISTENS_ACTIVE).decrement(dropped as f64);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

impl Drop for CourtsideHandler {
    fn drop(&mut self) {
        let open = self.listens().len();
        if open > 0 {
            metrics::gauge!(observability::LISTENS_ACTIVE).decrement(open as f64);
        }
    }
}

// ── Result shapes ────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn courts_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), text("discipline"), text("created_at")]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text("slot"),
        text("end"),
        boolean("available"),
        boolean("occupied"),
        boolean("past"),
        text("reservation_id"),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("court_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        text("status"),
        text("created_at"),
    ]
}

fn agenda_schema() -> Vec<FieldInfo> {
    let mut fields = vec![text("section"), text("badge"), boolean("cancellable")];
    fields.extend(reservations_schema());
    fields
}

fn encode_reservation(encoder: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.user_id.to_string())?;
    encoder.encode_field(&r.court_id.to_string())?;
    encoder.encode_field(&r.date.to_string())?;
    encoder.encode_field(&r.span.start.to_string())?;
    encoder.encode_field(&r.span.end.to_string())?;
    encoder.encode_field(&r.status.as_str())?;
    encoder.encode_field(&r.created_at.to_string())?;
    Ok(())
}

fn reservation_rows(rows: &[Reservation]) -> Response {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = rows
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_reservation(&mut encoder, r)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn agenda_rows(agenda: &Agenda) -> Response {
    let schema = Arc::new(agenda_schema());
    let sections = [("upcoming", &agenda.upcoming), ("history", &agenda.history)];
    let rows: Vec<PgWireResult<_>> = sections
        .iter()
        .flat_map(|(section, entries)| entries.iter().map(move |e: &AgendaEntry| (*section, e)))
        .map(|(section, entry)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&section)?;
            encoder.encode_field(&entry.badge.as_str())?;
            encoder.encode_field(&entry.cancellable)?;
            encode_reservation(&mut encoder, &entry.reservation)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, before its parameters are bound.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let target = words
        .windows(2)
        .find(|w| w[0] == "FROM" || w[0] == "INTO")
        .map(|w| w[1]);
    match (words.first().copied(), target) {
        (Some("SELECT"), Some("COURTS")) => courts_schema(),
        (Some("SELECT"), Some("SLOTS")) => slots_schema(),
        (Some("SELECT"), Some("AGENDA")) => agenda_schema(),
        (Some("SELECT"), Some("RESERVATIONS")) | (Some("INSERT"), Some("RESERVATIONS")) => reservations_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtsideHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notifications(client).await?;
        let response = self.run(client, query).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtsideQueryParser;

#[async_trait]
impl QueryParser for CourtsideQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtsideHandler {
    type Statement = String;
    type QueryParser = CourtsideQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notifications(client).await?;
        let sql = substitute_params(portal);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first
/// so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtsideFactory {
    handler: Arc<CourtsideHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<ClubPasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtsideFactory {
    pub fn new(engine: Arc<Engine>, booking: Booking, password: String) -> Self {
        Self {
            handler: Arc::new(CourtsideHandler::new(engine, booking)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ClubPasswordSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtsideFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn booking_err(e: BookingError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn store_err(e: StoreError) -> PgWireError {
    match e {
        StoreError::AlreadyExists(_) => user_error("23505", e.to_string()),
        StoreError::LimitExceeded(_) => user_error("54000", e.to_string()),
        other => booking_err(BookingError::from_store(other)),
    }
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match e {
        sql::SqlError::UnknownTable(_) => "42P01",
        sql::SqlError::BadChannel(_) => "42602",
        sql::SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
