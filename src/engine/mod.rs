mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::StoreError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDaySheet = Arc<RwLock<DaySheet>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, fsync once,
/// answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // flush what we have before compaction touches the file
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so half-buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// The authoritative reservation store: courts, profiles, and one
/// lock-guarded day sheet per (court, date).
pub struct Engine {
    pub(super) courts: DashMap<Ulid, Court>,
    pub(super) days: DashMap<CourtDay, SharedDaySheet>,
    /// Reverse lookup: reservation id → sheet key.
    pub(super) reservation_index: DashMap<Ulid, CourtDay>,
    pub(super) profiles: DashMap<UserId, Profile>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation from its checks until it is applied,
    /// and exclusively by compaction from snapshot to file swap. Taken
    /// before any sheet lock.
    pub(super) write_gate: RwLock<()>,
    /// Serializes court and profile creation between check and insert.
    pub(super) catalog: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
}

/// Apply a reservation event to its sheet (caller holds the lock).
fn apply_to_sheet(sheet: &mut DaySheet, event: &Event, index: &DashMap<Ulid, CourtDay>) {
    match event {
        Event::ReservationInserted {
            id,
            user_id,
            court_id,
            date,
            span,
            created_at,
        } => {
            sheet.insert(Reservation {
                id: *id,
                user_id: *user_id,
                court_id: *court_id,
                date: *date,
                span: *span,
                status: ReservationStatus::Active,
                created_at: *created_at,
            });
            index.insert(*id, sheet.key);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(row) = sheet.get_mut(id) {
                row.status = *status;
            }
        }
        // court/profile events don't touch sheets
        Event::CourtCreated { .. } | Event::ProfileCreated { .. } => {}
    }
}

/// The feed notification an applied event produces, if any.
fn change_for(event: &Event) -> Option<ReservationChange> {
    match event {
        Event::ReservationInserted { id, court_id, date, .. } => Some(ReservationChange {
            op: ChangeOp::Insert,
            reservation_id: *id,
            court_id: *court_id,
            date: *date,
            status: ReservationStatus::Active,
        }),
        Event::ReservationStatusChanged { id, court_id, date, status } => Some(ReservationChange {
            op: ChangeOp::Update,
            reservation_id: *id,
            court_id: *court_id,
            date: *date,
            status: *status,
        }),
        Event::CourtCreated { .. } | Event::ProfileCreated { .. } => None,
    }
}

/// Sheet key of a reservation event.
fn event_day(event: &Event) -> Option<CourtDay> {
    match event {
        Event::ReservationInserted { court_id, date, .. }
        | Event::ReservationStatusChanged { court_id, date, .. } => Some(CourtDay::new(*court_id, *date)),
        Event::CourtCreated { .. } | Event::ProfileCreated { .. } => None,
    }
}

impl Engine {
    /// Open the store at `wal_path`, replaying whatever the log holds.
    /// Must be called inside a tokio runtime (spawns the WAL writer).
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let courts = DashMap::new();
        let profiles = DashMap::new();
        let reservation_index = DashMap::new();
        let mut sheets: HashMap<CourtDay, DaySheet> = HashMap::new();

        for event in &events {
            match event {
                Event::CourtCreated { id, name, discipline, created_at } => {
                    courts.insert(*id, Court {
                        id: *id,
                        name: name.clone(),
                        discipline: *discipline,
                        created_at: *created_at,
                    });
                }
                Event::ProfileCreated { id, email, full_name, created_at } => {
                    profiles.insert(*id, new_profile(*id, email.clone(), full_name.clone(), *created_at));
                }
                other => {
                    if let Some(key) = event_day(other) {
                        let sheet = sheets.entry(key).or_insert_with(|| DaySheet::new(key));
                        apply_to_sheet(sheet, other, &reservation_index);
                    }
                }
            }
        }

        let days = DashMap::new();
        for (key, sheet) in sheets {
            days.insert(key, Arc::new(RwLock::new(sheet)));
        }

        tracing::debug!(
            "replayed {} events: {} courts, {} reservations",
            events.len(),
            courts.len(),
            reservation_index.len()
        );

        Ok(Self {
            courts,
            days,
            reservation_index,
            profiles,
            wal_tx,
            write_gate: RwLock::new(()),
            catalog: Mutex::new(()),
            notify,
            clock,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// The sheet for `key`, created empty on first touch.
    pub fn sheet(&self, key: CourtDay) -> SharedDaySheet {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySheet::new(key))))
            .value()
            .clone()
    }

    /// The sheet for `key` if anything was ever booked there.
    pub fn existing_sheet(&self, key: &CourtDay) -> Option<SharedDaySheet> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// WAL-append + apply + notify in one call. Caller holds `write_gate`
    /// shared and the sheet's write lock.
    pub(super) async fn persist_and_apply(&self, sheet: &mut DaySheet, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_sheet(sheet, event, &self.reservation_index);
        if let Some(change) = change_for(event) {
            self.notify.send(&change);
        }
        Ok(())
    }

    /// Lookup reservation → sheet, acquire its write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<DaySheet>, StoreError> {
        let key = self
            .reservation_index
            .get(id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(*id))?;
        let sheet = self.existing_sheet(&key).ok_or(StoreError::NotFound(*id))?;
        Ok(sheet.write_owned().await)
    }
}

pub(super) fn new_profile(
    id: UserId,
    email: String,
    full_name: Option<String>,
    created_at: chrono::NaiveDateTime,
) -> Profile {
    Profile {
        id,
        email,
        street: String::new(),
        full_name,
        club_card_verified: false,
        created_at,
    }
}
