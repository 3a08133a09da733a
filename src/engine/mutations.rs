use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::{new_profile, Engine, StoreError, WalCommand};

impl Engine {
    pub async fn create_court(&self, id: Ulid, name: String, discipline: Discipline) -> Result<Court, StoreError> {
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog.lock().await;
        if self.courts.len() >= MAX_COURTS {
            return Err(StoreError::LimitExceeded("too many courts"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("court name must be 1..=256 bytes"));
        }
        if self.courts.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }

        let created_at = self.clock.now();
        let event = Event::CourtCreated { id, name: name.clone(), discipline, created_at };
        self.wal_append(&event).await?;
        let court = Court { id, name, discipline, created_at };
        self.courts.insert(id, court.clone());
        tracing::info!(court = %id, name = %court.name, "court created");
        Ok(court)
    }

    /// Insert one active reservation. The overlap check and the append run
    /// under the sheet's write lock, so two writers racing for the same
    /// span cannot both get in.
    pub async fn insert_reservation(&self, row: NewReservation) -> Result<Reservation, StoreError> {
        validate_span(&row.span)?;
        if !self.courts.contains_key(&row.court_id) {
            return Err(StoreError::NotFound(row.court_id));
        }

        let _gate = self.write_gate.read().await;
        let sheet = self.sheet(row.key());
        let mut guard = sheet.write().await;
        if guard.active().count() >= MAX_RESERVATIONS_PER_DAY {
            return Err(StoreError::LimitExceeded("too many reservations on this day"));
        }
        check_no_conflict(&guard, &row.span)?;

        let id = Ulid::new();
        let created_at = self.clock.now();
        let event = Event::ReservationInserted {
            id,
            user_id: row.user_id,
            court_id: row.court_id,
            date: row.date,
            span: row.span,
            created_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        Ok(Reservation {
            id,
            user_id: row.user_id,
            court_id: row.court_id,
            date: row.date,
            span: row.span,
            status: ReservationStatus::Active,
            created_at,
        })
    }

    /// Set the status of the reservation `id` owned by `owner`.
    ///
    /// A row owned by someone else is reported as missing. Re-applying the
    /// current status is a no-op; cancelled rows never come back.
    pub async fn update_reservation_status(
        &self,
        id: Ulid,
        owner: UserId,
        status: ReservationStatus,
    ) -> Result<Reservation, StoreError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = match guard.get(&id) {
            Some(r) if r.user_id == owner => r.clone(),
            _ => return Err(StoreError::NotFound(id)),
        };
        if current.status == status {
            return Ok(current);
        }
        if current.status == ReservationStatus::Cancelled {
            return Err(StoreError::InvalidTransition { from: current.status, to: status });
        }

        let event = Event::ReservationStatusChanged {
            id,
            court_id: current.court_id,
            date: current.date,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Reservation { status, ..current })
    }

    /// The member's profile, provisioned from `defaults` on first sight.
    pub async fn get_or_create_profile(&self, user: UserId, defaults: ProfileDefaults) -> Result<Profile, StoreError> {
        if let Some(existing) = self.profiles.get(&user) {
            return Ok(existing.value().clone());
        }
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog.lock().await;
        // another caller may have provisioned it while we waited
        if let Some(existing) = self.profiles.get(&user) {
            return Ok(existing.value().clone());
        }
        if defaults.email.len() > MAX_PROFILE_FIELD_LEN
            || defaults.full_name.as_ref().is_some_and(|n| n.len() > MAX_PROFILE_FIELD_LEN)
        {
            return Err(StoreError::LimitExceeded("profile field too long"));
        }

        let created_at = self.clock.now();
        let event = Event::ProfileCreated {
            id: user,
            email: defaults.email.clone(),
            full_name: defaults.full_name.clone(),
            created_at,
        };
        self.wal_append(&event).await?;
        let profile = new_profile(user, defaults.email, defaults.full_name, created_at);
        self.profiles.insert(user, profile.clone());
        tracing::debug!(user = %user, "profile provisioned");
        Ok(profile)
    }

    /// Rewrite the WAL with just the events needed to rebuild current state.
    /// Writers wait until the compacted file has replaced the log.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.write().await;
        let mut events: Vec<Event> = self
            .courts
            .iter()
            .map(|e| {
                let c = e.value();
                Event::CourtCreated {
                    id: c.id,
                    name: c.name.clone(),
                    discipline: c.discipline,
                    created_at: c.created_at,
                }
            })
            .collect();
        events.extend(self.profiles.iter().map(|e| {
            let p = e.value();
            Event::ProfileCreated {
                id: p.id,
                email: p.email.clone(),
                full_name: p.full_name.clone(),
                created_at: p.created_at,
            }
        }));

        let sheets: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        for sheet in sheets {
            let guard = sheet.read().await;
            for r in &guard.reservations {
                events.push(Event::ReservationInserted {
                    id: r.id,
                    user_id: r.user_id,
                    court_id: r.court_id,
                    date: r.date,
                    span: r.span,
                    created_at: r.created_at,
                });
                if r.status != ReservationStatus::Active {
                    events.push(Event::ReservationStatusChanged {
                        id: r.id,
                        court_id: r.court_id,
                        date: r.date,
                        status: r.status,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
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
