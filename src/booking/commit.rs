use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::StoreError;
use crate::identity::Identity;
use crate::model::{NewReservation, Reservation, Span, TimeOfDay};
use crate::observability::BOOKINGS_TOTAL;

use super::{Booking, BookingError, Selection};

fn record(outcome: &'static str) {
    metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
}

impl Booking {
    /// Reserve `selection` on `court_id` for `date` as the current member.
    ///
    /// The fresh overlap check here only fails early; the store's own
    /// exclusion decides races, and a lost race comes back as `Conflict` too.
    pub async fn commit(
        &self,
        identity: &dyn Identity,
        court_id: Ulid,
        date: NaiveDate,
        selection: &Selection,
    ) -> Result<Reservation, BookingError> {
        let result = self.try_commit(identity, court_id, date, selection).await;
        match &result {
            Ok(r) => {
                record("committed");
                tracing::info!(
                    reservation = %r.id,
                    court = %court_id,
                    %date,
                    span = %r.span,
                    user = %r.user_id,
                    "reservation committed"
                );
            }
            Err(e) => {
                record(e.kind());
                tracing::debug!(court = %court_id, %date, "commit rejected: {e}");
            }
        }
        result
    }

    async fn try_commit(
        &self,
        identity: &dyn Identity,
        court_id: Ulid,
        date: NaiveDate,
        selection: &Selection,
    ) -> Result<Reservation, BookingError> {
        let user = identity.current_user().ok_or(BookingError::AuthExpired)?;
        let span = selection
            .span(self.grid())
            .ok_or_else(|| BookingError::validation("select at least one slot"))?;
        self.check_bookable(date, &span)?;

        let current = self
            .store
            .active_reservations(court_id, date)
            .await
            .map_err(BookingError::from_store)?;
        if let Some(existing) = current.iter().find(|r| r.span.overlaps(&span)) {
            return Err(BookingError::Conflict { with: Some(existing.id) });
        }

        if let Err(e) = self.store.get_or_create_profile(user.id, user.profile_defaults()).await {
            tracing::warn!(user = %user.id, "profile provisioning failed, booking anyway: {e}");
        }

        let row = NewReservation {
            user_id: user.id,
            court_id,
            date,
            span,
        };
        self.store.insert_reservation(row).await.map_err(|e| match e {
            StoreError::Conflict(id) => {
                tracing::info!(court = %court_id, %date, %span, "lost booking race to {id}");
                BookingError::Conflict { with: Some(id) }
            }
            StoreError::NotFound(id) if id == court_id => BookingError::validation(format!("unknown court {id}")),
            other => BookingError::from_store(other),
        })
    }

    /// Date inside the booking window and the span not yet started.
    fn check_bookable(&self, date: NaiveDate, span: &Span) -> Result<(), BookingError> {
        if !self.in_window(date) {
            return Err(BookingError::validation(format!("{date} is outside the booking window")));
        }
        let now = self.clock.now();
        if date == now.date() && span.start <= TimeOfDay::of(&now.time()) {
            return Err(BookingError::validation(format!("the {} slot has already started", span.start)));
        }
        Ok(())
    }
}
