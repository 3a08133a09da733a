use ulid::Ulid;

use crate::identity::Identity;
use crate::model::{Reservation, ReservationStatus};
use crate::observability::CANCELLATIONS_TOTAL;

use super::{Booking, BookingError};

impl Booking {
    /// Cancel reservation `id` on behalf of the current member.
    ///
    /// Only the owner may cancel. Cancelling an already-cancelled
    /// reservation succeeds without writing anything.
    pub async fn cancel(&self, identity: &dyn Identity, id: Ulid) -> Result<Reservation, BookingError> {
        let result = self.try_cancel(identity, id).await;
        let outcome = match &result {
            Ok(_) => "cancelled",
            Err(e) => e.kind(),
        };
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => outcome).increment(1);
        if let Err(BookingError::Forbidden(_)) = &result {
            tracing::warn!(reservation = %id, "cancel refused: not the owner");
        }
        result
    }

    async fn try_cancel(&self, identity: &dyn Identity, id: Ulid) -> Result<Reservation, BookingError> {
        let user = identity.current_user_id().ok_or(BookingError::AuthExpired)?;
        let existing = self
            .store
            .get_reservation(id)
            .await
            .map_err(BookingError::from_store)?
            .ok_or(BookingError::NotFound(id))?;
        if existing.user_id != user {
            return Err(BookingError::Forbidden(id));
        }
        if existing.status == ReservationStatus::Cancelled {
            return Ok(existing);
        }

        let cancelled = self
            .store
            .update_reservation_status(id, user, ReservationStatus::Cancelled)
            .await
            .map_err(BookingError::from_store)?;
        tracing::info!(reservation = %id, user = %user, "reservation cancelled");
        Ok(cancelled)
    }
}
