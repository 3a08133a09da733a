use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::{Engine, StoreError};
use crate::model::*;
use crate::notify::{ChangeFilter, Subscription};

/// What the booking core needs from the authoritative store.
///
/// `insert_reservation` must enforce the per-(court, date) exclusion
/// itself and report a lost race as [`StoreError::Conflict`]; the
/// committer's own pre-check only exists to fail early.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// `status = active` rows of one court on one date, ordered by start.
    async fn active_reservations(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<Reservation>, StoreError>;

    async fn all_active_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    async fn user_reservations(&self, user: UserId) -> Result<Vec<Reservation>, StoreError>;

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    async fn insert_reservation(&self, row: NewReservation) -> Result<Reservation, StoreError>;

    /// Matches on both `id` and `owner`; no match is `NotFound`.
    async fn update_reservation_status(
        &self,
        id: Ulid,
        owner: UserId,
        status: ReservationStatus,
    ) -> Result<Reservation, StoreError>;

    async fn get_or_create_profile(&self, user: UserId, defaults: ProfileDefaults) -> Result<Profile, StoreError>;

    fn subscribe(&self, filter: ChangeFilter) -> Subscription;
}

#[async_trait]
impl ReservationStore for Engine {
    async fn active_reservations(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<Reservation>, StoreError> {
        Ok(Engine::active_reservations(self, court_id, date).await)
    }

    async fn all_active_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(Engine::all_active_reservations(self).await)
    }

    async fn user_reservations(&self, user: UserId) -> Result<Vec<Reservation>, StoreError> {
        Ok(Engine::user_reservations(self, user).await)
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(Engine::get_reservation(self, &id).await)
    }

    async fn insert_reservation(&self, row: NewReservation) -> Result<Reservation, StoreError> {
        Engine::insert_reservation(self, row).await
    }

    async fn update_reservation_status(
        &self,
        id: Ulid,
        owner: UserId,
        status: ReservationStatus,
    ) -> Result<Reservation, StoreError> {
        Engine::update_reservation_status(self, id, owner, status).await
    }

    async fn get_or_create_profile(&self, user: UserId, defaults: ProfileDefaults) -> Result<Profile, StoreError> {
        Engine::get_or_create_profile(self, user, defaults).await
    }

    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        self.notify.subscribe(filter)
    }
}
