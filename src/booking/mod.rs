//! The booking core: turns a day's reservations into bookable slots,
//! validates what a member picks, and commits or cancels reservations
//! against a [`ReservationStore`].

mod agenda;
mod availability;
mod cancel;
mod commit;
mod error;
mod live;
mod selection;

pub use agenda::{classify, Agenda, AgendaEntry, Badge};
pub use availability::{next_boundary, resolve, DayAvailability, SlotState};
pub use error::BookingError;
pub use live::{CourtDayView, ReservationBoard, ViewUpdate};
pub use selection::Selection;

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::ClubConfig;
use crate::grid::SlotGrid;
use crate::store::ReservationStore;

/// Entry point to the booking core. Cheap to clone; one per server.
#[derive(Clone)]
pub struct Booking {
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    club: ClubConfig,
}

impl Booking {
    pub fn new(store: Arc<dyn ReservationStore>, clock: Arc<dyn Clock>, club: ClubConfig) -> Self {
        Self { store, clock, club }
    }

    pub fn grid(&self) -> &SlotGrid {
        &self.club.grid
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    /// Today and the following days members may book, in order.
    pub fn bookable_dates(&self) -> Vec<NaiveDate> {
        let today = self.clock.today();
        (0..self.club.booking_window_days)
            .filter_map(|i| today.checked_add_signed(Duration::days(i64::from(i))))
            .collect()
    }

    pub fn in_window(&self, date: NaiveDate) -> bool {
        let today = self.clock.today();
        let days_ahead = (date - today).num_days();
        (0..i64::from(self.club.booking_window_days)).contains(&days_ahead)
    }

    /// Resolve the slot grid of one court on one date as of now.
    pub async fn availability(&self, court_id: Ulid, date: NaiveDate) -> Result<DayAvailability, BookingError> {
        let rows = self
            .store
            .active_reservations(court_id, date)
            .await
            .map_err(BookingError::from_store)?;
        Ok(resolve(&self.club.grid, &rows, date, self.clock.now()))
    }
}
