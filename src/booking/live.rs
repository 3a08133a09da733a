use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::identity::Identity;
use crate::model::{CourtDay, Reservation, TimeOfDay, UserId};
use crate::notify::{ChangeFilter, FeedEvent, Subscription};

use super::agenda::{classify, Agenda};
use super::availability::{next_boundary, resolve, DayAvailability};
use super::{Booking, BookingError, Selection};

/// Why a live view changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewUpdate {
    /// The feed reported a change (or dropped some); rows were fetched again.
    Refetched,
    /// The clock crossed a slot start or midnight; rows were re-resolved as-is.
    ClockTick,
}

fn until(now: NaiveDateTime, deadline: NaiveDateTime) -> StdDuration {
    (deadline - now).to_std().unwrap_or(StdDuration::ZERO)
}

/// Drain whatever else is queued so one refetch covers a burst.
fn drain(sub: &mut Subscription) {
    while sub.try_recv().is_some() {}
}

/// One member's live picture of a court on a date: resolved slots plus
/// their in-progress selection, kept current from the change feed.
pub struct CourtDayView {
    booking: Booking,
    key: CourtDay,
    feed: Subscription,
    reservations: Vec<Reservation>,
    availability: DayAvailability,
    selection: Selection,
}

impl CourtDayView {
    /// Subscribes before the first fetch, so no change can slip in between.
    pub async fn open(booking: &Booking, court_id: Ulid, date: NaiveDate) -> Result<Self, BookingError> {
        let key = CourtDay::new(court_id, date);
        let feed = booking.store().subscribe(ChangeFilter::CourtDay(key));
        let mut view = Self {
            booking: booking.clone(),
            key,
            feed,
            reservations: Vec::new(),
            availability: DayAvailability::default(),
            selection: Selection::new(),
        };
        view.refetch().await?;
        Ok(view)
    }

    pub fn key(&self) -> CourtDay {
        self.key
    }

    pub fn availability(&self) -> &DayAvailability {
        &self.availability
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn toggle(&mut self, slot: TimeOfDay) -> bool {
        self.selection
            .toggle(self.booking.grid(), &self.availability, slot)
    }

    /// Switch to another date: new feed, fresh rows, empty selection.
    pub async fn set_date(&mut self, date: NaiveDate) -> Result<(), BookingError> {
        if date == self.key.date {
            return Ok(());
        }
        self.key = CourtDay::new(self.key.court_id, date);
        self.feed = self.booking.store().subscribe(ChangeFilter::CourtDay(self.key));
        self.selection.clear();
        self.refetch().await
    }

    /// Replace the cached rows wholesale and re-resolve.
    pub async fn refetch(&mut self) -> Result<(), BookingError> {
        self.reservations = self
            .booking
            .store()
            .active_reservations(self.key.court_id, self.key.date)
            .await
            .map_err(BookingError::from_store)?;
        self.reresolve();
        Ok(())
    }

    /// Re-resolve the cached rows against the current clock.
    pub fn reresolve(&mut self) {
        let grid = self.booking.grid();
        self.availability = resolve(grid, &self.reservations, self.key.date, self.booking.clock().now());
        self.selection.prune(grid, &self.availability);
    }

    /// Wait for the next reason to redraw and apply it.
    pub async fn next_update(&mut self) -> Result<ViewUpdate, BookingError> {
        let now = self.booking.clock().now();
        let tick = next_boundary(self.booking.grid(), self.key.date, now);
        let sleep = tokio::time::sleep(tick.map_or(StdDuration::MAX, |t| until(now, t)));
        tokio::pin!(sleep);

        tokio::select! {
            event = self.feed.recv() => match event {
                Some(FeedEvent::Changed(_)) | Some(FeedEvent::Lagged(_)) => {
                    drain(&mut self.feed);
                    self.refetch().await?;
                    Ok(ViewUpdate::Refetched)
                }
                None => Err(BookingError::Transient("change feed closed".into())),
            },
            _ = &mut sleep, if tick.is_some() => {
                self.reresolve();
                Ok(ViewUpdate::ClockTick)
            }
        }
    }

    /// Commit the current selection. Clears it on success and refetches
    /// either way so the grid shows what won.
    pub async fn commit(&mut self, identity: &dyn Identity) -> Result<Reservation, BookingError> {
        let result = self
            .booking
            .commit(identity, self.key.court_id, self.key.date, &self.selection)
            .await;
        if result.is_ok() {
            self.selection.clear();
        }
        if matches!(result, Ok(_) | Err(BookingError::Conflict { .. })) {
            self.refetch().await?;
        }
        result
    }
}

/// The "all reservations" page: every active reservation, classified for
/// one viewer, refreshed on any change and at midnight.
pub struct ReservationBoard {
    booking: Booking,
    viewer: Option<UserId>,
    feed: Subscription,
    rows: Vec<Reservation>,
    agenda: Agenda,
}

impl ReservationBoard {
    const HORIZON_DAYS: i64 = 7;

    pub async fn open(booking: &Booking, viewer: Option<UserId>) -> Result<Self, BookingError> {
        let feed = booking.store().subscribe(ChangeFilter::StatusActive);
        let mut board = Self {
            booking: booking.clone(),
            viewer,
            feed,
            rows: Vec::new(),
            agenda: Agenda::default(),
        };
        board.refetch().await?;
        Ok(board)
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub async fn refetch(&mut self) -> Result<(), BookingError> {
        self.rows = self
            .booking
            .store()
            .all_active_reservations()
            .await
            .map_err(BookingError::from_store)?;
        self.reclassify();
        Ok(())
    }

    fn reclassify(&mut self) {
        self.agenda = classify(
            &self.rows,
            self.viewer,
            self.booking.clock().now(),
            Duration::days(Self::HORIZON_DAYS),
        );
    }

    pub async fn next_update(&mut self) -> Result<ViewUpdate, BookingError> {
        let now = self.booking.clock().now();
        let midnight = now.date().succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0));
        let sleep = tokio::time::sleep(midnight.map_or(StdDuration::MAX, |t| until(now, t)));
        tokio::pin!(sleep);

        tokio::select! {
            event = self.feed.recv() => match event {
                Some(_) => {
                    drain(&mut self.feed);
                    self.refetch().await?;
                    Ok(ViewUpdate::Refetched)
                }
                None => Err(BookingError::Transient("change feed closed".into())),
            },
            _ = &mut sleep, if midnight.is_some() => {
                self.reclassify();
                Ok(ViewUpdate::ClockTick)
            }
        }
    }

    /// Cancel one of the viewer's reservations from the board.
    pub async fn cancel(&mut self, identity: &dyn Identity, id: Ulid) -> Result<Reservation, BookingError> {
        let cancelled = self.booking.cancel(identity, id).await?;
        self.refetch().await?;
        Ok(cancelled)
    }
}
