use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use ulid::Ulid;

use crate::grid::SlotGrid;
use crate::model::{Reservation, Span, TimeOfDay};

/// One grid slot as seen by a member at a given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotState {
    pub slot: TimeOfDay,
    pub span: Span,
    pub available: bool,
    pub occupied: bool,
    pub past: bool,
    /// The active reservation covering this slot, if any.
    pub reservation_id: Option<Ulid>,
}

/// The resolved grid of one (court, date).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DayAvailability {
    pub slots: Vec<SlotState>,
}

impl DayAvailability {
    pub fn get(&self, slot: TimeOfDay) -> Option<&SlotState> {
        self.slots.iter().find(|s| s.slot == slot)
    }

    pub fn is_available(&self, slot: TimeOfDay) -> bool {
        self.get(slot).is_some_and(|s| s.available)
    }

    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| s.available).count()
    }
}

/// Mark every grid slot of `date` occupied, past, or available.
///
/// Occupancy is minute-level interval intersection, so rows whose stored
/// bounds are off the grid still block every slot they touch. A slot is
/// past when `date` is today and it starts at or before `now`; every slot
/// of an earlier date is past.
pub fn resolve(grid: &SlotGrid, reservations: &[Reservation], date: NaiveDate, now: NaiveDateTime) -> DayAvailability {
    let today = now.date();
    let clock = TimeOfDay::of(&now.time());

    let slots = (0..grid.len())
        .filter_map(|i| grid.span_of(i))
        .map(|span| {
            let owner = reservations
                .iter()
                .find(|r| r.is_active() && r.span.overlaps(&span))
                .map(|r| r.id);
            let past = date < today || (date == today && span.start <= clock);
            let occupied = owner.is_some();
            SlotState {
                slot: span.start,
                span,
                available: !occupied && !past,
                occupied,
                past,
                reservation_id: owner,
            }
        })
        .collect();
    DayAvailability { slots }
}

/// When the resolved grid of `date` next changes on its own: the first
/// slot start after `now` on that day, else the following midnight.
/// `None` once `date` is entirely in the past.
pub fn next_boundary(grid: &SlotGrid, date: NaiveDate, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let today = now.date();
    if date < today {
        return None;
    }
    let midnight = today.succ_opt()?.and_hms_opt(0, 0, 0)?;
    if date > today {
        return Some(midnight);
    }
    let clock = TimeOfDay::of(&now.time());
    match grid.iter().find(|s| *s > clock) {
        Some(start) => today
            .and_hms_opt(start.minutes() / 60, start.minutes() % 60, 0)
            .or(Some(midnight)),
        None => Some(midnight),
    }
}
