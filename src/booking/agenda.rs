use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::model::{Reservation, ReservationStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Badge {
    Cancelled,
    Completed,
    /// Upcoming and held by the viewer.
    Yours,
    /// Upcoming and held by another member.
    Taken,
}

impl Badge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::Cancelled => "cancelled",
            Badge::Completed => "completed",
            Badge::Yours => "yours",
            Badge::Taken => "taken",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgendaEntry {
    pub reservation: Reservation,
    pub badge: Badge,
    /// The viewer owns this row and it can still be cancelled.
    pub cancellable: bool,
}

/// Reservations split the way the board shows them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Agenda {
    /// Active rows starting between now and `now + horizon`, soonest first.
    pub upcoming: Vec<AgendaEntry>,
    /// Rows that already started or were cancelled, most recent first.
    pub history: Vec<AgendaEntry>,
}

/// Sort `rows` into upcoming and history as seen by `viewer` at `now`.
/// Active rows further out than `horizon` are left off the board.
pub fn classify(rows: &[Reservation], viewer: Option<UserId>, now: NaiveDateTime, horizon: Duration) -> Agenda {
    let limit = now + horizon;
    let mut agenda = Agenda::default();
    for r in rows {
        let starts = r.starts_at();
        let mine = viewer == Some(r.user_id);
        let badge = if r.status == ReservationStatus::Cancelled {
            Badge::Cancelled
        } else if starts < now {
            Badge::Completed
        } else if mine {
            Badge::Yours
        } else {
            Badge::Taken
        };
        let entry = AgendaEntry {
            reservation: r.clone(),
            badge,
            cancellable: mine && r.is_active() && starts >= now,
        };
        match badge {
            Badge::Cancelled | Badge::Completed => agenda.history.push(entry),
            Badge::Yours | Badge::Taken if starts <= limit => agenda.upcoming.push(entry),
            Badge::Yours | Badge::Taken => {}
        }
    }
    agenda.upcoming.sort_by_key(|e| e.reservation.starts_at());
    agenda
        .history
        .sort_by_key(|e| std::cmp::Reverse(e.reservation.starts_at()));
    agenda
}
