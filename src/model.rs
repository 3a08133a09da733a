use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since local midnight. The only time-of-day unit.
pub type Minutes = u32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Member id as issued by the identity provider.
pub type UserId = Ulid;

/// A wall-clock time of day with minute granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(Minutes);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    /// Returns `None` past 24:00.
    pub const fn from_minutes(minutes: Minutes) -> Option<Self> {
        if minutes > MINUTES_PER_DAY {
            None
        } else {
            Some(Self(minutes))
        }
    }

    pub const fn hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 || hour > 24 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    pub const fn minutes(self) -> Minutes {
        self.0
    }

    /// Shift forward, `None` if the result leaves the day.
    pub const fn plus(self, minutes: Minutes) -> Option<Self> {
        Self::from_minutes(self.0.saturating_add(minutes))
    }

    /// Truncates seconds.
    pub fn of(time: &chrono::NaiveTime) -> Self {
        use chrono::Timelike;
        Self(time.hour() * 60 + time.minute())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day: {0:?} (expected HH:MM)")]
pub struct ParseTimeError(pub String);

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    /// Accepts `HH:MM` and the `HH:MM:00` form legacy rows were stored in.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseTimeError(s.to_string());
        let mut parts = s.trim().split(':');
        let hour: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let minute: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        if let Some(sec) = parts.next()
            && sec != "00"
        {
            return Err(bad());
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        TimeOfDay::hm(hour, minute).ok_or_else(bad)
    }
}

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Span {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> Minutes {
        self.end.minutes() - self.start.minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}–{}", self.start, self.end)
    }
}

/// The key that scopes one reservation set and one feed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CourtDay {
    pub court_id: Ulid,
    pub date: NaiveDate,
}

impl CourtDay {
    pub fn new(court_id: Ulid, date: NaiveDate) -> Self {
        Self { court_id, date }
    }
}

impl fmt::Display for CourtDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.court_id, self.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    Tennis,
    Padel,
}

impl Discipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Discipline::Tennis => "tennis",
            Discipline::Padel => "padel",
        }
    }
}

impl FromStr for Discipline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tennis" => Ok(Discipline::Tennis),
            "padel" => Ok(Discipline::Padel),
            other => Err(format!("unknown discipline: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub name: String,
    pub discipline: Discipline,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: UserId,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: NaiveDateTime,
}

impl Reservation {
    pub fn key(&self) -> CourtDay {
        CourtDay::new(self.court_id, self.date)
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Local date-time at which play starts.
    pub fn starts_at(&self) -> NaiveDateTime {
        let minutes = self.span.start.minutes();
        self.date.and_hms_opt(0, 0, 0).unwrap_or_default()
            + chrono::Duration::minutes(i64::from(minutes))
    }
}

/// A reservation row as submitted for insertion; the store assigns id, status and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub user_id: UserId,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

impl NewReservation {
    pub fn key(&self) -> CourtDay {
        CourtDay::new(self.court_id, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub email: String,
    pub street: String,
    pub full_name: Option<String>,
    pub club_card_verified: bool,
    pub created_at: NaiveDateTime,
}

/// Values used when a profile has to be provisioned on first booking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileDefaults {
    pub email: String,
    pub full_name: Option<String>,
}

/// All reservation rows (active and cancelled) of one court on one date,
/// sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DaySheet {
    pub key: CourtDay,
    pub reservations: Vec<Reservation>,
}

impl DaySheet {
    pub fn new(key: CourtDay) -> Self {
        Self {
            key,
            reservations: Vec::new(),
        }
    }

    /// Insert a row maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }

    /// Active rows whose span intersects `query`.
    /// Uses binary search to skip rows starting at or after `query.end`.
    pub fn overlapping_active(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.span.end > query.start)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtCreated {
        id: Ulid,
        name: String,
        discipline: Discipline,
        created_at: NaiveDateTime,
    },
    ProfileCreated {
        id: UserId,
        email: String,
        full_name: Option<String>,
        created_at: NaiveDateTime,
    },
    ReservationInserted {
        id: Ulid,
        user_id: UserId,
        court_id: Ulid,
        date: NaiveDate,
        span: Span,
        created_at: NaiveDateTime,
    },
    ReservationStatusChanged {
        id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        status: ReservationStatus,
    },
}

// ── Change feed ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One notification on the live feed. Carries only what a viewer needs
/// to decide whether its cached reservation set went stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationChange {
    pub op: ChangeOp,
    pub reservation_id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    /// Status after the change.
    pub status: ReservationStatus,
}

impl ReservationChange {
    pub fn key(&self) -> CourtDay {
        CourtDay::new(self.court_id, self.date)
    }
}
