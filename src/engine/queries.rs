use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    /// All courts, ordered by name.
    pub fn list_courts(&self) -> Vec<Court> {
        let mut courts: Vec<Court> = self.courts.iter().map(|e| e.value().clone()).collect();
        courts.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        courts
    }

    pub fn get_court(&self, id: &Ulid) -> Option<Court> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn get_profile(&self, id: &UserId) -> Option<Profile> {
        self.profiles.get(id).map(|e| e.value().clone())
    }

    /// Active reservations of one court on one date, ordered by start.
    pub async fn active_reservations(&self, court_id: Ulid, date: NaiveDate) -> Vec<Reservation> {
        let Some(sheet) = self.existing_sheet(&CourtDay::new(court_id, date)) else {
            return Vec::new();
        };
        let guard = sheet.read().await;
        guard.active().cloned().collect()
    }

    /// Every active reservation across all courts and dates,
    /// ordered by date, then start, then court.
    pub async fn all_active_reservations(&self) -> Vec<Reservation> {
        let sheets: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for sheet in sheets {
            let guard = sheet.read().await;
            out.extend(guard.active().cloned());
        }
        out.sort_by_key(|r| (r.date, r.span.start, r.court_id));
        out
    }

    /// All reservations of one member in any status, ordered by date then start.
    pub async fn user_reservations(&self, user: UserId) -> Vec<Reservation> {
        let sheets: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for sheet in sheets {
            let guard = sheet.read().await;
            out.extend(guard.reservations.iter().filter(|r| r.user_id == user).cloned());
        }
        out.sort_by_key(|r| (r.date, r.span.start));
        out
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let key = self.reservation_index.get(id).map(|e| *e.value())?;
        let sheet = self.existing_sheet(&key)?;
        let guard = sheet.read().await;
        guard.get(id).cloned()
    }

    pub fn court_count(&self) -> usize {
        self.courts.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_index.len()
    }
}
