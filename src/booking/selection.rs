use crate::grid::SlotGrid;
use crate::limits::MAX_SELECTED_SLOTS;
use crate::model::{Minutes, Span, TimeOfDay};

use super::availability::DayAvailability;
use super::BookingError;

/// The slots a member has picked for one prospective booking, at most two
/// and grid-adjacent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Grid indices, ascending.
    picked: Vec<usize>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a selection from explicit slot starts, as submitted in one
    /// request. Rejects anything the toggle rules could not produce.
    pub fn from_slots(grid: &SlotGrid, slots: &[TimeOfDay]) -> Result<Self, BookingError> {
        if slots.is_empty() {
            return Err(BookingError::validation("select at least one slot"));
        }
        if slots.len() > MAX_SELECTED_SLOTS {
            return Err(BookingError::validation(format!(
                "at most {MAX_SELECTED_SLOTS} slots per booking"
            )));
        }
        let mut picked = slots
            .iter()
            .map(|s| {
                grid.index_of(*s)
                    .ok_or_else(|| BookingError::validation(format!("{s} is not a slot start")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        picked.sort_unstable();
        picked.dedup();
        if picked.len() != slots.len() {
            return Err(BookingError::validation("duplicate slot in selection"));
        }
        if let [a, b] = picked[..]
            && b - a != 1
        {
            return Err(BookingError::validation("selected slots must be consecutive"));
        }
        Ok(Self { picked })
    }

    /// Apply one click on `slot`. Slots that are off the grid, past, or
    /// occupied are ignored. Returns whether the selection changed.
    pub fn toggle(&mut self, grid: &SlotGrid, day: &DayAvailability, slot: TimeOfDay) -> bool {
        let Some(index) = grid.index_of(slot) else {
            return false;
        };
        if !day.is_available(slot) {
            return false;
        }
        if let Some(pos) = self.picked.iter().position(|&i| i == index) {
            self.picked.remove(pos);
            return true;
        }
        match self.picked[..] {
            [only] if only.abs_diff(index) == 1 => {
                self.picked.push(index);
                self.picked.sort_unstable();
            }
            // full, or not adjacent: start over from this slot
            _ => self.picked = vec![index],
        }
        true
    }

    /// Drop picked slots that are no longer available. Returns whether
    /// anything was removed.
    pub fn prune(&mut self, grid: &SlotGrid, day: &DayAvailability) -> bool {
        let before = self.picked.len();
        self.picked
            .retain(|&i| grid.starts().get(i).is_some_and(|s| day.is_available(*s)));
        self.picked.len() != before
    }

    pub fn clear(&mut self) {
        self.picked.clear();
    }

    pub fn len(&self) -> usize {
        self.picked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.picked.is_empty()
    }

    pub fn contains(&self, grid: &SlotGrid, slot: TimeOfDay) -> bool {
        grid.index_of(slot).is_some_and(|i| self.picked.contains(&i))
    }

    /// Picked slot starts, ascending.
    pub fn slots(&self, grid: &SlotGrid) -> Vec<TimeOfDay> {
        self.picked
            .iter()
            .filter_map(|&i| grid.starts().get(i).copied())
            .collect()
    }

    /// The interval a commit would reserve: from the first picked start to
    /// the start of the slot after the last one (or closing).
    pub fn span(&self, grid: &SlotGrid) -> Option<Span> {
        let (first, last) = (*self.picked.first()?, *self.picked.last()?);
        grid.span_between(first, last)
    }

    pub fn duration_minutes(&self, grid: &SlotGrid) -> Minutes {
        self.picked.len() as Minutes * grid.slot_minutes()
    }

    /// Summary such as `16:00 - 17:30 (3 hours)`.
    pub fn label(&self, grid: &SlotGrid) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let labels: Vec<String> = self.slots(grid).iter().map(|s| s.to_string()).collect();
        let hours = f64::from(self.duration_minutes(grid)) / 60.0;
        Some(format!("{} ({hours} hours)", labels.join(" - ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::booking::availability::resolve;
    use crate::model::{Reservation, ReservationStatus};

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn free_day() -> DayAvailability {
        let date = NaiveDate::from_ymd_opt(2025, 6, 11).unwrap();
        let now = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap().and_hms_opt(9, 0, 0).unwrap();
        resolve(&SlotGrid::default(), &[], date, now)
    }

    fn labels(sel: &Selection, grid: &SlotGrid) -> Vec<String> {
        sel.slots(grid).iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn adjacent_pair_is_kept() {
        let grid = SlotGrid::default();
        let day = free_day();
        let mut sel = Selection::new();
        assert!(sel.toggle(&grid, &day, t("17:30")));
        assert!(sel.toggle(&grid, &day, t("16:00")));
        assert_eq!(labels(&sel, &grid), vec!["16:00", "17:30"]);
        assert_eq!(sel.span(&grid), Some(Span::new(t("16:00"), t("19:00"))));
        assert_eq!(sel.duration_minutes(&grid), 180);
    }

    #[test]
    fn non_adjacent_restarts() {
        let grid = SlotGrid::default();
        let day = free_day();
        let mut sel = Selection::new();
        sel.toggle(&grid, &day, t("08:30"));
        sel.toggle(&grid, &day, t("11:30"));
        assert_eq!(labels(&sel, &grid), vec!["11:30"]);
    }

    #[test]
    fn third_pick_resets() {
        let grid = SlotGrid::default();
        let day = free_day();
        let mut sel = Selection::new();
        sel.toggle(&grid, &day, t("08:30"));
        sel.toggle(&grid, &day, t("10:00"));
        sel.toggle(&grid, &day, t("13:00"));
        assert_eq!(labels(&sel, &grid), vec!["13:00"]);
        // adjacent to one of a full pair still resets
        sel.toggle(&grid, &day, t("14:30"));
        sel.toggle(&grid, &day, t("16:00"));
        assert_eq!(labels(&sel, &grid), vec!["16:00"]);
    }

    #[test]
    fn toggling_selected_slot_removes_it() {
        let grid = SlotGrid::default();
        let day = free_day();
        let mut sel = Selection::new();
        sel.toggle(&grid, &day, t("10:00"));
        sel.toggle(&grid, &day, t("11:30"));
        sel.toggle(&grid, &day, t("10:00"));
        assert_eq!(labels(&sel, &grid), vec!["11:30"]);
        sel.toggle(&grid, &day, t("11:30"));
        assert!(sel.is_empty());
        assert_eq!(sel.span(&grid), None);
    }

    #[test]
    fn unavailable_slots_ignored() {
        let grid = SlotGrid::default();
        let date = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let now = date.and_hms_opt(14, 45, 0).unwrap();
        let taken = Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            court_id: Ulid::new(),
            date,
            span: Span::new(t("16:00"), t("17:30")),
            status: ReservationStatus::Active,
            created_at: now,
        };
        let day = resolve(&grid, &[taken], date, now);
        let mut sel = Selection::new();
        assert!(!sel.toggle(&grid, &day, t("14:30")), "past");
        assert!(!sel.toggle(&grid, &day, t("16:00")), "occupied");
        assert!(!sel.toggle(&grid, &day, t("16:15")), "off grid");
        assert!(sel.is_empty());
    }

    #[test]
    fn prune_drops_slots_taken_meanwhile() {
        let grid = SlotGrid::default();
        let day = free_day();
        let mut sel = Selection::new();
        sel.toggle(&grid, &day, t("19:00"));
        sel.toggle(&grid, &day, t("20:30"));

        let date = NaiveDate::from_ymd_opt(2025, 6, 11).unwrap();
        let now = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let taken = Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            court_id: Ulid::new(),
            date,
            span: Span::new(t("20:30"), t("22:00")),
            status: ReservationStatus::Active,
            created_at: now,
        };
        let later = resolve(&grid, &[taken], date, now);
        assert!(sel.prune(&grid, &later));
        assert_eq!(labels(&sel, &grid), vec!["19:00"]);
        assert!(!sel.prune(&grid, &later));
    }

    #[test]
    fn label_summarises_selection() {
        let grid = SlotGrid::default();
        let day = free_day();
        let mut sel = Selection::new();
        assert_eq!(sel.label(&grid), None);
        sel.toggle(&grid, &day, t("16:00"));
        assert_eq!(sel.label(&grid).unwrap(), "16:00 (1.5 hours)");
        sel.toggle(&grid, &day, t("17:30"));
        assert_eq!(sel.label(&grid).unwrap(), "16:00 - 17:30 (3 hours)");
    }

    #[test]
    fn from_slots_validates() {
        let grid = SlotGrid::default();
        let sel = Selection::from_slots(&grid, &[t("17:30"), t("16:00")]).unwrap();
        assert_eq!(labels(&sel, &grid), vec!["16:00", "17:30"]);

        for bad in [
            vec![],
            vec![t("08:30"), t("11:30")],
            vec![t("08:30"), t("10:00"), t("11:30")],
            vec![t("16:15")],
            vec![t("16:00"), t("16:00")],
        ] {
            assert!(
                matches!(Selection::from_slots(&grid, &bad), Err(BookingError::Validation(_))),
                "{bad:?}"
            );
        }
    }
}
