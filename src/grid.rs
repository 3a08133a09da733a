use crate::model::{Minutes, Span, TimeOfDay};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("slot duration must be positive")]
    ZeroDuration,
    #[error("opening {opening} must be before closing {closing}")]
    Inverted { opening: TimeOfDay, closing: TimeOfDay },
    #[error("no {slot_minutes}-minute slot fits between {opening} and {closing}")]
    NoSlots {
        opening: TimeOfDay,
        closing: TimeOfDay,
        slot_minutes: Minutes,
    },
}

/// The canonical bookable slots of a business day: `opening, opening+d, …`
/// for every start `t` with `t + d <= closing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrid {
    opening: TimeOfDay,
    closing: TimeOfDay,
    slot_minutes: Minutes,
    starts: Vec<TimeOfDay>,
}

impl SlotGrid {
    pub fn new(opening: TimeOfDay, closing: TimeOfDay, slot_minutes: Minutes) -> Result<Self, GridError> {
        if slot_minutes == 0 {
            return Err(GridError::ZeroDuration);
        }
        if opening >= closing {
            return Err(GridError::Inverted { opening, closing });
        }
        let mut starts = Vec::new();
        let mut t = opening;
        while let Some(end) = t.plus(slot_minutes)
            && end <= closing
        {
            starts.push(t);
            t = end;
        }
        if starts.is_empty() {
            return Err(GridError::NoSlots { opening, closing, slot_minutes });
        }
        Ok(Self { opening, closing, slot_minutes, starts })
    }

    pub fn opening(&self) -> TimeOfDay {
        self.opening
    }

    pub fn closing(&self) -> TimeOfDay {
        self.closing
    }

    pub fn slot_minutes(&self) -> Minutes {
        self.slot_minutes
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Slot starts in order. Each call starts over.
    pub fn iter(&self) -> impl Iterator<Item = TimeOfDay> + '_ {
        self.starts.iter().copied()
    }

    pub fn starts(&self) -> &[TimeOfDay] {
        &self.starts
    }

    pub fn index_of(&self, start: TimeOfDay) -> Option<usize> {
        self.starts.binary_search(&start).ok()
    }

    /// The interval a single slot covers: `[s, s + d)`.
    pub fn span_of(&self, index: usize) -> Option<Span> {
        let start = *self.starts.get(index)?;
        Some(Span::new(start, start.plus(self.slot_minutes)?))
    }

    /// Start of the following slot, or closing for the last one.
    pub fn end_of(&self, index: usize) -> TimeOfDay {
        self.starts.get(index + 1).copied().unwrap_or(self.closing)
    }

    /// `[first.start, successor(last).start)` for a run of grid indices.
    pub fn span_between(&self, first: usize, last: usize) -> Option<Span> {
        let start = *self.starts.get(first)?;
        if last < first || last >= self.starts.len() {
            return None;
        }
        Some(Span::new(start, self.end_of(last)))
    }
}

impl Default for SlotGrid {
    /// 08:30–23:30 in 90-minute slots.
    fn default() -> Self {
        Self {
            opening: DEFAULT_OPENING,
            closing: DEFAULT_CLOSING,
            slot_minutes: DEFAULT_SLOT_MINUTES,
            starts: (0..10)
                .filter_map(|i| DEFAULT_OPENING.plus(i * DEFAULT_SLOT_MINUTES))
                .collect(),
        }
    }
}

pub const DEFAULT_OPENING: TimeOfDay = match TimeOfDay::hm(8, 30) {
    Some(t) => t,
    None => TimeOfDay::MIDNIGHT,
};
pub const DEFAULT_CLOSING: TimeOfDay = match TimeOfDay::hm(23, 30) {
    Some(t) => t,
    None => TimeOfDay::MIDNIGHT,
};
pub const DEFAULT_SLOT_MINUTES: Minutes = 90;
