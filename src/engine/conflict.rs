use crate::limits::*;
use crate::model::*;

use super::StoreError;

pub(crate) fn validate_span(span: &Span) -> Result<(), StoreError> {
    if span.start >= span.end || span.end.minutes() > MINUTES_PER_DAY {
        return Err(StoreError::InvalidSpan(*span));
    }
    if span.duration_minutes() > MAX_BOOKING_MINUTES {
        return Err(StoreError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// The exclusion constraint: no two active rows of one sheet may intersect.
/// Caller holds the sheet's write lock.
pub(crate) fn check_no_conflict(sheet: &DaySheet, span: &Span) -> Result<(), StoreError> {
    match sheet.overlapping_active(span).next() {
        Some(existing) => Err(StoreError::Conflict(existing.id)),
        None => Ok(()),
    }
}
