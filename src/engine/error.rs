use ulid::Ulid;

use crate::model::{ReservationStatus, Span};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Storage-level exclusion: the span intersects this active reservation.
    #[error("conflict with reservation: {0}")]
    Conflict(Ulid),
    #[error("invalid span {0}")]
    InvalidSpan(Span),
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
