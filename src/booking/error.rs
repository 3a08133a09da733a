use ulid::Ulid;

use crate::engine::StoreError;

/// Outcome kinds the booking core reports to its callers. Storage errors
/// are translated into one of these at the component boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    /// Bad input caught before reaching storage.
    #[error("{0}")]
    Validation(String),
    /// The requested time intersects an active reservation.
    #[error("slot no longer available, choose a different time")]
    Conflict { with: Option<Ulid> },
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("reservation {0} belongs to another member")]
    Forbidden(Ulid),
    /// Store unavailable. Safe for the caller to retry; nothing retries automatically.
    #[error("temporarily unavailable, please retry: {0}")]
    Transient(String),
    #[error("session expired, please sign in again")]
    AuthExpired,
}

impl BookingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BookingError::Validation(msg.into())
    }

    /// Translate a store failure. Only the store's own exclusion violation
    /// becomes `Conflict`.
    pub fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(id) => BookingError::Conflict { with: Some(id) },
            StoreError::NotFound(id) => BookingError::NotFound(id),
            StoreError::InvalidSpan(span) => BookingError::Validation(format!("invalid time range {span}")),
            StoreError::InvalidTransition { from, to } => BookingError::Validation(format!(
                "cannot change a {} reservation to {}",
                from.as_str(),
                to.as_str()
            )),
            StoreError::LimitExceeded(what) => BookingError::Validation(what.to_string()),
            StoreError::AlreadyExists(id) => BookingError::Validation(format!("already exists: {id}")),
            StoreError::WalError(msg) => BookingError::Transient(msg),
        }
    }

    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "22023",
            BookingError::Conflict { .. } => "23P01",
            BookingError::NotFound(_) => "02000",
            BookingError::Forbidden(_) => "42501",
            BookingError::Transient(_) => "08006",
            BookingError::AuthExpired => "28000",
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::Conflict { .. } => "conflict",
            BookingError::NotFound(_) => "not_found",
            BookingError::Forbidden(_) => "forbidden",
            BookingError::Transient(_) => "transient",
            BookingError::AuthExpired => "auth_expired",
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        BookingError::from_store(err)
    }
}
