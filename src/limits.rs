use crate::model::Minutes;

/// Maximum number of courts a club may register.
pub const MAX_COURTS: usize = 1_000;

/// Maximum court name length in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Maximum active rows in one (court, date) sheet. Cancelled rows do not count.
pub const MAX_RESERVATIONS_PER_DAY: usize = 512;

/// Longest reservation the store accepts: two 90-minute slots.
pub const MAX_BOOKING_MINUTES: Minutes = 180;

/// Most slots a member may select for one reservation.
pub const MAX_SELECTED_SLOTS: usize = 2;

/// Maximum concurrent LISTEN channels per connection.
pub const MAX_LISTENS_PER_CONNECTION: usize = 64;

/// Upper bound on the booking window, in days.
pub const MAX_BOOKING_WINDOW_DAYS: u32 = 90;

/// Maximum profile email / name length in bytes.
pub const MAX_PROFILE_FIELD_LEN: usize = 320;
