/// Upper bound on `days` for a listing and on how far ahead a booking may land.
pub const MAX_HORIZON_DAYS: u32 = 60;
pub const DEFAULT_HORIZON_DAYS: u32 = 14;

pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_BOOKINGS_PER_HOST: usize = 100_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_FIELD_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 4_000;
pub const MAX_SLUG_LEN: usize = 128;
