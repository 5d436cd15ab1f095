use crate::model::Ms;

pub const MAX_HOSTS: usize = 10_000;
pub const MAX_EVENT_TYPES: usize = 10_000;
pub const MAX_RULES_PER_HOST: usize = 256;
pub const MAX_EXCEPTIONS_PER_HOST: usize = 4_096;
pub const MAX_RANGES_PER_EXCEPTION: usize = 32;
pub const MAX_ELIGIBLE_HOSTS: usize = 256;
pub const MAX_BOOKINGS_PER_HOST: usize = 1_000_000;
pub const MAX_ATTENDEES: u32 = 1_000;
pub const MAX_SERIES_LEN: u32 = 104;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_INVITEE_LEN: usize = 4_096;
pub const MAX_LOCATION_LEN: usize = 1_024;
pub const MAX_REASON_LEN: usize = 4_096;

pub const MAX_DURATION_MIN: u32 = 24 * 60;
pub const MAX_BUFFER_MIN: u32 = 24 * 60;
pub const MAX_NOTICE_MIN: u32 = 365 * 24 * 60;
pub const MAX_HORIZON_DAYS: u32 = 730;
pub const MAX_LOAD_WINDOW_DAYS: u32 = 366;

/// Widest slot listing, in display-timezone days.
pub const MAX_QUERY_DAYS: i64 = 93;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest request line accepted by the protocol, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
