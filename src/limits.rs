//! Hard bounds on stored data. Exceeding any of these is a client error,
//! never a panic.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_GUEST_FIELD_LEN: usize = 256;
pub const MAX_RESTRICTIONS_PER_ROOM: usize = 100_000;

/// Longest bookable stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 366;
/// Widest availability/restriction query window, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366 * 5;

/// Sanity bounds on stay years. Dates outside this window are almost
/// certainly client bugs.
pub const MIN_STAY_YEAR: i32 = 2000;
pub const MAX_STAY_YEAR: i32 = 2200;
