//! Common constants used across all services
//!
//! Single source of truth for magic numbers

// Fixed-point arithmetic constants
/// Number of implied decimal places in `Px` and `Qty`
pub const FIXED_POINT_DECIMALS: u32 = 8;
/// Fixed-point scale factor (8 decimal places)
pub const FIXED_POINT_SCALE: i64 = 100_000_000;
pub const FIXED_POINT_SCALE_F64: f64 = 100_000_000.0;

// Time constants
pub const MILLIS_PER_SEC: i64 = 1000;
pub const SECS_PER_MIN: i64 = 60;
pub const MINS_PER_HOUR: i64 = 60;
pub const HOURS_PER_DAY: i64 = 24;
pub const MILLIS_PER_MIN: i64 = MILLIS_PER_SEC * SECS_PER_MIN;
pub const MILLIS_PER_HOUR: i64 = MILLIS_PER_MIN * MINS_PER_HOUR;
pub const MILLIS_PER_DAY: i64 = MILLIS_PER_HOUR * HOURS_PER_DAY;

// Size constants
pub const BYTES_PER_KB: u64 = 1024;
pub const BYTES_PER_MB: u64 = BYTES_PER_KB * 1024;

// Symbol limits
pub const MAX_SYMBOL_LEN: usize = 32;
