//! Fixed-point price and quantity types
//!
//! Values are stored as `i64` with eight implied decimal places so that
//! aggregation never touches floating point. Conversion from `f64` exists
//! for external feeds only.

use crate::constants::{FIXED_POINT_DECIMALS, FIXED_POINT_SCALE, FIXED_POINT_SCALE_F64};
use crate::errors::TypeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scale an `f64` into fixed-point ticks, clamping to the `i64` range
fn scale_f64(value: f64) -> i64 {
    const MAX_SAFE: f64 = 9_223_372_036_854_775_807.0;
    const MIN_SAFE: f64 = -9_223_372_036_854_775_808.0;

    let scaled = (value * FIXED_POINT_SCALE_F64).round();
    if scaled.is_nan() {
        0
    } else if scaled >= MAX_SAFE {
        i64::MAX
    } else if scaled <= MIN_SAFE {
        i64::MIN
    } else {
        #[allow(clippy::cast_possible_truncation)]
        // SAFETY: bounds checked above
        let result = scaled as i64;
        result
    }
}

/// Parse an exact decimal string ("123.45", "-0.5", "7") into ticks
fn parse_decimal(input: &str) -> Result<i64, TypeError> {
    let invalid = |reason| TypeError::InvalidDecimal {
        input: input.to_string(),
        reason,
    };

    let trimmed = input.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let (whole, frac) = match digits.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (digits, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(invalid("no digits"));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("unexpected character"));
    }
    // SAFETY: u32 to usize widening
    if frac.len() > FIXED_POINT_DECIMALS as usize {
        return Err(invalid("too many decimal places"));
    }

    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid("out of range"))?
    };

    let mut frac_value: i64 = 0;
    for b in frac.bytes() {
        frac_value = frac_value * 10 + i64::from(b - b'0');
    }
    // SAFETY: frac.len() <= FIXED_POINT_DECIMALS, fits in u32
    let padding = FIXED_POINT_DECIMALS - frac.len() as u32;
    frac_value *= 10_i64.pow(padding);

    let ticks = whole_value
        .checked_mul(FIXED_POINT_SCALE)
        .and_then(|w| w.checked_add(frac_value))
        .ok_or_else(|| invalid("out of range"))?;

    Ok(if negative { -ticks } else { ticks })
}

/// Render ticks as a decimal string without trailing zeros
fn format_ticks(ticks: i64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let sign = if ticks < 0 { "-" } else { "" };
    let abs = ticks.unsigned_abs();
    // SAFETY: FIXED_POINT_SCALE is positive
    let scale = FIXED_POINT_SCALE as u64;
    let whole = abs / scale;
    let frac = abs % scale;

    if frac == 0 {
        return write!(f, "{sign}{whole}");
    }

    let width = FIXED_POINT_DECIMALS as usize;
    let digits = format!("{frac:0width$}");
    write!(f, "{sign}{whole}.{}", digits.trim_end_matches('0'))
}

/// Price type (stored as i64 ticks, 8 decimal places)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(i64);

impl Px {
    /// Zero price
    pub const ZERO: Self = Self(0);

    /// Create a price from an `f64`
    /// For external feed compatibility only - prefer `from_i64` or `FromStr`
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self(scale_f64(value))
    }

    /// Create from whole units
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units * FIXED_POINT_SCALE)
    }

    /// Create from i64 ticks
    #[must_use]
    pub const fn from_i64(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Get price as i64 ticks
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Get price as f64 for external APIs only
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.0 as f64 / FIXED_POINT_SCALE_F64
        }
    }

    /// True if the price is strictly positive
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl FromStr for Px {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_decimal(s).map(Self)
    }
}

impl fmt::Display for Px {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_ticks(self.0, f)
    }
}

/// Quantity type (stored as i64 units, 8 decimal places)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Qty(i64);

impl Qty {
    /// Zero quantity
    pub const ZERO: Self = Self(0);

    /// Create a quantity from an `f64`
    /// For external feed compatibility only - prefer `from_i64` or `FromStr`
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self(scale_f64(value))
    }

    /// Create from whole units
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units * FIXED_POINT_SCALE)
    }

    /// Create from i64 units
    #[must_use]
    pub const fn from_i64(units: i64) -> Self {
        Self(units)
    }

    /// Get quantity as i64 units
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Get quantity as f64 for external APIs only
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.0 as f64 / FIXED_POINT_SCALE_F64
        }
    }

    /// Check if quantity is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// True if the quantity is below zero
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Add two quantities, saturating at the i64 bounds
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl FromStr for Qty {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_decimal(s).map(Self)
    }
}

impl fmt::Display for Qty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_ticks(self.0, f)
    }
}
