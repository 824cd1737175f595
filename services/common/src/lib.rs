//! Shared primitives for the chart services
//!
//! - Fixed-point price and quantity types
//! - Millisecond timestamps
//! - Validated instrument symbols
//! - Tracing bootstrap

pub mod constants;
pub mod errors;
pub mod fixed_point;
pub mod logging;
pub mod symbol;
pub mod time;

pub use constants::*;
pub use errors::*;
pub use fixed_point::{Px, Qty};
pub use logging::init_tracing;
pub use symbol::Symbol;
pub use time::TimestampMs;
