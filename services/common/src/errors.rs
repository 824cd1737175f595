//! Errors raised while constructing shared primitives

use thiserror::Error;

/// Validation error for primitive types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// Decimal string could not be parsed
    #[error("Invalid decimal '{input}': {reason}")]
    InvalidDecimal {
        /// Offending input
        input: String,
        /// Why parsing failed
        reason: &'static str,
    },

    /// Symbol failed validation
    #[error("Invalid symbol '{0}'")]
    InvalidSymbol(String),
}
