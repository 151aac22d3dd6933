//! Process-wide tracing setup shared by workers and tests.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogFormat, init, init_for_tests, init_with};
