//! Utility modules
//!
//! Error types and logging setup shared across the crate.

pub mod errors;
pub mod logging;

pub use errors::{ConversaError, ErrorSeverity, Result};
