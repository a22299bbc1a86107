//! Middleware module
//!
//! Per-event concerns applied before flow logic runs: tracing and duplicate detection.

pub mod idempotency;
pub mod trace;

// Re-export commonly used middleware
pub use idempotency::{fallback_event_id, IdempotencyGuard};
pub use trace::{OperationRecord, TraceContext, TraceSummary};
