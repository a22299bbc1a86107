//! Conversa
//!
//! Conversational-state core of a multi-tenant chat automation service.
//! This library tracks where each end-user is inside a multi-step dialogue,
//! makes retried inbound events idempotent, and serves per-tenant
//! configuration from a time-bounded cache.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use config::Settings;
pub use utils::errors::{ConversaError, Result};

// Re-export main components for easy access
pub use middleware::{IdempotencyGuard, TraceContext};
pub use services::{ConversationOrchestrator, Outcome, ServiceFactory, TenantResolver};
pub use state::{FlowStateMachine, SessionStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!("{} v{}", NAME, VERSION)
}
