//! Data models module
//!
//! Inbound events, request descriptors and tenant configuration.

pub mod event;
pub mod request;
pub mod tenant;

// Re-export commonly used models
pub use event::{InboundEvent, MessageContent};
pub use request::RequestDescriptor;
pub use tenant::TenantConfig;
