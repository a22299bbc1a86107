//! Flow handlers module
//!
//! Implementations of [`crate::services::conversation::FlowHandler`] that ship
//! with the crate.

pub mod collector;

pub use collector::StepCollectorHandler;
