//! State management module
//!
//! Flow definitions, per-user sessions, the session store and its durable mirror.

pub mod flows;
pub mod machine;
pub mod session;
pub mod storage;
pub mod store;

// Re-export commonly used state components
pub use flows::{AppointmentStep, AssistantStep, FlowStep, FlowType, HandoffStep, QuotationStep, StepGraph};
pub use machine::{FlowStateMachine, StepInfo};
pub use session::{ActiveFlow, HistoryTurn, InactivityStatus, Payload, Role, Session, SessionSummary};
pub use storage::{MemorySessionStorage, MirrorQueue, MirrorStats, MirrorWorker, RedisSessionStorage, SessionPersistence};
pub use store::{
    InactivityNotifier, LoggingNotifier, SessionLease, SessionStats, SessionStore, SessionSweeper, SweepReport,
};
