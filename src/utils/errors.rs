//! Error handling for Conversa
//!
//! This module defines the main error type used throughout the crate
//! and provides a unified error handling strategy.

use thiserror::Error;

/// Main error type for Conversa
#[derive(Error, Debug)]
pub enum ConversaError {
    #[error("Invalid transition in flow {flow}: {from} -> {to} (allowed: {})", .allowed.join(", "))]
    InvalidTransition {
        flow: String,
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    #[error("Step {flow}.{step} is missing payload fields: {}", .missing.join(", "))]
    MissingPayloadField {
        flow: String,
        step: String,
        missing: Vec<String>,
    },

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Unknown step {step} for flow {flow}")]
    UnknownStep { flow: String, step: String },

    #[error("Tenant could not be resolved from request")]
    TenantUnresolved,

    #[error("Durable persistence failure: {0}")]
    DurablePersistenceFailure(String),

    #[error("Invalid configuration for tenant {tenant_id}: {}", .errors.join("; "))]
    ConfigValidation {
        tenant_id: String,
        errors: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for Conversa operations
pub type Result<T> = std::result::Result<T, ConversaError>;

impl ConversaError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConversaError::InvalidTransition { .. } => true,
            ConversaError::MissingPayloadField { .. } => true,
            ConversaError::UnknownFlow(_) => false,
            ConversaError::UnknownStep { .. } => false,
            ConversaError::TenantUnresolved => false,
            ConversaError::DurablePersistenceFailure(_) => true,
            ConversaError::ConfigValidation { .. } => false,
            ConversaError::Config(_) => false,
            ConversaError::Redis(_) => true,
            ConversaError::Serialization(_) => false,
            ConversaError::Io(_) => true,
            ConversaError::UrlParse(_) => false,
            ConversaError::Toml(_) => false,
            ConversaError::Timeout(_) => true,
            ConversaError::InvalidInput(_) => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConversaError::Config(_) => ErrorSeverity::Critical,
            ConversaError::ConfigValidation { .. } => ErrorSeverity::Critical,
            ConversaError::InvalidTransition { .. } => ErrorSeverity::Warning,
            ConversaError::MissingPayloadField { .. } => ErrorSeverity::Warning,
            ConversaError::DurablePersistenceFailure(_) => ErrorSeverity::Warning,
            ConversaError::Timeout(_) => ErrorSeverity::Warning,
            ConversaError::TenantUnresolved => ErrorSeverity::Warning,
            ConversaError::InvalidInput(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// Whether the error is a flow validation rejection that leaves the session untouched
    pub fn is_transition_rejection(&self) -> bool {
        matches!(
            self,
            ConversaError::InvalidTransition { .. }
                | ConversaError::MissingPayloadField { .. }
                | ConversaError::UnknownStep { .. }
        )
    }

    /// Short machine-readable code, used in traces
    pub fn code(&self) -> &'static str {
        match self {
            ConversaError::InvalidTransition { .. } => "invalid_transition",
            ConversaError::MissingPayloadField { .. } => "missing_payload_field",
            ConversaError::UnknownFlow(_) => "unknown_flow",
            ConversaError::UnknownStep { .. } => "unknown_step",
            ConversaError::TenantUnresolved => "tenant_unresolved",
            ConversaError::DurablePersistenceFailure(_) => "durable_persistence_failure",
            ConversaError::ConfigValidation { .. } => "config_validation",
            ConversaError::Config(_) => "config",
            ConversaError::Redis(_) => "redis",
            ConversaError::Serialization(_) => "serialization",
            ConversaError::Io(_) => "io",
            ConversaError::UrlParse(_) => "url_parse",
            ConversaError::Toml(_) => "toml",
            ConversaError::Timeout(_) => "timeout",
            ConversaError::InvalidInput(_) => "invalid_input",
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARN"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}
