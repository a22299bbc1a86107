//! Application settings management
//!
//! This module defines the configuration structure and provides methods
//! for loading settings from TOML files and environment variables.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::tenant::TenantConfig;
use crate::state::FlowType;

/// Main application configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionConfig,
    pub mirror: MirrorConfig,
    pub redis: RedisConfig,
    pub tenants: TenantsConfig,
    pub conversation: ConversationConfig,
    pub logging: LoggingConfig,
}

/// Session lifetime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is evicted
    pub timeout_seconds: u64,
    /// Idle time after which a single inactivity warning is due
    pub warning_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub history_limit: usize,
}

/// Durable mirror queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
    pub write_timeout_ms: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
    pub ttl_seconds: u64,
}

/// Tenant resolution and config cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantsConfig {
    pub default_tenant_id: String,
    pub allow_default: bool,
    pub cache_ttl_seconds: u64,
    pub load_timeout_ms: u64,
    /// Directory holding `<tenant_id>/config.json` overrides
    pub config_dir: String,
    /// TOML table mapping channel addresses to tenant ids
    pub address_map_path: Option<String>,
    pub header_name: String,
    pub address_header_name: String,
    pub query_param: String,
    pub address_query_param: String,
    /// Base configuration every tenant override is merged onto
    pub defaults: TenantConfig,
}

/// Keyword tables used to classify free-form input
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub greetings: Vec<String>,
    pub escalation_keywords: Vec<String>,
    pub resume_keywords: Vec<String>,
    /// Menu option text or selection id to the flow it starts
    pub menu_options: BTreeMap<String, FlowType>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub json: bool,
}

impl Settings {
    /// Load settings from configuration file and environment variables
    pub fn new() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("CONVERSA").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), crate::utils::errors::ConversaError> {
        super::validation::validate_settings(self)
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn warning_after(&self) -> Duration {
        Duration::from_secs(self.warning_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl MirrorConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl TenantsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 15 * 60,
            warning_seconds: 5 * 60,
            sweep_interval_seconds: 5 * 60,
            history_limit: 50,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: 1024,
            write_timeout_ms: 2_000,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            prefix: "conversa:".to_string(),
            ttl_seconds: 24 * 3600,
        }
    }
}

impl Default for TenantsConfig {
    fn default() -> Self {
        Self {
            default_tenant_id: "default".to_string(),
            allow_default: true,
            cache_ttl_seconds: 60 * 60,
            load_timeout_ms: 3_000,
            config_dir: "tenants".to_string(),
            address_map_path: None,
            header_name: "x-tenant-id".to_string(),
            address_header_name: "x-channel-address".to_string(),
            query_param: "tenant".to_string(),
            address_query_param: "phone".to_string(),
            defaults: TenantConfig::default(),
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect::<Vec<_>>();

        let mut menu_options = BTreeMap::new();
        menu_options.insert("1".to_string(), FlowType::Appointment);
        menu_options.insert("2".to_string(), FlowType::Quotation);
        menu_options.insert("3".to_string(), FlowType::Assistant);
        menu_options.insert("option_agenda".to_string(), FlowType::Appointment);
        menu_options.insert("option_quotation".to_string(), FlowType::Quotation);
        menu_options.insert("option_question".to_string(), FlowType::Assistant);

        Self {
            greetings: words(&["hola", "hello", "hi", "buenos", "buenas", "hey", "ey", "que onda"]),
            escalation_keywords: words(&["asesor", "humano", "agente", "persona", "especialista"]),
            resume_keywords: words(&["continuar", "retomar"]),
            menu_options,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json: false,
        }
    }
}
