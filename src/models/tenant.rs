//! Tenant configuration model
//!
//! A tenant's configuration is its overrides deep-merged onto the shared
//! defaults, then validated. The conversational core only reads the enabled
//! flows and feature flags; the remaining sections are carried for the
//! external collaborators (channel adapter, completion provider, record stores).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::FlowType;
use crate::utils::errors::{ConversaError, Result};

/// Full configuration of one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub name: String,
    pub channel: ChannelSettings,
    pub ai: AiSettings,
    pub storage: StorageSettings,
    pub records: RecordsSettings,
    pub bot: BotSettings,
    pub enabled_flows: Vec<FlowType>,
    pub messages: MessageSettings,
    pub features: BTreeMap<String, bool>,
    pub limits: LimitSettings,
    pub escalation: EscalationSettings,
}

/// Messaging channel credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub business_account_id: String,
    pub phone_number_id: String,
    pub api_token: String,
    pub webhook_token: String,
}

/// Completion provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Profile memory store settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub project_id: String,
    pub database_url: String,
    pub credentials_path: String,
}

/// Business record store settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsSettings {
    pub enabled: bool,
    pub spreadsheet_id: Option<String>,
    pub credentials_path: Option<String>,
}

/// Bot behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    pub language: String,
    pub timezone: String,
    pub response_delay_ms: u64,
    pub max_retries: u32,
    pub enable_tracing: bool,
    pub enable_memory: bool,
}

/// Tenant-specific copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    pub welcome: String,
    pub error_generic: String,
    pub error_rate_limit: String,
    pub handoff_reason: String,
    pub main_menu: String,
    pub restart_hint: String,
    pub resume_found: String,
    pub resume_empty: String,
    pub flow_unavailable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub messages_per_hour: u32,
    pub max_conversation_length: u32,
    pub quotation_expiry_days: u32,
}

/// Human handoff routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    pub enabled_teams: Vec<String>,
    pub default_team: String,
    pub routing_rules: BTreeMap<String, String>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        let features = [
            ("quotation_engine", true),
            ("appointment_booking", true),
            ("records_integration", false),
            ("memory_system", true),
            ("memory_persistent", false),
            ("quotation_ai", false),
            ("opportunity_detection", false),
            ("sales_agent", false),
            ("dashboard", false),
        ]
        .into_iter()
        .map(|(name, enabled)| (name.to_string(), enabled))
        .collect();

        Self {
            tenant_id: "default".to_string(),
            name: "Default Tenant".to_string(),
            channel: ChannelSettings::default(),
            ai: AiSettings::default(),
            storage: StorageSettings::default(),
            records: RecordsSettings::default(),
            bot: BotSettings::default(),
            enabled_flows: FlowType::ALL.to_vec(),
            messages: MessageSettings::default(),
            features,
            limits: LimitSettings::default(),
            escalation: EscalationSettings::default(),
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            language: "es".to_string(),
            timezone: "Europe/Madrid".to_string(),
            response_delay_ms: 0,
            max_retries: 3,
            enable_tracing: true,
            enable_memory: true,
        }
    }
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            welcome: "¡Hola! ¿Cómo te puedo ayudar?".to_string(),
            error_generic: "Disculpa, hubo un error. Reintenta en unos segundos.".to_string(),
            error_rate_limit: "Estoy recibiendo muchos mensajes. Intenta en 1 minuto.".to_string(),
            handoff_reason: "Te estoy conectando con un agente. Aguarda un momento.".to_string(),
            main_menu: "Selecciona una opción:\n1. Agendar reunión\n2. Solicitar cotización\n3. Hacer consulta".to_string(),
            restart_hint: "Parece que tu sesión anterior se cerró. Escribe *hola* para comenzar de nuevo.".to_string(),
            resume_found: "Listo, retomamos donde lo dejamos. ¿Qué te gustaría preguntar?".to_string(),
            resume_empty: "No encontré conversación previa, igual te escucho. ¿Qué te gustaría preguntar?".to_string(),
            flow_unavailable: "Esa opción no está disponible por ahora.".to_string(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            messages_per_hour: 100,
            max_conversation_length: 500,
            quotation_expiry_days: 7,
        }
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        let routing_rules = [("urgent", "vip_team"), ("complaint", "support")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            enabled_teams: vec!["sales".to_string(), "support".to_string()],
            default_team: "sales".to_string(),
            routing_rules,
        }
    }
}

impl TenantConfig {
    /// Build a tenant's configuration from defaults and optional overrides.
    ///
    /// Objects merge recursively; scalars and arrays in the overrides replace
    /// the default. The tenant id is always the requested one.
    pub fn from_overrides(defaults: &TenantConfig, tenant_id: &str, overrides: Option<Value>) -> Result<Self> {
        let mut merged = serde_json::to_value(defaults)?;
        if let Some(overrides) = overrides {
            deep_merge(&mut merged, overrides);
        }
        if let Value::Object(map) = &mut merged {
            map.insert("tenant_id".to_string(), Value::String(tenant_id.to_string()));
        }

        let config: TenantConfig = serde_json::from_value(merged).map_err(|e| ConversaError::ConfigValidation {
            tenant_id: tenant_id.to_string(),
            errors: vec![e.to_string()],
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation; collects every problem before failing
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.tenant_id.trim().is_empty() {
            errors.push("tenant_id is required".to_string());
        }
        if self.channel.api_token.is_empty() {
            errors.push("channel.api_token is required".to_string());
        }
        if self.ai.api_key.is_empty() {
            errors.push("ai.api_key is required".to_string());
        }
        if !(0.0..=1.0).contains(&self.ai.temperature) {
            errors.push("ai.temperature must be between 0 and 1".to_string());
        }
        if self.ai.max_tokens == 0 {
            errors.push("ai.max_tokens must be greater than 0".to_string());
        }
        if self.limits.quotation_expiry_days < 1 {
            errors.push("limits.quotation_expiry_days must be >= 1".to_string());
        }
        if self.records.enabled && self.records.spreadsheet_id.as_deref().map_or(true, str::is_empty) {
            errors.push("records.spreadsheet_id is required when records are enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConversaError::ConfigValidation {
                tenant_id: self.tenant_id.clone(),
                errors,
            })
        }
    }

    pub fn is_flow_enabled(&self, flow: FlowType) -> bool {
        self.enabled_flows.contains(&flow)
    }

    /// Unknown features count as disabled
    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        self.features.get(feature).copied().unwrap_or(false)
    }

    pub fn feature_or(&self, feature: &str, default: bool) -> bool {
        self.features.get(feature).copied().unwrap_or(default)
    }

    pub fn enabled_features(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Team a handoff with the given reason tag is routed to
    pub fn escalation_team(&self, reason: Option<&str>) -> &str {
        reason
            .and_then(|r| self.escalation.routing_rules.get(r))
            .map(String::as_str)
            .unwrap_or(&self.escalation.default_team)
    }
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let nested = value.is_object() && target.get(&key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = target.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    target.insert(key, value);
                }
            }
        }
        (target, source) => *target = source,
    }
}
