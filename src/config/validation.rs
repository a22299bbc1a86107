//! Configuration validation module
//!
//! This module provides validation functions for application configuration
//! to ensure all required settings are properly configured. Sections are
//! checked in order and the first problem found is reported.

use super::Settings;
use crate::models::TenantConfig;
use crate::utils::errors::{ConversaError, Result};

/// Validate all configuration settings
pub fn validate_settings(settings: &Settings) -> Result<()> {
    validate_session_config(&settings.session)?;
    validate_tenants_config(&settings.tenants)?;
    validate_conversation_config(&settings.conversation)?;
    validate_logging_config(&settings.logging)?;

    if settings.mirror.enabled {
        validate_mirror_config(&settings.mirror)?;
        validate_redis_config(&settings.redis)?;
    }

    Ok(())
}

/// Validate session lifetime configuration
fn validate_session_config(config: &super::SessionConfig) -> Result<()> {
    if config.timeout_seconds == 0 {
        return Err(ConversaError::Config(
            "Session timeout must be greater than 0".to_string(),
        ));
    }

    if config.warning_seconds >= config.timeout_seconds {
        return Err(ConversaError::Config(
            "Inactivity warning must fire before the session timeout".to_string(),
        ));
    }

    if config.sweep_interval_seconds == 0 {
        return Err(ConversaError::Config(
            "Sweep interval must be greater than 0".to_string(),
        ));
    }

    if config.history_limit == 0 {
        return Err(ConversaError::Config(
            "History limit must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate mirror queue configuration
fn validate_mirror_config(config: &super::MirrorConfig) -> Result<()> {
    if config.queue_capacity == 0 {
        return Err(ConversaError::Config(
            "Mirror queue capacity must be greater than 0".to_string(),
        ));
    }

    if config.write_timeout_ms == 0 {
        return Err(ConversaError::Config(
            "Mirror write timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate Redis configuration
fn validate_redis_config(config: &super::RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(ConversaError::Config("Redis URL is required".to_string()));
    }

    if config.ttl_seconds == 0 {
        return Err(ConversaError::Config(
            "Redis TTL must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate tenant resolution configuration
fn validate_tenants_config(config: &super::TenantsConfig) -> Result<()> {
    if config.default_tenant_id.trim().is_empty() {
        return Err(ConversaError::Config(
            "Default tenant id is required".to_string(),
        ));
    }

    if config.cache_ttl_seconds == 0 {
        return Err(ConversaError::Config(
            "Tenant cache TTL must be greater than 0".to_string(),
        ));
    }

    if config.load_timeout_ms == 0 {
        return Err(ConversaError::Config(
            "Tenant load timeout must be greater than 0".to_string(),
        ));
    }

    if config.header_name.is_empty() || config.query_param.is_empty() {
        return Err(ConversaError::Config(
            "Tenant header and query parameter names are required".to_string(),
        ));
    }

    // The default tenant is served as-is, so it has to be usable on its own
    TenantConfig::from_overrides(&config.defaults, &config.default_tenant_id, None)?;

    Ok(())
}

/// Validate keyword tables
fn validate_conversation_config(config: &super::ConversationConfig) -> Result<()> {
    if config.menu_options.is_empty() {
        return Err(ConversaError::Config(
            "At least one menu option must be configured".to_string(),
        ));
    }

    if config.greetings.iter().any(|g| g.trim().is_empty()) {
        return Err(ConversaError::Config(
            "Greeting keywords cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validate logging configuration
fn validate_logging_config(config: &super::LoggingConfig) -> Result<()> {
    if config.level.is_empty() {
        return Err(ConversaError::Config("Log level is required".to_string()));
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.level.as_str()) {
        return Err(ConversaError::Config(format!(
            "Invalid log level: {}. Valid levels: {:?}",
            config.level, valid_levels
        )));
    }

    Ok(())
}
