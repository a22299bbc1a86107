//! Tenant resolution and configuration cache
//!
//! Resolution looks at an inbound request through an ordered list of
//! strategies and falls back to the default tenant. Configuration is loaded
//! from a [`TenantConfigSource`], merged onto the shared defaults, validated
//! and cached for a fixed TTL. A cache hit hands out the same `Arc` as the
//! load that filled it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TenantsConfig;
use crate::models::{RequestDescriptor, TenantConfig};
use crate::utils::errors::{ConversaError, Result};
use crate::utils::logging::log_tenant_resolved;

/// Where per-tenant overrides come from
#[async_trait]
pub trait TenantConfigSource: Send + Sync {
    /// Partial configuration for a tenant, or `None` when it has no overrides
    async fn load_overrides(&self, tenant_id: &str) -> Result<Option<Value>>;

    fn name(&self) -> &'static str;
}

/// Reads `<dir>/<tenant_id>/config.json`
#[derive(Debug, Clone)]
pub struct FileTenantSource {
    dir: PathBuf,
}

impl FileTenantSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl TenantConfigSource for FileTenantSource {
    async fn load_overrides(&self, tenant_id: &str) -> Result<Option<Value>> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(ConversaError::InvalidInput(format!("invalid tenant id: {}", tenant_id)));
        }

        let path = self.dir.join(tenant_id).join("config.json");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(tenant_id = tenant_id, path = %path.display(), "No tenant overrides file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let overrides = serde_json::from_str(&content).map_err(|e| ConversaError::ConfigValidation {
            tenant_id: tenant_id.to_string(),
            errors: vec![format!("{}: {}", path.display(), e)],
        })?;
        Ok(Some(overrides))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Resolution strategies in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Header,
    Subdomain,
    Path,
    ChannelAddress,
    Query,
    Default,
}

impl ResolutionStrategy {
    pub const ORDERED: [ResolutionStrategy; 5] = [
        ResolutionStrategy::Header,
        ResolutionStrategy::Subdomain,
        ResolutionStrategy::Path,
        ResolutionStrategy::ChannelAddress,
        ResolutionStrategy::Query,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::Header => "header",
            ResolutionStrategy::Subdomain => "subdomain",
            ResolutionStrategy::Path => "path",
            ResolutionStrategy::ChannelAddress => "channel_address",
            ResolutionStrategy::Query => "query",
            ResolutionStrategy::Default => "default",
        }
    }
}

/// Options for a single resolution
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Overrides the configured fallback policy
    pub allow_default: Option<bool>,
    /// Only try this strategy
    pub only: Option<ResolutionStrategy>,
}

/// A resolved tenant id and how it was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTenant {
    pub tenant_id: String,
    pub strategy: ResolutionStrategy,
}

#[derive(Debug, Clone)]
struct CachedTenant {
    config: Arc<TenantConfig>,
    loaded_at: Instant,
}

/// One cache entry as reported by [`TenantResolver::cache_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct TenantCacheEntry {
    pub tenant_id: String,
    pub age_seconds: u64,
    pub expired: bool,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct TenantCacheStats {
    pub size: usize,
    pub loads: u64,
    pub entries: Vec<TenantCacheEntry>,
}

#[derive(Debug, Deserialize)]
struct AddressMapFile {
    #[serde(default)]
    addresses: HashMap<String, String>,
}

/// Tenant resolver with a TTL cache of validated configuration
pub struct TenantResolver {
    settings: TenantsConfig,
    source: Arc<dyn TenantConfigSource>,
    address_map: RwLock<HashMap<String, String>>,
    path_pattern: Regex,
    cache: DashMap<String, CachedTenant>,
    loading: DashMap<String, Arc<Mutex<()>>>,
    loads: AtomicU64,
    /// Bumped by `invalidate` and `clear`; loads started under an older
    /// generation are served but not cached
    generation: AtomicU64,
}

impl TenantResolver {
    pub fn new(settings: TenantsConfig, source: Arc<dyn TenantConfigSource>) -> Result<Self> {
        let path_pattern = Regex::new(r"/tenant/([A-Za-z0-9_-]+)(?:/|$)")
            .map_err(|e| ConversaError::Config(format!("Invalid tenant path pattern: {}", e)))?;

        Ok(Self {
            settings,
            source,
            address_map: RwLock::new(HashMap::new()),
            path_pattern,
            cache: DashMap::new(),
            loading: DashMap::new(),
            loads: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// Channel address to tenant id table
    pub fn with_address_map(self, map: HashMap<String, String>) -> Self {
        self.replace_address_map(map);
        self
    }

    /// Re-read the address table from `path` and swap it in.
    ///
    /// On error the current table stays in place.
    pub async fn reload_address_map(&self, path: impl AsRef<Path>) -> Result<usize> {
        let map = Self::load_address_map(path).await?;
        Ok(self.replace_address_map(map))
    }

    fn replace_address_map(&self, map: HashMap<String, String>) -> usize {
        let normalized: HashMap<String, String> = map
            .into_iter()
            .map(|(address, tenant)| (normalize_address(&address), tenant))
            .collect();
        let entries = normalized.len();
        *self.address_map.write().unwrap_or_else(|e| e.into_inner()) = normalized;
        entries
    }

    fn mapped_tenant(&self, address: &str) -> Option<String> {
        self.address_map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize_address(address))
            .cloned()
    }

    /// Read an address table from a TOML file with an `[addresses]` section
    pub async fn load_address_map(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let file: AddressMapFile = toml::from_str(&content)?;
        info!(
            path = %path.as_ref().display(),
            entries = file.addresses.len(),
            "Loaded tenant address map"
        );
        Ok(file.addresses)
    }

    pub fn default_tenant_id(&self) -> &str {
        &self.settings.default_tenant_id
    }

    pub fn resolve(&self, request: &RequestDescriptor) -> Result<ResolvedTenant> {
        self.resolve_with(request, ResolveOptions::default())
    }

    pub fn resolve_with(&self, request: &RequestDescriptor, options: ResolveOptions) -> Result<ResolvedTenant> {
        let strategies: &[ResolutionStrategy] = match &options.only {
            Some(strategy) => std::slice::from_ref(strategy),
            None => &ResolutionStrategy::ORDERED,
        };

        for &strategy in strategies {
            if let Some(tenant_id) = self.try_strategy(strategy, request) {
                log_tenant_resolved(&tenant_id, strategy.as_str());
                return Ok(ResolvedTenant { tenant_id, strategy });
            }
        }

        if options.allow_default.unwrap_or(self.settings.allow_default) {
            log_tenant_resolved(&self.settings.default_tenant_id, ResolutionStrategy::Default.as_str());
            return Ok(ResolvedTenant {
                tenant_id: self.settings.default_tenant_id.clone(),
                strategy: ResolutionStrategy::Default,
            });
        }

        warn!(path = %request.path, host = ?request.host, "Tenant could not be resolved");
        Err(ConversaError::TenantUnresolved)
    }

    fn try_strategy(&self, strategy: ResolutionStrategy, request: &RequestDescriptor) -> Option<String> {
        let candidate = match strategy {
            ResolutionStrategy::Header => request.header(&self.settings.header_name).map(str::to_string),
            ResolutionStrategy::Subdomain => request.hostname().and_then(subdomain_tenant),
            ResolutionStrategy::Path => self
                .path_pattern
                .captures(&request.path)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
            ResolutionStrategy::ChannelAddress => request
                .channel_address
                .as_deref()
                .or_else(|| request.header(&self.settings.address_header_name))
                .or_else(|| request.query_param(&self.settings.address_query_param))
                .and_then(|address| self.mapped_tenant(address)),
            ResolutionStrategy::Query => request.query_param(&self.settings.query_param).map(str::to_string),
            ResolutionStrategy::Default => Some(self.settings.default_tenant_id.clone()),
        };

        candidate.filter(|id| is_valid_tenant_id(id))
    }

    /// Validated configuration for a tenant, served from cache within the TTL
    pub async fn load_config(&self, tenant_id: &str) -> Result<Arc<TenantConfig>> {
        if let Some(config) = self.cached(tenant_id) {
            debug!(tenant_id = tenant_id, "Tenant config cache hit");
            return Ok(config);
        }

        let gate = {
            let entry = self.loading.entry(tenant_id.to_string()).or_default();
            Arc::clone(entry.value())
        };
        let loaded = {
            let _loading = gate.lock().await;

            // Another caller may have finished loading while we waited
            match self.cached(tenant_id) {
                Some(config) => Ok(config),
                None => self.load_fresh(tenant_id).await,
            }
        };

        // Last one through drops the gate; waiters still hold a clone
        drop(gate);
        self.loading.remove_if(tenant_id, |_, gate| Arc::strong_count(gate) == 1);
        loaded
    }

    /// Resolve the tenant of a request and load its configuration
    pub async fn resolve_and_load(&self, request: &RequestDescriptor) -> Result<(ResolvedTenant, Arc<TenantConfig>)> {
        let resolved = self.resolve(request)?;
        let config = self.load_config(&resolved.tenant_id).await?;
        Ok((resolved, config))
    }

    /// Drop one tenant from the cache; the next load goes to the source
    pub fn invalidate(&self, tenant_id: &str) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let removed = self.cache.remove(tenant_id).is_some();
        if removed {
            info!(tenant_id = tenant_id, "Tenant config invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let size = self.cache.len();
        self.cache.clear();
        info!(entries = size, "Tenant config cache cleared");
    }

    pub fn cache_stats(&self) -> TenantCacheStats {
        let ttl = self.settings.cache_ttl();
        let mut entries: Vec<TenantCacheEntry> = self
            .cache
            .iter()
            .map(|entry| {
                let age = entry.value().loaded_at.elapsed();
                TenantCacheEntry {
                    tenant_id: entry.key().clone(),
                    age_seconds: age.as_secs(),
                    expired: age >= ttl,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        TenantCacheStats {
            size: entries.len(),
            loads: self.loads.load(Ordering::Relaxed),
            entries,
        }
    }

    fn cached(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        let ttl = self.settings.cache_ttl();
        if let Some(entry) = self.cache.get(tenant_id) {
            if entry.loaded_at.elapsed() < ttl {
                return Some(Arc::clone(&entry.config));
            }
        }

        self.cache
            .remove_if(tenant_id, |_, entry| entry.loaded_at.elapsed() >= ttl);
        None
    }

    /// Cache a freshly loaded config unless the cache was invalidated since
    /// `generation` was read. Expired entries are purged on the way.
    fn store(&self, tenant_id: &str, config: TenantConfig, generation: u64) -> Arc<TenantConfig> {
        let config = Arc::new(config);
        self.loads.fetch_add(1, Ordering::Relaxed);

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(tenant_id = tenant_id, "Cache invalidated during load, not caching");
            return config;
        }

        let ttl = self.settings.cache_ttl();
        self.cache.retain(|_, entry| entry.loaded_at.elapsed() < ttl);
        self.cache.insert(
            tenant_id.to_string(),
            CachedTenant {
                config: Arc::clone(&config),
                loaded_at: Instant::now(),
            },
        );
        config
    }

    async fn load_fresh(&self, tenant_id: &str) -> Result<Arc<TenantConfig>> {
        let generation = self.generation.load(Ordering::SeqCst);
        if tenant_id == self.settings.default_tenant_id {
            return self.default_config();
        }

        let loaded = tokio::time::timeout(self.settings.load_timeout(), self.source.load_overrides(tenant_id)).await;
        let overrides = match loaded {
            Ok(Ok(overrides)) => overrides,
            Ok(Err(e @ ConversaError::ConfigValidation { .. })) => return Err(e),
            Ok(Err(e)) => return self.fallback(tenant_id, &e.to_string()),
            Err(_) => return self.fallback(tenant_id, "load timed out"),
        };

        if overrides.is_none() {
            warn!(tenant_id = tenant_id, "No overrides found for tenant, using defaults");
        }

        let config = TenantConfig::from_overrides(&self.settings.defaults, tenant_id, overrides)?;
        info!(tenant_id = tenant_id, source = self.source.name(), "Tenant config loaded");
        Ok(self.store(tenant_id, config, generation))
    }

    /// Serve the default tenant when a source fails softly; nothing is cached
    /// under the requested id so the next call retries the source
    fn fallback(&self, tenant_id: &str, reason: &str) -> Result<Arc<TenantConfig>> {
        warn!(
            tenant_id = tenant_id,
            reason = reason,
            fallback = %self.settings.default_tenant_id,
            "Tenant config unavailable, serving default tenant"
        );
        self.default_config()
    }

    fn default_config(&self) -> Result<Arc<TenantConfig>> {
        let default_id = &self.settings.default_tenant_id;
        if let Some(config) = self.cached(default_id) {
            return Ok(config);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let config = TenantConfig::from_overrides(&self.settings.defaults, default_id, None)?;
        Ok(self.store(default_id, config, generation))
    }
}

impl std::fmt::Debug for TenantResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantResolver")
            .field("source", &self.source.name())
            .field("default_tenant_id", &self.settings.default_tenant_id)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

fn subdomain_tenant(host: &str) -> Option<String> {
    if host.contains("localhost") || host.parse::<std::net::IpAddr>().is_ok() {
        return None;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 && labels[0] != "www" && !labels[0].is_empty() {
        Some(labels[0].to_string())
    } else {
        None
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().trim_start_matches('+').to_string()
}

fn is_valid_tenant_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct StaticSource {
        overrides: HashMap<String, Value>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TenantConfigSource for StaticSource {
        async fn load_overrides(&self, tenant_id: &str) -> Result<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.overrides.get(tenant_id).cloned())
        }

        fn name(&self) -> &'static str {
            "static"
        }
    }

    fn settings() -> TenantsConfig {
        let mut settings = TenantsConfig::default();
        settings.defaults.channel.api_token = "token".to_string();
        settings.defaults.ai.api_key = "key".to_string();
        settings
    }

    fn resolver() -> (TenantResolver, Arc<StaticSource>) {
        let mut overrides = HashMap::new();
        overrides.insert("acme".to_string(), json!({"name": "Acme"}));
        let source = Arc::new(StaticSource {
            overrides,
            calls: AtomicUsize::new(0),
        });
        let resolver = TenantResolver::new(settings(), source.clone()).unwrap();
        (resolver, source)
    }

    #[test]
    fn test_header_beats_later_strategies() {
        let (resolver, _) = resolver();
        let request = RequestDescriptor::new()
            .with_header("X-Tenant-Id", "t2")
            .with_query("tenant", "t1");

        let resolved = resolver.resolve(&request).unwrap();
        assert_eq!(resolved.tenant_id, "t2");
        assert_eq!(resolved.strategy, ResolutionStrategy::Header);
    }

    #[test]
    fn test_subdomain_rules() {
        assert_eq!(subdomain_tenant("acme.bots.example.com"), Some("acme".to_string()));
        assert_eq!(subdomain_tenant("www.example.com"), None);
        assert_eq!(subdomain_tenant("example.com"), None);
        assert_eq!(subdomain_tenant("acme.localhost.dev"), None);
        assert_eq!(subdomain_tenant("10.0.0.12"), None);
    }

    #[test]
    fn test_path_and_address_strategies() {
        let mut map = HashMap::new();
        map.insert("+34600111222".to_string(), "clinic".to_string());
        let (resolver, _) = resolver();
        let resolver = resolver.with_address_map(map);

        let by_path = RequestDescriptor::new().with_path("/tenant/shop-1/webhook");
        assert_eq!(resolver.resolve(&by_path).unwrap().tenant_id, "shop-1");

        let by_address = RequestDescriptor::new().with_channel_address("34600111222");
        let resolved = resolver.resolve(&by_address).unwrap();
        assert_eq!(resolved.tenant_id, "clinic");
        assert_eq!(resolved.strategy, ResolutionStrategy::ChannelAddress);
    }

    #[test]
    fn test_default_policy() {
        let (resolver, _) = resolver();
        let request = RequestDescriptor::new().with_path("/webhook");

        let resolved = resolver.resolve(&request).unwrap();
        assert_eq!(resolved.tenant_id, "default");
        assert_eq!(resolved.strategy, ResolutionStrategy::Default);

        let strict = ResolveOptions {
            allow_default: Some(false),
            only: None,
        };
        assert_matches!(resolver.resolve_with(&request, strict), Err(ConversaError::TenantUnresolved));
    }

    #[test]
    fn test_single_strategy_option() {
        let (resolver, _) = resolver();
        let request = RequestDescriptor::new()
            .with_header("x-tenant-id", "t2")
            .with_query("tenant", "t1");
        let options = ResolveOptions {
            allow_default: Some(false),
            only: Some(ResolutionStrategy::Query),
        };

        assert_eq!(resolver.resolve_with(&request, options).unwrap().tenant_id, "t1");
    }

    #[test]
    fn test_invalid_ids_are_ignored() {
        let (resolver, _) = resolver();
        let request = RequestDescriptor::new()
            .with_header("x-tenant-id", "../etc")
            .with_query("tenant", "t1");

        assert_eq!(resolver.resolve(&request).unwrap().tenant_id, "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_returns_same_config() {
        let (resolver, source) = resolver();

        let first = resolver.load_config("acme").await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(10 * 60)).await;
        let second = resolver.load_config("acme").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name, "Acme");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reloads_once() {
        let (resolver, source) = resolver();

        let first = resolver.load_config("acme").await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(61 * 60)).await;
        let second = resolver.load_config("acme").await.unwrap();
        let third = resolver.load_config("acme").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let (resolver, source) = resolver();

        resolver.load_config("acme").await.unwrap();
        assert!(resolver.invalidate("acme"));
        resolver.load_config("acme").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        resolver.clear();
        assert_eq!(resolver.cache_stats().size, 0);
    }

    #[tokio::test]
    async fn test_missing_overrides_use_defaults_with_tenant_id() {
        let (resolver, _) = resolver();
        let config = resolver.load_config("newcomer").await.unwrap();

        assert_eq!(config.tenant_id, "newcomer");
        assert_eq!(config.name, "Default Tenant");
        assert_eq!(resolver.cache_stats().entries[0].tenant_id, "newcomer");
    }

    #[tokio::test]
    async fn test_invalid_defaults_fail_validation() {
        let source = Arc::new(StaticSource {
            overrides: HashMap::new(),
            calls: AtomicUsize::new(0),
        });
        let resolver = TenantResolver::new(TenantsConfig::default(), source).unwrap();

        assert_matches!(
            resolver.load_config("acme").await,
            Err(ConversaError::ConfigValidation { tenant_id, .. }) if tenant_id == "acme"
        );
        assert_eq!(resolver.cache_stats().size, 0);
    }

    #[tokio::test]
    async fn test_loading_gates_are_released() {
        let (resolver, _) = resolver();

        for id in ["acme", "one", "two", "default"] {
            resolver.load_config(id).await.unwrap();
        }

        assert!(resolver.loading.is_empty());
    }
}
