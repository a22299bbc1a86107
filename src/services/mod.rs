//! Services module
//!
//! Tenant resolution, the conversation orchestrator, and the factory that
//! wires them to the session store.

pub mod conversation;
pub mod tenant;

// Re-export commonly used services
pub use conversation::{
    Action, ConversationOrchestrator, FlowDirective, FlowHandler, FlowTurn, Intent, IntentClassifier, Outcome,
    RejectionAction,
};
pub use tenant::{
    FileTenantSource, ResolutionStrategy, ResolveOptions, ResolvedTenant, TenantCacheStats, TenantConfigSource,
    TenantResolver,
};

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Settings;
use crate::handlers::StepCollectorHandler;
use crate::state::{
    FlowStateMachine, InactivityNotifier, MirrorQueue, MirrorStats, MirrorWorker, RedisSessionStorage, SessionPersistence,
    SessionStore, SessionSweeper,
};
use crate::utils::errors::Result;

/// Owner of the wired core components and their background tasks
pub struct ServiceFactory {
    pub sessions: Arc<SessionStore>,
    pub tenants: Arc<TenantResolver>,
    pub orchestrator: Arc<ConversationOrchestrator>,
    mirror_worker: Option<MirrorWorker>,
    sweeper: SessionSweeper,
}

impl ServiceFactory {
    /// Build everything from settings: Redis mirror when enabled, tenant
    /// files from the configured directory, and the step collector for every flow
    pub async fn new(settings: &Settings) -> Result<Self> {
        let persistence: Option<Arc<dyn SessionPersistence>> = if settings.mirror.enabled {
            match connect_redis(settings).await {
                Ok(storage) => Some(Arc::new(storage)),
                Err(e) => {
                    // Sessions stay in memory only
                    warn!(error = %e, "Durable session mirror unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let source = Arc::new(FileTenantSource::new(&settings.tenants.config_dir));
        Self::build(settings, persistence, source).await
    }

    /// Build with explicit persistence and tenant source
    pub async fn build(
        settings: &Settings,
        persistence: Option<Arc<dyn SessionPersistence>>,
        source: Arc<dyn TenantConfigSource>,
    ) -> Result<Self> {
        let (mirror, mirror_worker) = match persistence {
            Some(persistence) => {
                let (queue, worker) = MirrorQueue::spawn(persistence, &settings.mirror);
                (Some(queue), Some(worker))
            }
            None => (None, None),
        };

        let sessions = Arc::new(SessionStore::new(settings.session.clone(), mirror));

        let mut resolver = TenantResolver::new(settings.tenants.clone(), source)?;
        if let Some(path) = &settings.tenants.address_map_path {
            let map = TenantResolver::load_address_map(path).await?;
            resolver = resolver.with_address_map(map);
        }
        let tenants = Arc::new(resolver);

        let collector = Arc::new(StepCollectorHandler::new());
        let mut orchestrator =
            ConversationOrchestrator::new(Arc::clone(&sessions), Arc::clone(&tenants), settings.conversation.clone());
        for flow in FlowStateMachine::new().available_flows().iter().copied() {
            orchestrator.register_handler(flow, collector.clone());
        }

        info!(
            mirror = sessions.mirror().is_some(),
            default_tenant = %settings.tenants.default_tenant_id,
            "Services initialized"
        );

        Ok(Self {
            sessions,
            tenants,
            orchestrator: Arc::new(orchestrator),
            mirror_worker,
            sweeper: SessionSweeper::new(settings.session.sweep_interval()),
        })
    }

    pub fn start_sweeper(&mut self, notifier: Option<Arc<dyn InactivityNotifier>>) {
        self.sweeper.start(Arc::clone(&self.sessions), notifier);
    }

    pub fn health_check(&self) -> ServiceHealthStatus {
        ServiceHealthStatus {
            mirror: self.sessions.mirror().map(|m| m.stats()),
            sweeper_running: self.sweeper.is_running(),
            sessions: self.sessions.len(),
            cached_tenants: self.tenants.cache_stats().size,
        }
    }

    /// Stop the sweeper and drain queued mirror writes
    pub async fn shutdown(&mut self) {
        self.sweeper.stop();
        if let Some(mirror) = self.sessions.mirror() {
            mirror.flush().await;
        }
        if let Some(worker) = self.mirror_worker.as_mut() {
            worker.stop();
        }
        info!("Services shut down");
    }
}

async fn connect_redis(settings: &Settings) -> Result<RedisSessionStorage> {
    let storage = RedisSessionStorage::new(settings.redis.clone()).await?;
    storage.test_connection().await?;
    info!(url = %settings.redis.url, "Connected to Redis session mirror");
    Ok(storage)
}

/// Health status of the core services
#[derive(Debug, Clone)]
pub struct ServiceHealthStatus {
    pub mirror: Option<MirrorStats>,
    pub sweeper_running: bool,
    pub sessions: usize,
    pub cached_tenants: usize,
}

impl ServiceHealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.get_issues().is_empty()
    }

    pub fn get_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !self.sweeper_running {
            issues.push("Session sweeper not running".to_string());
        }
        if let Some(stats) = &self.mirror {
            if stats.dropped > 0 {
                issues.push(format!("Mirror queue dropped {} writes", stats.dropped));
            }
            if stats.failed > 0 {
                issues.push(format!("Mirror failed {} writes", stats.failed));
            }
        }

        issues
    }
}
