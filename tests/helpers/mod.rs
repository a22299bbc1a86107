//! Test helpers module
//!
//! Shared fixtures for the integration suites: tenant sources, recording flow
//! handlers, event builders and a fully wired test context.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use conversa::config::{ConversationConfig, SessionConfig, TenantsConfig};
use conversa::models::{InboundEvent, MessageContent, RequestDescriptor};
use conversa::services::{
    ConversationOrchestrator, FlowDirective, FlowHandler, FlowTurn, RejectionAction, TenantConfigSource,
    TenantResolver,
};
use conversa::state::{FlowStep, MemorySessionStorage, MirrorQueue, MirrorWorker, SessionStore};
use conversa::{ConversaError, Result};

static INIT: Once = Once::new();

/// Initialize logging for tests (called once)
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Tenant settings whose defaults pass validation
pub fn tenant_settings() -> TenantsConfig {
    let mut settings = TenantsConfig::default();
    settings.defaults.channel.api_token = "test-token".to_string();
    settings.defaults.ai.api_key = "test-key".to_string();
    settings
}

/// Tenant source backed by a map, counting every load
#[derive(Default)]
pub struct CountingSource {
    overrides: Mutex<HashMap<String, Value>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    failing: bool,
}

impl CountingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(self, tenant_id: &str, overrides: Value) -> Self {
        self.overrides
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), overrides);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantConfigSource for CountingSource {
    async fn load_overrides(&self, tenant_id: &str) -> Result<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            return Err(ConversaError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "config store down",
            )));
        }
        Ok(self.overrides.lock().unwrap().get(tenant_id).cloned())
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Flow handler returning queued directives and recording every turn
#[derive(Default)]
pub struct RecordingHandler {
    script: Mutex<Vec<FlowDirective>>,
    seen: Mutex<Vec<(FlowStep, String)>>,
    reprompt: Option<String>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directives are handed out in order; once exhausted the handler stays
    pub fn then(self, directive: FlowDirective) -> Self {
        self.script.lock().unwrap().push(directive);
        self
    }

    pub fn reprompting(mut self, prompt: &str) -> Self {
        self.reprompt = Some(prompt.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<(FlowStep, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlowHandler for RecordingHandler {
    async fn handle(&self, turn: FlowTurn<'_>) -> Result<FlowDirective> {
        self.seen
            .lock()
            .unwrap()
            .push((turn.step, turn.content.body().to_string()));

        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Ok(FlowDirective::stay())
        } else {
            Ok(script.remove(0))
        }
    }

    fn on_rejected(&self, _step: FlowStep, _error: &ConversaError) -> RejectionAction {
        match &self.reprompt {
            Some(prompt) => RejectionAction::Reprompt(prompt.clone()),
            None => RejectionAction::MainMenu,
        }
    }
}

pub fn text_event(sender: &str, event_id: &str, body: &str) -> InboundEvent {
    InboundEvent::new(sender, 1_717_000_000, MessageContent::text(body)).with_event_id(event_id)
}

pub fn selection_event(sender: &str, event_id: &str, option: &str) -> InboundEvent {
    InboundEvent::new(sender, 1_717_000_000, MessageContent::selection(option)).with_event_id(event_id)
}

pub fn request() -> RequestDescriptor {
    RequestDescriptor::new().with_path("/webhook")
}

/// Orchestrator wired to an in-memory mirror and a counting tenant source
pub struct TestContext {
    pub orchestrator: ConversationOrchestrator,
    pub sessions: Arc<SessionStore>,
    pub tenants: Arc<TenantResolver>,
    pub storage: Arc<MemorySessionStorage>,
    pub source: Arc<CountingSource>,
    pub mirror: MirrorQueue,
    _worker: MirrorWorker,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_source(CountingSource::new())
    }

    pub fn with_source(source: CountingSource) -> Self {
        Self::with_storage(source, Arc::new(MemorySessionStorage::new()))
    }

    pub fn with_storage(source: CountingSource, storage: Arc<MemorySessionStorage>) -> Self {
        init_test_logging();

        let (mirror, worker) = MirrorQueue::spawn(storage.clone(), &Default::default());
        let sessions = Arc::new(SessionStore::new(SessionConfig::default(), Some(mirror.clone())));
        let source = Arc::new(source);
        let tenants = Arc::new(TenantResolver::new(tenant_settings(), source.clone()).unwrap());
        let orchestrator =
            ConversationOrchestrator::new(sessions.clone(), tenants.clone(), ConversationConfig::default());

        Self {
            orchestrator,
            sessions,
            tenants,
            storage,
            source,
            mirror,
            _worker: worker,
        }
    }

    pub fn register(&mut self, flow: conversa::state::FlowType, handler: Arc<dyn FlowHandler>) {
        self.orchestrator.register_handler(flow, handler);
    }
}
