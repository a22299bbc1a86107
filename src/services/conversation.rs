//! Conversation orchestrator
//!
//! Entry point for one inbound event. The event is checked against the
//! idempotency marker, the tenant is resolved, and the user's session is
//! leased for the rest of the event. Active flows are delegated to their
//! [`FlowHandler`]; every transition a handler asks for is validated by the
//! session store before it is committed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn, Instrument};

use crate::config::ConversationConfig;
use crate::middleware::{IdempotencyGuard, TraceContext, TraceSummary};
use crate::models::{InboundEvent, MessageContent, RequestDescriptor, TenantConfig};
use crate::services::tenant::TenantResolver;
use crate::state::{FlowStep, FlowType, Payload, Role, SessionLease, SessionStore};
use crate::utils::errors::{ConversaError, Result};
use crate::utils::logging::log_flow_completed;

/// Session metadata keys written for every event
pub const META_DISPLAY_NAME: &str = "displayName";
pub const META_CHANNEL_ADDRESS: &str = "channelAddress";
pub const META_TENANT_ID: &str = "tenantId";

/// What a flow handler sees for one event
#[derive(Debug, Clone, Copy)]
pub struct FlowTurn<'a> {
    pub user_id: &'a str,
    pub step: FlowStep,
    pub payload: &'a Payload,
    pub content: &'a MessageContent,
    pub tenant: &'a TenantConfig,
}

/// What a flow handler asks the orchestrator to do
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowDirective {
    /// Step to move to; `None` stays on the current step
    pub next: Option<FlowStep>,
    pub payload_updates: Payload,
    pub reply: Option<String>,
}

impl FlowDirective {
    pub fn stay() -> Self {
        Self::default()
    }

    pub fn advance(next: FlowStep) -> Self {
        Self {
            next: Some(next),
            ..Self::default()
        }
    }

    pub fn with_update(mut self, key: &str, value: Value) -> Self {
        self.payload_updates.insert(key.to_string(), value);
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// How a handler reacts when its requested transition is rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionAction {
    /// Stay on the current step and send this prompt
    Reprompt(String),
    /// Leave the flow and show the main menu
    MainMenu,
}

/// Flow-specific conversational logic
#[async_trait]
pub trait FlowHandler: Send + Sync {
    async fn handle(&self, turn: FlowTurn<'_>) -> Result<FlowDirective>;

    /// Prompt sent when the user enters `step` from outside the flow
    fn prompt(&self, _step: FlowStep, _tenant: &TenantConfig) -> Option<String> {
        None
    }

    fn on_rejected(&self, _step: FlowStep, _error: &ConversaError) -> RejectionAction {
        RejectionAction::MainMenu
    }
}

/// Classification of input received outside a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    MenuSelection(FlowType),
    Escalation,
    Resume,
    FreeText,
    Unsupported,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::MenuSelection(_) => "menu_selection",
            Intent::Escalation => "escalation",
            Intent::Resume => "resume",
            Intent::FreeText => "free_text",
            Intent::Unsupported => "unsupported",
        }
    }
}

/// Keyword-based classifier over the configured word lists
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    config: ConversationConfig,
}

impl IntentClassifier {
    pub fn new(config: ConversationConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, content: &MessageContent) -> Intent {
        match content {
            MessageContent::Unsupported { .. } => Intent::Unsupported,
            MessageContent::Selection { id, .. } => self
                .menu_option(id)
                .map(Intent::MenuSelection)
                .unwrap_or(Intent::FreeText),
            MessageContent::Text { body } => {
                let text = body.trim().to_lowercase();
                if contains_any(&text, &self.config.resume_keywords) {
                    Intent::Resume
                } else if contains_any(&text, &self.config.greetings) {
                    Intent::Greeting
                } else if contains_any(&text, &self.config.escalation_keywords) {
                    Intent::Escalation
                } else if let Some(flow) = self.menu_option(&text) {
                    Intent::MenuSelection(flow)
                } else {
                    Intent::FreeText
                }
            }
        }
    }

    pub fn is_greeting(&self, content: &MessageContent) -> bool {
        match content {
            MessageContent::Text { body } => contains_any(&body.trim().to_lowercase(), &self.config.greetings),
            _ => false,
        }
    }

    fn menu_option(&self, option: &str) -> Option<FlowType> {
        self.config
            .menu_options
            .get(option.trim().to_lowercase().as_str())
            .copied()
    }
}

/// Whole-word match of any phrase in `text`
fn contains_any(text: &str, phrases: &[String]) -> bool {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    phrases.iter().any(|phrase| {
        let phrase = phrase.to_lowercase();
        let needle: Vec<&str> = phrase.split_whitespace().collect();
        !needle.is_empty() && words.windows(needle.len()).any(|window| window == needle.as_slice())
    })
}

/// What the orchestrator did with an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Welcome,
    MainMenu,
    RestartHint,
    FlowStarted { flow: FlowType, step: FlowStep },
    FlowAdvanced { from: FlowStep, to: FlowStep },
    FlowStayed { step: FlowStep },
    FlowCompleted { flow: FlowType, step: FlowStep },
    TransitionRejected { step: FlowStep, error: &'static str, left_flow: bool },
    FlowDisabled { flow: FlowType },
    Resumed { restored: bool, step: FlowStep },
    HandlerFailed { step: FlowStep, error: String },
    Unsupported { kind: String },
}

/// Result of handling one event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Already processed; nothing was done
    Duplicate { event_id: String },
    Processed {
        event_id: String,
        tenant_id: String,
        action: Action,
        reply: Option<String>,
        trace: TraceSummary,
    },
}

impl Outcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Outcome::Duplicate { .. })
    }

    pub fn event_id(&self) -> &str {
        match self {
            Outcome::Duplicate { event_id } | Outcome::Processed { event_id, .. } => event_id,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match self {
            Outcome::Processed { action, .. } => Some(action),
            Outcome::Duplicate { .. } => None,
        }
    }

    pub fn reply(&self) -> Option<&str> {
        match self {
            Outcome::Processed { reply, .. } => reply.as_deref(),
            Outcome::Duplicate { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Response {
    action: Action,
    reply: Option<String>,
}

impl Response {
    fn new(action: Action, reply: Option<String>) -> Self {
        Self { action, reply }
    }
}

/// Coordinates the guard, tenant resolver, session store and flow handlers
pub struct ConversationOrchestrator {
    sessions: Arc<SessionStore>,
    tenants: Arc<TenantResolver>,
    guard: IdempotencyGuard,
    classifier: IntentClassifier,
    handlers: HashMap<FlowType, Arc<dyn FlowHandler>>,
}

impl ConversationOrchestrator {
    pub fn new(sessions: Arc<SessionStore>, tenants: Arc<TenantResolver>, conversation: ConversationConfig) -> Self {
        Self {
            guard: IdempotencyGuard::new(Arc::clone(&sessions)),
            sessions,
            tenants,
            classifier: IntentClassifier::new(conversation),
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler(&mut self, flow: FlowType, handler: Arc<dyn FlowHandler>) {
        if self.handlers.insert(flow, handler).is_some() {
            warn!(flow = %flow, "Replaced flow handler");
        }
    }

    pub fn with_handler(mut self, flow: FlowType, handler: Arc<dyn FlowHandler>) -> Self {
        self.register_handler(flow, handler);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn tenants(&self) -> &Arc<TenantResolver> {
        &self.tenants
    }

    /// Handle one inbound event.
    ///
    /// Duplicates report success without side effects. An unresolvable tenant
    /// is returned as an error before the session is touched.
    pub async fn handle(&self, request: &RequestDescriptor, event: &InboundEvent) -> Result<Outcome> {
        let event_id = IdempotencyGuard::event_id(event);
        if self.guard.is_duplicate(&event.sender_id, &event_id).await {
            return Ok(Outcome::Duplicate { event_id });
        }

        let mut trace = TraceContext::new(&event.sender_id);
        trace.set_event_id(&event_id);
        trace.set_message_type(event.content.kind());
        let span = trace.span();

        self.process(request, event, event_id, trace).instrument(span).await
    }

    async fn process(
        &self,
        request: &RequestDescriptor,
        event: &InboundEvent,
        event_id: String,
        mut trace: TraceContext,
    ) -> Result<Outcome> {
        let timer = trace.start_operation("tenant_config");
        let tenant = match self.tenants.resolve_and_load(request).await {
            Ok((_, tenant)) => {
                trace.succeed(timer);
                tenant
            }
            Err(e) => {
                trace.fail(timer, &e);
                trace.finish();
                return Err(e);
            }
        };
        trace.set_tenant(&tenant.tenant_id);

        let mut lease = self.sessions.acquire(&event.sender_id).await;
        if self.guard.is_duplicate_locked(&lease, &event_id) {
            return Ok(Outcome::Duplicate { event_id });
        }

        if let Some(name) = event.first_name() {
            lease.set_metadata(META_DISPLAY_NAME, Value::String(name.to_string()));
        }
        if let Some(address) = request.channel_address.as_deref() {
            lease.set_metadata(META_CHANNEL_ADDRESS, Value::String(address.to_string()));
        }
        lease.set_metadata(META_TENANT_ID, Value::String(tenant.tenant_id.clone()));

        let returning = !lease.session().history().is_empty();
        lease.append_history(Role::User, &event.content.display_text());

        let step = lease.session().step();
        trace.set_step(step);

        let response = match step {
            Some(step) => self.continue_flow(&mut lease, step, event, &tenant, &mut trace).await?,
            None => self.route_new_message(&mut lease, event, &tenant, returning, &mut trace).await?,
        };

        if let Some(reply) = &response.reply {
            lease.append_history(Role::Assistant, reply);
        }
        self.guard.record_processed_locked(&mut lease, &event_id);
        trace.set_step(lease.session().step());
        drop(lease);

        Ok(Outcome::Processed {
            event_id,
            tenant_id: tenant.tenant_id.clone(),
            action: response.action,
            reply: response.reply,
            trace: trace.finish(),
        })
    }

    async fn continue_flow(
        &self,
        lease: &mut SessionLease<'_>,
        step: FlowStep,
        event: &InboundEvent,
        tenant: &TenantConfig,
        trace: &mut TraceContext,
    ) -> Result<Response> {
        let flow = step.flow();

        if self.classifier.is_greeting(&event.content) {
            trace.set_intent(Intent::Greeting.as_str());
            lease.clear_flow();
            info!(user_id = %event.sender_id, flow = %flow, "Greeting during flow, restarting");
            return Ok(self.welcome(tenant));
        }

        let Some(handler) = self.handlers.get(&flow).cloned() else {
            warn!(user_id = %event.sender_id, flow = %flow, "No handler for active flow, clearing it");
            lease.clear_flow();
            return Ok(self.main_menu(tenant));
        };

        trace.set_intent("flow_continue");
        let payload = lease.session().payload().cloned().unwrap_or_default();
        let turn = FlowTurn {
            user_id: &event.sender_id,
            step,
            payload: &payload,
            content: &event.content,
            tenant,
        };

        let timer = trace.start_operation("flow_handler");
        let directive = match handler.handle(turn).await {
            Ok(directive) => {
                trace.succeed(timer);
                directive
            }
            Err(e) => {
                trace.fail(timer, &e);
                error!(user_id = %event.sender_id, step = %step, error = %e, "Flow handler failed");
                return Ok(Response::new(
                    Action::HandlerFailed {
                        step,
                        error: e.to_string(),
                    },
                    Some(tenant.messages.error_generic.clone()),
                ));
            }
        };

        let FlowDirective {
            next,
            payload_updates,
            reply,
        } = directive;

        let Some(next) = next else {
            lease.update_payload(payload_updates)?;
            return Ok(Response::new(Action::FlowStayed { step }, reply));
        };

        match lease.transition(next, payload_updates) {
            Ok(_) if next.is_terminal() => {
                lease.clear_flow();
                log_flow_completed(&event.sender_id, flow.as_str(), next.name());
                Ok(Response::new(Action::FlowCompleted { flow, step: next }, reply))
            }
            Ok(_) => Ok(Response::new(Action::FlowAdvanced { from: step, to: next }, reply)),
            Err(e) if e.is_transition_rejection() => {
                trace.log("transition_rejected", Some(&e.to_string()));
                match handler.on_rejected(step, &e) {
                    RejectionAction::Reprompt(prompt) => Ok(Response::new(
                        Action::TransitionRejected {
                            step,
                            error: e.code(),
                            left_flow: false,
                        },
                        Some(prompt),
                    )),
                    RejectionAction::MainMenu => {
                        lease.clear_flow();
                        Ok(Response::new(
                            Action::TransitionRejected {
                                step,
                                error: e.code(),
                                left_flow: true,
                            },
                            Some(tenant.messages.main_menu.clone()),
                        ))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn route_new_message(
        &self,
        lease: &mut SessionLease<'_>,
        event: &InboundEvent,
        tenant: &TenantConfig,
        returning: bool,
        trace: &mut TraceContext,
    ) -> Result<Response> {
        let intent = self.classifier.classify(&event.content);
        trace.set_intent(intent.as_str());

        match intent {
            Intent::Greeting => Ok(self.welcome(tenant)),
            Intent::MenuSelection(flow) => self.start_flow(lease, flow, tenant),
            Intent::Escalation => self.start_flow(lease, FlowType::HumanHandoff, tenant),
            Intent::Resume => self.resume(lease, tenant, trace).await,
            Intent::FreeText if returning => Ok(Response::new(
                Action::RestartHint,
                Some(tenant.messages.restart_hint.clone()),
            )),
            Intent::FreeText => Ok(self.main_menu(tenant)),
            Intent::Unsupported => Ok(Response::new(
                Action::Unsupported {
                    kind: event.content.kind().to_string(),
                },
                None,
            )),
        }
    }

    fn start_flow(&self, lease: &mut SessionLease<'_>, flow: FlowType, tenant: &TenantConfig) -> Result<Response> {
        if !tenant.is_flow_enabled(flow) {
            info!(user_id = lease.user_id(), flow = %flow, tenant_id = %tenant.tenant_id, "Flow disabled for tenant");
            let reply = format!("{}\n\n{}", tenant.messages.flow_unavailable, tenant.messages.main_menu);
            return Ok(Response::new(Action::FlowDisabled { flow }, Some(reply)));
        }

        let step = flow.initial_step();
        lease.set_flow(flow, step, Payload::new())?;
        let reply = self.handlers.get(&flow).and_then(|handler| handler.prompt(step, tenant));
        Ok(Response::new(Action::FlowStarted { flow, step }, reply))
    }

    async fn resume(&self, lease: &mut SessionLease<'_>, tenant: &TenantConfig, trace: &mut TraceContext) -> Result<Response> {
        let timer = trace.start_operation("durable_restore");
        let restored = lease.restore_from_durable().await;
        trace.succeed(timer);

        if let Some(step) = lease.session().step() {
            let reply = self
                .handlers
                .get(&step.flow())
                .and_then(|handler| handler.prompt(step, tenant))
                .unwrap_or_else(|| tenant.messages.resume_found.clone());
            return Ok(Response::new(Action::Resumed { restored, step }, Some(reply)));
        }

        if !tenant.is_flow_enabled(FlowType::Assistant) {
            return self.start_flow(lease, FlowType::Assistant, tenant);
        }

        let step = FlowType::Assistant.initial_step();
        lease.set_flow(FlowType::Assistant, step, Payload::new())?;
        let reply = if restored {
            tenant.messages.resume_found.clone()
        } else {
            tenant.messages.resume_empty.clone()
        };
        Ok(Response::new(Action::Resumed { restored, step }, Some(reply)))
    }

    fn welcome(&self, tenant: &TenantConfig) -> Response {
        let reply = format!("{}\n\n{}", tenant.messages.welcome, tenant.messages.main_menu);
        Response::new(Action::Welcome, Some(reply))
    }

    fn main_menu(&self, tenant: &TenantConfig) -> Response {
        Response::new(Action::MainMenu, Some(tenant.messages.main_menu.clone()))
    }
}

impl std::fmt::Debug for ConversationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flows: Vec<&FlowType> = self.handlers.keys().collect();
        flows.sort();
        f.debug_struct("ConversationOrchestrator")
            .field("handlers", &flows)
            .field("tenants", &self.tenants)
            .finish_non_exhaustive()
    }
}
