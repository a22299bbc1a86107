//! Orchestrator behavior tests
//!
//! Idempotency, intent routing, flow delegation and failure handling.

mod helpers;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use conversa::config::{ConversationConfig, SessionConfig};
use conversa::models::MessageContent;
use conversa::services::{
    Action, ConversationOrchestrator, FlowDirective, FlowHandler, FlowTurn, Outcome, TenantResolver,
};
use conversa::state::{AssistantStep, FlowStep, FlowType, HandoffStep, QuotationStep, Session, SessionPersistence, SessionStore};
use conversa::{ConversaError, Result};
use helpers::*;

struct FailingHandler;

#[async_trait]
impl FlowHandler for FailingHandler {
    async fn handle(&self, _turn: FlowTurn<'_>) -> Result<FlowDirective> {
        Err(ConversaError::Timeout("completion provider".to_string()))
    }
}

#[tokio::test]
async fn test_retried_event_reaches_handler_once() {
    let mut ctx = TestContext::new();
    let handler = Arc::new(RecordingHandler::new());
    ctx.register(FlowType::Assistant, handler.clone());

    ctx.orchestrator
        .handle(&request(), &text_event("u1", "m1", "3"))
        .await
        .unwrap();

    let question = text_event("u1", "m2", "¿hacen apps?");
    let first = ctx.orchestrator.handle(&request(), &question).await.unwrap();
    let before = ctx.sessions.peek("u1").await.unwrap();
    let second = ctx.orchestrator.handle(&request(), &question).await.unwrap();
    let after = ctx.sessions.peek("u1").await.unwrap();

    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());
    assert_eq!(handler.calls(), 1);
    assert_eq!(after.history().len(), before.history().len());
    assert_eq!(after.last_activity_at(), before.last_activity_at());
}

#[tokio::test]
async fn test_concurrent_deliveries_of_same_event() {
    let mut ctx = TestContext::new();
    let handler = Arc::new(RecordingHandler::new());
    ctx.register(FlowType::Assistant, handler.clone());
    ctx.orchestrator
        .handle(&request(), &text_event("u1", "m1", "3"))
        .await
        .unwrap();

    let event = text_event("u1", "m2", "otra pregunta");
    let req = request();
    let (a, b) = tokio::join!(
        ctx.orchestrator.handle(&req, &event),
        ctx.orchestrator.handle(&req, &event)
    );

    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_duplicate()).count(), 1);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_events_without_provider_id_use_digest() {
    let ctx = TestContext::new();
    let event = conversa::models::InboundEvent::new("u1", 1_717_000_123, MessageContent::text("hola"));

    let first = ctx.orchestrator.handle(&request(), &event).await.unwrap();
    let second = ctx.orchestrator.handle(&request(), &event).await.unwrap();

    assert_eq!(first.event_id().len(), 64);
    assert!(second.is_duplicate());
    assert_eq!(first.event_id(), second.event_id());
}

#[tokio::test]
async fn test_greeting_restarts_active_flow() {
    let ctx = TestContext::new();
    ctx.orchestrator
        .handle(&request(), &text_event("u1", "m1", "2"))
        .await
        .unwrap();
    assert_eq!(ctx.sessions.peek("u1").await.unwrap().current_flow(), Some(FlowType::Quotation));

    let outcome = ctx
        .orchestrator
        .handle(&request(), &text_event("u1", "m2", "Hola de nuevo"))
        .await
        .unwrap();

    assert_eq!(outcome.action(), Some(&Action::Welcome));
    assert!(ctx.sessions.peek("u1").await.unwrap().current_flow().is_none());
}

#[tokio::test]
async fn test_escalation_keyword_starts_handoff() {
    let ctx = TestContext::new();
    let outcome = ctx
        .orchestrator
        .handle(&request(), &text_event("u1", "m1", "quiero hablar con un asesor"))
        .await
        .unwrap();

    assert_eq!(
        outcome.action(),
        Some(&Action::FlowStarted {
            flow: FlowType::HumanHandoff,
            step: FlowStep::HumanHandoff(HandoffStep::Reason),
        })
    );
}

#[tokio::test]
async fn test_disabled_flow_is_not_started() {
    let ctx = TestContext::with_source(CountingSource::new().with_tenant("acme", json!({"enabled_flows": ["assistant"]})));
    let req = request().with_header("x-tenant-id", "acme");

    let outcome = ctx
        .orchestrator
        .handle(&req, &text_event("u1", "m1", "1"))
        .await
        .unwrap();

    assert_eq!(
        outcome.action(),
        Some(&Action::FlowDisabled {
            flow: FlowType::Appointment
        })
    );
    let session = ctx.sessions.peek("u1").await.unwrap();
    assert!(session.current_flow().is_none());
    assert_eq!(session.metadata_str("tenantId"), Some("acme"));
}

#[tokio::test]
async fn test_handler_failure_is_handled_and_recorded() {
    let mut ctx = TestContext::new();
    ctx.register(FlowType::Assistant, Arc::new(FailingHandler));
    ctx.orchestrator
        .handle(&request(), &text_event("u1", "m1", "3"))
        .await
        .unwrap();

    let outcome = ctx
        .orchestrator
        .handle(&request(), &text_event("u1", "m2", "pregunta"))
        .await
        .unwrap();

    assert_matches!(outcome.action(), Some(Action::HandlerFailed { .. }));
    let session = ctx.sessions.peek("u1").await.unwrap();
    assert_eq!(session.step(), Some(FlowStep::Assistant(AssistantStep::Active)));
    assert_eq!(session.last_processed_event_id(), Some("m2"));
    assert_matches!(outcome, Outcome::Processed { ref trace, .. } => {
        let op = trace.operations.get("flow_handler").unwrap();
        assert_eq!(op.success, Some(false));
        assert_eq!(op.error_code.as_deref(), Some("timeout"));
    });
}

#[tokio::test]
async fn test_unresolved_tenant_fails_before_session_work() {
    init_test_logging();
    let mut settings = tenant_settings();
    settings.allow_default = false;
    let sessions = Arc::new(SessionStore::new(SessionConfig::default(), None));
    let tenants = Arc::new(TenantResolver::new(settings, Arc::new(CountingSource::new())).unwrap());
    let orchestrator = ConversationOrchestrator::new(sessions.clone(), tenants, ConversationConfig::default());

    let result = orchestrator.handle(&request(), &text_event("u1", "m1", "hola")).await;

    assert_matches!(result, Err(ConversaError::TenantUnresolved));
    assert!(!sessions.contains("u1"));
}

#[tokio::test]
async fn test_mirror_failure_does_not_abort_event() {
    let ctx = TestContext::new();
    ctx.storage.set_failing(true);

    let outcome = ctx
        .orchestrator
        .handle(&request(), &text_event("u1", "m1", "hola"))
        .await
        .unwrap();
    ctx.mirror.flush().await;

    assert_eq!(outcome.action(), Some(&Action::Welcome));
    assert!(ctx.mirror.stats().failed >= 1);
    assert!(ctx.sessions.contains("u1"));
}

#[tokio::test]
async fn test_resume_adopts_durable_flow() {
    let storage = Arc::new(conversa::state::MemorySessionStorage::new());
    let earlier = (Utc::now() - chrono::Duration::minutes(30)).to_rfc3339();
    let snapshot: Session = serde_json::from_value(json!({
        "user_id": "u1",
        "active": {
            "step": {"flow": "quotation", "step": "description"},
            "payload": {},
            "started_at": earlier,
            "last_transition_at": earlier
        },
        "history": [{"role": "user", "content": "quiero una web", "timestamp": earlier}],
        "metadata": {"displayName": "Ana"},
        "last_processed_event_id": "m-old",
        "created_at": earlier,
        "last_activity_at": earlier
    }))
    .unwrap();
    storage.save(&snapshot).await.unwrap();

    let ctx = TestContext::with_storage(CountingSource::new(), storage);
    let outcome = ctx
        .orchestrator
        .handle(&request(), &text_event("u1", "m1", "continuar"))
        .await
        .unwrap();

    assert_eq!(
        outcome.action(),
        Some(&Action::Resumed {
            restored: true,
            step: FlowStep::Quotation(QuotationStep::Description),
        })
    );
    let session = ctx.sessions.peek("u1").await.unwrap();
    assert_eq!(session.history().front().map(|t| t.content.as_str()), Some("quiero una web"));
    assert_eq!(session.metadata_str("displayName"), Some("Ana"));
}

#[tokio::test]
async fn test_resume_without_history_starts_assistant() {
    let ctx = TestContext::new();
    let outcome = ctx
        .orchestrator
        .handle(&request(), &text_event("u1", "m1", "retomar"))
        .await
        .unwrap();

    assert_eq!(
        outcome.action(),
        Some(&Action::Resumed {
            restored: false,
            step: FlowStep::Assistant(AssistantStep::Active),
        })
    );
    assert_eq!(ctx.sessions.peek("u1").await.unwrap().current_flow(), Some(FlowType::Assistant));
}

#[tokio::test]
async fn test_unsupported_content_outside_flow() {
    let ctx = TestContext::new();
    let event = conversa::models::InboundEvent::new(
        "u1",
        1_717_000_000,
        MessageContent::Unsupported {
            kind: "image".to_string(),
        },
    )
    .with_event_id("m1");

    let outcome = ctx.orchestrator.handle(&request(), &event).await.unwrap();
    assert_eq!(
        outcome.action(),
        Some(&Action::Unsupported {
            kind: "image".to_string()
        })
    );
    assert_eq!(outcome.reply(), None);
}
