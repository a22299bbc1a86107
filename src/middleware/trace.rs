//! Per-event trace context
//!
//! Every inbound event gets a trace id that is attached to all log lines
//! emitted while handling it, plus a record of each sub-operation (tenant
//! config load, flow handler call, durable restore) with its latency and
//! outcome. The record is logged as a single summary when the trace ends.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn, Span};
use uuid::Uuid;

use crate::state::{FlowStep, FlowType};
use crate::utils::errors::ConversaError;

/// Outcome of one sub-operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationRecord {
    pub attempted: bool,
    pub success: Option<bool>,
    pub latency_ms: Option<u64>,
    pub error_code: Option<String>,
}

/// A named point in the trace timeline
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub elapsed_ms: u64,
    pub detail: Option<String>,
}

/// Handle for a running sub-operation
#[derive(Debug)]
pub struct OperationTimer {
    name: &'static str,
    started_at: Instant,
}

/// Final view of a trace, returned with every outcome
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: Uuid,
    pub user_id: String,
    pub event_id: Option<String>,
    pub tenant_id: Option<String>,
    pub flow: Option<FlowType>,
    pub step: Option<&'static str>,
    pub intent: Option<String>,
    pub message_type: Option<String>,
    pub duration_ms: u64,
    pub operations: BTreeMap<&'static str, OperationRecord>,
    pub events: Vec<TraceEvent>,
}

/// Correlation context for one inbound event
#[derive(Debug)]
pub struct TraceContext {
    trace_id: Uuid,
    user_id: String,
    event_id: Option<String>,
    tenant_id: Option<String>,
    flow: Option<FlowType>,
    step: Option<&'static str>,
    intent: Option<String>,
    message_type: Option<String>,
    operations: BTreeMap<&'static str, OperationRecord>,
    events: Vec<TraceEvent>,
    started_at: Instant,
    span: Span,
}

impl TraceContext {
    pub fn new(user_id: &str) -> Self {
        let trace_id = Uuid::new_v4();
        let span = tracing::info_span!("event", trace_id = %trace_id, user_id = %user_id);

        Self {
            trace_id,
            user_id: user_id.to_string(),
            event_id: None,
            tenant_id: None,
            flow: None,
            step: None,
            intent: None,
            message_type: None,
            operations: BTreeMap::new(),
            events: Vec::new(),
            started_at: Instant::now(),
            span,
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Span to instrument work done on behalf of this event
    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn set_event_id(&mut self, event_id: &str) {
        self.event_id = Some(event_id.to_string());
    }

    pub fn set_tenant(&mut self, tenant_id: &str) {
        self.tenant_id = Some(tenant_id.to_string());
    }

    pub fn set_step(&mut self, step: Option<FlowStep>) {
        self.flow = step.map(|s| s.flow());
        self.step = step.map(|s| s.name());
    }

    pub fn set_intent(&mut self, intent: &str) {
        self.intent = Some(intent.to_string());
    }

    pub fn set_message_type(&mut self, message_type: &str) {
        self.message_type = Some(message_type.to_string());
    }

    pub fn start_operation(&mut self, name: &'static str) -> OperationTimer {
        self.operations.entry(name).or_default().attempted = true;
        OperationTimer {
            name,
            started_at: Instant::now(),
        }
    }

    pub fn succeed(&mut self, timer: OperationTimer) {
        let latency = timer.started_at.elapsed();
        self.finish_operation(timer.name, latency, None);
    }

    pub fn fail(&mut self, timer: OperationTimer, error: &ConversaError) {
        let latency = timer.started_at.elapsed();
        self.finish_operation(timer.name, latency, Some(error.code()));
    }

    /// Append a timeline event and log it under the trace span
    pub fn log(&mut self, name: &str, detail: Option<&str>) {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        self.span.in_scope(|| {
            debug!(trace_id = %self.trace_id, event = name, detail = detail, elapsed_ms = elapsed_ms, "trace event");
        });
        self.events.push(TraceEvent {
            name: name.to_string(),
            elapsed_ms,
            detail: detail.map(str::to_string),
        });
    }

    pub fn operation(&self, name: &str) -> Option<&OperationRecord> {
        self.operations.get(name)
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            trace_id: self.trace_id,
            user_id: self.user_id.clone(),
            event_id: self.event_id.clone(),
            tenant_id: self.tenant_id.clone(),
            flow: self.flow,
            step: self.step,
            intent: self.intent.clone(),
            message_type: self.message_type.clone(),
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            operations: self.operations.clone(),
            events: self.events.clone(),
        }
    }

    /// End the trace and emit the completion record
    pub fn finish(self) -> TraceSummary {
        let summary = self.summary();
        let failed = summary
            .operations
            .values()
            .filter(|op| op.success == Some(false))
            .count();

        self.span.in_scope(|| {
            if failed > 0 {
                warn!(
                    trace_id = %summary.trace_id,
                    event_id = summary.event_id.as_deref(),
                    tenant_id = summary.tenant_id.as_deref(),
                    flow = summary.flow.map(|f| f.as_str()),
                    step = summary.step,
                    intent = summary.intent.as_deref(),
                    duration_ms = summary.duration_ms,
                    failed_operations = failed,
                    "trace.complete"
                );
            } else {
                info!(
                    trace_id = %summary.trace_id,
                    event_id = summary.event_id.as_deref(),
                    tenant_id = summary.tenant_id.as_deref(),
                    flow = summary.flow.map(|f| f.as_str()),
                    step = summary.step,
                    intent = summary.intent.as_deref(),
                    duration_ms = summary.duration_ms,
                    "trace.complete"
                );
            }
        });

        summary
    }

    fn finish_operation(&mut self, name: &'static str, latency: Duration, error_code: Option<&str>) {
        let latency_ms = latency.as_millis() as u64;
        let record = self.operations.entry(name).or_default();
        record.latency_ms = Some(latency_ms);
        record.success = Some(error_code.is_none());
        record.error_code = error_code.map(str::to_string);

        if latency_ms > 1000 {
            warn!(trace_id = %self.trace_id, operation = name, latency_ms = latency_ms, "Slow operation detected");
        }
    }
}
