//! Generic step collector
//!
//! A content-free [`FlowHandler`] that walks any flow graph forward. The
//! user's text fills whatever payload keys the next step requires, steps whose
//! successor is a terminal step with requirements act as confirmation gates,
//! and open-ended steps stay put until the user signs off.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::models::TenantConfig;
use crate::services::conversation::{FlowDirective, FlowHandler, FlowTurn, RejectionAction};
use crate::state::{FlowStep, Payload};
use crate::utils::errors::{ConversaError, Result};

/// Word lists the collector reacts to
#[derive(Debug, Clone)]
pub struct StepCollectorHandler {
    cancel_words: Vec<String>,
    confirm_words: Vec<String>,
    decline_words: Vec<String>,
    end_words: Vec<String>,
}

impl Default for StepCollectorHandler {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        Self {
            cancel_words: words(&["cancelar", "cancel", "salir", "stop"]),
            confirm_words: words(&["si", "sí", "yes", "ok", "confirmo", "dale"]),
            decline_words: words(&["no", "cambiar", "corregir"]),
            end_words: words(&["gracias", "listo", "chau", "adios", "adiós", "fin"]),
        }
    }
}

impl StepCollectorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, turn: &FlowTurn<'_>, text: &str) -> FlowDirective {
        let mut successors = turn.step.allowed_next().into_iter().filter(|next| *next != turn.step.cancelled());
        let Some(forward) = successors.next() else {
            return FlowDirective::stay();
        };
        let back = successors.next();
        let missing = missing_keys(forward, turn.payload);

        if forward.is_terminal() && forward.required_payload().is_empty() {
            // Open-ended step
            if has_word(text, &self.end_words) {
                return FlowDirective::advance(forward);
            }
            return FlowDirective::stay();
        }

        if forward.is_terminal() {
            if has_word(text, &self.confirm_words) {
                return fill(FlowDirective::advance(forward), &missing, Value::Bool(true));
            }
            if let Some(back) = back.filter(|_| has_word(text, &self.decline_words)) {
                return FlowDirective::advance(back).with_reply(back.description());
            }
            return FlowDirective::stay().with_reply(turn.step.description());
        }

        if text.is_empty() {
            return FlowDirective::stay().with_reply(turn.step.description());
        }

        fill(FlowDirective::advance(forward), &missing, Value::String(text.to_string()))
            .with_reply(forward.description())
    }
}

#[async_trait]
impl FlowHandler for StepCollectorHandler {
    async fn handle(&self, turn: FlowTurn<'_>) -> Result<FlowDirective> {
        let text = turn.content.body().trim();

        if has_word(text, &self.cancel_words) {
            debug!(user_id = turn.user_id, step = %turn.step, "Flow cancelled by user");
            return Ok(FlowDirective::advance(turn.step.cancelled()));
        }

        Ok(self.collect(&turn, text))
    }

    fn prompt(&self, step: FlowStep, _tenant: &TenantConfig) -> Option<String> {
        Some(step.description().to_string())
    }

    fn on_rejected(&self, step: FlowStep, _error: &ConversaError) -> RejectionAction {
        RejectionAction::Reprompt(step.description().to_string())
    }
}

fn missing_keys(step: FlowStep, payload: &Payload) -> Vec<&'static str> {
    step.required_payload()
        .iter()
        .copied()
        .filter(|key| payload.get(*key).map_or(true, Value::is_null))
        .collect()
}

fn fill(mut directive: FlowDirective, keys: &[&str], value: Value) -> FlowDirective {
    for key in keys {
        directive = directive.with_update(key, value.clone());
    }
    directive
}

fn has_word(text: &str, words: &[String]) -> bool {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| words.iter().any(|word| word == token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageContent;
    use crate::state::{AppointmentStep, AssistantStep, HandoffStep};
    use serde_json::json;

    async fn run(step: FlowStep, payload: Payload, text: &str) -> FlowDirective {
        let tenant = TenantConfig::default();
        let content = MessageContent::text(text);
        let turn = FlowTurn {
            user_id: "u1",
            step,
            payload: &payload,
            content: &content,
            tenant: &tenant,
        };
        StepCollectorHandler::new().handle(turn).await.unwrap()
    }

    #[tokio::test]
    async fn test_text_fills_next_requirement() {
        let directive = run(FlowStep::Appointment(AppointmentStep::Date), Payload::new(), "2024-06-01").await;

        assert_eq!(directive.next, Some(FlowStep::Appointment(AppointmentStep::Time)));
        assert_eq!(directive.payload_updates.get("selectedDate"), Some(&json!("2024-06-01")));
    }

    #[tokio::test]
    async fn test_confirmation_gate() {
        let mut payload = Payload::new();
        payload.insert("reason".to_string(), json!("billing"));
        let step = FlowStep::HumanHandoff(HandoffStep::Confirmation);

        let confirmed = run(step, payload.clone(), "Sí, por favor").await;
        assert_eq!(confirmed.next, Some(FlowStep::HumanHandoff(HandoffStep::Escalated)));
        assert_eq!(confirmed.payload_updates.get("savedToSheets"), Some(&json!(true)));

        let declined = run(step, payload.clone(), "no").await;
        assert_eq!(declined.next, Some(FlowStep::HumanHandoff(HandoffStep::Reason)));

        let unclear = run(step, payload, "mmm").await;
        assert_eq!(unclear.next, None);
    }

    #[tokio::test]
    async fn test_open_ended_step_waits_for_sign_off() {
        let step = FlowStep::Assistant(AssistantStep::Active);

        assert_eq!(run(step, Payload::new(), "cuánto cuesta?").await.next, None);
        assert_eq!(
            run(step, Payload::new(), "listo, gracias").await.next,
            Some(FlowStep::Assistant(AssistantStep::Completed))
        );
    }

    #[tokio::test]
    async fn test_cancel_word() {
        let directive = run(FlowStep::Appointment(AppointmentStep::Time), Payload::new(), "cancelar").await;
        assert_eq!(directive.next, Some(FlowStep::Appointment(AppointmentStep::Cancelled)));
    }
}
