//! Flow state machine
//!
//! Validates step transitions and payload requirements against the static
//! step graphs declared in [`super::flows`]. The tables are the same for every
//! tenant; tenants only decide which flows are enabled.

use serde::Serialize;

use super::flows::{FlowStep, FlowType};
use super::session::Payload;
use crate::utils::errors::{ConversaError, Result};

/// Read-only description of a single step
#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    pub flow: FlowType,
    pub step: &'static str,
    pub description: &'static str,
    pub allowed_next: Vec<&'static str>,
    pub required_payload: Vec<&'static str>,
    pub terminal: bool,
}

/// Validator over the declared flow graphs
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowStateMachine;

impl FlowStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// All flows the machine knows about
    pub fn available_flows(&self) -> &'static [FlowType] {
        &FlowType::ALL
    }

    pub fn initial_step(&self, flow: FlowType) -> FlowStep {
        flow.initial_step()
    }

    pub fn is_terminal(&self, flow: FlowType, step: FlowStep) -> Result<bool> {
        self.ensure_belongs(flow, step)?;
        Ok(step.is_terminal())
    }

    /// Steps reachable from `current`; entering a flow only allows its initial step
    pub fn allowed_transitions(&self, flow: FlowType, current: Option<FlowStep>) -> Result<Vec<FlowStep>> {
        match current {
            None => Ok(vec![flow.initial_step()]),
            Some(step) => {
                self.ensure_belongs(flow, step)?;
                Ok(step.allowed_next())
            }
        }
    }

    /// Fails with `InvalidTransition` unless `next` is allowed after `current`
    pub fn assert_valid_transition(
        &self,
        flow: FlowType,
        current: Option<FlowStep>,
        next: FlowStep,
    ) -> Result<()> {
        self.ensure_belongs(flow, next)?;
        let allowed = self.allowed_transitions(flow, current)?;

        if allowed.contains(&next) {
            return Ok(());
        }

        Err(ConversaError::InvalidTransition {
            flow: flow.to_string(),
            from: current.map(|s| s.name()).unwrap_or("none").to_string(),
            to: next.name().to_string(),
            allowed: allowed.iter().map(|s| s.name().to_string()).collect(),
        })
    }

    /// Fails with `MissingPayloadField` naming every required key that is absent or null
    pub fn assert_payload_satisfies(&self, flow: FlowType, step: FlowStep, payload: &Payload) -> Result<()> {
        self.ensure_belongs(flow, step)?;

        let missing: Vec<String> = step
            .required_payload()
            .iter()
            .filter(|key| payload.get(**key).map_or(true, |value| value.is_null()))
            .map(|key| key.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConversaError::MissingPayloadField {
                flow: flow.to_string(),
                step: step.name().to_string(),
                missing,
            })
        }
    }

    /// Both checks, in the order they are reported
    pub fn validate_transition(
        &self,
        flow: FlowType,
        current: Option<FlowStep>,
        next: FlowStep,
        payload: &Payload,
    ) -> Result<()> {
        self.assert_valid_transition(flow, current, next)?;
        self.assert_payload_satisfies(flow, next, payload)
    }

    pub fn step_info(&self, step: FlowStep) -> StepInfo {
        StepInfo {
            flow: step.flow(),
            step: step.name(),
            description: step.description(),
            allowed_next: step.allowed_next().iter().map(|s| s.name()).collect(),
            required_payload: step.required_payload().to_vec(),
            terminal: step.is_terminal(),
        }
    }

    /// Text rendering of a flow graph for debugging
    pub fn describe(&self, flow: FlowType) -> String {
        let mut out = format!("{} (initial: {})\n", flow, flow.initial_step().name());

        for step in flow.steps() {
            let info = self.step_info(step);
            let next = if info.terminal {
                "[terminal]".to_string()
            } else {
                info.allowed_next.join(" | ")
            };
            out.push_str(&format!("  {} -> {}", info.step, next));
            if !info.required_payload.is_empty() {
                out.push_str(&format!("  requires: {}", info.required_payload.join(", ")));
            }
            out.push('\n');
        }

        out
    }

    fn ensure_belongs(&self, flow: FlowType, step: FlowStep) -> Result<()> {
        if step.flow() == flow {
            Ok(())
        } else {
            Err(ConversaError::UnknownStep {
                flow: flow.to_string(),
                step: step.to_string(),
            })
        }
    }
}
