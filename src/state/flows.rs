//! Flow and step identifiers
//!
//! Every flow is a small directed graph of steps. Each flow has its own step
//! enum implementing [`StepGraph`], which declares the allowed successors and
//! the payload keys that must be present on entering a step. [`FlowStep`]
//! wraps those enums so a step value always carries the flow it belongs to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::errors::{ConversaError, Result};

/// Multi-step dialogues a session can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowType {
    Appointment,
    Quotation,
    Assistant,
    HumanHandoff,
}

/// Static description of one flow's step graph
pub trait StepGraph: Copy + Eq + Sized + 'static {
    const INITIAL: Self;
    const ALL: &'static [Self];

    fn name(self) -> &'static str;
    fn allowed_next(self) -> &'static [Self];
    fn required_payload(self) -> &'static [&'static str];
    fn description(self) -> &'static str;

    fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStep {
    Date,
    Time,
    Confirmation,
    Completed,
    Cancelled,
}

impl StepGraph for AppointmentStep {
    const INITIAL: Self = AppointmentStep::Date;
    const ALL: &'static [Self] = &[
        AppointmentStep::Date,
        AppointmentStep::Time,
        AppointmentStep::Confirmation,
        AppointmentStep::Completed,
        AppointmentStep::Cancelled,
    ];

    fn name(self) -> &'static str {
        match self {
            AppointmentStep::Date => "date",
            AppointmentStep::Time => "time",
            AppointmentStep::Confirmation => "confirmation",
            AppointmentStep::Completed => "completed",
            AppointmentStep::Cancelled => "cancelled",
        }
    }

    fn allowed_next(self) -> &'static [Self] {
        use AppointmentStep::*;
        match self {
            Date => &[Time, Cancelled],
            Time => &[Confirmation, Date, Cancelled],
            Confirmation => &[Completed, Time, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    fn required_payload(self) -> &'static [&'static str] {
        match self {
            AppointmentStep::Date | AppointmentStep::Cancelled => &[],
            AppointmentStep::Time => &["selectedDate"],
            AppointmentStep::Confirmation => &["selectedDate", "selectedTime"],
            AppointmentStep::Completed => &["selectedDate", "selectedTime", "savedToSheets"],
        }
    }

    fn description(self) -> &'static str {
        match self {
            AppointmentStep::Date => "Choosing a date",
            AppointmentStep::Time => "Choosing a time slot",
            AppointmentStep::Confirmation => "Confirming the appointment",
            AppointmentStep::Completed => "Appointment booked",
            AppointmentStep::Cancelled => "Appointment cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotationStep {
    Description,
    Analysis,
    Confirmation,
    Completed,
    Cancelled,
}

impl StepGraph for QuotationStep {
    const INITIAL: Self = QuotationStep::Description;
    const ALL: &'static [Self] = &[
        QuotationStep::Description,
        QuotationStep::Analysis,
        QuotationStep::Confirmation,
        QuotationStep::Completed,
        QuotationStep::Cancelled,
    ];

    fn name(self) -> &'static str {
        match self {
            QuotationStep::Description => "description",
            QuotationStep::Analysis => "analysis",
            QuotationStep::Confirmation => "confirmation",
            QuotationStep::Completed => "completed",
            QuotationStep::Cancelled => "cancelled",
        }
    }

    fn allowed_next(self) -> &'static [Self] {
        use QuotationStep::*;
        match self {
            Description => &[Analysis, Cancelled],
            Analysis => &[Confirmation, Description, Cancelled],
            Confirmation => &[Completed, Analysis, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    fn required_payload(self) -> &'static [&'static str] {
        match self {
            QuotationStep::Description | QuotationStep::Cancelled => &[],
            QuotationStep::Analysis => &["description"],
            QuotationStep::Confirmation => &["description", "analyzedData"],
            QuotationStep::Completed => &["description", "analyzedData", "savedToSheets"],
        }
    }

    fn description(self) -> &'static str {
        match self {
            QuotationStep::Description => "Collecting the project description",
            QuotationStep::Analysis => "Analyzing the request",
            QuotationStep::Confirmation => "Confirming the quotation",
            QuotationStep::Completed => "Quotation saved",
            QuotationStep::Cancelled => "Quotation cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantStep {
    Active,
    Completed,
    Cancelled,
}

impl StepGraph for AssistantStep {
    const INITIAL: Self = AssistantStep::Active;
    const ALL: &'static [Self] = &[
        AssistantStep::Active,
        AssistantStep::Completed,
        AssistantStep::Cancelled,
    ];

    fn name(self) -> &'static str {
        match self {
            AssistantStep::Active => "active",
            AssistantStep::Completed => "completed",
            AssistantStep::Cancelled => "cancelled",
        }
    }

    fn allowed_next(self) -> &'static [Self] {
        match self {
            AssistantStep::Active => &[AssistantStep::Completed, AssistantStep::Cancelled],
            AssistantStep::Completed | AssistantStep::Cancelled => &[],
        }
    }

    fn required_payload(self) -> &'static [&'static str] {
        &[]
    }

    fn description(self) -> &'static str {
        match self {
            AssistantStep::Active => "Open conversation with the assistant",
            AssistantStep::Completed => "Conversation finished",
            AssistantStep::Cancelled => "Conversation cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStep {
    Reason,
    Confirmation,
    Escalated,
    Cancelled,
}

impl StepGraph for HandoffStep {
    const INITIAL: Self = HandoffStep::Reason;
    const ALL: &'static [Self] = &[
        HandoffStep::Reason,
        HandoffStep::Confirmation,
        HandoffStep::Escalated,
        HandoffStep::Cancelled,
    ];

    fn name(self) -> &'static str {
        match self {
            HandoffStep::Reason => "reason",
            HandoffStep::Confirmation => "confirmation",
            HandoffStep::Escalated => "escalated",
            HandoffStep::Cancelled => "cancelled",
        }
    }

    fn allowed_next(self) -> &'static [Self] {
        use HandoffStep::*;
        match self {
            Reason => &[Confirmation, Cancelled],
            Confirmation => &[Escalated, Reason, Cancelled],
            Escalated | Cancelled => &[],
        }
    }

    fn required_payload(self) -> &'static [&'static str] {
        match self {
            HandoffStep::Reason | HandoffStep::Cancelled => &[],
            HandoffStep::Confirmation => &["reason"],
            HandoffStep::Escalated => &["reason", "savedToSheets"],
        }
    }

    fn description(self) -> &'static str {
        match self {
            HandoffStep::Reason => "Asking why a human is needed",
            HandoffStep::Confirmation => "Confirming the escalation",
            HandoffStep::Escalated => "Handed over to the team",
            HandoffStep::Cancelled => "Escalation cancelled",
        }
    }
}

/// A step together with the flow it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "flow", content = "step", rename_all = "camelCase")]
pub enum FlowStep {
    Appointment(AppointmentStep),
    Quotation(QuotationStep),
    Assistant(AssistantStep),
    HumanHandoff(HandoffStep),
}

fn wrap_all<S: StepGraph>(steps: &[S], wrap: fn(S) -> FlowStep) -> Vec<FlowStep> {
    steps.iter().copied().map(wrap).collect()
}

impl FlowStep {
    pub fn flow(self) -> FlowType {
        match self {
            FlowStep::Appointment(_) => FlowType::Appointment,
            FlowStep::Quotation(_) => FlowType::Quotation,
            FlowStep::Assistant(_) => FlowType::Assistant,
            FlowStep::HumanHandoff(_) => FlowType::HumanHandoff,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FlowStep::Appointment(s) => s.name(),
            FlowStep::Quotation(s) => s.name(),
            FlowStep::Assistant(s) => s.name(),
            FlowStep::HumanHandoff(s) => s.name(),
        }
    }

    pub fn allowed_next(self) -> Vec<FlowStep> {
        match self {
            FlowStep::Appointment(s) => wrap_all(s.allowed_next(), FlowStep::Appointment),
            FlowStep::Quotation(s) => wrap_all(s.allowed_next(), FlowStep::Quotation),
            FlowStep::Assistant(s) => wrap_all(s.allowed_next(), FlowStep::Assistant),
            FlowStep::HumanHandoff(s) => wrap_all(s.allowed_next(), FlowStep::HumanHandoff),
        }
    }

    pub fn can_transition_to(self, next: FlowStep) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn required_payload(self) -> &'static [&'static str] {
        match self {
            FlowStep::Appointment(s) => s.required_payload(),
            FlowStep::Quotation(s) => s.required_payload(),
            FlowStep::Assistant(s) => s.required_payload(),
            FlowStep::HumanHandoff(s) => s.required_payload(),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            FlowStep::Appointment(s) => s.description(),
            FlowStep::Quotation(s) => s.description(),
            FlowStep::Assistant(s) => s.description(),
            FlowStep::HumanHandoff(s) => s.description(),
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            FlowStep::Appointment(s) => s.is_terminal(),
            FlowStep::Quotation(s) => s.is_terminal(),
            FlowStep::Assistant(s) => s.is_terminal(),
            FlowStep::HumanHandoff(s) => s.is_terminal(),
        }
    }

    /// The cancellation step of this step's flow
    pub fn cancelled(self) -> FlowStep {
        match self {
            FlowStep::Appointment(_) => FlowStep::Appointment(AppointmentStep::Cancelled),
            FlowStep::Quotation(_) => FlowStep::Quotation(QuotationStep::Cancelled),
            FlowStep::Assistant(_) => FlowStep::Assistant(AssistantStep::Cancelled),
            FlowStep::HumanHandoff(_) => FlowStep::HumanHandoff(HandoffStep::Cancelled),
        }
    }
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.flow(), self.name())
    }
}

impl FlowType {
    pub const ALL: [FlowType; 4] = [
        FlowType::Appointment,
        FlowType::Quotation,
        FlowType::Assistant,
        FlowType::HumanHandoff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FlowType::Appointment => "appointment",
            FlowType::Quotation => "quotation",
            FlowType::Assistant => "assistant",
            FlowType::HumanHandoff => "humanHandoff",
        }
    }

    pub fn initial_step(self) -> FlowStep {
        match self {
            FlowType::Appointment => FlowStep::Appointment(AppointmentStep::INITIAL),
            FlowType::Quotation => FlowStep::Quotation(QuotationStep::INITIAL),
            FlowType::Assistant => FlowStep::Assistant(AssistantStep::INITIAL),
            FlowType::HumanHandoff => FlowStep::HumanHandoff(HandoffStep::INITIAL),
        }
    }

    pub fn steps(self) -> Vec<FlowStep> {
        match self {
            FlowType::Appointment => wrap_all(AppointmentStep::ALL, FlowStep::Appointment),
            FlowType::Quotation => wrap_all(QuotationStep::ALL, FlowStep::Quotation),
            FlowType::Assistant => wrap_all(AssistantStep::ALL, FlowStep::Assistant),
            FlowType::HumanHandoff => wrap_all(HandoffStep::ALL, FlowStep::HumanHandoff),
        }
    }

    /// Look up a step of this flow by its name
    pub fn parse_step(self, name: &str) -> Result<FlowStep> {
        let step = match self {
            FlowType::Appointment => AppointmentStep::parse(name).map(FlowStep::Appointment),
            FlowType::Quotation => QuotationStep::parse(name).map(FlowStep::Quotation),
            FlowType::Assistant => AssistantStep::parse(name).map(FlowStep::Assistant),
            FlowType::HumanHandoff => HandoffStep::parse(name).map(FlowStep::HumanHandoff),
        };

        step.ok_or_else(|| ConversaError::UnknownStep {
            flow: self.to_string(),
            step: name.to_string(),
        })
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowType {
    type Err = ConversaError;

    fn from_str(s: &str) -> Result<Self> {
        FlowType::ALL
            .iter()
            .copied()
            .find(|flow| flow.as_str() == s)
            .ok_or_else(|| ConversaError::UnknownFlow(s.to_string()))
    }
}
