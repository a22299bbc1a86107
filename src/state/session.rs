//! Per-user conversation session
//!
//! A session tracks the active flow (if any), recent conversation history and
//! free-form metadata for one end-user. The active flow, its step and its
//! payload live together in [`ActiveFlow`], so a session can never hold a step
//! or payload without a flow.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::flows::{FlowStep, FlowType};

/// Ordered flow-specific data
pub type Payload = serde_json::Map<String, Value>;

/// Number of turns handed to completion providers as context
pub const CONTEXT_WINDOW: usize = 8;

/// Who produced a history turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The flow a session is currently in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFlow {
    pub step: FlowStep,
    pub payload: Payload,
    pub started_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

/// Result of an inactivity check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactivityStatus {
    Active,
    /// Idle past the warning threshold and not yet warned
    Warning,
    Expired,
}

/// Conversation state of one end-user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    user_id: String,
    active: Option<ActiveFlow>,
    history: VecDeque<HistoryTurn>,
    metadata: BTreeMap<String, Value>,
    last_processed_event_id: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    #[serde(default)]
    inactivity_warning_sent: bool,
    /// Set when the session was removed from the store while unlocked
    #[serde(skip)]
    pub(crate) evicted: bool,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            active: None,
            history: VecDeque::new(),
            metadata: BTreeMap::new(),
            last_processed_event_id: None,
            created_at: now,
            last_activity_at: now,
            inactivity_warning_sent: false,
            evicted: false,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn active_flow(&self) -> Option<&ActiveFlow> {
        self.active.as_ref()
    }

    pub fn current_flow(&self) -> Option<FlowType> {
        self.active.as_ref().map(|a| a.step.flow())
    }

    pub fn step(&self) -> Option<FlowStep> {
        self.active.as_ref().map(|a| a.step)
    }

    /// Flow payload; `None` when no flow is active
    pub fn payload(&self) -> Option<&Payload> {
        self.active.as_ref().map(|a| &a.payload)
    }

    pub fn payload_value(&self, key: &str) -> Option<&Value> {
        self.payload().and_then(|p| p.get(key))
    }

    pub fn history(&self) -> &VecDeque<HistoryTurn> {
        &self.history
    }

    /// The last `n` turns, oldest first
    pub fn recent_history(&self, n: usize) -> Vec<&HistoryTurn> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).collect()
    }

    /// Turns passed to completion providers as conversation context
    pub fn conversation_context(&self) -> Vec<&HistoryTurn> {
        self.recent_history(CONTEXT_WINDOW)
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn last_processed_event_id(&self) -> Option<&str> {
        self.last_processed_event_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    pub fn inactivity_warning_sent(&self) -> bool {
        self.inactivity_warning_sent
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity_at
    }

    pub fn inactivity_status(&self, now: DateTime<Utc>, warning_after: Duration, timeout: Duration) -> InactivityStatus {
        let idle = self.idle_for(now);
        if idle > timeout {
            InactivityStatus::Expired
        } else if idle > warning_after && !self.inactivity_warning_sent {
            InactivityStatus::Warning
        } else {
            InactivityStatus::Active
        }
    }

    /// Create a summary of the session for logging
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            user_id: self.user_id.clone(),
            flow: self.current_flow(),
            step: self.step().map(|s| s.name()),
            payload_keys: self
                .payload()
                .map(|p| p.keys().cloned().collect())
                .unwrap_or_default(),
            history_len: self.history.len(),
            last_activity_at: self.last_activity_at,
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
        self.inactivity_warning_sent = false;
    }

    pub(crate) fn enter_flow(&mut self, step: FlowStep, payload: Payload, now: DateTime<Utc>) {
        self.active = Some(ActiveFlow {
            step,
            payload,
            started_at: now,
            last_transition_at: now,
        });
    }

    pub(crate) fn advance(&mut self, next: FlowStep, payload: Payload, now: DateTime<Utc>) {
        if let Some(active) = self.active.as_mut() {
            active.step = next;
            active.payload = payload;
            active.last_transition_at = now;
        }
    }

    pub(crate) fn merge_payload(&mut self, updates: Payload) {
        if let Some(active) = self.active.as_mut() {
            active.payload.extend(updates);
        }
    }

    pub(crate) fn clear_flow(&mut self) -> Option<ActiveFlow> {
        self.active.take()
    }

    pub(crate) fn push_history(&mut self, turn: HistoryTurn, limit: usize) {
        self.history.push_back(turn);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    pub(crate) fn set_metadata(&mut self, key: String, value: Value) {
        self.metadata.insert(key, value);
    }

    pub(crate) fn set_last_processed(&mut self, event_id: String) {
        self.last_processed_event_id = Some(event_id);
    }

    pub(crate) fn mark_warning_sent(&mut self) {
        self.inactivity_warning_sent = true;
    }

    /// Fold a durable snapshot into this session.
    ///
    /// Snapshot turns go before local ones, metadata only fills missing keys,
    /// and the snapshot's flow is adopted when no flow is active locally.
    pub(crate) fn absorb(&mut self, snapshot: Session, limit: usize) -> bool {
        let mut history = snapshot.history;
        history.extend(self.history.drain(..));
        while history.len() > limit {
            history.pop_front();
        }
        self.history = history;

        for (key, value) in snapshot.metadata {
            self.metadata.entry(key).or_insert(value);
        }

        if self.last_processed_event_id.is_none() {
            self.last_processed_event_id = snapshot.last_processed_event_id;
        }
        if snapshot.created_at < self.created_at {
            self.created_at = snapshot.created_at;
        }

        if self.active.is_none() && snapshot.active.is_some() {
            self.active = snapshot.active;
            return true;
        }
        false
    }
}

/// Session summary for logging and stats
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub user_id: String,
    pub flow: Option<FlowType>,
    pub step: Option<&'static str>,
    pub payload_keys: Vec<String>,
    pub history_len: usize,
    pub last_activity_at: DateTime<Utc>,
}
