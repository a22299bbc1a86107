//! In-process session store
//!
//! Sessions are kept in a sharded concurrent map with one async mutex per
//! user. Work for one user is serialized by holding that user's mutex for the
//! whole event through a [`SessionLease`]; different users never contend on a
//! shared lock. Every committed change is mirrored to the durable store when
//! the lease is released.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::flows::{FlowStep, FlowType};
use super::machine::FlowStateMachine;
use super::session::{ActiveFlow, HistoryTurn, InactivityStatus, Payload, Role, Session};
use super::storage::{MirrorQueue, MirrorStats};
use crate::config::SessionConfig;
use crate::utils::errors::{ConversaError, Result};
use crate::utils::logging::{log_flow_started, log_step_changed, log_validation_failed};

type SessionCell = Arc<Mutex<Session>>;

/// Owner of all per-user sessions
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, SessionCell>,
    machine: FlowStateMachine,
    config: SessionConfig,
    mirror: Option<MirrorQueue>,
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    /// Sessions that crossed the warning threshold during this pass
    pub warned: Vec<String>,
    /// Sessions skipped because an event was being processed
    pub busy: usize,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub sessions_in_flow: usize,
    pub flows: BTreeMap<FlowType, usize>,
    pub busy: usize,
    pub mirror: Option<MirrorStats>,
}

impl SessionStore {
    pub fn new(config: SessionConfig, mirror: Option<MirrorQueue>) -> Self {
        Self {
            sessions: DashMap::new(),
            machine: FlowStateMachine::new(),
            config,
            mirror,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn mirror(&self) -> Option<&MirrorQueue> {
        self.mirror.as_ref()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Exclusive access to a user's session, created empty if absent.
    ///
    /// Callers for the same user queue up in lock order; callers for other
    /// users proceed independently.
    pub async fn acquire(&self, user_id: &str) -> SessionLease<'_> {
        loop {
            let cell = {
                let entry = self
                    .sessions
                    .entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Session::new(user_id))));
                Arc::clone(entry.value())
            };

            let guard = cell.lock_owned().await;
            if guard.evicted {
                // Removed while we waited; a fresh cell will be inserted
                continue;
            }

            return SessionLease {
                store: self,
                guard,
                dirty: false,
            };
        }
    }

    /// Snapshot of a user's session, creating an empty one lazily
    pub async fn get(&self, user_id: &str) -> Session {
        self.acquire(user_id).await.session().clone()
    }

    /// Snapshot of a user's session without creating one
    pub async fn peek(&self, user_id: &str) -> Option<Session> {
        let cell = self.existing_cell(user_id)?;
        let session = cell.lock().await;
        if session.evicted {
            None
        } else {
            Some(session.clone())
        }
    }

    pub async fn last_processed_event_id(&self, user_id: &str) -> Option<String> {
        let cell = self.existing_cell(user_id)?;
        let session = cell.lock().await;
        session.last_processed_event_id().map(str::to_string)
    }

    pub async fn set_flow(&self, user_id: &str, flow: FlowType, step: FlowStep, payload: Payload) -> Result<()> {
        self.acquire(user_id).await.set_flow(flow, step, payload)
    }

    pub async fn transition(&self, user_id: &str, next: FlowStep, updates: Payload) -> Result<Option<FlowStep>> {
        self.acquire(user_id).await.transition(next, updates)
    }

    pub async fn update_payload(&self, user_id: &str, updates: Payload) -> Result<()> {
        self.acquire(user_id).await.update_payload(updates)
    }

    pub async fn append_history(&self, user_id: &str, role: Role, content: &str) {
        self.acquire(user_id).await.append_history(role, content);
    }

    pub async fn clear_flow(&self, user_id: &str) -> Option<ActiveFlow> {
        self.acquire(user_id).await.clear_flow()
    }

    pub async fn set_metadata(&self, user_id: &str, key: &str, value: Value) {
        self.acquire(user_id).await.set_metadata(key, value);
    }

    /// The last `n` history turns of an existing session
    pub async fn history(&self, user_id: &str, n: usize) -> Vec<HistoryTurn> {
        match self.peek(user_id).await {
            Some(session) => session.recent_history(n).into_iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn check_inactivity(&self, user_id: &str) -> Option<InactivityStatus> {
        self.check_inactivity_at(user_id, Utc::now()).await
    }

    pub async fn check_inactivity_at(&self, user_id: &str, now: DateTime<Utc>) -> Option<InactivityStatus> {
        let cell = self.existing_cell(user_id)?;
        let session = cell.lock().await;
        if session.evicted {
            return None;
        }
        Some(session.inactivity_status(now, self.warning_after(), self.timeout()))
    }

    /// Remove a session and its durable copy
    pub async fn end_session(&self, user_id: &str) -> bool {
        let Some(cell) = self.existing_cell(user_id) else {
            return false;
        };

        // Queue behind any lease holder; acquirers arriving later see `evicted`
        let mut session = cell.lock().await;
        if session.evicted {
            return false;
        }
        session.evicted = true;
        self.sessions
            .remove_if(user_id, |_, current| Arc::ptr_eq(current, &cell));
        if let Some(mirror) = &self.mirror {
            mirror.enqueue_delete(user_id);
        }
        info!(user_id = user_id, "Session ended");
        true
    }

    /// Load a session from the durable store if it is not cached here
    pub async fn warm(&self, user_id: &str) -> Result<bool> {
        if self.contains(user_id) {
            return Ok(false);
        }
        let Some(mirror) = &self.mirror else {
            return Ok(false);
        };

        let Some(mut snapshot) = mirror.load(user_id).await? else {
            return Ok(false);
        };
        snapshot.evicted = false;

        let mut inserted = false;
        self.sessions.entry(user_id.to_string()).or_insert_with(|| {
            inserted = true;
            Arc::new(Mutex::new(snapshot))
        });

        if inserted {
            info!(user_id = user_id, "Session warmed from durable store");
        }
        Ok(inserted)
    }

    pub fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(Utc::now())
    }

    /// Evict sessions idle past the timeout and flag those due a warning.
    ///
    /// Sessions locked by an in-flight event are active by definition and are
    /// left alone.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> SweepReport {
        let warning_after = self.warning_after();
        let timeout = self.timeout();
        let mut report = SweepReport::default();

        self.sessions.retain(|user_id, cell| {
            let Ok(mut session) = cell.try_lock() else {
                report.busy += 1;
                return true;
            };

            match session.inactivity_status(now, warning_after, timeout) {
                InactivityStatus::Expired => {
                    session.evicted = true;
                    report.evicted.push(user_id.clone());
                    false
                }
                InactivityStatus::Warning => {
                    session.mark_warning_sent();
                    report.warned.push(user_id.clone());
                    true
                }
                InactivityStatus::Active => true,
            }
        });

        if let Some(mirror) = &self.mirror {
            for user_id in &report.evicted {
                mirror.enqueue_delete(user_id);
            }
        }

        if !report.evicted.is_empty() || !report.warned.is_empty() {
            info!(
                evicted = report.evicted.len(),
                warned = report.warned.len(),
                remaining = self.sessions.len(),
                "Session sweep completed"
            );
        }

        report
    }

    pub fn stats(&self) -> SessionStats {
        let mut flows = BTreeMap::new();
        let mut sessions_in_flow = 0;
        let mut busy = 0;

        for entry in self.sessions.iter() {
            match entry.value().try_lock() {
                Ok(session) => {
                    if let Some(flow) = session.current_flow() {
                        sessions_in_flow += 1;
                        *flows.entry(flow).or_insert(0) += 1;
                    }
                }
                Err(_) => busy += 1,
            }
        }

        SessionStats {
            total_sessions: self.sessions.len(),
            sessions_in_flow,
            flows,
            busy,
            mirror: self.mirror.as_ref().map(|m| m.stats()),
        }
    }

    fn existing_cell(&self, user_id: &str) -> Option<SessionCell> {
        self.sessions.get(user_id).map(|entry| Arc::clone(entry.value()))
    }

    fn timeout(&self) -> chrono::Duration {
        to_chrono(self.config.timeout())
    }

    fn warning_after(&self) -> chrono::Duration {
        to_chrono(self.config.warning_after())
    }
}

/// Out-of-range durations saturate instead of overflowing
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

/// Exclusive access to one user's session.
///
/// Mutations are validated before they touch the session. If anything
/// changed, a snapshot is queued for the durable mirror when the lease drops.
pub struct SessionLease<'a> {
    store: &'a SessionStore,
    guard: OwnedMutexGuard<Session>,
    dirty: bool,
}

impl SessionLease<'_> {
    pub fn session(&self) -> &Session {
        &self.guard
    }

    pub fn user_id(&self) -> &str {
        self.guard.user_id()
    }

    pub fn is_duplicate(&self, event_id: &str) -> bool {
        self.guard.last_processed_event_id() == Some(event_id)
    }

    /// Enter a flow, replacing any active one
    pub fn set_flow(&mut self, flow: FlowType, step: FlowStep, payload: Payload) -> Result<()> {
        if let Err(e) = self.store.machine.validate_transition(flow, None, step, &payload) {
            log_validation_failed(self.guard.user_id(), flow.as_str(), &e.to_string());
            return Err(e);
        }

        if let Some(previous) = self.guard.current_flow() {
            debug!(user_id = self.guard.user_id(), previous = %previous, "Replacing active flow");
        }

        let now = Utc::now();
        self.guard.enter_flow(step, payload, now);
        self.commit(now);
        log_flow_started(self.guard.user_id(), flow.as_str(), step.name());
        Ok(())
    }

    /// Move the active flow to `next` after merging `updates` into its payload.
    ///
    /// Returns the previous step, or `None` when this entered a new flow.
    pub fn transition(&mut self, next: FlowStep, updates: Payload) -> Result<Option<FlowStep>> {
        let flow = next.flow();
        let Some((current_step, mut candidate)) = self
            .guard
            .active_flow()
            .map(|active| (active.step, active.payload.clone()))
        else {
            self.set_flow(flow, next, updates)?;
            return Ok(None);
        };

        let active_flow = current_step.flow();
        candidate.extend(updates);

        if let Err(e) = self
            .store
            .machine
            .validate_transition(active_flow, Some(current_step), next, &candidate)
        {
            log_validation_failed(self.guard.user_id(), active_flow.as_str(), &e.to_string());
            return Err(e);
        }

        let now = Utc::now();
        self.guard.advance(next, candidate, now);
        self.commit(now);
        log_step_changed(self.guard.user_id(), flow.as_str(), current_step.name(), next.name());
        Ok(Some(current_step))
    }

    /// Merge keys into the active flow's payload
    pub fn update_payload(&mut self, updates: Payload) -> Result<()> {
        if self.guard.active_flow().is_none() {
            return Err(ConversaError::InvalidInput(format!(
                "cannot update payload for {} without an active flow",
                self.guard.user_id()
            )));
        }
        if updates.is_empty() {
            return Ok(());
        }

        self.guard.merge_payload(updates);
        self.commit(Utc::now());
        Ok(())
    }

    pub fn append_history(&mut self, role: Role, content: &str) {
        let limit = self.store.config.history_limit;
        self.guard.push_history(HistoryTurn::new(role, content), limit);
        self.commit(Utc::now());
    }

    pub fn clear_flow(&mut self) -> Option<ActiveFlow> {
        let cleared = self.guard.clear_flow();
        if cleared.is_some() {
            self.commit(Utc::now());
        }
        cleared
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        if self.guard.metadata().get(key) == Some(&value) {
            return;
        }
        self.guard.set_metadata(key.to_string(), value);
        self.commit(Utc::now());
    }

    pub fn mark_processed(&mut self, event_id: &str) {
        self.guard.set_last_processed(event_id.to_string());
        self.commit(Utc::now());
    }

    /// Merge the durable copy of this session into the cached one.
    ///
    /// Returns whether a durable copy existed. Failures are soft: they are
    /// logged and reported as "nothing restored".
    pub async fn restore_from_durable(&mut self) -> bool {
        let Some(mirror) = &self.store.mirror else {
            return false;
        };

        match mirror.load(self.guard.user_id()).await {
            Ok(Some(snapshot)) if snapshot.created_at() >= self.guard.created_at() => {
                // Mirror of this same session; nothing older to merge
                debug!(user_id = self.guard.user_id(), "Durable copy already cached");
                true
            }
            Ok(Some(snapshot)) => {
                let adopted_flow = self.guard.absorb(snapshot, self.store.config.history_limit);
                self.commit(Utc::now());
                info!(
                    user_id = self.guard.user_id(),
                    adopted_flow = adopted_flow,
                    "Session restored from durable store"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(user_id = self.guard.user_id(), error = %e, "Could not restore session");
                false
            }
        }
    }

    fn commit(&mut self, now: DateTime<Utc>) {
        self.guard.touch(now);
        self.dirty = true;
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(mirror) = &self.store.mirror {
            mirror.enqueue_save(&self.guard);
        }
    }
}

impl std::fmt::Debug for SessionLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("user_id", &self.guard.user_id())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Receives users that crossed the inactivity warning threshold
#[async_trait]
pub trait InactivityNotifier: Send + Sync {
    async fn notify_inactive(&self, user_id: &str);
}

/// Periodic sweep of idle sessions
#[derive(Debug)]
pub struct SessionSweeper {
    interval: Duration,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl SessionSweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: None,
        }
    }

    /// Start the sweep task
    pub fn start(&mut self, store: Arc<SessionStore>, notifier: Option<Arc<dyn InactivityNotifier>>) {
        if self.handle.is_some() {
            warn!("Session sweeper is already running");
            return;
        }

        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = store.sweep_expired();

                if let Some(notifier) = &notifier {
                    let notifications = report.warned.iter().map(|user_id| notifier.notify_inactive(user_id));
                    futures::future::join_all(notifications).await;
                }

                if report.busy > 0 {
                    debug!(busy = report.busy, "Sweep skipped sessions with in-flight events");
                }
            }
        });

        self.handle = Some(handle);
        info!("Started session sweeper with interval {:?}", self.interval);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweep task
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Stopped session sweeper");
        }
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Notifier that only logs, used when no channel adapter is attached
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl InactivityNotifier for LoggingNotifier {
    async fn notify_inactive(&self, user_id: &str) {
        info!(user_id = user_id, "Session inactive, warning due");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::flows::{AppointmentStep, QuotationStep};
    use crate::state::storage::{MemorySessionStorage, SessionPersistence};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn store() -> SessionStore {
        SessionStore::new(SessionConfig::default(), None)
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_get_creates_empty_session() {
        let store = store();
        assert!(store.peek("u1").await.is_none());

        let session = store.get("u1").await;
        assert_eq!(session.user_id(), "u1");
        assert!(session.current_flow().is_none());
        assert!(store.contains("u1"));
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_session_untouched() {
        let store = store();
        store
            .set_flow("u1", FlowType::Quotation, FlowType::Quotation.initial_step(), Payload::new())
            .await
            .unwrap();
        let before = store.peek("u1").await.unwrap();

        let result = store
            .transition("u1", FlowStep::Quotation(QuotationStep::Confirmation), Payload::new())
            .await;

        assert_matches!(result, Err(ConversaError::InvalidTransition { .. }));
        let after = store.peek("u1").await.unwrap();
        assert_eq!(after.step(), before.step());
        assert_eq!(after.payload(), before.payload());
        assert_eq!(after.last_activity_at(), before.last_activity_at());
    }

    #[tokio::test]
    async fn test_transition_merges_payload() {
        let store = store();
        let user = "u1";
        store
            .set_flow(user, FlowType::Appointment, FlowType::Appointment.initial_step(), Payload::new())
            .await
            .unwrap();

        let previous = store
            .transition(
                user,
                FlowStep::Appointment(AppointmentStep::Time),
                payload(json!({"selectedDate": "2024-06-01"})),
            )
            .await
            .unwrap();

        assert_eq!(previous, Some(FlowStep::Appointment(AppointmentStep::Date)));
        let session = store.peek(user).await.unwrap();
        assert_eq!(session.step(), Some(FlowStep::Appointment(AppointmentStep::Time)));
        assert_eq!(session.payload_value("selectedDate"), Some(&json!("2024-06-01")));
    }

    #[tokio::test]
    async fn test_payload_requires_active_flow() {
        let store = store();
        let result = store.update_payload("u1", payload(json!({"reason": "billing"}))).await;

        assert_matches!(result, Err(ConversaError::InvalidInput(_)));
        assert!(store.peek("u1").await.unwrap().payload().is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_sessions() {
        let store = store();
        store.append_history("idle", Role::User, "hola").await;
        store.append_history("fresh", Role::User, "hola").await;
        {
            let mut lease = store.acquire("idle").await;
            lease.guard.touch(Utc::now() - chrono::Duration::minutes(16));
        }

        let report = store.sweep_expired();
        assert_eq!(report.evicted, vec!["idle".to_string()]);
        assert!(store.contains("fresh"));
        assert!(!store.contains("idle"));
        assert!(store.peek("idle").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_sessions() {
        let store = store();
        let lease = store.acquire("busy").await;

        let report = store.sweep_expired_at(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(report.busy, 1);
        assert!(report.evicted.is_empty());
        drop(lease);
        assert!(store.contains("busy"));
    }

    #[tokio::test]
    async fn test_warning_reported_once_per_idle_period() {
        let store = store();
        store.append_history("u1", Role::User, "hola").await;
        let later = Utc::now() + chrono::Duration::minutes(6);

        assert_eq!(store.check_inactivity_at("u1", later).await, Some(InactivityStatus::Warning));
        let report = store.sweep_expired_at(later);
        assert_eq!(report.warned, vec!["u1".to_string()]);

        let report = store.sweep_expired_at(later);
        assert!(report.warned.is_empty());
        assert_eq!(store.check_inactivity_at("u1", later).await, Some(InactivityStatus::Active));
    }

    #[tokio::test]
    async fn test_end_session_removes_durable_copy() {
        let storage = Arc::new(MemorySessionStorage::new());
        let (mirror, _worker) = MirrorQueue::spawn(storage.clone(), &crate::config::MirrorConfig::default());
        let store = SessionStore::new(SessionConfig::default(), Some(mirror.clone()));

        store.append_history("u1", Role::User, "hola").await;
        mirror.flush().await;
        assert!(storage.contains("u1"));

        assert!(store.end_session("u1").await);
        mirror.flush().await;
        assert!(!storage.contains("u1"));
        assert!(!store.end_session("u1").await);
    }

    #[tokio::test]
    async fn test_huge_timeouts_saturate() {
        let mut config = SessionConfig::default();
        config.timeout_seconds = u64::MAX;
        config.warning_seconds = u64::MAX - 1;
        let store = SessionStore::new(config, None);
        store.append_history("u1", Role::User, "hola").await;

        let report = store.sweep_expired_at(Utc::now() + chrono::Duration::days(365));
        assert!(report.evicted.is_empty());
        assert!(report.warned.is_empty());
        assert_eq!(store.check_inactivity("u1").await, Some(InactivityStatus::Active));
    }

    #[tokio::test]
    async fn test_warm_loads_uncached_session() {
        let storage = Arc::new(MemorySessionStorage::new());
        let mut stored = Session::new("u1");
        stored.push_history(HistoryTurn::new(Role::User, "earlier"), 50);
        storage.save(&stored).await.unwrap();

        let (mirror, _worker) = MirrorQueue::spawn(storage.clone(), &crate::config::MirrorConfig::default());
        let store = SessionStore::new(SessionConfig::default(), Some(mirror));

        assert!(store.warm("u1").await.unwrap());
        assert!(!store.warm("u1").await.unwrap());
        assert_eq!(store.history("u1", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_count_flows() {
        let store = store();
        store
            .set_flow("a", FlowType::Assistant, FlowType::Assistant.initial_step(), Payload::new())
            .await
            .unwrap();
        store.append_history("b", Role::User, "hola").await;

        let stats = store.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.sessions_in_flow, 1);
        assert_eq!(stats.flows.get(&FlowType::Assistant), Some(&1));
        assert!(stats.mirror.is_none());
    }
}
