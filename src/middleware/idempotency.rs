//! Duplicate event detection
//!
//! Messaging providers retry deliveries, so the same event may arrive more
//! than once. Each session remembers the id of the last event it finished
//! processing; an event carrying that id again is skipped.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::models::InboundEvent;
use crate::state::{SessionLease, SessionStore};
use crate::utils::logging::log_duplicate_event;

/// Characters of the body that feed the fallback digest
const DIGEST_BODY_CHARS: usize = 100;

/// Guard over the per-session idempotency marker
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    sessions: Arc<SessionStore>,
}

impl IdempotencyGuard {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }

    /// Provider id when present, otherwise a digest of sender, timestamp and body
    pub fn event_id(event: &InboundEvent) -> String {
        match event.event_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => fallback_event_id(&event.sender_id, event.timestamp, event.content.body()),
        }
    }

    /// Check without creating a session.
    ///
    /// This is a fast path only; the authoritative check is
    /// [`IdempotencyGuard::is_duplicate_locked`] under the user's lease.
    pub async fn is_duplicate(&self, user_id: &str, event_id: &str) -> bool {
        let duplicate = self.sessions.last_processed_event_id(user_id).await.as_deref() == Some(event_id);
        if duplicate {
            log_duplicate_event(user_id, event_id);
        }
        duplicate
    }

    pub fn is_duplicate_locked(&self, lease: &SessionLease<'_>, event_id: &str) -> bool {
        let duplicate = lease.is_duplicate(event_id);
        if duplicate {
            log_duplicate_event(lease.user_id(), event_id);
        }
        duplicate
    }

    pub async fn record_processed(&self, user_id: &str, event_id: &str) {
        self.sessions.acquire(user_id).await.mark_processed(event_id);
    }

    pub fn record_processed_locked(&self, lease: &mut SessionLease<'_>, event_id: &str) {
        lease.mark_processed(event_id);
    }
}

/// Deterministic id for events that arrive without one
pub fn fallback_event_id(sender_id: &str, timestamp: i64, body: &str) -> String {
    let body_prefix: String = body.chars().take(DIGEST_BODY_CHARS).collect();

    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(body_prefix.as_bytes());

    hex::encode(hasher.finalize())
}
