//! Durable session mirror
//!
//! Sessions live in process memory; every mutation is also mirrored to a
//! durable store so a session can be warmed again after a restart. Mirror
//! writes go through a bounded queue drained by a single background worker,
//! so a slow or failing store never blocks message handling. Failures are
//! logged and counted, never propagated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::session::Session;
use crate::config::{MirrorConfig, RedisConfig};
use crate::utils::errors::{ConversaError, Result};
use crate::utils::logging::log_mirror_failure;

/// Durable copy of sessions
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn save(&self, session: &Session) -> Result<()>;

    async fn load(&self, user_id: &str) -> Result<Option<Session>>;

    async fn delete(&self, user_id: &str) -> Result<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Redis-backed session persistence
#[derive(Clone)]
pub struct RedisSessionStorage {
    connection_manager: redis::aio::ConnectionManager,
    config: RedisConfig,
}

impl RedisSessionStorage {
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection_manager = redis::aio::ConnectionManager::new(client).await?;

        Ok(Self {
            connection_manager,
            config,
        })
    }

    /// Test Redis connection
    pub async fn test_connection(&self) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn session_key(&self, user_id: &str) -> String {
        session_key(&self.config.prefix, user_id)
    }
}

fn session_key(prefix: &str, user_id: &str) -> String {
    format!("{}session:{}", prefix, user_id)
}

#[async_trait]
impl SessionPersistence for RedisSessionStorage {
    async fn save(&self, session: &Session) -> Result<()> {
        let key = self.session_key(session.user_id());
        let serialized = serde_json::to_string(session)?;
        debug!(user_id = session.user_id(), key = %key, bytes = serialized.len(), "Saving session to Redis");

        let mut conn = self.connection_manager.clone();
        conn.set_ex::<_, _, ()>(&key, serialized, self.config.ttl_seconds).await?;
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Option<Session>> {
        let key = self.session_key(user_id);
        let mut conn = self.connection_manager.clone();

        let serialized: Option<String> = conn.get(&key).await?;
        match serialized {
            Some(data) => {
                let session: Session = serde_json::from_str(&data)?;
                debug!(user_id = user_id, flow = ?session.current_flow(), "Session loaded from Redis");
                Ok(Some(session))
            }
            None => {
                debug!(user_id = user_id, "No session found in Redis");
                Ok(None)
            }
        }
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        let key = self.session_key(user_id);
        let mut conn = self.connection_manager.clone();

        let deleted: u32 = conn.del(&key).await?;
        debug!(user_id = user_id, deleted = deleted, "Deleted session from Redis");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisSessionStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSessionStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// In-process persistence for tests and local runs.
///
/// Sessions are stored serialized so loads go through the same snapshot
/// format as Redis. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    sessions: DashMap<String, String>,
    failing: AtomicBool,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ConversaError::DurablePersistenceFailure(
                "memory storage unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionPersistence for MemorySessionStorage {
    async fn save(&self, session: &Session) -> Result<()> {
        self.check_available()?;
        let serialized = serde_json::to_string(session)?;
        self.sessions.insert(session.user_id().to_string(), serialized);
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Option<Session>> {
        self.check_available()?;
        match self.sessions.get(user_id) {
            Some(data) => Ok(Some(serde_json::from_str(data.value())?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        self.check_available()?;
        self.sessions.remove(user_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

enum MirrorOp {
    Save(Box<Session>),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct MirrorCounters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Mirror queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    pub enqueued: u64,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Sending side of the mirror queue
#[derive(Clone)]
pub struct MirrorQueue {
    tx: mpsc::Sender<MirrorOp>,
    persistence: Arc<dyn SessionPersistence>,
    counters: Arc<MirrorCounters>,
    timeout: Duration,
}

/// Background task draining the mirror queue
#[derive(Debug)]
pub struct MirrorWorker {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MirrorQueue {
    /// Spawn the worker and return the queue feeding it
    pub fn spawn(persistence: Arc<dyn SessionPersistence>, config: &MirrorConfig) -> (Self, MirrorWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(MirrorCounters::default());

        let handle = tokio::spawn(run_worker(
            rx,
            Arc::clone(&persistence),
            config.write_timeout(),
            Arc::clone(&counters),
        ));
        info!(
            backend = persistence.name(),
            capacity = config.queue_capacity,
            "Started session mirror worker"
        );

        (
            Self {
                tx,
                persistence,
                counters,
                timeout: config.write_timeout(),
            },
            MirrorWorker { handle: Some(handle) },
        )
    }

    /// Queue a snapshot of the session; never waits
    pub fn enqueue_save(&self, session: &Session) {
        self.enqueue(session.user_id(), MirrorOp::Save(Box::new(session.clone())));
    }

    /// Queue deletion of the durable copy; never waits
    pub fn enqueue_delete(&self, user_id: &str) {
        self.enqueue(user_id, MirrorOp::Delete(user_id.to_string()));
    }

    fn enqueue(&self, user_id: &str, op: MirrorOp) {
        match self.tx.try_send(op) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log_mirror_failure(user_id, "enqueue", "mirror queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log_mirror_failure(user_id, "enqueue", "mirror worker stopped");
            }
        }
    }

    /// Wait until everything queued before this call has been attempted
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(MirrorOp::Flush(ack_tx)).await.is_err() {
            warn!("Mirror worker stopped before flush");
            return;
        }
        let _ = ack_rx.await;
    }

    /// Read a session straight from the durable store, bounded by the write timeout
    pub async fn load(&self, user_id: &str) -> Result<Option<Session>> {
        tokio::time::timeout(self.timeout, self.persistence.load(user_id))
            .await
            .map_err(|_| ConversaError::Timeout(format!("loading session for {}", user_id)))?
    }

    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MirrorQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorQueue")
            .field("backend", &self.persistence.name())
            .field("stats", &self.stats())
            .finish()
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<MirrorOp>,
    persistence: Arc<dyn SessionPersistence>,
    write_timeout: Duration,
    counters: Arc<MirrorCounters>,
) {
    while let Some(op) = rx.recv().await {
        let (user_id, operation, result) = match op {
            MirrorOp::Save(session) => {
                let result = tokio::time::timeout(write_timeout, persistence.save(&session)).await;
                (session.user_id().to_string(), "save", result)
            }
            MirrorOp::Delete(user_id) => {
                let result = tokio::time::timeout(write_timeout, persistence.delete(&user_id)).await;
                (user_id, "delete", result)
            }
            MirrorOp::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        match result {
            Ok(Ok(())) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log_mirror_failure(&user_id, operation, &e.to_string());
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log_mirror_failure(&user_id, operation, "write timed out");
            }
        }
    }

    debug!("Session mirror worker stopped");
}

impl MirrorWorker {
    /// Stop the worker without draining the queue
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Stopped session mirror worker");
        }
    }
}

impl Drop for MirrorWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror_config() -> MirrorConfig {
        MirrorConfig {
            enabled: true,
            queue_capacity: 16,
            write_timeout_ms: 500,
        }
    }

    #[test]
    fn test_session_key_format() {
        assert_eq!(session_key("conversa:", "+34600"), "conversa:session:+34600");
    }

    #[tokio::test]
    async fn test_mirror_writes_and_deletes() {
        let storage = Arc::new(MemorySessionStorage::new());
        let (queue, _worker) = MirrorQueue::spawn(storage.clone(), &mirror_config());

        queue.enqueue_save(&Session::new("u1"));
        queue.flush().await;
        assert!(storage.contains("u1"));
        assert!(queue.load("u1").await.unwrap().is_some());

        queue.enqueue_delete("u1");
        queue.flush().await;
        assert!(!storage.contains("u1"));

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.written, 2);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_mirror_failures_are_counted_not_raised() {
        let storage = Arc::new(MemorySessionStorage::new());
        storage.set_failing(true);
        let (queue, _worker) = MirrorQueue::spawn(storage.clone(), &mirror_config());

        queue.enqueue_save(&Session::new("u1"));
        queue.flush().await;

        assert!(storage.is_empty());
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let storage = Arc::new(MemorySessionStorage::new());
        let config = MirrorConfig {
            queue_capacity: 1,
            ..mirror_config()
        };
        let (queue, mut worker) = MirrorQueue::spawn(storage, &config);
        worker.stop();
        tokio::task::yield_now().await;

        for i in 0..3 {
            queue.enqueue_save(&Session::new(format!("u{}", i)));
        }

        assert!(queue.stats().dropped >= 2);
    }
}
