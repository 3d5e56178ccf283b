use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Semaphore;

use crate::metrics::Metrics;
use crate::session::{
    CloseListener, CloseReason, CreateRequest, Session, SessionConfig, SessionError, SessionHooks,
    SessionSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("capacity reached: {0} concurrent sessions already running")]
    CapacityReached(usize),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    config: SessionConfig,
    metrics: Arc<Metrics>,
}

impl CloseListener for ManagerInner {
    fn on_session_closed(&self, session: &Session, reason: CloseReason) {
        let mut sessions = self.sessions.write();
        // The entry may already be gone (explicit delete) or, in theory,
        // belong to another session with the same id.
        let matches = sessions
            .get(session.id())
            .is_some_and(|s| std::ptr::eq(s.as_ref(), session));
        if matches {
            sessions.remove(session.id());
        }
        tracing::info!(session = %session.id(), %reason, "session closed");
    }
}

/// Registry of live sessions plus the admission gate.
///
/// Knows nothing about PTYs or sockets beyond what [`Session`] exposes.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, max_concurrent: usize, metrics: Arc<Metrics>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                config,
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Slots not currently held by a live session.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Admit and start a new session. Never waits for a slot.
    pub fn create(&self, request: &CreateRequest) -> Result<Arc<Session>, ManagerError> {
        let slot = Arc::clone(&self.inner.slots)
            .try_acquire_owned()
            .map_err(|_| ManagerError::CapacityReached(self.inner.max_concurrent))?;

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let listener: Weak<dyn CloseListener> = weak;
        let hooks = SessionHooks {
            listener: Some(listener),
            slot: Some(slot),
        };
        let session = Session::start(&self.inner.config, request, self.inner.metrics.clone(), hooks)
            .map_err(|e| {
                tracing::error!(?e, "failed to start session");
                ManagerError::from(e)
            })?;

        let mut sessions = self.inner.sessions.write();
        // A session that died during startup already ran its close callback
        // against an empty slot in the map; don't resurrect it.
        if !session.is_closed() {
            sessions.insert(session.id().to_string(), Arc::clone(&session));
        }
        drop(sessions);
        tracing::info!(session = %session.id(), "session registered");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// Remove `id` and close it with `reason`. Safe against a concurrent
    /// self-close; returns `NotFound` if the session is already gone.
    pub fn delete(&self, id: &str, reason: CloseReason) -> Result<(), ManagerError> {
        let session = self
            .inner
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        session.close(reason);
        Ok(())
    }

    /// Snapshot of every registered session.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every live session. Used on server shutdown.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.inner.sessions.write().drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closing sessions for shutdown");
        }
        for session in drained {
            session.close(CloseReason::InternalError);
        }
    }
}
