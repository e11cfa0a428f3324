use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::domain::conversation::{ConversationContext, SessionId, Turn};
use parley_core::errors::DomainError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, RwLock};

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("session storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_turns: usize,
}

impl SessionSummary {
    pub fn from_context(context: &ConversationContext) -> Option<Self> {
        Some(Self {
            session_id: context.session_id.clone(),
            started_at: context.started_at()?,
            last_activity: context.last_activity()?,
            total_turns: context.len(),
        })
    }
}

/// Persistence seam for conversation history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// History for `session_id`; an unknown session starts empty.
    async fn load(&self, session_id: &SessionId) -> Result<ConversationContext, SessionStoreError>;

    /// Appends `turns` in order. Either all of them land or none do.
    async fn append(&self, session_id: &SessionId, turns: Vec<Turn>) -> Result<(), SessionStoreError>;

    /// Drops the session's history. Returns `false` when nothing was stored.
    async fn clear(&self, session_id: &SessionId) -> Result<bool, SessionStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, ConversationContext>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &SessionId) -> Result<ConversationContext, SessionStoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| ConversationContext::new(session_id.clone())))
    }

    async fn append(&self, session_id: &SessionId, turns: Vec<Turn>) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let mut updated = sessions
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| ConversationContext::new(session_id.clone()));
        for turn in turns {
            updated.append(turn)?;
        }
        sessions.insert(session_id.clone(), updated);
        Ok(())
    }

    async fn clear(&self, session_id: &SessionId) -> Result<bool, SessionStoreError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}

/// One async mutex per session so requests for the same session run one at
/// a time while different sessions proceed in parallel.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `session_id`. Waiters are served in
    /// arrival order.
    pub async fn acquire(&self, session_id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(session_id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops locks nobody holds or waits on.
    pub fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}
