use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    chrono::{DateTime, Utc},
    thiserror::Error,
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, info},
};

use crate::{
    key::SessionKey,
    session::{Session, SessionSettings, SessionSummary},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Describes where a new session comes from.
#[derive(Debug, Clone, Default)]
pub struct SessionOrigin {
    pub agent_id: String,
    pub channel: String,
    pub chat_id: String,
    pub peer_id: Option<String>,
    pub workspace: Option<String>,
}

/// In-memory session map.
///
/// Each session sits behind its own mutex; holding it serializes all work on
/// that session. The TTL sweep only evicts sessions it can lock without
/// waiting, so a session being processed is never evicted mid-turn.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    ttl: Duration,
    default_settings: SessionSettings,
}

impl SessionStore {
    pub fn new(ttl: Duration, default_settings: SessionSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            default_settings,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn default_settings(&self) -> &SessionSettings {
        &self.default_settings
    }

    /// Fetch the session for `origin`, creating it on first use.
    pub async fn get_or_create(&self, origin: &SessionOrigin) -> Arc<Mutex<Session>> {
        let key = SessionKey::for_chat(&origin.agent_id, &origin.channel, &origin.chat_id);
        if let Some(existing) = self.sessions.read().await.get(key.as_str()) {
            // Refresh under the map lock so a concurrent sweep sees it as live.
            if let Ok(mut session) = existing.try_lock() {
                session.touch();
            }
            return Arc::clone(existing);
        }

        let mut sessions = self.sessions.write().await;
        // Another task may have created it between the two locks.
        let entry = sessions.entry(key.to_string()).or_insert_with(|| {
            let mut session = Session::new(
                key.as_str(),
                origin.agent_id.as_str(),
                origin.channel.as_str(),
                origin.chat_id.as_str(),
                self.default_settings.clone(),
            );
            session.peer_id = origin.peer_id.clone();
            session.workspace = origin.workspace.clone();
            info!(session_id = %key, channel = %origin.channel, "session created");
            Arc::new(Mutex::new(session))
        });
        Arc::clone(entry)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Result<(), SessionError> {
        match self.sessions.write().await.remove(id) {
            Some(_) => {
                info!(session_id = id, "session deleted");
                Ok(())
            },
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    pub async fn reset(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.lock().await.reset();
        debug!(session_id = id, "session reset");
        Ok(())
    }

    pub async fn summary(&self, id: &str) -> Result<SessionSummary, SessionError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let summary = session.lock().await.summary();
        Ok(summary)
    }

    /// Summaries of all sessions, most recently active first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Evict sessions idle longer than the TTL. Returns the evicted ids.
    pub async fn sweep_expired(&self) -> Vec<String> {
        self.sweep_expired_at(Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();
        sessions.retain(|id, handle| {
            // A handle held outside the map is about to be used.
            if Arc::strong_count(handle) > 1 {
                return true;
            }
            let Ok(session) = handle.try_lock() else {
                return true;
            };
            if session.is_expired(now, ttl) {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            info!(count = evicted.len(), remaining = sessions.len(), "evicted idle sessions");
        }
        evicted
    }
}
