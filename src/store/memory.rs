use std::collections::HashMap;

use async_trait::async_trait;
use stagegate_common::{PipelineEvent, Session, SessionId, SessionSummary};
use tokio::sync::RwLock;

use super::SessionStore;
use crate::errors::StoreError;

/// In-process store. Sessions are lost when the process exits.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    events: RwLock<HashMap<SessionId, Vec<PipelineEvent>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, mut session: Session) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let id = session.session_id;
        if sessions.contains_key(&id) {
            return Err(StoreError::AlreadyExists { id });
        }
        session.version = 1;
        sessions.insert(id, session.clone());
        tracing::debug!(session = %id, "session created");
        Ok(session)
    }

    async fn load(&self, id: SessionId) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { id })
    }

    async fn save(&self, mut session: Session, expected_version: u64) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let id = session.session_id;
        let current = sessions.get(&id).ok_or(StoreError::NotFound { id })?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }
        session.version = expected_version + 1;
        sessions.insert(id, session.clone());
        tracing::debug!(session = %id, version = session.version, "session saved");
        Ok(session)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(Session::summary)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn append_event(&self, event: &PipelineEvent) -> Result<u64, StoreError> {
        let mut events = self.events.write().await;
        let log = events.entry(event.session_id).or_default();
        let seq = log.last().map(|e| e.seq).unwrap_or(0) + 1;
        let mut event = event.clone();
        event.seq = seq;
        log.push(event);
        Ok(seq)
    }

    async fn events(&self, id: SessionId) -> Result<Vec<PipelineEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}
