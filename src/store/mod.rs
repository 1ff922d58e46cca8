//! Session persistence.
//!
//! The store is a pure persistence contract with optimistic versioning:
//! every successful [`SessionStore::save`] bumps `Session::version`, and a
//! save whose `expected_version` is stale fails with
//! [`StoreError::VersionConflict`] without writing anything. The store
//! holds no business logic; callers reload and re-apply their transition
//! on conflict.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use stagegate_common::{PipelineEvent, Session, SessionId, SessionSummary};

use crate::config::{StagegateConfig, StoreBackend};
use crate::errors::StoreError;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Durable keyed state per session, plus its append-only event log.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session at version 1.
    async fn create(&self, session: Session) -> Result<Session, StoreError>;

    async fn load(&self, id: SessionId) -> Result<Session, StoreError>;

    /// Persist `session` if the stored version equals `expected_version`.
    /// Returns the saved session carrying its new version.
    async fn save(&self, session: Session, expected_version: u64) -> Result<Session, StoreError>;

    /// Summaries of all sessions, most recently created first.
    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError>;

    /// Append to the session's event log. The store assigns the next
    /// sequence number, ignoring `event.seq`, and returns it.
    async fn append_event(&self, event: &PipelineEvent) -> Result<u64, StoreError>;

    /// All persisted events of a session in sequence order.
    async fn events(&self, id: SessionId) -> Result<Vec<PipelineEvent>, StoreError>;

    /// Highest persisted event sequence number, 0 if none.
    async fn last_event_seq(&self, id: SessionId) -> Result<u64, StoreError> {
        Ok(self.events(id).await?.last().map(|e| e.seq).unwrap_or(0))
    }
}

pub type SharedStore = Arc<dyn SessionStore>;

/// Open the store backend selected in the configuration.
pub fn open_store(config: &StagegateConfig) -> Result<SharedStore> {
    match config.toml.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemorySessionStore::new())),
        StoreBackend::Sqlite => {
            let path = config.store_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create session store directory")?;
            }
            let store = SqliteSessionStore::open(&path)
                .with_context(|| format!("Failed to open session store {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}
