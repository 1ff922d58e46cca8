use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use stagegate_common::{PipelineEvent, Session, SessionId, SessionSummary};

use super::SessionStore;
use crate::errors::StoreError;

/// Other processes may hold the database; wait this long for their locks.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Attempts at appending an event when another writer took the same seq.
const APPEND_ATTEMPTS: u32 = 8;

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(e))
}

/// Lost a race with another connection; the statement can simply be rerun.
fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// SQLite connection with the session schema applied.
pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    current_stage TEXT NOT NULL,
                    record TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS session_events (
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (session_id, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn current_version(&self, id: &str) -> Result<Option<u64>, StoreError> {
        self.conn
            .query_row(
                "SELECT version FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.map(|v| v as u64))
            .map_err(backend)
    }

    pub fn create(&self, mut session: Session) -> Result<Session, StoreError> {
        let id = session.session_id;
        if self.current_version(&id.to_string())?.is_some() {
            return Err(StoreError::AlreadyExists { id });
        }
        session.version = 1;
        let record = serde_json::to_string(&session).map_err(StoreError::Serialization)?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, version, current_stage, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    id.to_string(),
                    session.version as i64,
                    session.current_stage.as_str(),
                    record,
                    session.created_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;
        Ok(session)
    }

    pub fn load(&self, id: SessionId) -> Result<Session, StoreError> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM sessions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let record = record.ok_or(StoreError::NotFound { id })?;
        serde_json::from_str(&record).map_err(StoreError::Serialization)
    }

    /// Versioned write: the `WHERE version = ?` clause is the conflict check.
    pub fn save(&self, mut session: Session, expected_version: u64) -> Result<Session, StoreError> {
        let id = session.session_id;
        session.version = expected_version + 1;
        let record = serde_json::to_string(&session).map_err(StoreError::Serialization)?;
        let updated = self
            .conn
            .execute(
                "UPDATE sessions
                 SET version = ?1, current_stage = ?2, record = ?3, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    session.version as i64,
                    session.current_stage.as_str(),
                    record,
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                    expected_version as i64,
                ],
            )
            .map_err(backend)?;
        if updated == 1 {
            return Ok(session);
        }
        match self.current_version(&id.to_string())? {
            None => Err(StoreError::NotFound { id }),
            Some(actual) => Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual,
            }),
        }
    }

    pub fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM sessions ORDER BY created_at DESC")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(backend)?;
        let mut summaries = Vec::new();
        for row in rows {
            let session: Session =
                serde_json::from_str(&row.map_err(backend)?).map_err(StoreError::Serialization)?;
            summaries.push(session.summary());
        }
        Ok(summaries)
    }

    /// Append an event under the next free sequence number of its session.
    ///
    /// The number is picked and inserted in one statement, so connections
    /// from other processes never share one; the primary key turns a lost
    /// race into a constraint error, which is retried.
    pub fn append_event(&self, event: &PipelineEvent) -> Result<u64, StoreError> {
        let payload = serde_json::to_string(event).map_err(StoreError::Serialization)?;
        let session_id = event.session_id.to_string();
        let mut attempt = 1;
        loop {
            let inserted = self.conn.query_row(
                "INSERT INTO session_events (session_id, seq, kind, payload)
                 SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3
                 FROM session_events WHERE session_id = ?1
                 RETURNING seq",
                params![session_id, event.kind.as_str(), payload],
                |row| row.get::<_, i64>(0),
            );
            match inserted {
                Ok(seq) => return Ok(seq as u64),
                Err(e) if is_contention(&e) && attempt < APPEND_ATTEMPTS => {
                    tracing::debug!(session = %event.session_id, attempt, "event seq taken, retrying");
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(5 * u64::from(attempt)));
                }
                Err(e) => return Err(backend(e)),
            }
        }
    }

    pub fn events(&self, id: SessionId) -> Result<Vec<PipelineEvent>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, payload FROM session_events WHERE session_id = ?1 ORDER BY seq")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(backend)?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, payload) = row.map_err(backend)?;
            let mut event: PipelineEvent =
                serde_json::from_str(&payload).map_err(StoreError::Serialization)?;
            // The column is authoritative.
            event.seq = seq as u64;
            events.push(event);
        }
        Ok(events)
    }

    pub fn last_event_seq(&self, id: SessionId) -> Result<u64, StoreError> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(seq) FROM session_events WHERE session_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(seq.unwrap_or(0) as u64)
    }
}

/// Async-safe handle to a [`SessionDb`].
///
/// All access runs on tokio's blocking pool via `spawn_blocking` so that
/// synchronous SQLite I/O never ties up async worker threads.
#[derive(Clone)]
pub struct SqliteSessionStore {
    inner: Arc<Mutex<SessionDb>>,
}

impl SqliteSessionStore {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(SessionDb::open(path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(SessionDb::open_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&SessionDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: Session) -> Result<Session, StoreError> {
        let id = session.session_id;
        let created = self.call(move |db| db.create(session)).await?;
        tracing::debug!(session = %id, "session created");
        Ok(created)
    }

    async fn load(&self, id: SessionId) -> Result<Session, StoreError> {
        self.call(move |db| db.load(id)).await
    }

    async fn save(&self, session: Session, expected_version: u64) -> Result<Session, StoreError> {
        let saved = self
            .call(move |db| db.save(session, expected_version))
            .await?;
        tracing::debug!(session = %saved.session_id, version = saved.version, "session saved");
        Ok(saved)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.call(|db| db.list()).await
    }

    async fn append_event(&self, event: &PipelineEvent) -> Result<u64, StoreError> {
        let event = event.clone();
        self.call(move |db| db.append_event(&event)).await
    }

    async fn events(&self, id: SessionId) -> Result<Vec<PipelineEvent>, StoreError> {
        self.call(move |db| db.events(id)).await
    }

    async fn last_event_seq(&self, id: SessionId) -> Result<u64, StoreError> {
        self.call(move |db| db.last_event_seq(id)).await
    }
}
