//! Per-session progress events.
//!
//! The hub appends each event to the store's event log, which assigns the
//! session's next sequence number, then broadcasts it to live subscribers. A subscription starts with a `snapshot` event describing
//! the session as it is now and ends after the session's terminal event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use stagegate_common::{EventKind, PipelineEvent, SessionId};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::errors::StoreError;
use crate::store::SharedStore;

struct Channel {
    tx: broadcast::Sender<PipelineEvent>,
    /// Highest sequence number seen by this hub; `None` until read from the store.
    last_seq: Option<u64>,
}

type ChannelHandle = Arc<tokio::sync::Mutex<Channel>>;

#[derive(Clone)]
pub struct EventHub {
    store: SharedStore,
    channels: Arc<Mutex<HashMap<SessionId, ChannelHandle>>>,
    buffer: usize,
}

impl EventHub {
    pub fn new(store: SharedStore, buffer: usize) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    fn channel(&self, id: SessionId) -> ChannelHandle {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(id)
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(self.buffer);
                Arc::new(tokio::sync::Mutex::new(Channel { tx, last_seq: None }))
            })
            .clone()
    }

    fn drop_channel(&self, id: SessionId) {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    async fn last_seq(&self, id: SessionId, channel: &mut Channel) -> Result<u64, StoreError> {
        match channel.last_seq {
            Some(seq) => Ok(seq),
            None => {
                let seq = self.store.last_event_seq(id).await?;
                channel.last_seq = Some(seq);
                Ok(seq)
            }
        }
    }

    /// Persist and broadcast an event. Returns it as sent, carrying the
    /// sequence number the store assigned.
    pub async fn emit(&self, mut event: PipelineEvent) -> PipelineEvent {
        let id = event.session_id;
        let handle = self.channel(id);
        let mut channel = handle.lock().await;

        event.seq = match self.store.append_event(&event).await {
            Ok(seq) => seq,
            Err(e) => {
                // Still tell live subscribers, numbered after what this hub has seen.
                let last = self.last_seq(id, &mut channel).await.unwrap_or(0);
                tracing::warn!(session = %id, error = %e, "failed to persist event");
                last + 1
            }
        };
        channel.last_seq = Some(channel.last_seq.map_or(event.seq, |last| last.max(event.seq)));
        tracing::debug!(session = %id, seq = event.seq, kind = %event.kind, "event");
        // No receivers is fine.
        let _ = channel.tx.send(event.clone());
        drop(channel);

        if event.is_terminal() {
            self.drop_channel(id);
        }
        event
    }

    /// Subscribe to a session's events from its current state onward.
    pub async fn subscribe(
        &self,
        id: SessionId,
    ) -> Result<BoxStream<'static, PipelineEvent>, StoreError> {
        // Receiver first, then the snapshot, so nothing falls in between.
        let handle = self.channel(id);
        let (rx, after) = {
            // Read the log itself; other processes may have appended to it.
            let mut channel = handle.lock().await;
            let after = self.store.last_event_seq(id).await?;
            channel.last_seq = Some(after);
            (channel.tx.subscribe(), after)
        };

        let session = match self.store.load(id).await {
            Ok(session) => session,
            Err(e) => {
                self.drop_channel(id);
                return Err(e);
            }
        };
        let status = session.status();
        let mut snapshot = PipelineEvent::new(id, session.current_stage, EventKind::Snapshot)
            .with_detail(serde_json::to_string(&status).map_err(StoreError::Serialization)?);
        snapshot.seq = after;

        if session.is_terminal() {
            self.drop_channel(id);
            return Ok(stream::once(async move { snapshot }).boxed());
        }

        let live = stream::unfold(Some(rx), move |state| async move {
            let mut rx = state?;
            loop {
                match rx.recv().await {
                    Ok(event) if event.seq <= after => continue,
                    Ok(event) => {
                        let next = if event.is_terminal() { None } else { Some(rx) };
                        return Some((event, next));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(session = %id, skipped, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::once(async move { snapshot }).chain(live).boxed())
    }

    /// Persisted events of a session, oldest first.
    pub async fn history(&self, id: SessionId) -> Result<Vec<PipelineEvent>, StoreError> {
        self.store.events(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySessionStore, SessionStore};
    use stagegate_common::{Session, Stage};

    async fn hub_with_session() -> (EventHub, SharedStore, SessionId) {
        let store: SharedStore = Arc::new(MemorySessionStore::new());
        let session = store.create(Session::new("doc")).await.unwrap();
        (EventHub::new(store.clone(), 16), store, session.session_id)
    }

    #[tokio::test]
    async fn emit_assigns_increasing_seq_and_persists() {
        let (hub, store, id) = hub_with_session().await;
        let a = hub
            .emit(PipelineEvent::new(id, Stage::Requirements, EventKind::SessionStarted))
            .await;
        let b = hub
            .emit(PipelineEvent::new(id, Stage::Requirements, EventKind::StageStarted))
            .await;
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        let log = store.events(id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].kind, EventKind::StageStarted);
    }

    #[tokio::test]
    async fn seq_continues_from_persisted_log() {
        let (hub, store, id) = hub_with_session().await;
        hub.emit(PipelineEvent::new(id, Stage::Requirements, EventKind::SessionStarted))
            .await;

        // A fresh hub over the same store picks up where the log ends.
        let fresh = EventHub::new(store, 16);
        let event = fresh
            .emit(PipelineEvent::new(id, Stage::Requirements, EventKind::StageStarted))
            .await;
        assert_eq!(event.seq, 2);
    }

    #[tokio::test]
    async fn hubs_sharing_a_store_never_reuse_a_seq() {
        let (first, store, id) = hub_with_session().await;
        let second = EventHub::new(store.clone(), 16);

        let kinds = [
            EventKind::SessionStarted,
            EventKind::StageStarted,
            EventKind::GateOpened,
            EventKind::DecisionApplied,
        ];
        let mut emitted = Vec::new();
        for (i, kind) in kinds.iter().enumerate() {
            let hub = if i % 2 == 0 { &first } else { &second };
            emitted.push(hub.emit(PipelineEvent::new(id, Stage::Requirements, *kind)).await.seq);
        }
        assert_eq!(emitted, vec![1, 2, 3, 4]);

        let log: Vec<EventKind> = store.events(id).await.unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(log, kinds.to_vec());
    }

    #[tokio::test]
    async fn subscription_starts_with_snapshot_and_ends_at_terminal() {
        let (hub, _store, id) = hub_with_session().await;
        hub.emit(PipelineEvent::new(id, Stage::Requirements, EventKind::SessionStarted))
            .await;

        let mut events = hub.subscribe(id).await.unwrap();
        hub.emit(PipelineEvent::new(id, Stage::Requirements, EventKind::GateOpened))
            .await;
        hub.emit(PipelineEvent::new(id, Stage::Terminated, EventKind::SessionTerminated))
            .await;

        let snapshot = events.next().await.unwrap();
        assert_eq!(snapshot.kind, EventKind::Snapshot);
        assert_eq!(snapshot.seq, 1);
        let status: serde_json::Value = serde_json::from_str(&snapshot.detail).unwrap();
        assert_eq!(status["current_stage"], "requirements");

        assert_eq!(events.next().await.unwrap().kind, EventKind::GateOpened);
        assert_eq!(
            events.next().await.unwrap().kind,
            EventKind::SessionTerminated
        );
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribing_to_terminal_session_yields_only_snapshot() {
        let (hub, store, id) = hub_with_session().await;
        let mut session = store.load(id).await.unwrap();
        session.current_stage = Stage::Finalized;
        store.save(session, 1).await.unwrap();

        let events: Vec<_> = hub.subscribe(id).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Snapshot);
        assert_eq!(events[0].stage, Stage::Finalized);
    }

    #[tokio::test]
    async fn subscribing_to_unknown_session_fails() {
        let store: SharedStore = Arc::new(MemorySessionStore::new());
        let hub = EventHub::new(store, 16);
        let err = hub.subscribe(SessionId::new()).await.err().unwrap();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
