// ABOUTME: Groups streamed generation output into timeline messages
// ABOUTME: Assigns message ids by role, forwards to live subscribers and persists through an ordered writer

use crate::events::{EventHub, LiveEvent};
use chrono::{DateTime, Utc};
use sandcastle_storage::{MessageRole, Persistence, StorageResult, TimelineMessage};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub const PERSIST_MAX_ATTEMPTS: u32 = 3;
pub const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Run a storage operation, retrying lock contention with linear backoff
pub async fn retry_on_busy<T, F, Fut>(operation: &str, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_busy() && attempt < PERSIST_MAX_ATTEMPTS => {
                debug!("{} hit busy storage (attempt {}), retrying", operation, attempt);
                tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

struct OpenMessage {
    id: String,
    role: MessageRole,
    content: String,
    timestamp: DateTime<Utc>,
}

struct SessionTrack {
    current: Option<OpenMessage>,
    force_new: bool,
    writer: mpsc::UnboundedSender<TimelineMessage>,
    writer_task: JoinHandle<()>,
}

/// Per-session message grouping and delivery
pub struct MessageTracker {
    persistence: Arc<dyn Persistence>,
    events: Arc<EventHub>,
    sessions: Mutex<HashMap<String, SessionTrack>>,
}

impl MessageTracker {
    pub fn new(persistence: Arc<dyn Persistence>, events: Arc<EventHub>) -> Self {
        Self {
            persistence,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record `content` from `role` and return the id of the message it belongs to.
    ///
    /// `system` always opens a new message. `user` and `assistant` extend the
    /// open message while the role is unchanged, unless `reset` was called.
    /// Must be called from within a tokio runtime.
    pub fn emit(&self, session_id: &str, role: MessageRole, content: &str) -> String {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let track = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.open_track(session_id));

        let continues = !track.force_new
            && role != MessageRole::System
            && track.current.as_ref().is_some_and(|m| m.role == role);
        track.force_new = false;

        let message = match track.current.take() {
            Some(mut open) if continues => {
                open.content.push_str(content);
                open
            }
            _ => OpenMessage {
                id: format!("msg_{}", Uuid::new_v4().simple()),
                role,
                content: content.to_string(),
                timestamp: Utc::now(),
            },
        };

        let record = TimelineMessage {
            id: message.id.clone(),
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp,
        };
        track.current = Some(message);

        self.events.publish(
            session_id,
            LiveEvent::LlmMessage {
                id: record.id.clone(),
                role: record.role,
                content: record.content.clone(),
                timestamp: record.timestamp,
            },
        );

        let id = record.id.clone();
        if track.writer.send(record).is_err() {
            warn!(session_id = %session_id, "Message writer is gone; message {} not persisted", id);
        }
        id
    }

    /// Make the next emission start a new message
    pub fn reset(&self, session_id: &str) {
        if let Some(track) = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(session_id)
        {
            track.force_new = true;
        }
    }

    /// Drop the session's tracking state and wait for its queued writes to land
    pub async fn cleanup(&self, session_id: &str) {
        let track = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        if let Some(track) = track {
            drop(track.writer);
            if let Err(e) = track.writer_task.await {
                warn!(session_id = %session_id, "Message writer task failed: {}", e);
            }
        }
    }

    pub fn is_tracking(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    fn open_track(&self, session_id: &str) -> SessionTrack {
        let (writer, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(run_writer(
            session_id.to_string(),
            Arc::clone(&self.persistence),
            rx,
        ));
        SessionTrack {
            current: None,
            force_new: false,
            writer,
            writer_task,
        }
    }
}

/// Persist messages in emission order. Queued updates to the same message are
/// collapsed to the latest content since every write carries the full text.
async fn run_writer(
    session_id: String,
    persistence: Arc<dyn Persistence>,
    mut rx: mpsc::UnboundedReceiver<TimelineMessage>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        for message in coalesce(batch) {
            let result = retry_on_busy("persist message", || persistence.upsert_message(&message)).await;
            if let Err(e) = result {
                warn!(
                    session_id = %session_id,
                    message_id = %message.id,
                    "Failed to persist message: {}",
                    e
                );
            }
        }
    }
    debug!(session_id = %session_id, "Message writer finished");
}

fn coalesce(batch: Vec<TimelineMessage>) -> Vec<TimelineMessage> {
    let mut ordered: Vec<TimelineMessage> = Vec::with_capacity(batch.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for message in batch {
        match index.get(&message.id) {
            Some(&i) => ordered[i] = message,
            None => {
                index.insert(message.id.clone(), ordered.len());
                ordered.push(message);
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandcastle_storage::{Session, SessionFile, StorageError};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records message upserts; the first `busy_failures` calls fail as locked
    #[derive(Default)]
    struct RecordingStore {
        busy_failures: AtomicU32,
        messages: Mutex<Vec<TimelineMessage>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Persistence for RecordingStore {
        async fn upsert_session(&self, _session: &Session) -> StorageResult<()> {
            Ok(())
        }
        async fn get_session(&self, _id: &str) -> StorageResult<Option<Session>> {
            Ok(None)
        }
        async fn list_sessions(&self) -> StorageResult<Vec<Session>> {
            Ok(Vec::new())
        }
        async fn delete_session(&self, _id: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn upsert_message(&self, message: &TimelineMessage) -> StorageResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .busy_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Database("database is locked".to_string()));
            }
            let mut messages = self.messages.lock().unwrap();
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => messages.push(message.clone()),
            }
            Ok(())
        }
        async fn list_messages(&self, _session_id: &str) -> StorageResult<Vec<TimelineMessage>> {
            Ok(self.messages.lock().unwrap().clone())
        }
        async fn save_file(&self, _s: &str, _p: &str, _c: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn list_files(&self, _session_id: &str) -> StorageResult<Vec<SessionFile>> {
            Ok(Vec::new())
        }
    }

    fn tracker(store: Arc<RecordingStore>) -> (MessageTracker, Arc<EventHub>) {
        let hub = Arc::new(EventHub::default());
        (MessageTracker::new(store, Arc::clone(&hub)), hub)
    }

    #[tokio::test]
    async fn test_same_role_shares_id() {
        let (tracker, _) = tracker(Arc::new(RecordingStore::default()));
        let first = tracker.emit("s1", MessageRole::Assistant, "Hello");
        let second = tracker.emit("s1", MessageRole::Assistant, " world");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_system_splits_assistant_messages() {
        let (tracker, _) = tracker(Arc::new(RecordingStore::default()));
        let a = tracker.emit("s1", MessageRole::Assistant, "Planning");
        let s = tracker.emit("s1", MessageRole::System, "Wrote package.json");
        let b = tracker.emit("s1", MessageRole::Assistant, "Next");

        assert_ne!(a, s);
        assert_ne!(s, b);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_consecutive_system_messages_are_separate() {
        let (tracker, _) = tracker(Arc::new(RecordingStore::default()));
        let a = tracker.emit("s1", MessageRole::System, "one");
        let b = tracker.emit("s1", MessageRole::System, "two");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_role_change_starts_new_message() {
        let (tracker, _) = tracker(Arc::new(RecordingStore::default()));
        let user = tracker.emit("s1", MessageRole::User, "Build a todo app");
        let assistant = tracker.emit("s1", MessageRole::Assistant, "Sure");
        assert_ne!(user, assistant);
    }

    #[tokio::test]
    async fn test_reset_forces_new_id() {
        let (tracker, _) = tracker(Arc::new(RecordingStore::default()));
        let a = tracker.emit("s1", MessageRole::Assistant, "before tool");
        tracker.reset("s1");
        let b = tracker.emit("s1", MessageRole::Assistant, "after tool");
        let c = tracker.emit("s1", MessageRole::Assistant, " continued");
        assert_ne!(a, b);
        assert_eq!(b, c);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (tracker, _) = tracker(Arc::new(RecordingStore::default()));
        let a = tracker.emit("s1", MessageRole::Assistant, "x");
        let b = tracker.emit("s2", MessageRole::Assistant, "x");
        assert_ne!(a, b);
        assert_eq!(tracker.emit("s1", MessageRole::Assistant, "y"), a);
    }

    #[tokio::test]
    async fn test_live_events_carry_accumulated_content() {
        let (tracker, hub) = tracker(Arc::new(RecordingStore::default()));
        let mut rx = hub.subscribe("s1");
        tracker.emit("s1", MessageRole::Assistant, "Hel");
        tracker.emit("s1", MessageRole::Assistant, "lo");

        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            LiveEvent::LlmMessage { content, role, .. } => {
                assert_eq!(content, "Hello");
                assert_eq!(role, MessageRole::Assistant);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persists_in_emission_order_after_cleanup() {
        let store = Arc::new(RecordingStore::default());
        let (tracker, _) = tracker(Arc::clone(&store));

        tracker.emit("s1", MessageRole::User, "Build it");
        tracker.emit("s1", MessageRole::Assistant, "Work");
        tracker.emit("s1", MessageRole::Assistant, "ing");
        tracker.emit("s1", MessageRole::System, "Done");
        tracker.cleanup("s1").await;

        let messages = store.messages.lock().unwrap().clone();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Build it", "Working", "Done"]);
        assert!(!tracker.is_tracking("s1"));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (tracker, _) = tracker(Arc::new(RecordingStore::default()));
        tracker.emit("s1", MessageRole::System, "hi");
        tracker.cleanup("s1").await;
        tracker.cleanup("s1").await;
        tracker.cleanup("never-seen").await;
        assert!(!tracker.is_tracking("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_storage_is_retried() {
        let store = Arc::new(RecordingStore {
            busy_failures: AtomicU32::new(2),
            ..Default::default()
        });
        let (tracker, _) = tracker(Arc::clone(&store));

        tracker.emit("s1", MessageRole::System, "persist me");
        tracker.cleanup("s1").await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_retry_gives_up_after_three_attempts() {
        let store = Arc::new(RecordingStore {
            busy_failures: AtomicU32::new(10),
            ..Default::default()
        });
        let (tracker, _) = tracker(Arc::clone(&store));

        tracker.emit("s1", MessageRole::System, "lost");
        tracker.cleanup("s1").await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_busy_errors_are_not_retried() {
        let mut calls = 0;
        let result: StorageResult<()> = retry_on_busy("op", || {
            calls += 1;
            async { Err(StorageError::NotFound("x".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_coalesce_keeps_first_position_and_last_content() {
        let msg = |id: &str, content: &str| TimelineMessage {
            id: id.to_string(),
            session_id: "s1".to_string(),
            role: MessageRole::Assistant,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        let out = coalesce(vec![msg("a", "1"), msg("b", "x"), msg("a", "12")]);
        let pairs: Vec<(&str, &str)> = out.iter().map(|m| (m.id.as_str(), m.content.as_str())).collect();
        assert_eq!(pairs, vec![("a", "12"), ("b", "x")]);
    }
}
