// ABOUTME: Room-scoped live event channel for pipeline subscribers
// ABOUTME: One tokio broadcast sender per session room; publishing never blocks the pipeline

use chrono::{DateTime, Utc};
use sandcastle_storage::{MessageRole, SessionStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of each room's broadcast channel
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    LlmMessage {
        id: String,
        role: MessageRole,
        content: String,
        timestamp: DateTime<Utc>,
    },
    FileUpdated {
        path: String,
        content: String,
    },
    SessionStatus {
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Publishes events to every subscriber of a session's room
pub struct EventHub {
    capacity: usize,
    rooms: Mutex<HashMap<String, broadcast::Sender<LiveEvent>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_SIZE)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Join the room of `session_id`, creating it on first use
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<LiveEvent> {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send `event` to the room and return how many subscribers received it.
    /// Rooms whose subscribers have all gone are dropped.
    pub fn publish(&self, session_id: &str, event: LiveEvent) -> usize {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = rooms.get(session_id) else {
            return 0;
        };
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(session_id = %session_id, "No live subscribers left, closing room");
                rooms.remove(session_id);
                0
            }
        }
    }

    /// Disconnect every subscriber of the room
    pub fn close_room(&self, session_id: &str) {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
