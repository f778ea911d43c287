//! Observability events
//!
//! Controllers report every phase change through `EventRecorder`. Events are
//! logged, kept in a bounded ring buffer for `kubechain get events`-style
//! inspection, and broadcast to live subscribers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::{Kind, ObjectKey};

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: Kind,
    pub key: ObjectKey,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded in-memory event sink
pub struct EventRecorder {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
    tx: broadcast::Sender<Event>,
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventRecorder {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    pub fn normal(&self, kind: Kind, key: &ObjectKey, reason: &str, message: impl Into<String>) {
        self.record(kind, key, EventType::Normal, reason, message.into());
    }

    pub fn warning(&self, kind: Kind, key: &ObjectKey, reason: &str, message: impl Into<String>) {
        self.record(kind, key, EventType::Warning, reason, message.into());
    }

    fn record(
        &self,
        kind: Kind,
        key: &ObjectKey,
        event_type: EventType,
        reason: &str,
        message: String,
    ) {
        match event_type {
            EventType::Normal => info!("{} {} [{}] {}", kind, key, reason, message),
            EventType::Warning => warn!("{} {} [{}] {}", kind, key, reason, message),
        }

        let event = Event {
            kind,
            key: key.clone(),
            event_type,
            reason: reason.to_string(),
            message,
            timestamp: Utc::now(),
        };

        {
            let mut buffer = self.buffer.lock();
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
        let _ = self.tx.send(event);
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> Vec<Event> {
        self.buffer.lock().iter().cloned().collect()
    }

    /// Events for one object, oldest first
    pub fn events_for(&self, kind: Kind, key: &ObjectKey) -> Vec<Event> {
        self.buffer
            .lock()
            .iter()
            .filter(|e| e.kind == kind && &e.key == key)
            .cloned()
            .collect()
    }

    /// Reasons recorded for one object, oldest first
    pub fn reasons_for(&self, kind: Kind, key: &ObjectKey) -> Vec<String> {
        self.events_for(kind, key)
            .into_iter()
            .map(|e| e.reason)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
