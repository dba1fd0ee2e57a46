//! Event bus — trait for publishing outreach events from any module.
//!
//! The engine accepts an `Arc<dyn EventSink>`; the UI layer subscribes through
//! a [`BroadcastSink`] to reconcile optimistic state.

use crate::types::{EventType, OutreachEvent};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Trait for emitting outreach events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutreachEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: OutreachEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<OutreachEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<OutreachEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: OutreachEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Fans events out to any number of async subscribers. Events emitted while
/// nobody is subscribed are dropped.
pub struct BroadcastSink {
    sender: broadcast::Sender<OutreachEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutreachEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: OutreachEvent) {
        if let Err(dropped) = self.sender.send(event) {
            trace!(event_type = ?dropped.0.event_type, "No subscribers for outreach event");
        }
    }
}

/// Convenience builder for creating `OutreachEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    instance_id: Uuid,
    lead_id: Option<String>,
) -> OutreachEvent {
    OutreachEvent {
        event_id: Uuid::new_v4(),
        event_type,
        instance_id,
        lead_id,
        step_ordinal: None,
        from_status: None,
        to_status: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
