//! Unified event bus — trait for emitting sequencer lifecycle events.
//!
//! Modules accept an `Arc<dyn EventSink>` to emit events for downstream
//! consumers (webhook fan-out, analytics export). The sequencer core only
//! depends on the trait.

use crate::types::{CampaignKind, EventType, SequencerEvent};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting sequencer lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SequencerEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: SequencerEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<SequencerEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<SequencerEvent> {
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
    fn emit(&self, event: SequencerEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `SequencerEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    instance_id: Uuid,
    subject_id: impl Into<String>,
    campaign_kind: CampaignKind,
    step_index: Option<u32>,
    detail: Option<String>,
) -> SequencerEvent {
    SequencerEvent {
        event_id: Uuid::new_v4(),
        event_type,
        instance_id,
        subject_id: subject_id.into(),
        campaign_kind,
        step_index,
        detail,
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
