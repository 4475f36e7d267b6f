use std::sync::Mutex;

use mandi_shared::DomainEvent;

/// Outbound port for status-change notifications. Implementations must
/// not block the caller on delivery.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Drops every event; used when no broker is configured.
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, event: DomainEvent) {
        tracing::debug!("Dropping {} event for {}", event.name(), event.key());
    }
}

/// Keeps published events in memory so tests can assert on them.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: DomainEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
