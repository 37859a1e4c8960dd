//! Event Publisher Adapter
//!
//! Implements the `EventPublisher` port with various backends.

use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Logging-based event publisher.
///
/// Writes domain events to the tracing subscriber, one structured line per
/// event. The binary uses this as its audit trail. Events that report data
/// at risk are always written at warn level.
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    level: Level,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log routine events at `level` instead of info
    pub fn with_level(level: Level) -> Self {
        Self { level }
    }

    fn level_for(&self, event: &DomainEvent) -> Level {
        match event {
            DomainEvent::BackupFailed { .. }
            | DomainEvent::BlockUnrecoverable { .. }
            | DomainEvent::FragmentLost { .. }
            | DomainEvent::WorkerCrashed { .. } => Level::WARN,
            _ => self.level,
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let backup_id = event.backup_id().unwrap_or("-");
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        // More verbose levels compare greater
        let level = self.level_for(&event);
        if level <= Level::WARN {
            warn!(event_type, backup_id, event = %json, "Domain event");
        } else if level == Level::INFO {
            info!(event_type, backup_id, event = %json, "Domain event");
        } else {
            debug!(event_type, backup_id, event = %json, "Domain event");
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// In-memory event collector for tests and drills.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Events concerning one backup, in publication order
    pub fn events_for(&self, backup_id: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.backup_id() == Some(backup_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}
