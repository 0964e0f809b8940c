//! Event envelope: ordering and timing metadata around a lifecycle event.

use cairn_id::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::LifecycleEvent;

/// Current schema version of [`LifecycleEvent`] payloads.
pub const EVENT_VERSION: i32 = 1;

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Server,
    Listener,
    Module,
}

impl AggregateType {
    pub fn of(event: &LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::ServerStatusChanged { .. }
            | LifecycleEvent::ServerUpdated { .. }
            | LifecycleEvent::ServerDeleted { .. } => AggregateType::Server,
            LifecycleEvent::ListenerCreated { .. } | LifecycleEvent::ListenerDeleted { .. } => {
                AggregateType::Listener
            }
            LifecycleEvent::ModuleUpdated { .. } | LifecycleEvent::ModuleDeleted { .. } => {
                AggregateType::Module
            }
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Server => "server",
            AggregateType::Listener => "listener",
            AggregateType::Module => "module",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic event identifier.
    pub event_id: EventId,

    pub occurred_at: DateTime<Utc>,

    pub aggregate_type: AggregateType,

    pub aggregate_id: String,

    pub event_version: i32,

    pub event: LifecycleEvent,
}

impl EventEnvelope {
    /// Wraps an event, deriving aggregate metadata from it.
    pub fn new(event_id: EventId, event: LifecycleEvent) -> Self {
        Self {
            event_id,
            occurred_at: Utc::now(),
            aggregate_type: AggregateType::of(&event),
            aggregate_id: event.aggregate_id(),
            event_version: EVENT_VERSION,
            event,
        }
    }

    /// Rejects payload versions this build cannot interpret.
    pub fn ensure_supported(&self) -> Result<(), EventError> {
        if self.event_version != EVENT_VERSION {
            return Err(EventError::UnsupportedVersion {
                event_type: self.event.event_type().to_string(),
                version: self.event_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerStatus;
    use cairn_id::{ListenerId, ServerId};

    #[test]
    fn test_aggregate_type_display() {
        assert_eq!(AggregateType::Server.to_string(), "server");
        assert_eq!(AggregateType::Listener.to_string(), "listener");
    }

    #[test]
    fn test_envelope_derives_aggregate() {
        let server_id = ServerId::new();
        let envelope = EventEnvelope::new(
            EventId::new(7),
            LifecycleEvent::ServerStatusChanged {
                server_id,
                status: ServerStatus::Running,
            },
        );

        assert_eq!(envelope.aggregate_type, AggregateType::Server);
        assert_eq!(envelope.aggregate_id, server_id.to_string());
        assert_eq!(envelope.event_version, EVENT_VERSION);
        assert!(envelope.ensure_supported().is_ok());
    }

    #[test]
    fn test_future_version_rejected() {
        let mut envelope = EventEnvelope::new(
            EventId::new(3),
            LifecycleEvent::ListenerCreated {
                listener_id: ListenerId::new(),
                port: 25565,
            },
        );
        envelope.event_version = EVENT_VERSION + 1;

        assert!(matches!(
            envelope.ensure_supported(),
            Err(EventError::UnsupportedVersion { version, .. }) if version == EVENT_VERSION + 1
        ));
    }
}
