//! Lifecycle event payloads.

use cairn_id::{ListenerId, ModuleId, ServerId};
use serde::{Deserialize, Serialize};

/// All event type names as constants.
pub mod event_types {
    pub const SERVER_STATUS_CHANGED: &str = "server.status_changed";
    pub const SERVER_UPDATED: &str = "server.updated";
    pub const SERVER_DELETED: &str = "server.deleted";

    pub const LISTENER_CREATED: &str = "listener.created";
    pub const LISTENER_DELETED: &str = "listener.deleted";

    pub const MODULE_UPDATED: &str = "module.updated";
    pub const MODULE_DELETED: &str = "module.deleted";
}

// =============================================================================
// Server Status
// =============================================================================

/// Container-backed status of a game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Starting,
    Running,
    Stopping,
    #[default]
    Stopped,
}

impl ServerStatus {
    /// Routes exist only while the server is starting or running.
    pub fn is_routable(&self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Running)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A lifecycle event as carried on the wire: `{"event_type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum LifecycleEvent {
    #[serde(rename = "server.status_changed")]
    ServerStatusChanged {
        server_id: ServerId,
        status: ServerStatus,
    },

    /// Hostname, listener or port assignment changed.
    #[serde(rename = "server.updated")]
    ServerUpdated {
        server_id: ServerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_hostname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_listener_id: Option<ListenerId>,
    },

    #[serde(rename = "server.deleted")]
    ServerDeleted { server_id: ServerId },

    #[serde(rename = "listener.created")]
    ListenerCreated { listener_id: ListenerId, port: u16 },

    #[serde(rename = "listener.deleted")]
    ListenerDeleted { listener_id: ListenerId, port: u16 },

    #[serde(rename = "module.updated")]
    ModuleUpdated {
        module_id: ModuleId,
        server_id: ServerId,
    },

    #[serde(rename = "module.deleted")]
    ModuleDeleted {
        module_id: ModuleId,
        server_id: ServerId,
    },
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::ServerStatusChanged { .. } => event_types::SERVER_STATUS_CHANGED,
            LifecycleEvent::ServerUpdated { .. } => event_types::SERVER_UPDATED,
            LifecycleEvent::ServerDeleted { .. } => event_types::SERVER_DELETED,
            LifecycleEvent::ListenerCreated { .. } => event_types::LISTENER_CREATED,
            LifecycleEvent::ListenerDeleted { .. } => event_types::LISTENER_DELETED,
            LifecycleEvent::ModuleUpdated { .. } => event_types::MODULE_UPDATED,
            LifecycleEvent::ModuleDeleted { .. } => event_types::MODULE_DELETED,
        }
    }

    /// The ID of the record this event is about.
    pub fn aggregate_id(&self) -> String {
        match self {
            LifecycleEvent::ServerStatusChanged { server_id, .. }
            | LifecycleEvent::ServerUpdated { server_id, .. }
            | LifecycleEvent::ServerDeleted { server_id } => server_id.to_string(),
            LifecycleEvent::ListenerCreated { listener_id, .. }
            | LifecycleEvent::ListenerDeleted { listener_id, .. } => listener_id.to_string(),
            LifecycleEvent::ModuleUpdated { module_id, .. }
            | LifecycleEvent::ModuleDeleted { module_id, .. } => module_id.to_string(),
        }
    }
}
