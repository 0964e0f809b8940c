//! Lifecycle event consumer.
//!
//! Translates panel lifecycle events into manager calls. Events only carry
//! identifiers, so each handler re-reads the current record from the store.
//! A failing event is logged and skipped; the loop keeps going.
//!
//! | Event                   | Manager calls                                        |
//! |-------------------------|------------------------------------------------------|
//! | `server.status_changed` | `update_server_route`, `update_module_route` per module |
//! | `server.updated`        | remove old route, then as above                      |
//! | `server.deleted`        | `remove_server_route`                                |
//! | `listener.created`      | `add_listener`                                       |
//! | `listener.deleted`      | `remove_listener`                                    |
//! | `module.updated`        | `update_module_route`                                |
//! | `module.deleted`        | `remove_module_route`                                |

use std::sync::Arc;

use cairn_events::{EventEnvelope, LifecycleEvent};
use cairn_id::{EventId, ServerId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::manager::ProxyManager;
use crate::model::ServerRecord;
use crate::persistence::PanelStore;

/// Consumes envelopes until the channel closes.
///
/// Envelopes at or below the last applied event id are redeliveries and are
/// skipped, as are envelopes carrying an unknown payload version. Returns the
/// last applied id.
pub async fn run_event_loop(
    manager: Arc<ProxyManager>,
    store: Arc<dyn PanelStore>,
    mut rx: mpsc::Receiver<EventEnvelope>,
) -> EventId {
    let mut cursor = EventId::default();
    info!("Event loop started");

    while let Some(envelope) = rx.recv().await {
        if envelope.event_id <= cursor {
            debug!(
                event_id = %envelope.event_id,
                cursor = %cursor,
                "Skipping already applied event"
            );
            continue;
        }
        if let Err(e) = envelope.ensure_supported() {
            warn!(event_id = %envelope.event_id, error = %e, "Skipping event");
            cursor = envelope.event_id;
            continue;
        }

        let event_type = envelope.event.event_type();
        match apply_event(&manager, store.as_ref(), &envelope.event).await {
            Ok(()) => debug!(
                event_id = %envelope.event_id,
                event_type,
                aggregate_id = %envelope.aggregate_id,
                "Applied event"
            ),
            Err(e) => warn!(
                event_id = %envelope.event_id,
                event_type,
                aggregate_id = %envelope.aggregate_id,
                error = %e,
                "Failed to apply event"
            ),
        }
        cursor = envelope.event_id;
    }

    info!(cursor = %cursor, "Event loop stopped");
    cursor
}

/// Applies one event to the manager.
pub async fn apply_event(
    manager: &ProxyManager,
    store: &dyn PanelStore,
    event: &LifecycleEvent,
) -> Result<()> {
    match event {
        LifecycleEvent::ServerStatusChanged { server_id, status } => {
            let Some(mut server) = store.server(server_id).await? else {
                manager.remove_server_route(server_id).await;
                return Err(ProxyError::ServerNotFound(*server_id));
            };
            server.status = *status;
            sync_server(manager, store, server).await
        }

        LifecycleEvent::ServerUpdated {
            server_id,
            previous_hostname,
            previous_listener_id,
        } => {
            match previous_hostname {
                Some(hostname) => {
                    manager
                        .remove_route_by_hostname(hostname, previous_listener_id.as_ref())
                        .await;
                }
                None => {
                    manager.remove_server_route(server_id).await;
                }
            }
            let server = store
                .server(server_id)
                .await?
                .ok_or(ProxyError::ServerNotFound(*server_id))?;
            sync_server(manager, store, server).await
        }

        LifecycleEvent::ServerDeleted { server_id } => {
            manager.remove_server_route(server_id).await;
            Ok(())
        }

        LifecycleEvent::ListenerCreated { listener_id, port } => {
            let listener = store
                .listener(listener_id)
                .await?
                .ok_or(ProxyError::ListenerNotFound(*listener_id))?;
            if listener.port != *port {
                debug!(
                    listener_id = %listener_id,
                    event_port = port,
                    port = listener.port,
                    "Listener port changed since event"
                );
            }
            manager.add_listener(&listener).await
        }

        LifecycleEvent::ListenerDeleted { port, .. } => match manager.remove_listener(*port).await {
            Err(ProxyError::PortNotFound(_)) => Ok(()),
            other => other,
        },

        LifecycleEvent::ModuleUpdated {
            module_id,
            server_id,
        } => {
            let Some(module) = store.module(module_id).await? else {
                manager.remove_module_route(module_id).await;
                return Ok(());
            };
            let server = server_or_not_found(store, server_id).await?;
            manager.update_module_route(&module, &server).await
        }

        LifecycleEvent::ModuleDeleted { module_id, .. } => {
            manager.remove_module_route(module_id).await;
            Ok(())
        }
    }
}

async fn server_or_not_found(store: &dyn PanelStore, server_id: &ServerId) -> Result<ServerRecord> {
    store
        .server(server_id)
        .await?
        .ok_or(ProxyError::ServerNotFound(*server_id))
}

/// Re-routes a server and every module attached to it.
async fn sync_server(
    manager: &ProxyManager,
    store: &dyn PanelStore,
    server: ServerRecord,
) -> Result<()> {
    let result = manager.update_server_route(&server).await;

    for module in store.modules_for_server(&server.id).await? {
        if let Err(e) = manager.update_module_route(&module, &server).await {
            warn!(module_id = %module.id, error = %e, "Failed to update module routes");
        }
    }
    result
}
