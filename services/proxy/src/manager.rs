//! Proxy manager.
//!
//! Owns every proxy instance, keyed by listening port, and keeps their routes
//! in line with the panel's records:
//! - Listener ports always run a handshake-routed instance
//! - Module ports get an instance of the module's protocol on first use and
//!   lose it when their last route goes away
//! - Server routes follow status: starting/running servers are routed,
//!   stopping/stopped ones are not
//!
//! One registry lock serializes every mutation, including route fan-out to
//! several ports. Container lookups for single-server updates happen before
//! the lock is taken.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;

use cairn_id::{ListenerId, ModuleId, ServerId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::model::{HostnamePolicy, ListenerRecord, ModuleRecord, ServerRecord};
use crate::persistence::{PanelStore, StoreError};
use crate::proxy::{ProxyInstance, ProxyKind, ProxyTimeouts, Route, SENTINEL_KEY};
use crate::resolver::BackendResolver;

/// Settings the manager needs from the service configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Address every instance binds on.
    pub bind_host: IpAddr,
    /// Network container addresses are resolved on.
    pub docker_network: String,
    /// Candidate ports for `allocate_proxy_port`.
    pub proxy_port_range: RangeInclusive<u16>,
    pub hostnames: HostnamePolicy,
    pub timeouts: ProxyTimeouts,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            docker_network: "cairn".to_string(),
            proxy_port_range: 30000..=30999,
            hostnames: HostnamePolicy::default(),
            timeouts: ProxyTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortOrigin {
    Listener(ListenerId),
    /// Created for module ports; evicted once empty.
    Module,
}

struct Entry {
    instance: Arc<ProxyInstance>,
    origin: PortOrigin,
}

type Registry = HashMap<u16, Entry>;

/// Routes of one port, as reported by [`ProxyManager::get_routes`].
#[derive(Debug, Clone, Serialize)]
pub struct PortRoutes {
    pub kind: ProxyKind,
    pub listener_id: Option<ListenerId>,
    pub routes: HashMap<String, Route>,
}

/// Coordinates proxy instances against panel state.
pub struct ProxyManager {
    config: ManagerConfig,
    store: Arc<dyn PanelStore>,
    resolver: Arc<dyn BackendResolver>,
    registry: Mutex<Registry>,
}

impl ProxyManager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn PanelStore>,
        resolver: Arc<dyn BackendResolver>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Starts listeners and routes from the persisted records.
    ///
    /// A listener that fails to bind or a server that cannot be resolved is
    /// logged and skipped; only store failures abort.
    pub async fn start(&self) -> Result<()> {
        let listeners = self.store.listeners().await?;
        let servers = self.store.servers().await?;
        let modules = self.store.modules().await?;

        let mut registry = self.registry.lock().await;
        for listener in listeners.iter().filter(|l| l.enabled) {
            if registry.contains_key(&listener.port) {
                continue;
            }
            if let Err(e) = self.start_listener_locked(&mut registry, listener).await {
                error!(
                    port = listener.port,
                    listener_id = %listener.id,
                    error = %e,
                    "Failed to start listener"
                );
            }
        }
        self.rebuild_routes_locked(&mut registry, &servers, &modules)
            .await;

        info!(
            ports = registry.len(),
            routes = registry.values().map(|e| e.instance.route_count()).sum::<usize>(),
            "Proxy manager started"
        );
        Ok(())
    }

    /// Stops every instance and empties the registry.
    pub async fn stop(&self) {
        let mut registry = self.registry.lock().await;
        for (port, entry) in registry.drain() {
            if let Err(e) = entry.instance.stop().await {
                warn!(port, error = %e, "Failed to stop proxy instance");
            }
        }
        info!("Proxy manager stopped");
    }

    async fn resolve(&self, container: &str) -> Result<String> {
        let ip = self
            .resolver
            .container_ip(container, &self.config.docker_network)
            .await?;
        Ok(ip.to_string())
    }

    fn bind_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.config.bind_host, port)
    }

    fn listener_instance(
        registry: &Registry,
        listener_id: &ListenerId,
    ) -> Option<Arc<ProxyInstance>> {
        registry
            .values()
            .find(|e| e.origin == PortOrigin::Listener(*listener_id))
            .map(|e| Arc::clone(&e.instance))
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    async fn start_listener_locked(
        &self,
        registry: &mut Registry,
        listener: &ListenerRecord,
    ) -> Result<()> {
        if registry.contains_key(&listener.port) {
            return Err(ProxyError::PortInUse(listener.port));
        }

        let instance = ProxyInstance::new(
            ProxyKind::Minecraft,
            self.bind_addr(listener.port),
            self.config.timeouts,
        );
        instance.start().await?;
        registry.insert(
            listener.port,
            Entry {
                instance: Arc::new(instance),
                origin: PortOrigin::Listener(listener.id),
            },
        );
        info!(
            port = listener.port,
            listener_id = %listener.id,
            name = %listener.name,
            "Listener added"
        );
        Ok(())
    }

    /// Starts a handshake-routed instance for `listener` and records it.
    ///
    /// Fails with `PortInUse` if the port already has an instance; the
    /// existing instance is left untouched. Disabled listeners are only
    /// saved.
    pub async fn add_listener(&self, listener: &ListenerRecord) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.contains_key(&listener.port) {
            return Err(ProxyError::PortInUse(listener.port));
        }

        if listener.enabled {
            self.start_listener_locked(&mut registry, listener).await?;
        }

        if let Err(e) = self.store.save_listener(listener.clone()).await {
            if let Some(entry) = registry.remove(&listener.port) {
                let _ = entry.instance.stop().await;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Deletes the listener on `port` and stops its instance.
    ///
    /// Listeners saved disabled have no instance; their record is found by
    /// port. Refused while servers still reference the listener.
    pub async fn remove_listener(&self, port: u16) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let listener_id = match registry.get(&port).map(|e| e.origin) {
            Some(PortOrigin::Listener(id)) => id,
            Some(PortOrigin::Module) => return Err(ProxyError::PortNotFound(port)),
            None => self
                .store
                .listeners()
                .await?
                .into_iter()
                .find(|l| l.port == port)
                .map(|l| l.id)
                .ok_or(ProxyError::PortNotFound(port))?,
        };

        match self.store.delete_listener(&listener_id).await {
            Ok(_) | Err(StoreError::ListenerNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(entry) = registry.remove(&port) {
            entry.instance.stop().await?;
        }
        info!(port, listener_id = %listener_id, "Listener removed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Server routes
    // -------------------------------------------------------------------------

    /// Routes or unroutes a server according to its status.
    ///
    /// Servers without a listener are not hostname-routed and are ignored.
    pub async fn update_server_route(&self, server: &ServerRecord) -> Result<()> {
        let Some(listener_id) = server.listener_id else {
            debug!(server_id = %server.id, "Server has no listener, skipping route");
            return Ok(());
        };
        let hostname = self.config.hostnames.hostname_for(server);

        if !server.status.is_routable() {
            let removed = self
                .remove_route_by_hostname(&hostname, Some(&listener_id))
                .await;
            debug!(server_id = %server.id, hostname = %hostname, removed, "Server not routable");
            return Ok(());
        }

        let Some(container) = server.container_id.as_deref() else {
            debug!(server_id = %server.id, "Server has no container yet, skipping route");
            return Ok(());
        };
        let backend_host = self.resolve(container).await?;

        let registry = self.registry.lock().await;
        let instance = Self::listener_instance(&registry, &listener_id)
            .ok_or(ProxyError::ListenerNotFound(listener_id))?;
        Self::upsert_route(
            &instance,
            &server.id.to_string(),
            &hostname,
            &backend_host,
            server.game_port,
        );
        info!(
            server_id = %server.id,
            hostname = %hostname,
            backend = %format!("{}:{}", backend_host, server.game_port),
            "Server route set"
        );
        Ok(())
    }

    fn upsert_route(
        instance: &ProxyInstance,
        owner_id: &str,
        routing_key: &str,
        backend_host: &str,
        backend_port: u16,
    ) {
        if !instance.update_route(routing_key, backend_host, backend_port) {
            instance.add_route(owner_id, routing_key, backend_host, backend_port);
        }
    }

    /// Removes every hostname route owned by `server_id`. Module routes of the
    /// server are left alone.
    pub async fn remove_server_route(&self, server_id: &ServerId) -> usize {
        let registry = self.registry.lock().await;
        let owner = server_id.to_string();
        let removed: usize = registry
            .values()
            .map(|e| e.instance.remove_owner(&owner).len())
            .sum();
        debug!(server_id = %server_id, removed, "Server routes removed");
        removed
    }

    /// Removes `hostname` from one listener's instance, or from every
    /// instance when no listener is given. Returns how many routes went away.
    pub async fn remove_route_by_hostname(
        &self,
        hostname: &str,
        listener_id: Option<&ListenerId>,
    ) -> usize {
        let mut registry = self.registry.lock().await;
        let mut removed = 0;
        for entry in registry.values() {
            let selected = match listener_id {
                Some(id) => entry.origin == PortOrigin::Listener(*id),
                None => entry.instance.kind().is_virtual_hosted(),
            };
            if selected && entry.instance.remove_route(hostname).is_some() {
                removed += 1;
            }
        }
        if listener_id.is_none() {
            self.evict_empty_module_ports(&mut registry).await;
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Module routes
    // -------------------------------------------------------------------------

    /// Adds routes for every port the module declares.
    ///
    /// Ports without an instance get one of the port's protocol. A port
    /// already served by a different protocol fails with `KindMismatch`.
    pub async fn add_module_route(
        &self,
        module: &ModuleRecord,
        server: &ServerRecord,
    ) -> Result<()> {
        let Some(container) = module.backend_container(server) else {
            debug!(module_id = %module.id, "Module has no container, skipping routes");
            return Ok(());
        };
        let backend_host = self.resolve(container).await?;

        let mut registry = self.registry.lock().await;
        self.add_module_ports_locked(&mut registry, module, server, &backend_host)
            .await
    }

    /// Replaces a module's routes: old ports are released, the current ports
    /// are routed if the server is starting or running.
    pub async fn update_module_route(
        &self,
        module: &ModuleRecord,
        server: &ServerRecord,
    ) -> Result<()> {
        let backend_host = match module.backend_container(server) {
            Some(container) if server.status.is_routable() => Some(self.resolve(container).await?),
            _ => None,
        };

        let mut registry = self.registry.lock().await;
        let owner = module.id.to_string();
        for entry in registry.values() {
            entry.instance.remove_owner(&owner);
        }
        // A port switching protocol needs its old instance gone before the
        // new kind can bind.
        let retagged: Vec<u16> = module
            .ports
            .iter()
            .filter_map(|port| {
                let kind = port.kind().ok()?;
                let entry = registry.get(&port.listen_port)?;
                let empty_module_port =
                    entry.origin == PortOrigin::Module && entry.instance.route_count() == 0;
                (empty_module_port && entry.instance.kind() != kind).then_some(port.listen_port)
            })
            .collect();
        for port in retagged {
            if let Some(entry) = registry.remove(&port) {
                if let Err(e) = entry.instance.stop().await {
                    warn!(port, error = %e, "Failed to stop module port");
                }
                info!(
                    port,
                    kind = %entry.instance.kind(),
                    "Module port closed for protocol change"
                );
            }
        }

        let result = match backend_host {
            Some(backend_host) => {
                self.add_module_ports_locked(&mut registry, module, server, &backend_host)
                    .await
            }
            None => Ok(()),
        };
        self.evict_empty_module_ports(&mut registry).await;
        result
    }

    /// Removes a module's routes and stops module ports left without routes.
    pub async fn remove_module_route(&self, module_id: &ModuleId) -> usize {
        let mut registry = self.registry.lock().await;
        let owner = module_id.to_string();
        let removed: usize = registry
            .values()
            .map(|e| e.instance.remove_owner(&owner).len())
            .sum();
        self.evict_empty_module_ports(&mut registry).await;
        debug!(module_id = %module_id, removed, "Module routes removed");
        removed
    }

    async fn add_module_ports_locked(
        &self,
        registry: &mut Registry,
        module: &ModuleRecord,
        server: &ServerRecord,
        backend_host: &str,
    ) -> Result<()> {
        let owner = module.id.to_string();
        for port in &module.ports {
            let kind = port.kind()?;
            let instance = self
                .module_instance_locked(registry, port.listen_port, kind)
                .await?;

            let routing_key = if kind.is_virtual_hosted() {
                port.hostname
                    .clone()
                    .filter(|h| !h.trim().is_empty())
                    .unwrap_or_else(|| self.config.hostnames.hostname_for(server))
            } else {
                SENTINEL_KEY.to_string()
            };
            instance.add_route(&owner, &routing_key, backend_host, port.backend_port);
            info!(
                module_id = %module.id,
                port = port.listen_port,
                %kind,
                routing_key = %routing_key,
                "Module route set"
            );
        }
        Ok(())
    }

    /// Instance serving `port`, created and started on first use.
    async fn module_instance_locked(
        &self,
        registry: &mut Registry,
        port: u16,
        kind: ProxyKind,
    ) -> Result<Arc<ProxyInstance>> {
        if let Some(entry) = registry.get(&port) {
            let existing = entry.instance.kind();
            if existing != kind {
                return Err(ProxyError::KindMismatch {
                    port,
                    existing,
                    requested: kind,
                });
            }
            return Ok(Arc::clone(&entry.instance));
        }

        let instance = Arc::new(ProxyInstance::new(
            kind,
            self.bind_addr(port),
            self.config.timeouts,
        ));
        instance.start().await?;
        registry.insert(
            port,
            Entry {
                instance: Arc::clone(&instance),
                origin: PortOrigin::Module,
            },
        );
        info!(port, %kind, "Module port opened");
        Ok(instance)
    }

    async fn evict_empty_module_ports(&self, registry: &mut Registry) {
        let empty: Vec<u16> = registry
            .iter()
            .filter(|(_, e)| e.origin == PortOrigin::Module && e.instance.route_count() == 0)
            .map(|(port, _)| *port)
            .collect();

        for port in empty {
            if let Some(entry) = registry.remove(&port) {
                if let Err(e) = entry.instance.stop().await {
                    warn!(port, error = %e, "Failed to stop module port");
                }
                info!(port, kind = %entry.instance.kind(), "Module port closed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Lowest port in the configured range no other server holds.
    pub async fn allocate_proxy_port(&self, server_id: &ServerId) -> Result<u16> {
        let taken: HashSet<u16> = self
            .store
            .servers()
            .await?
            .into_iter()
            .filter(|s| &s.id != server_id)
            .filter_map(|s| s.proxy_port)
            .collect();

        let range = self.config.proxy_port_range.clone();
        range
            .clone()
            .find(|port| !taken.contains(port))
            .ok_or(ProxyError::PortRangeExhausted {
                start: *range.start(),
                end: *range.end(),
            })
    }

    /// Drops every route and rebuilds from the store.
    ///
    /// Listener instances are brought in line with the enabled listeners.
    /// Individual failures are logged and do not abort the refresh.
    pub async fn refresh_routes(&self) -> Result<()> {
        let listeners = self.store.listeners().await?;
        let servers = self.store.servers().await?;
        let modules = self.store.modules().await?;

        let mut registry = self.registry.lock().await;
        for entry in registry.values() {
            entry.instance.clear_routes();
        }

        let wanted: HashMap<ListenerId, &ListenerRecord> = listeners
            .iter()
            .filter(|l| l.enabled)
            .map(|l| (l.id, l))
            .collect();
        let stale: Vec<u16> = registry
            .iter()
            .filter(|(port, e)| match e.origin {
                PortOrigin::Listener(id) => wanted.get(&id).is_none_or(|l| l.port != **port),
                PortOrigin::Module => false,
            })
            .map(|(port, _)| *port)
            .collect();
        for port in stale {
            if let Some(entry) = registry.remove(&port) {
                let _ = entry.instance.stop().await;
                info!(port, "Stale listener stopped");
            }
        }

        for listener in wanted.values() {
            let present = registry
                .get(&listener.port)
                .is_some_and(|e| e.origin == PortOrigin::Listener(listener.id));
            if present {
                continue;
            }
            if let Err(e) = self.start_listener_locked(&mut registry, listener).await {
                warn!(port = listener.port, error = %e, "Failed to add listener during refresh");
            }
        }

        self.rebuild_routes_locked(&mut registry, &servers, &modules)
            .await;
        self.evict_empty_module_ports(&mut registry).await;

        info!(
            ports = registry.len(),
            routes = registry.values().map(|e| e.instance.route_count()).sum::<usize>(),
            "Routes refreshed"
        );
        Ok(())
    }

    /// Adds routes for every routable server and its modules.
    async fn rebuild_routes_locked(
        &self,
        registry: &mut Registry,
        servers: &[ServerRecord],
        modules: &[ModuleRecord],
    ) {
        for server in servers.iter().filter(|s| s.status.is_routable()) {
            if let (Some(listener_id), Some(container)) =
                (server.listener_id, server.container_id.as_deref())
            {
                match Self::listener_instance(registry, &listener_id) {
                    Some(instance) => match self.resolve(container).await {
                        Ok(backend_host) => {
                            let hostname = self.config.hostnames.hostname_for(server);
                            instance.add_route(
                                &server.id.to_string(),
                                &hostname,
                                &backend_host,
                                server.game_port,
                            );
                        }
                        Err(e) => {
                            warn!(
                                server_id = %server.id,
                                error = %e,
                                "Failed to resolve server backend"
                            )
                        }
                    },
                    None => {
                        debug!(
                            server_id = %server.id,
                            listener_id = %listener_id,
                            "Listener not running"
                        )
                    }
                }
            }

            for module in modules.iter().filter(|m| m.server_id == server.id) {
                let Some(container) = module.backend_container(server) else {
                    continue;
                };
                let result = match self.resolve(container).await {
                    Ok(backend_host) => {
                        self.add_module_ports_locked(registry, module, server, &backend_host)
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(module_id = %module.id, error = %e, "Failed to restore module routes");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Routes of every port, ordered by port.
    pub async fn get_routes(&self) -> BTreeMap<u16, PortRoutes> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .map(|(port, e)| {
                let listener_id = match e.origin {
                    PortOrigin::Listener(id) => Some(id),
                    PortOrigin::Module => None,
                };
                (
                    *port,
                    PortRoutes {
                        kind: e.instance.kind(),
                        listener_id,
                        routes: e.instance.get_routes(),
                    },
                )
            })
            .collect()
    }

    /// True while at least one instance is serving.
    pub async fn is_running(&self) -> bool {
        let instances: Vec<Arc<ProxyInstance>> = {
            let registry = self.registry.lock().await;
            registry.values().map(|e| Arc::clone(&e.instance)).collect()
        };
        for instance in instances {
            if instance.is_running().await {
                return true;
            }
        }
        false
    }

    /// Instance on `port`, if any.
    pub async fn instance(&self, port: u16) -> Option<Arc<ProxyInstance>> {
        self.registry
            .lock()
            .await
            .get(&port)
            .map(|e| Arc::clone(&e.instance))
    }

    pub async fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.registry.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}
