//! Backend address resolution.
//!
//! Game servers run in containers whose addresses change on every
//! recreation, so routes are (re)built from a fresh lookup each time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use async_trait::async_trait;
use bollard::Docker;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Maps a container to its address on a network.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn container_ip(&self, container: &str, network: &str) -> Result<IpAddr>;
}

fn resolve_error(container: &str, network: &str, reason: impl Into<String>) -> ProxyError {
    ProxyError::Resolve {
        container: container.to_string(),
        network: network.to_string(),
        reason: reason.into(),
    }
}

/// Resolves through the Docker Engine API.
pub struct DockerResolver {
    docker: Docker,
}

impl DockerResolver {
    /// Connects using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| resolve_error("*", "*", format!("docker connect failed: {e}")))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl BackendResolver for DockerResolver {
    async fn container_ip(&self, container: &str, network: &str) -> Result<IpAddr> {
        let inspect = self
            .docker
            .inspect_container(container, None)
            .await
            .map_err(|e| resolve_error(container, network, e.to_string()))?;

        let endpoint = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(network))
            .ok_or_else(|| resolve_error(container, network, "container is not on this network"))?;

        let address = endpoint
            .ip_address
            .filter(|ip| !ip.is_empty())
            .or(endpoint.global_ipv6_address.filter(|ip| !ip.is_empty()))
            .ok_or_else(|| {
                resolve_error(container, network, "container has no address (not running?)")
            })?;

        let ip = address
            .parse::<IpAddr>()
            .map_err(|e| resolve_error(container, network, format!("bad address {address}: {e}")))?;
        debug!(container, network, %ip, "Resolved container address");
        Ok(ip)
    }
}

/// Fixed container -> address table, for tests and hosts without Docker.
///
/// Lookups ignore the network name.
#[derive(Default)]
pub struct StaticResolver {
    addrs: RwLock<HashMap<String, IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, container: impl Into<String>, ip: IpAddr) -> Self {
        self.insert(container, ip);
        self
    }

    pub fn insert(&self, container: impl Into<String>, ip: IpAddr) {
        if let Ok(mut addrs) = self.addrs.write() {
            addrs.insert(container.into(), ip);
        }
    }

    pub fn remove(&self, container: &str) -> Option<IpAddr> {
        self.addrs.write().ok()?.remove(container)
    }
}

#[async_trait]
impl BackendResolver for StaticResolver {
    async fn container_ip(&self, container: &str, network: &str) -> Result<IpAddr> {
        self.addrs
            .read()
            .ok()
            .and_then(|addrs| addrs.get(container).copied())
            .ok_or_else(|| resolve_error(container, network, "unknown container"))
    }
}
