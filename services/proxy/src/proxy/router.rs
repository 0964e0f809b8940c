//! Per-instance route table.
//!
//! Every proxy instance owns one table mapping a routing key to a single
//! backend address:
//! - Keys are hostnames normalized to lowercase with any `:port` suffix and
//!   trailing dot removed
//! - Re-adding a key replaces the entry in place
//! - Variants without virtual hosting (raw TCP, UDP) store their only backend
//!   under [`SENTINEL_KEY`] whatever key the caller passes
//!
//! Readers take an immutable snapshot, so a connection keeps the route it
//! resolved at accept time even if the table changes underneath it.
//! Writers go through `rcu`, which retries on contention and keeps
//! concurrent updates from overwriting each other.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::debug;

/// Key used by variants that forward everything to one backend.
pub const SENTINEL_KEY: &str = "*";

/// One forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Server or module this route belongs to. Bookkeeping only.
    pub owner_id: String,
    pub routing_key: String,
    pub backend_host: String,
    pub backend_port: u16,
    /// Inactive routes stay in the table but never match.
    pub active: bool,
}

impl Route {
    pub fn backend_addr(&self) -> String {
        if self.backend_host.contains(':') && !self.backend_host.starts_with('[') {
            format!("[{}]:{}", self.backend_host, self.backend_port)
        } else {
            format!("{}:{}", self.backend_host, self.backend_port)
        }
    }
}

/// Normalize a hostname for matching.
///
/// - Lowercase
/// - Strip a `:port` suffix (bracketed IPv6 literals keep their brackets)
/// - Trim surrounding whitespace and a trailing dot
pub fn normalize_key(raw: &str) -> String {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        match raw.rsplit_once(':') {
            // More than one colon is a bare IPv6 literal, not host:port.
            Some((host, _)) if !host.contains(':') => host,
            _ => raw,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Route table owned by one proxy instance.
pub struct RouteTable {
    snapshot: ArcSwap<HashMap<String, Route>>,
    virtual_hosts: bool,
}

impl RouteTable {
    /// Table keyed by hostname.
    pub fn virtual_hosted() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            virtual_hosts: true,
        }
    }

    /// Table holding at most one backend under [`SENTINEL_KEY`].
    pub fn single_backend() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            virtual_hosts: false,
        }
    }

    fn key_for(&self, raw: &str) -> String {
        if self.virtual_hosts {
            normalize_key(raw)
        } else {
            SENTINEL_KEY.to_string()
        }
    }

    pub fn add_route(
        &self,
        owner_id: &str,
        routing_key: &str,
        backend_host: &str,
        backend_port: u16,
    ) {
        let route = Route {
            owner_id: owner_id.to_string(),
            routing_key: self.key_for(routing_key),
            backend_host: backend_host.to_string(),
            backend_port,
            active: true,
        };
        debug!(
            routing_key = %route.routing_key,
            backend = %route.backend_addr(),
            owner_id = %route.owner_id,
            "Route added"
        );
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(route.routing_key.clone(), route.clone());
            next
        });
    }

    /// Points an existing route at a new backend. No-op for unknown keys.
    pub fn update_route(&self, routing_key: &str, backend_host: &str, backend_port: u16) -> bool {
        let key = self.key_for(routing_key);
        let mut updated = false;
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            updated = match next.get_mut(&key) {
                Some(route) => {
                    route.backend_host = backend_host.to_string();
                    route.backend_port = backend_port;
                    true
                }
                None => false,
            };
            next
        });
        if updated {
            debug!(routing_key = %key, backend_host, backend_port, "Route updated");
        }
        updated
    }

    pub fn remove_route(&self, routing_key: &str) -> Option<Route> {
        let key = self.key_for(routing_key);
        let mut removed = None;
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(&key);
            next
        });
        if removed.is_some() {
            debug!(routing_key = %key, "Route removed");
        }
        removed
    }

    /// Removes every route belonging to `owner_id`, returning the removed keys.
    pub fn remove_owner(&self, owner_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.snapshot.rcu(|current| {
            let (gone, kept): (HashMap<_, _>, HashMap<_, _>) = current
                .iter()
                .map(|(k, r)| (k.clone(), r.clone()))
                .partition(|(_, r)| r.owner_id == owner_id);
            removed = gone.into_keys().collect();
            kept
        });
        removed
    }

    pub fn clear(&self) {
        self.snapshot.store(Arc::new(HashMap::new()));
    }

    /// Active route for a raw (unnormalized) key.
    pub fn lookup(&self, raw_key: &str) -> Option<Route> {
        let key = self.key_for(raw_key);
        self.snapshot
            .load()
            .get(&key)
            .filter(|route| route.active)
            .cloned()
    }

    /// Copy of the whole table.
    pub fn routes(&self) -> HashMap<String, Route> {
        HashMap::clone(&self.snapshot.load())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;
