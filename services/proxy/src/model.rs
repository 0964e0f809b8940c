//! Panel records the proxy core routes from.
//!
//! These mirror what the panel persists. The proxy only reads them, except
//! for listeners which it creates and deletes on behalf of the service layer.

use cairn_events::ServerStatus;
use cairn_id::{ListenerId, ModuleId, ServerId};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::proxy::ProxyKind;

/// Default port game servers listen on inside their container.
pub const DEFAULT_GAME_PORT: u16 = 25565;

fn default_game_port() -> u16 {
    DEFAULT_GAME_PORT
}

fn default_true() -> bool {
    true
}

/// A shared, handshake-routed entry port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRecord {
    pub id: ListenerId,
    pub port: u16,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listener new servers are assigned to.
    #[serde(default)]
    pub is_default: bool,
}

impl ListenerRecord {
    pub fn new(port: u16, name: impl Into<String>) -> Self {
        Self {
            id: ListenerId::new(),
            port,
            name: name.into(),
            description: String::new(),
            enabled: true,
            is_default: false,
        }
    }
}

/// A game server and where its traffic comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    /// Container running the server. `None` until first provisioned.
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub status: ServerStatus,
    /// Explicit routing hostname; generated when absent.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Shared listener this server is reachable through.
    #[serde(default)]
    pub listener_id: Option<ListenerId>,
    #[serde(default = "default_game_port")]
    pub game_port: u16,
    /// Dedicated host port, when one was allocated.
    #[serde(default)]
    pub proxy_port: Option<u16>,
}

impl ServerRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ServerId::new(),
            name: name.into(),
            container_id: None,
            status: ServerStatus::Stopped,
            hostname: None,
            listener_id: None,
            game_port: DEFAULT_GAME_PORT,
            proxy_port: None,
        }
    }

    /// Whether the server takes part in hostname routing at all.
    pub fn uses_listener(&self) -> bool {
        self.listener_id.is_some()
    }
}

/// An auxiliary service attached to a server (map renderer, voice chat, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub server_id: ServerId,
    pub name: String,
    /// Own container; `None` means the module runs inside the server's.
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub ports: Vec<ModulePort>,
}

impl ModuleRecord {
    pub fn new(server_id: ServerId, name: impl Into<String>) -> Self {
        Self {
            id: ModuleId::new(),
            server_id,
            name: name.into(),
            container_id: None,
            ports: Vec::new(),
        }
    }

    /// Container traffic for this module goes to.
    pub fn backend_container<'a>(&'a self, server: &'a ServerRecord) -> Option<&'a str> {
        self.container_id
            .as_deref()
            .or(server.container_id.as_deref())
    }
}

/// One host port a module exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePort {
    pub listen_port: u16,
    pub backend_port: u16,
    /// `tcp`, `udp`, `http` or `minecraft`.
    pub protocol: String,
    /// Virtual host for `http`/`minecraft` ports; defaults to the server's.
    #[serde(default)]
    pub hostname: Option<String>,
}

impl ModulePort {
    pub fn kind(&self) -> Result<ProxyKind> {
        self.protocol.parse()
    }
}

/// How hostnames are generated for servers without an explicit one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnamePolicy {
    pub base_domain: Option<String>,
    /// Used as `server-<id>.<suffix>` when no base domain is configured.
    pub suffix: String,
}

impl Default for HostnamePolicy {
    fn default() -> Self {
        Self {
            base_domain: None,
            suffix: "local".to_string(),
        }
    }
}

impl HostnamePolicy {
    pub fn generate(&self, server: &ServerRecord) -> String {
        match self.base_domain.as_deref().filter(|d| !d.is_empty()) {
            Some(domain) => format!("{}.{}", slugify(&server.name), domain),
            None => format!("server-{}.{}", server.id, self.suffix),
        }
    }

    /// Explicit hostname if set, generated otherwise.
    pub fn hostname_for(&self, server: &ServerRecord) -> String {
        match server.hostname.as_deref().map(str::trim) {
            Some(hostname) if !hostname.is_empty() => hostname.to_string(),
            _ => self.generate(server),
        }
    }
}

/// Lowercase, ASCII alphanumerics only, runs of anything else become one `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("server");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Cool Server"), "my-cool-server");
        assert_eq!(slugify("  --Survival__2024!! "), "survival-2024");
        assert_eq!(slugify("ÜberCraft"), "bercraft");
        assert_eq!(slugify("!!!"), "server");
    }

    #[test]
    fn test_hostname_generation() {
        let mut server = ServerRecord::new("Creative World");
        let policy = HostnamePolicy {
            base_domain: Some("play.example.com".into()),
            suffix: "local".into(),
        };
        assert_eq!(policy.hostname_for(&server), "creative-world.play.example.com");

        let fallback = HostnamePolicy::default();
        assert_eq!(
            fallback.hostname_for(&server),
            format!("server-{}.local", server.id)
        );

        server.hostname = Some("mc.example.org".into());
        assert_eq!(policy.hostname_for(&server), "mc.example.org");

        server.hostname = Some("   ".into());
        assert_eq!(policy.hostname_for(&server), "creative-world.play.example.com");
    }

    #[test]
    fn test_server_defaults_on_deserialize() {
        let id = ServerId::new();
        let json = format!(r#"{{"id":"{}","name":"lobby"}}"#, id);
        let server: ServerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(server.game_port, DEFAULT_GAME_PORT);
        assert_eq!(server.status, ServerStatus::Stopped);
        assert!(!server.uses_listener());
    }

    #[test]
    fn test_module_backend_container() {
        let mut server = ServerRecord::new("lobby");
        server.container_id = Some("cairn-lobby".into());
        let mut module = ModuleRecord::new(server.id, "dynmap");
        assert_eq!(module.backend_container(&server), Some("cairn-lobby"));

        module.container_id = Some("cairn-voice".into());
        assert_eq!(module.backend_container(&server), Some("cairn-voice"));
    }

    #[test]
    fn test_module_port_kind() {
        let port = ModulePort {
            listen_port: 8123,
            backend_port: 8123,
            protocol: "http".into(),
            hostname: None,
        };
        assert_eq!(port.kind().unwrap(), ProxyKind::Http);
    }
}
