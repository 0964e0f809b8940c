//! Panel record persistence.
//!
//! The proxy reads listener, server and module records through the
//! [`PanelStore`] trait. [`JsonStore`] keeps them in a single versioned JSON
//! document:
//! - Writes go to a temp file which is then renamed over the original
//! - A missing file starts an empty panel
//! - A listener cannot be deleted while a server references it

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cairn_id::{ListenerId, ModuleId, ServerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{ListenerRecord, ModuleRecord, ServerRecord};

/// Document format version.
const DATA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listener {listener_id} is still used by {count} server(s)", count = .servers.len())]
    ListenerInUse {
        listener_id: ListenerId,
        servers: Vec<ServerId>,
    },

    #[error("listener port {port} is already taken by {existing}")]
    DuplicateListenerPort { port: u16, existing: ListenerId },

    #[error("listener {0} not found")]
    ListenerNotFound(ListenerId),

    #[error("server {0} not found")]
    ServerNotFound(ServerId),

    #[error("module {0} not found")]
    ModuleNotFound(ModuleId),

    #[error("unsupported data version {found} (expected {expected})", expected = DATA_VERSION)]
    UnsupportedVersion { found: u32 },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid panel data: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Source of panel records.
#[async_trait]
pub trait PanelStore: Send + Sync {
    async fn listeners(&self) -> Result<Vec<ListenerRecord>, StoreError>;

    async fn listener(&self, id: &ListenerId) -> Result<Option<ListenerRecord>, StoreError> {
        Ok(self.listeners().await?.into_iter().find(|l| &l.id == id))
    }

    async fn servers(&self) -> Result<Vec<ServerRecord>, StoreError>;

    async fn server(&self, id: &ServerId) -> Result<Option<ServerRecord>, StoreError>;

    async fn modules(&self) -> Result<Vec<ModuleRecord>, StoreError>;

    async fn module(&self, id: &ModuleId) -> Result<Option<ModuleRecord>, StoreError> {
        Ok(self.modules().await?.into_iter().find(|m| &m.id == id))
    }

    async fn modules_for_server(&self, id: &ServerId) -> Result<Vec<ModuleRecord>, StoreError> {
        Ok(self
            .modules()
            .await?
            .into_iter()
            .filter(|m| &m.server_id == id)
            .collect())
    }

    /// Inserts or replaces a listener. Ports are unique across listeners.
    async fn save_listener(&self, listener: ListenerRecord) -> Result<(), StoreError>;

    /// Fails with [`StoreError::ListenerInUse`] while any server references it.
    async fn delete_listener(&self, id: &ListenerId) -> Result<ListenerRecord, StoreError>;

    async fn save_server(&self, server: ServerRecord) -> Result<(), StoreError>;

    /// Deletes the server and its modules.
    async fn delete_server(&self, id: &ServerId) -> Result<ServerRecord, StoreError>;

    async fn save_module(&self, module: ModuleRecord) -> Result<(), StoreError>;

    async fn delete_module(&self, id: &ModuleId) -> Result<ModuleRecord, StoreError>;
}

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelData {
    pub version: u32,
    #[serde(default)]
    pub listeners: Vec<ListenerRecord>,
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    #[serde(default)]
    pub modules: Vec<ModuleRecord>,
}

impl Default for PanelData {
    fn default() -> Self {
        Self {
            version: DATA_VERSION,
            listeners: Vec::new(),
            servers: Vec::new(),
            modules: Vec::new(),
        }
    }
}

/// JSON-file backed store. Every mutation rewrites the document.
pub struct JsonStore {
    path: Option<PathBuf>,
    data: Mutex<PanelData>,
}

impl JsonStore {
    /// Opens the document at `path`, starting empty if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let data: PanelData = serde_json::from_str(&content)?;
                if data.version != DATA_VERSION {
                    return Err(StoreError::UnsupportedVersion {
                        found: data.version,
                    });
                }
                info!(
                    path = %path.display(),
                    listeners = data.listeners.len(),
                    servers = data.servers.len(),
                    modules = data.modules.len(),
                    "Loaded panel data"
                );
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No panel data file, starting empty");
                PanelData::default()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::with_data(PanelData::default())
    }

    pub fn with_data(data: PanelData) -> Self {
        Self {
            path: None,
            data: Mutex::new(data),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the whole document.
    pub async fn snapshot(&self) -> PanelData {
        self.data.lock().await.clone()
    }

    async fn persist(&self, data: &PanelData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(parent))?;
        }

        let tmp_path = path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(io_err(&tmp_path))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(io_err(path))?;

        debug!(path = %path.display(), "Saved panel data");
        Ok(())
    }

    /// Applies `change` and persists the result. The in-memory copy is only
    /// replaced once the write succeeded.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut PanelData) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *data = next;
        Ok(out)
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

#[async_trait]
impl PanelStore for JsonStore {
    async fn listeners(&self) -> Result<Vec<ListenerRecord>, StoreError> {
        Ok(self.data.lock().await.listeners.clone())
    }

    async fn servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
        Ok(self.data.lock().await.servers.clone())
    }

    async fn server(&self, id: &ServerId) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self
            .data
            .lock()
            .await
            .servers
            .iter()
            .find(|s| &s.id == id)
            .cloned())
    }

    async fn modules(&self) -> Result<Vec<ModuleRecord>, StoreError> {
        Ok(self.data.lock().await.modules.clone())
    }

    async fn save_listener(&self, listener: ListenerRecord) -> Result<(), StoreError> {
        self.mutate(move |data| {
            if let Some(other) = data
                .listeners
                .iter()
                .find(|l| l.port == listener.port && l.id != listener.id)
            {
                return Err(StoreError::DuplicateListenerPort {
                    port: listener.port,
                    existing: other.id,
                });
            }
            if listener.is_default {
                for other in data.listeners.iter_mut() {
                    other.is_default = false;
                }
            }
            let id = listener.id;
            upsert(&mut data.listeners, listener, |l| l.id == id);
            Ok(())
        })
        .await
    }

    async fn delete_listener(&self, id: &ListenerId) -> Result<ListenerRecord, StoreError> {
        let id = *id;
        self.mutate(move |data| {
            let servers: Vec<ServerId> = data
                .servers
                .iter()
                .filter(|s| s.listener_id == Some(id))
                .map(|s| s.id)
                .collect();
            if !servers.is_empty() {
                return Err(StoreError::ListenerInUse {
                    listener_id: id,
                    servers,
                });
            }
            let index = data
                .listeners
                .iter()
                .position(|l| l.id == id)
                .ok_or(StoreError::ListenerNotFound(id))?;
            Ok(data.listeners.remove(index))
        })
        .await
    }

    async fn save_server(&self, server: ServerRecord) -> Result<(), StoreError> {
        self.mutate(move |data| {
            if let Some(listener_id) = server.listener_id {
                if !data.listeners.iter().any(|l| l.id == listener_id) {
                    return Err(StoreError::ListenerNotFound(listener_id));
                }
            }
            let id = server.id;
            upsert(&mut data.servers, server, |s| s.id == id);
            Ok(())
        })
        .await
    }

    async fn delete_server(&self, id: &ServerId) -> Result<ServerRecord, StoreError> {
        let id = *id;
        self.mutate(move |data| {
            let index = data
                .servers
                .iter()
                .position(|s| s.id == id)
                .ok_or(StoreError::ServerNotFound(id))?;
            data.modules.retain(|m| m.server_id != id);
            Ok(data.servers.remove(index))
        })
        .await
    }

    async fn save_module(&self, module: ModuleRecord) -> Result<(), StoreError> {
        self.mutate(move |data| {
            if !data.servers.iter().any(|s| s.id == module.server_id) {
                return Err(StoreError::ServerNotFound(module.server_id));
            }
            let id = module.id;
            upsert(&mut data.modules, module, |m| m.id == id);
            Ok(())
        })
        .await
    }

    async fn delete_module(&self, id: &ModuleId) -> Result<ModuleRecord, StoreError> {
        let id = *id;
        self.mutate(move |data| {
            let index = data
                .modules
                .iter()
                .position(|m| m.id == id)
                .ok_or(StoreError::ModuleNotFound(id))?;
            Ok(data.modules.remove(index))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModulePort;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path().join("panel.json")).await.unwrap();
        assert!(store.listeners().await.unwrap().is_empty());
        assert!(store.servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("panel.json");

        let listener = ListenerRecord::new(25565, "main");
        let mut server = ServerRecord::new("lobby");
        server.listener_id = Some(listener.id);
        server.container_id = Some("cairn-lobby".into());
        let mut module = ModuleRecord::new(server.id, "dynmap");
        module.ports.push(ModulePort {
            listen_port: 8123,
            backend_port: 8123,
            protocol: "http".into(),
            hostname: Some("map.example.com".into()),
        });

        {
            let store = JsonStore::open(&path).await.unwrap();
            store.save_listener(listener.clone()).await.unwrap();
            store.save_server(server.clone()).await.unwrap();
            store.save_module(module.clone()).await.unwrap();
        }

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let store = JsonStore::open(&path).await.unwrap();
        assert_eq!(store.listeners().await.unwrap(), vec![listener]);
        assert_eq!(store.server(&server.id).await.unwrap(), Some(server.clone()));
        assert_eq!(store.modules_for_server(&server.id).await.unwrap(), vec![module]);
    }

    #[tokio::test]
    async fn test_listener_in_use() {
        let store = JsonStore::in_memory();
        let listener = ListenerRecord::new(25565, "main");
        store.save_listener(listener.clone()).await.unwrap();

        let mut server = ServerRecord::new("lobby");
        server.listener_id = Some(listener.id);
        store.save_server(server.clone()).await.unwrap();

        let err = store.delete_listener(&listener.id).await.unwrap_err();
        match err {
            StoreError::ListenerInUse { servers, .. } => assert_eq!(servers, vec![server.id]),
            other => panic!("unexpected error: {other}"),
        }

        server.listener_id = None;
        store.save_server(server).await.unwrap();
        store.delete_listener(&listener.id).await.unwrap();
        assert!(store.listeners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_listener_port() {
        let store = JsonStore::in_memory();
        let first = ListenerRecord::new(25565, "a");
        store.save_listener(first.clone()).await.unwrap();

        let err = store
            .save_listener(ListenerRecord::new(25565, "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateListenerPort { port: 25565, .. }));

        // Re-saving the same listener is an update, not a conflict.
        let mut renamed = first;
        renamed.name = "renamed".into();
        store.save_listener(renamed).await.unwrap();
        assert_eq!(store.listeners().await.unwrap()[0].name, "renamed");
    }

    #[tokio::test]
    async fn test_single_default_listener() {
        let store = JsonStore::in_memory();
        let mut a = ListenerRecord::new(25565, "a");
        a.is_default = true;
        let mut b = ListenerRecord::new(25566, "b");
        b.is_default = true;
        store.save_listener(a.clone()).await.unwrap();
        store.save_listener(b.clone()).await.unwrap();

        let defaults: Vec<_> = store
            .listeners()
            .await
            .unwrap()
            .into_iter()
            .filter(|l| l.is_default)
            .map(|l| l.id)
            .collect();
        assert_eq!(defaults, vec![b.id]);
    }

    #[tokio::test]
    async fn test_delete_server_cascades_modules() {
        let store = JsonStore::in_memory();
        let server = ServerRecord::new("lobby");
        store.save_server(server.clone()).await.unwrap();
        store
            .save_module(ModuleRecord::new(server.id, "voice"))
            .await
            .unwrap();

        store.delete_server(&server.id).await.unwrap();
        assert!(store.modules().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_server(&server.id).await,
            Err(StoreError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("panel.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        let err = JsonStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::UnsupportedVersion { found: 99 }));
    }
}
