//! # cairn-proxy
//!
//! Multi-protocol reverse proxy and virtual routing core for the cairn
//! game-server panel.
//!
//! - [`proxy`]: handshake codec, route tables and the four proxy variants
//!   (raw TCP, UDP sessions, HTTP Host routing, handshake-routed game traffic)
//! - [`manager`]: the port -> instance registry kept in line with panel state
//! - [`persistence`]: listener, server and module records
//! - [`resolver`]: container address lookup
//! - [`sync`]: lifecycle events -> manager calls

pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod persistence;
pub mod proxy;
pub mod resolver;
pub mod sync;

pub use error::{ProxyError, Result};
pub use manager::{ManagerConfig, PortRoutes, ProxyManager};
pub use model::{HostnamePolicy, ListenerRecord, ModulePort, ModuleRecord, ServerRecord};
pub use persistence::{JsonStore, PanelStore, StoreError};
pub use proxy::{ProxyInstance, ProxyKind, ProxyTimeouts, Route, RouteTable};
pub use resolver::{BackendResolver, DockerResolver, StaticResolver};
