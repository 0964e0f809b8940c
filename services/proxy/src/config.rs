//! Proxy daemon configuration (env-driven).

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::manager::ManagerConfig;
use crate::model::HostnamePolicy;
use crate::proxy::ProxyTimeouts;

#[derive(Debug, Clone)]
pub struct Config {
    /// Panel records (listeners, servers, modules).
    pub data_file: PathBuf,

    /// Docker network container addresses are resolved on.
    pub docker_network: String,

    /// Inclusive range `allocate_proxy_port` draws from.
    pub proxy_port_min: u16,
    pub proxy_port_max: u16,

    /// Base domain for generated hostnames (`<slug>.<base_domain>`).
    pub base_domain: Option<String>,

    /// Suffix for fallback hostnames (`server-<id>.<suffix>`).
    pub hostname_suffix: String,

    /// Host every listener binds on.
    pub bind_host: IpAddr,

    /// Period of the drift-correcting route refresh; `None` disables it.
    pub refresh_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} has an invalid value"))
        .map(|v| v.unwrap_or(default))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_file = std::env::var("CAIRN_DATA_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/panel.json"));

        let docker_network =
            std::env::var("CAIRN_DOCKER_NETWORK").unwrap_or_else(|_| "cairn".to_string());

        let proxy_port_min: u16 = env_parse("CAIRN_PROXY_PORT_MIN", 30000)?;
        let proxy_port_max: u16 = env_parse("CAIRN_PROXY_PORT_MAX", 30999)?;
        if proxy_port_min > proxy_port_max {
            bail!(
                "CAIRN_PROXY_PORT_MIN ({proxy_port_min}) must not exceed \
                 CAIRN_PROXY_PORT_MAX ({proxy_port_max})"
            );
        }

        let base_domain = std::env::var("CAIRN_BASE_DOMAIN")
            .ok()
            .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty());

        let hostname_suffix =
            std::env::var("CAIRN_HOSTNAME_SUFFIX").unwrap_or_else(|_| "local".to_string());

        let bind_host: IpAddr = env_parse("CAIRN_BIND_HOST", IpAddr::from([0, 0, 0, 0]))?;

        let refresh_secs: u64 = env_parse("CAIRN_REFRESH_INTERVAL_SECS", 300)?;
        let refresh_interval = (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs));

        let log_level = std::env::var("CAIRN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            data_file,
            docker_network,
            proxy_port_min,
            proxy_port_max,
            base_domain,
            hostname_suffix,
            bind_host,
            refresh_interval,
            log_level,
        })
    }

    /// The subset the proxy manager uses.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            bind_host: self.bind_host,
            docker_network: self.docker_network.clone(),
            proxy_port_range: self.proxy_port_min..=self.proxy_port_max,
            hostnames: HostnamePolicy {
                base_domain: self.base_domain.clone(),
                suffix: self.hostname_suffix.clone(),
            },
            timeouts: ProxyTimeouts::default(),
        }
    }
}
