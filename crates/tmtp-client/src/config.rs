//! Client configuration loaded from environment variables.
//!
//! Everything has a default, so the client starts with an empty store and no
//! service when nothing is set.

use std::path::PathBuf;
use std::time::Duration;

use tmtp_net::LinkConfig;
use tmtp_shared::constants::DEFAULT_RELAY_PORT;
use tmtp_store::ServiceConfig;

/// Login period used when `TMTP_LOGIN_PERIOD` is unset.
const DEFAULT_LOGIN_PERIOD: u64 = 600;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root of the store tree.
    /// Env: `TMTP_STORE_DIR`
    /// Default: `./store`
    pub store_dir: PathBuf,

    /// Service to create on first start, if it does not exist yet.
    /// Env: `TMTP_SERVICE`
    pub service: Option<String>,

    /// Relay address for that service.
    /// Env: `TMTP_RELAY_ADDR`
    /// Default: `127.0.0.1:8888`
    pub relay_addr: String,

    /// Alias to register under.
    /// Env: `TMTP_ALIAS`
    pub alias: String,

    /// Seconds between logins; also scales the idle timeout.
    /// Env: `TMTP_LOGIN_PERIOD`
    pub login_period: u64,

    /// Env: `TMTP_CONNECT_TIMEOUT` (seconds)
    /// Default: `10`
    pub connect_timeout: Duration,

    /// Crash checkpoint for recovery testing, `staged` or `applied`.
    /// Env: `TMTP_CRASH_AT`
    pub crash_at: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./store"),
            service: None,
            relay_addr: format!("127.0.0.1:{DEFAULT_RELAY_PORT}"),
            alias: String::new(),
            login_period: DEFAULT_LOGIN_PERIOD,
            connect_timeout: LinkConfig::default().connect_timeout,
            crash_at: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = var("TMTP_STORE_DIR") {
            config.store_dir = PathBuf::from(dir);
        }

        if let Some(name) = var("TMTP_SERVICE") {
            if !name.is_empty() {
                config.service = Some(name);
            }
        }

        if let Some(addr) = var("TMTP_RELAY_ADDR") {
            config.relay_addr = addr;
        }

        if let Some(alias) = var("TMTP_ALIAS") {
            config.alias = alias;
        }

        if let Some(val) = var("TMTP_LOGIN_PERIOD") {
            match val.parse::<u64>() {
                Ok(n) => config.login_period = n,
                Err(_) => tracing::warn!(value = %val, "Invalid TMTP_LOGIN_PERIOD, using default"),
            }
        }

        if let Some(val) = var("TMTP_CONNECT_TIMEOUT") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.connect_timeout = Duration::from_secs(n),
                _ => tracing::warn!(value = %val, "Invalid TMTP_CONNECT_TIMEOUT, using default"),
            }
        }

        if let Some(point) = var("TMTP_CRASH_AT") {
            if !point.is_empty() {
                config.crash_at = Some(point);
            }
        }

        config
    }

    /// Settings for the service named by `TMTP_SERVICE`.
    pub fn service_config(&self) -> Option<ServiceConfig> {
        let name = self.service.clone()?;
        Some(ServiceConfig {
            alias: if self.alias.is_empty() {
                name.clone()
            } else {
                self.alias.clone()
            },
            name,
            addr: self.relay_addr.clone(),
            login_period: self.login_period,
            ..Default::default()
        })
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: self.connect_timeout,
            ..Default::default()
        }
    }
}
