//! Relay configuration.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use mxrelay_smtp::{Credentials, SmtpTimeouts, SslMode};
use serde::Deserialize;
use thiserror::Error;

use crate::{dns::DnsConfig, types::IpBindInfo};

/// Where targets come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RelayMode {
    /// MX lookup of the recipient's domain.
    #[default]
    Dns,
    /// The configured smart hosts.
    SmartHost,
}

/// How the selector walks the target list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum BalanceMode {
    /// Any admissible target may be used; smart hosts rotate per session.
    #[default]
    LoadBalance,
    /// Only the first remaining target is considered.
    FailOver,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmartHost {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl SmartHost {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            ssl_mode: SslMode::None,
            credentials: None,
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn with_ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Smart host relay mode requires at least one smart host")]
    NoSmartHosts,

    #[error("Smart host {index} has an empty host name")]
    EmptySmartHost { index: usize },

    #[error("Smart host {host} has port 0")]
    InvalidPort { host: String },

    #[error("At least one local binding is required")]
    NoBindings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub relay_mode: RelayMode,

    #[serde(default)]
    pub balance_mode: BalanceMode,

    #[serde(default)]
    pub smart_hosts: Vec<SmartHost>,

    /// Local addresses to connect from (default: `0.0.0.0` and `::`)
    #[serde(default = "default_bindings")]
    pub bindings: Vec<IpBindInfo>,

    /// Concurrent sessions, 0 for unlimited (default: 0)
    #[serde(default)]
    pub max_connections: usize,

    /// Concurrent connections to one remote IP, 0 for unlimited (default: 10)
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Default: 300
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,

    /// Upgrade with STARTTLS whenever the server offers it.
    #[serde(default)]
    pub use_tls_if_possible: bool,

    /// Skip certificate verification. For testing only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub smtp_timeouts: SmtpTimeouts,
}

const fn default_port() -> u16 {
    25
}

fn default_bindings() -> Vec<IpBindInfo> {
    vec![
        IpBindInfo::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        IpBindInfo::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
    ]
}

const fn default_max_connections_per_ip() -> usize {
    10
}

const fn default_session_idle_timeout_secs() -> u64 {
    300
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_mode: RelayMode::default(),
            balance_mode: BalanceMode::default(),
            smart_hosts: Vec::new(),
            bindings: default_bindings(),
            max_connections: 0,
            max_connections_per_ip: default_max_connections_per_ip(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            use_tls_if_possible: false,
            accept_invalid_certs: false,
            dns: DnsConfig::default(),
            smtp_timeouts: SmtpTimeouts::default(),
        }
    }
}

impl RelayConfig {
    /// Check the configuration for combinations the relay cannot work with.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bindings.is_empty() {
            return Err(ConfigError::NoBindings);
        }

        if self.relay_mode == RelayMode::SmartHost && self.smart_hosts.is_empty() {
            return Err(ConfigError::NoSmartHosts);
        }

        for (index, smart_host) in self.smart_hosts.iter().enumerate() {
            if smart_host.host.trim().is_empty() {
                return Err(ConfigError::EmptySmartHost { index });
            }

            if smart_host.port == 0 {
                return Err(ConfigError::InvalidPort {
                    host: smart_host.host.clone(),
                });
            }
        }

        Ok(())
    }

    #[must_use]
    pub const fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}
