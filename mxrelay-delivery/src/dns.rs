//! DNS resolution for outbound relay.
//!
//! Implements MX lookups with the implicit MX fallback of RFC 5321 §5.1 and
//! the null MX of RFC 7505. MX answers and address answers are cached
//! separately, using the record TTL bounded by the configured minimum and
//! maximum unless an override TTL is configured.

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    ResolveError, TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::rr::{Name, Record},
};
use mxrelay_common::Domain;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// TTL assumed when an answer carries no records to take one from.
const FALLBACK_TTL: u32 = 300;

/// MX host names ordered by preference, or the null MX error when any
/// exchange is the root name.
fn exchange_hosts(
    domain: &str,
    records: impl IntoIterator<Item = (u16, Name)>,
) -> Result<Vec<String>, DnsError> {
    let mut records: Vec<_> = records.into_iter().collect();
    records.sort_by_key(|(preference, _)| *preference);

    if records.iter().any(|(_, exchange)| exchange.is_root()) {
        return Err(DnsError::NullMx(domain.to_string()));
    }

    Ok(records
        .into_iter()
        .map(|(_, exchange)| exchange.to_utf8().trim_end_matches('.').to_string())
        .collect())
}

#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// The domain publishes a null MX and accepts no mail.
    #[error("Domain does not accept mail (null MX): {0}")]
    NullMx(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] ResolveError),

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("Host has no addresses: {0}")]
    NoAddresses(String),
}

impl DnsError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides the record TTL for every cached entry when set.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

impl DnsConfig {
    /// How long to cache an answer whose smallest record TTL is `dns_ttl`.
    #[must_use]
    pub fn cache_ttl(&self, dns_ttl: u32) -> Duration {
        let secs = self.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(
                self.min_cache_ttl_secs,
                self.max_cache_ttl_secs.max(self.min_cache_ttl_secs),
            )
        });

        Duration::from_secs(secs)
    }
}

/// A host name together with the addresses it resolved to, in resolver order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddresses {
    pub host: String,
    pub addresses: Vec<IpAddr>,
}

impl HostAddresses {
    #[must_use]
    pub fn new(host: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            host: host.into(),
            addresses,
        }
    }
}

/// The DNS collaborator of a relay session.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Mail exchangers for `domain` in preference order, each with its addresses.
    async fn resolve_mail_exchangers(&self, domain: &Domain)
    -> Result<Vec<HostAddresses>, DnsError>;

    /// Addresses for each of `hosts`, in the given order.
    async fn resolve_addresses(&self, hosts: &[String]) -> Result<Vec<HostAddresses>, DnsError>;
}

#[derive(Debug, Clone)]
struct Cached<T> {
    value: Arc<T>,
    expires_at: Instant,
}

/// Hickory backed resolver with lock-free TTL caching.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    exchangers: DashMap<String, Cached<Vec<String>>>,
    addresses: DashMap<String, Cached<Vec<IpAddr>>>,
    config: DnsConfig,
}

fn min_ttl(records: &[Record]) -> u32 {
    records
        .iter()
        .map(Record::ttl)
        .min()
        .unwrap_or(FALLBACK_TTL)
}

impl DnsResolver {
    /// Creates a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self::from_resolver(resolver, config))
    }

    /// Creates a resolver with an explicit upstream configuration.
    #[must_use]
    pub fn with_resolver_config(
        resolver_config: ResolverConfig,
        mut opts: ResolverOpts,
        config: DnsConfig,
    ) -> Self {
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self::from_resolver(resolver, config)
    }

    fn from_resolver(resolver: TokioResolver, config: DnsConfig) -> Self {
        Self {
            resolver,
            exchangers: DashMap::new(),
            addresses: DashMap::new(),
            config,
        }
    }

    fn cached<T>(cache: &DashMap<String, Cached<T>>, key: &str) -> Option<Arc<T>> {
        let entry = cache.get(key)?;
        if entry.expires_at > Instant::now() {
            return Some(Arc::clone(&entry.value));
        }

        drop(entry);
        cache.remove(key);
        None
    }

    fn store<T>(&self, cache: &DashMap<String, Cached<T>>, key: &str, value: T, dns_ttl: u32) -> Arc<T> {
        let ttl = self.config.cache_ttl(dns_ttl);
        let value = Arc::new(value);

        debug!("Caching {key} for {}s", ttl.as_secs());

        cache.insert(
            key.to_string(),
            Cached {
                value: Arc::clone(&value),
                expires_at: Instant::now() + ttl,
            },
        );

        value
    }

    async fn exchangers(&self, domain: &str) -> Result<Arc<Vec<String>>, DnsError> {
        if let Some(exchangers) = Self::cached(&self.exchangers, domain) {
            debug!("Cache hit for MX {domain}");
            return Ok(exchangers);
        }

        let (exchangers, ttl) = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let ttl = min_ttl(lookup.as_lookup().records());

                let records = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().clone()));

                (exchange_hosts(domain, records)?, ttl)
            }
            Err(err) if err.is_nx_domain() => {
                return Err(DnsError::DomainNotFound(domain.to_string()));
            }
            Err(err) if err.is_no_records_found() => (Vec::new(), FALLBACK_TTL),
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                return Err(DnsError::LookupFailed(err));
            }
        };

        // Implicit MX: the domain itself
        let exchangers = if exchangers.is_empty() {
            debug!("No MX records for {domain}, using the domain itself");
            vec![domain.to_string()]
        } else {
            exchangers
        };

        Ok(self.store(&self.exchangers, domain, exchangers, ttl))
    }

    async fn lookup_host(&self, host: &str) -> Result<Arc<Vec<IpAddr>>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Arc::new(vec![ip]));
        }

        if let Some(addresses) = Self::cached(&self.addresses, host) {
            debug!("Cache hit for {host}");
            return Ok(addresses);
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let ttl = min_ttl(lookup.as_lookup().records());
                let addresses: Vec<IpAddr> = lookup.iter().collect();

                if addresses.is_empty() {
                    return Err(DnsError::NoAddresses(host.to_string()));
                }

                Ok(self.store(&self.addresses, host, addresses, ttl))
            }
            Err(err) if err.is_nx_domain() || err.is_no_records_found() => {
                Err(DnsError::NoAddresses(host.to_string()))
            }
            Err(err) => {
                warn!("Address lookup failed for {host}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    /// Look up every host, skipping the ones that fail. Only when none
    /// resolve is the first error returned.
    async fn lookup_all<'a>(
        &self,
        hosts: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<HostAddresses>, Option<DnsError>> {
        let mut resolved = Vec::new();
        let mut first_error = None;

        for host in hosts {
            match self.lookup_host(host).await {
                Ok(addresses) => resolved.push(HostAddresses::new(host, addresses.to_vec())),
                Err(err) => {
                    debug!("Skipping {host}: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }

        if resolved.is_empty() {
            Err(first_error)
        } else {
            Ok(resolved)
        }
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve_mail_exchangers(
        &self,
        domain: &Domain,
    ) -> Result<Vec<HostAddresses>, DnsError> {
        debug!("Resolving mail exchangers for {domain}");

        let exchangers = self.exchangers(domain.as_str()).await?;

        self.lookup_all(exchangers.iter().map(String::as_str))
            .await
            .map_err(|err| err.unwrap_or_else(|| DnsError::NoMailServers(domain.to_string())))
    }

    async fn resolve_addresses(&self, hosts: &[String]) -> Result<Vec<HostAddresses>, DnsError> {
        self.lookup_all(hosts.iter().map(String::as_str))
            .await
            .map_err(|err| err.unwrap_or_else(|| DnsError::NoAddresses(hosts.join(", "))))
    }
}
