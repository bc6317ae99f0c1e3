//! Domain newtype for type safety
//!
//! Wraps the domain part of a mailbox so that addresses and host names are
//! never confused when handed to the resolver.

use std::{
    fmt::{self, Display},
    net::IpAddr,
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A domain name, or an address literal such as `[192.0.2.1]`.
///
/// # Examples
///
/// ```
/// use mxrelay_common::Domain;
///
/// let domain = Domain::from_address("user@Example.COM").unwrap();
/// assert_eq!(domain.as_str(), "example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    /// Extract the domain part of a mailbox.
    ///
    /// Angle brackets are tolerated. The domain is lower-cased. Returns `None`
    /// when there is no `@`, or the domain part is empty.
    #[must_use]
    pub fn from_address(address: &str) -> Option<Self> {
        let address = address
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');

        let (_, domain) = address.rsplit_once('@')?;
        let domain = domain.trim_end_matches('.');

        if domain.is_empty() {
            return None;
        }

        Some(Self::new(domain.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is an address literal (`[192.0.2.1]`, `[IPv6:2001:db8::1]`).
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.0.starts_with('[') && self.0.ends_with(']')
    }

    /// The IP address of an address literal, if it is one and parses.
    #[must_use]
    pub fn literal_address(&self) -> Option<IpAddr> {
        if !self.is_literal() {
            return None;
        }

        let inner = &self.0[1..self.0.len() - 1];
        let inner = inner
            .strip_prefix("ipv6:")
            .or_else(|| inner.strip_prefix("IPv6:"))
            .unwrap_or(inner);

        inner.parse().ok()
    }

    #[must_use]
    pub fn into_inner(self) -> Arc<str> {
        self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}
