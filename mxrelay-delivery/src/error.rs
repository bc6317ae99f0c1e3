use std::{fmt, net::SocketAddr};

use mxrelay_smtp::ClientError;
use thiserror::Error;

use crate::{dns::DnsError, session::SessionState};

/// Why no candidate target could be resolved.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Recipient has no usable domain: {0}")]
    InvalidRecipient(String),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error("No relay targets for {0}")]
    NoTargets(String),
}

impl ResolutionError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Dns(dns) => dns.is_temporary(),
            Self::InvalidRecipient(_) | Self::NoTargets(_) => false,
        }
    }
}

/// Why the selector could not hand out a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoTargetReason {
    /// Every remaining target is at its per-IP connection limit.
    AdmissionLimit,
    /// No local binding of the target's address family is configured.
    NoLocalBinding,
    /// Every target was tried, or the list was empty.
    Exhausted,
}

impl fmt::Display for NoTargetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AdmissionLimit => "all targets over per-IP limit",
            Self::NoLocalBinding => "no address-family-matching local binding",
            Self::Exhausted => "all targets failed to connect",
        })
    }
}

/// Outcome of a failed relay session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Nothing to connect to; no connection was attempted.
    #[error("Target resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("No target available: {reason}")]
    NoTarget {
        reason: NoTargetReason,
        #[source]
        last_error: Option<Box<RelayError>>,
    },

    /// Recoverable within a session by failing over to the next target.
    #[error("Connect to {target} failed: {source}")]
    Connect {
        target: SocketAddr,
        #[source]
        source: ClientError,
    },

    /// Rejection or failure after the connection was established.
    #[error("{stage} failed: {source}")]
    Protocol {
        stage: SessionState,
        #[source]
        source: ClientError,
    },

    #[error("Session disconnected: {0}")]
    Disconnected(String),
}

impl RelayError {
    pub(crate) fn protocol(stage: SessionState) -> impl Fn(ClientError) -> Self {
        move |source| Self::Protocol { stage, source }
    }

    /// Whether a later attempt could succeed. Only `5xx` replies and
    /// unusable recipients are final.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Resolution(resolution) => resolution.is_temporary(),
            Self::Protocol { source, .. } => source.is_temporary(),
            Self::NoTarget { .. } | Self::Connect { .. } | Self::Disconnected(_) => true,
        }
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }

    /// The stage at which the session failed, if it got past resolution.
    #[must_use]
    pub const fn stage(&self) -> Option<SessionState> {
        match self {
            Self::Protocol { stage, .. } => Some(*stage),
            Self::Connect { .. } | Self::NoTarget { .. } => Some(SessionState::Connecting),
            Self::Resolution(_) => Some(SessionState::ResolvingTargets),
            Self::Disconnected(_) => None,
        }
    }
}
