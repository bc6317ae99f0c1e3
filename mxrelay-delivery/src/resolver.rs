//! Turns a recipient, or the smart host list, into relay targets.

use std::net::SocketAddr;

use mxrelay_common::Domain;
use tracing::debug;

use crate::{
    config::{RelayMode, SmartHost},
    dns::Resolve,
    error::ResolutionError,
    types::RelayTarget,
};

/// Port for MX delivery.
pub const SMTP_PORT: u16 = 25;

/// Resolve the ordered target list for one session.
///
/// In DNS mode every address of every mail exchanger of the recipient's
/// domain becomes a target on port 25, keeping MX preference order and the
/// resolver's address order. In smart host mode every address of every smart
/// host becomes a target with that smart host's port, TLS mode and
/// credentials, in configuration order.
///
/// # Errors
///
/// Fails if the recipient has no domain, the lookup fails, or nothing
/// resolves.
pub async fn resolve_targets(
    recipient: &str,
    relay_mode: RelayMode,
    smart_hosts: &[SmartHost],
    resolver: &dyn Resolve,
) -> Result<Vec<RelayTarget>, ResolutionError> {
    let targets = match relay_mode {
        RelayMode::Dns => resolve_mail_exchangers(recipient, resolver).await?,
        RelayMode::SmartHost => resolve_smart_hosts(smart_hosts, resolver).await?,
    };

    if targets.is_empty() {
        return Err(ResolutionError::NoTargets(recipient.to_string()));
    }

    debug!(count = targets.len(), "Resolved relay targets");
    Ok(targets)
}

async fn resolve_mail_exchangers(
    recipient: &str,
    resolver: &dyn Resolve,
) -> Result<Vec<RelayTarget>, ResolutionError> {
    let domain = Domain::from_address(recipient)
        .ok_or_else(|| ResolutionError::InvalidRecipient(recipient.to_string()))?;

    if domain.is_literal() {
        let ip = domain
            .literal_address()
            .ok_or_else(|| ResolutionError::InvalidRecipient(recipient.to_string()))?;

        return Ok(vec![RelayTarget::new(
            ip.to_string(),
            SocketAddr::new(ip, SMTP_PORT),
        )]);
    }

    let exchangers = resolver.resolve_mail_exchangers(&domain).await?;

    Ok(exchangers
        .into_iter()
        .flat_map(|exchanger| {
            exchanger.addresses.into_iter().map(move |ip| {
                RelayTarget::new(exchanger.host.clone(), SocketAddr::new(ip, SMTP_PORT))
            })
        })
        .collect())
}

async fn resolve_smart_hosts(
    smart_hosts: &[SmartHost],
    resolver: &dyn Resolve,
) -> Result<Vec<RelayTarget>, ResolutionError> {
    let names: Vec<String> = smart_hosts.iter().map(|host| host.host.clone()).collect();
    let resolved = resolver.resolve_addresses(&names).await?;

    Ok(smart_hosts
        .iter()
        .filter_map(|smart_host| {
            let addresses = resolved
                .iter()
                .find(|resolved| resolved.host.eq_ignore_ascii_case(&smart_host.host))?;

            Some(addresses.addresses.iter().map(|&ip| RelayTarget {
                host_name: smart_host.host.clone(),
                endpoint: SocketAddr::new(ip, smart_host.port),
                ssl_mode: smart_host.ssl_mode,
                credentials: smart_host.credentials.clone(),
            }))
        })
        .flatten()
        .collect())
}
