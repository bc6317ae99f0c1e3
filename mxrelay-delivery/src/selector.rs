//! Picks the next target to connect to.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    admission::{AdmissionController, AdmissionPermit},
    config::{BalanceMode, RelayMode},
    error::NoTargetReason,
    types::{IpBindInfo, RelayTarget},
};

/// A target ready to be connected to, with its slot already taken.
#[derive(Debug)]
pub struct Selection {
    pub target: RelayTarget,
    pub binding: Arc<IpBindInfo>,
    pub permit: AdmissionPermit,
}

/// Remove and return the next usable target from `remaining`.
///
/// * With no per-IP limit, the first target with a local binding of its
///   address family wins. Targets without one are dropped from the list.
/// * For DNS relay, or smart hosts in load balance mode, the list is scanned
///   in order and the first target with a binding and a free slot wins.
///   Skipped targets stay in the list.
/// * For smart hosts in fail-over mode only the first target is considered.
///
/// # Errors
///
/// Returns why nothing could be selected: every candidate was over its
/// per-IP limit, none had a matching local binding, or the list is empty.
pub fn select_next(
    remaining: &mut Vec<RelayTarget>,
    admission: &Arc<AdmissionController>,
    relay_mode: RelayMode,
    balance_mode: BalanceMode,
) -> Result<Selection, NoTargetReason> {
    if admission.is_unlimited() {
        select_unlimited(remaining, admission)
    } else if relay_mode == RelayMode::Dns || balance_mode == BalanceMode::LoadBalance {
        select_scan(remaining, admission)
    } else {
        select_first(remaining, admission)
    }
}

fn select_unlimited(
    remaining: &mut Vec<RelayTarget>,
    admission: &Arc<AdmissionController>,
) -> Result<Selection, NoTargetReason> {
    let mut dropped = false;

    while !remaining.is_empty() {
        let target = remaining.remove(0);

        let Some(binding) = admission.resolve_local_binding(target.family()) else {
            warn!(%target, "Dropping target, no local binding for its address family");
            dropped = true;
            continue;
        };

        if let Some(permit) = admission.try_admit(target.ip()) {
            return Ok(Selection {
                target,
                binding,
                permit,
            });
        }
    }

    Err(if dropped {
        NoTargetReason::NoLocalBinding
    } else {
        NoTargetReason::Exhausted
    })
}

fn select_scan(
    remaining: &mut Vec<RelayTarget>,
    admission: &Arc<AdmissionController>,
) -> Result<Selection, NoTargetReason> {
    let mut over_limit = false;
    let mut unbound = false;

    for index in 0..remaining.len() {
        let target = &remaining[index];

        let Some(binding) = admission.resolve_local_binding(target.family()) else {
            debug!(%target, "Skipping target, no local binding for its address family");
            unbound = true;
            continue;
        };

        let Some(permit) = admission.try_admit(target.ip()) else {
            debug!(
                %target,
                limit = admission.max_per_ip(),
                "Skipping target, per-IP connection limit reached"
            );
            over_limit = true;
            continue;
        };

        return Ok(Selection {
            target: remaining.remove(index),
            binding,
            permit,
        });
    }

    Err(if over_limit {
        NoTargetReason::AdmissionLimit
    } else if unbound {
        NoTargetReason::NoLocalBinding
    } else {
        NoTargetReason::Exhausted
    })
}

fn select_first(
    remaining: &mut Vec<RelayTarget>,
    admission: &Arc<AdmissionController>,
) -> Result<Selection, NoTargetReason> {
    let target = remaining.first().ok_or(NoTargetReason::Exhausted)?;

    let Some(binding) = admission.resolve_local_binding(target.family()) else {
        debug!(%target, "Primary target has no local binding for its address family");
        return Err(NoTargetReason::NoLocalBinding);
    };

    let Some(permit) = admission.try_admit(target.ip()) else {
        debug!(%target, "Primary target is at its per-IP connection limit");
        return Err(NoTargetReason::AdmissionLimit);
    };

    Ok(Selection {
        target: remaining.remove(0),
        binding,
        permit,
    })
}
