//! Per remote IP connection admission and local binding selection.
//!
//! Every session that wants to connect to a remote IP first takes a slot from
//! the admission controller. The slot comes back as an [`AdmissionPermit`],
//! which gives the slot back when dropped, so each successful admit is
//! matched by exactly one release however the session ends.
//!
//! The controller also owns the configured local bindings and hands them out
//! round-robin per address family.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::trace;

use crate::types::{AddressFamily, IpBindInfo};

#[derive(Debug)]
pub struct AdmissionController {
    /// 0 means unlimited.
    max_per_ip: usize,
    in_use: DashMap<IpAddr, usize>,
    v4: Vec<Arc<IpBindInfo>>,
    v6: Vec<Arc<IpBindInfo>>,
    v4_next: AtomicUsize,
    v6_next: AtomicUsize,
}

impl AdmissionController {
    #[must_use]
    pub fn new(max_per_ip: usize, bindings: impl IntoIterator<Item = IpBindInfo>) -> Self {
        let (v4, v6): (Vec<_>, Vec<_>) = bindings
            .into_iter()
            .map(Arc::new)
            .partition(|binding| binding.family() == AddressFamily::V4);

        Self {
            max_per_ip,
            in_use: DashMap::new(),
            v4,
            v6,
            v4_next: AtomicUsize::new(0),
            v6_next: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn max_per_ip(&self) -> usize {
        self.max_per_ip
    }

    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_per_ip == 0
    }

    /// Take a connection slot for `ip` unless it is at its limit.
    ///
    /// Slots are counted even when unlimited so that [`Self::in_use`] stays
    /// meaningful.
    #[must_use]
    pub fn try_admit(self: &Arc<Self>, ip: IpAddr) -> Option<AdmissionPermit> {
        let mut count = self.in_use.entry(ip).or_insert(0);

        if !self.is_unlimited() && *count >= self.max_per_ip {
            trace!(%ip, in_use = *count, "Admission refused");
            return None;
        }

        *count += 1;
        trace!(%ip, in_use = *count, "Admitted");
        drop(count);

        Some(AdmissionPermit {
            controller: Arc::clone(self),
            ip,
        })
    }

    /// Give a slot back before the permit would be dropped anyway.
    pub fn release(&self, permit: AdmissionPermit) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&permit.controller)));
        drop(permit);
    }

    fn release_ip(&self, ip: IpAddr) {
        if let Entry::Occupied(mut entry) = self.in_use.entry(ip) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
        trace!(%ip, "Released");
    }

    /// A local binding for connecting to a remote of `family`.
    ///
    /// With several bindings of that family, the n-th call returns binding
    /// `n mod k` in configuration order.
    #[must_use]
    pub fn resolve_local_binding(&self, family: AddressFamily) -> Option<Arc<IpBindInfo>> {
        let (bindings, next) = match family {
            AddressFamily::V4 => (&self.v4, &self.v4_next),
            AddressFamily::V6 => (&self.v6, &self.v6_next),
        };

        if bindings.is_empty() {
            return None;
        }

        let index = next.fetch_add(1, Ordering::Relaxed) % bindings.len();
        bindings.get(index).cloned()
    }

    /// Active connections to `ip`.
    #[must_use]
    pub fn in_use(&self, ip: IpAddr) -> usize {
        self.in_use.get(&ip).map_or(0, |count| *count)
    }

    /// Every IP with at least one active connection, sorted by IP.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(IpAddr, usize)> {
        let mut snapshot: Vec<_> = self
            .in_use
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        snapshot.sort_unstable();
        snapshot
    }
}

/// A held connection slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    ip: IpAddr,
}

impl AdmissionPermit {
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release_ip(self.ip);
    }
}
