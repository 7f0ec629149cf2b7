//! Domain Gate - capability-checked access to IOMMU domains
//!
//! The gate owns a registry from capability id to domain and performs every
//! operation on behalf of an owner holding that capability:
//!
//! | Operation  | Right needed |
//! |------------|--------------|
//! | `map`      | `MAP`        |
//! | `bulk_map` | `MAP`        |
//! | `unmap`    | `UNMAP`      |
//! | `revoke`   | `REVOKE`     |
//! | `destroy`  | `REVOKE`     |
//!
//! Lock order is capability table, then registry, then domain. The
//! capability check and the domain mutation happen inside
//! [`CapabilityTable::with_authorized`], so a concurrent revocation cannot
//! slip between them. The sync hook runs after every lock is released.
//!
//! ## Revocation through the table
//!
//! A domain is bound to the capability's `(id, nonce)` pair, not to the id
//! alone. Removing the capability from the table directly leaves the binding
//! behind, and the slot may be handed to another owner. The next gated call
//! on that id sees the nonce mismatch, retires the old domain (every mapping
//! revoked, sync hook called) and reports [`IommuError::UnknownDomain`].
//! [`DomainGate::reap`] retires such domains without waiting for a call.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use cap_broker::{CapId, CapabilityEntry, CapabilityTable, OwnerId, Rights};

use crate::{
    AddressSpaceId, IommuDomain, IommuError, IommuMapping, IotlbSync, NoopSync, Permissions,
    Result,
};

/// A registered domain and the capability it was created for
struct Binding {
    nonce: u64,
    domain: Arc<IommuDomain>,
}

/// Registry of capability-scoped IOMMU domains
pub struct DomainGate {
    /// Shared capability table
    table: Arc<CapabilityTable>,

    /// Domains reachable through a capability
    domains: Mutex<BTreeMap<CapId, Binding>>,

    /// Sync hook installed in every domain created here
    sync: Arc<dyn IotlbSync>,

    /// Next address-space identifier
    next_asid: AtomicU32,
}

impl DomainGate {
    /// Create a gate whose domains use the no-op sync hook
    pub fn new(table: Arc<CapabilityTable>) -> Self {
        Self::with_sync(table, Arc::new(NoopSync))
    }

    /// Create a gate whose domains report changes to `sync`
    pub fn with_sync(table: Arc<CapabilityTable>, sync: Arc<dyn IotlbSync>) -> Self {
        Self {
            table,
            domains: Mutex::new(BTreeMap::new()),
            sync,
            next_asid: AtomicU32::new(1),
        }
    }

    /// Create an empty domain and a capability for it
    ///
    /// A domain still registered under a recycled id is retired first.
    ///
    /// # Errors
    /// - `Unauthorized(ResourceExhausted)` if the table is full
    /// - `UnknownDomain` if the new capability was revoked and its id
    ///   rebound before registration finished
    pub fn create_domain(&self, owner: OwnerId, rights: Rights) -> Result<CapId> {
        let entry = self.table.alloc_entry(rights, owner)?;
        let cap = entry.id;
        let asid: AddressSpaceId = self.next_asid.fetch_add(1, Ordering::Relaxed);
        let domain = Arc::new(IommuDomain::with_sync(asid, Arc::clone(&self.sync)));

        let binding = Binding {
            nonce: entry.nonce,
            domain,
        };
        if let Some(displaced) = self.bind(cap, binding) {
            if displaced.nonce == entry.nonce {
                return Err(IommuError::UnknownDomain);
            }
            Self::retire(cap, displaced);
        }

        log::debug!("domain asid {} created as {} for owner {}", asid, cap, owner);
        Ok(cap)
    }

    /// Domain behind a live capability, without any rights check
    ///
    /// Read-only inspection (epoch, translate, snapshots) is not gated.
    /// Returns `None` once the capability has been revoked, even if the
    /// domain has not been retired yet.
    pub fn domain(&self, cap: CapId) -> Option<Arc<IommuDomain>> {
        let (nonce, domain) = self
            .domains
            .lock()
            .get(&cap)
            .map(|binding| (binding.nonce, Arc::clone(&binding.domain)))?;
        let live = self.table.lookup(cap).is_ok_and(|entry| entry.nonce == nonce);
        live.then_some(domain)
    }

    /// Register `binding`, returning whichever binding lost the slot
    ///
    /// Nonces only grow, so the higher one is the live capability.
    fn bind(&self, cap: CapId, binding: Binding) -> Option<Binding> {
        let mut domains = self.domains.lock();
        let newer = domains
            .get(&cap)
            .is_some_and(|current| current.nonce > binding.nonce);
        if newer {
            return Some(binding);
        }
        domains.insert(cap, binding)
    }

    /// Unregister `cap` if it is still bound to `nonce`
    fn unbind(&self, cap: CapId, nonce: u64) -> Option<Binding> {
        let mut domains = self.domains.lock();
        let matches = domains
            .get(&cap)
            .is_some_and(|binding| binding.nonce == nonce);
        if matches {
            domains.remove(&cap)
        } else {
            None
        }
    }

    /// Domain bound to the authorized `entry`
    ///
    /// Runs under the table lock. A binding left over from an earlier
    /// capability on the same slot is unregistered and handed back through
    /// `stale` so the caller can retire it once the lock is gone.
    fn bound(
        &self,
        entry: &CapabilityEntry,
        stale: &mut Option<Binding>,
    ) -> Result<Arc<IommuDomain>> {
        let mut domains = self.domains.lock();
        let current = domains
            .get(&entry.id)
            .map(|binding| (binding.nonce, Arc::clone(&binding.domain)));

        match current {
            Some((nonce, domain)) if nonce == entry.nonce => Ok(domain),
            Some(_) => {
                *stale = domains.remove(&entry.id);
                Err(IommuError::UnknownDomain)
            }
            None => Err(IommuError::UnknownDomain),
        }
    }

    /// Revoke every mapping of a domain whose capability is gone
    fn retire(cap: CapId, binding: Binding) {
        let cleared = binding.domain.revoke();
        log::debug!(
            "domain asid {} retired: {} revoked, {} mappings cleared",
            binding.domain.asid(),
            cap,
            cleared
        );
    }

    /// Run `op` on the domain while `cap` is held authorized
    fn gated<T>(
        &self,
        cap: CapId,
        owner: OwnerId,
        needed: Rights,
        op: impl FnOnce(&IommuDomain) -> Result<T>,
    ) -> Result<(Arc<IommuDomain>, T)> {
        let mut stale = None;
        let outcome = self.table.with_authorized(cap, owner, needed, |entry| {
            let domain = self.bound(entry, &mut stale)?;
            let out = op(&domain)?;
            Ok::<_, IommuError>((domain, out))
        });

        if let Some(binding) = stale {
            Self::retire(cap, binding);
        }
        outcome?
    }

    /// Map a range in the domain behind `cap` (needs `MAP`)
    pub fn map(
        &self,
        cap: CapId,
        owner: OwnerId,
        iova: u64,
        pa: u64,
        length: u64,
        permissions: Permissions,
    ) -> Result<()> {
        let (domain, epoch) = self.gated(cap, owner, Rights::MAP, |domain| {
            domain.apply_map(IommuMapping::new(iova, pa, length, permissions))
        })?;
        domain.notify_sync(epoch);
        Ok(())
    }

    /// Map a batch in the domain behind `cap` (needs `MAP`)
    pub fn bulk_map(&self, cap: CapId, owner: OwnerId, entries: &[IommuMapping]) -> Result<()> {
        let (domain, epoch) =
            self.gated(cap, owner, Rights::MAP, |domain| domain.apply_bulk_map(entries))?;
        if let Some(epoch) = epoch {
            domain.notify_sync(epoch);
        }
        Ok(())
    }

    /// Unmap an exact range in the domain behind `cap` (needs `UNMAP`)
    pub fn unmap(&self, cap: CapId, owner: OwnerId, iova: u64, length: u64) -> Result<()> {
        let (domain, epoch) =
            self.gated(cap, owner, Rights::UNMAP, |domain| domain.apply_unmap(iova, length))?;
        domain.notify_sync(epoch);
        Ok(())
    }

    /// Clear every mapping in the domain behind `cap` (needs `REVOKE`)
    pub fn revoke(&self, cap: CapId, owner: OwnerId) -> Result<usize> {
        let (domain, (cleared, epoch)) =
            self.gated(cap, owner, Rights::REVOKE, |domain| Ok(domain.apply_revoke()))?;
        domain.notify_sync(epoch);
        Ok(cleared)
    }

    /// Revoke all mappings, drop the domain and remove its capability
    /// (needs `REVOKE`)
    pub fn destroy(&self, cap: CapId, owner: OwnerId) -> Result<()> {
        let mut stale = None;
        let outcome = self.table.with_authorized(cap, owner, Rights::REVOKE, |entry| {
            let domain = self.bound(entry, &mut stale)?;
            self.domains.lock().remove(&cap);
            let (_, epoch) = domain.apply_revoke();
            Ok::<_, IommuError>((domain, entry.nonce, epoch))
        });
        if let Some(binding) = stale {
            Self::retire(cap, binding);
        }

        let (domain, nonce, epoch) = outcome??;
        domain.notify_sync(epoch);
        // Fails only if the capability was revoked concurrently
        self.table.remove_exact(cap, nonce)?;
        log::debug!("domain asid {} destroyed ({})", domain.asid(), cap);
        Ok(())
    }

    /// Destroy every domain whose capability belongs to `owner`
    ///
    /// The capabilities are removed in one table critical section. Returns
    /// the number of domains destroyed.
    pub fn destroy_owner(&self, owner: OwnerId) -> usize {
        let revoked = self.table.revoke_where(|entry| {
            entry.owner == owner
                && self
                    .domains
                    .lock()
                    .get(&entry.id)
                    .is_some_and(|binding| binding.nonce == entry.nonce)
        });

        let mut destroyed = 0;
        for entry in revoked {
            if let Some(binding) = self.unbind(entry.id, entry.nonce) {
                Self::retire(entry.id, binding);
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Retire every domain whose capability is no longer live
    ///
    /// Picks up capabilities removed through the table directly
    /// (`remove`, `revoke_owner`, `teardown`). Returns the number of domains
    /// retired.
    pub fn reap(&self) -> usize {
        let bound: Vec<(CapId, u64)> = self
            .domains
            .lock()
            .iter()
            .map(|(cap, binding)| (*cap, binding.nonce))
            .collect();

        let mut reaped = 0;
        for (cap, nonce) in bound {
            // A stale nonce never becomes live again
            if self.table.lookup(cap).is_ok_and(|entry| entry.nonce == nonce) {
                continue;
            }
            if let Some(binding) = self.unbind(cap, nonce) {
                Self::retire(cap, binding);
                reaped += 1;
            }
        }
        reaped
    }

    /// Number of registered domains, including any not yet reaped
    pub fn domain_count(&self) -> usize {
        self.domains.lock().len()
    }
}
