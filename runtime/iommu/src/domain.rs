//! IOMMU Domain - one device address space
//!
//! ## Locking
//!
//! Each domain owns one spinlock around its arena and epoch. Every mutating
//! operation takes the lock, validates, mutates, bumps the epoch and drops
//! the lock, then calls the [`IotlbSync`] hook with the new epoch. The hook
//! never runs with the domain lock held.
//!
//! ## Epochs
//!
//! The epoch starts at zero and increases by one per structural change. A
//! [`Translation`] remembers the epoch it was read at; if the domain's epoch
//! has moved on, the translation may be stale and must be looked up again.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use crate::arena::MappingArena;
use crate::page::align_down;
use crate::{validate_range, IommuError, IommuMapping, Permissions, Result};

/// Hardware address-space identifier
pub type AddressSpaceId = u32;

/// Translation-cache invalidation hook
///
/// Called after every structural change, outside the domain lock. Without
/// real hardware the hook is a no-op, but it is always invoked.
pub trait IotlbSync: Send + Sync {
    /// Invalidate cached translations for `asid` older than `epoch`
    fn sync(&self, asid: AddressSpaceId, epoch: u64);
}

/// Hook for domains with no hardware behind them
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

impl IotlbSync for NoopSync {
    fn sync(&self, _asid: AddressSpaceId, _epoch: u64) {}
}

/// Result of a translation lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Looked-up device address
    pub iova: u64,

    /// Physical address `iova` translates to
    pub pa: u64,

    /// Page-aligned base of `iova`
    pub page: u64,

    pub permissions: Permissions,

    /// Domain epoch at lookup time
    pub epoch: u64,
}

impl Translation {
    /// Check whether the domain changed since this translation was read
    pub fn is_stale(&self, domain: &IommuDomain) -> bool {
        domain.epoch() != self.epoch
    }
}

struct DomainState {
    arena: MappingArena,
    epoch: u64,
}

impl DomainState {
    fn bump(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

/// IOMMU translation domain
pub struct IommuDomain {
    asid: AddressSpaceId,
    state: Mutex<DomainState>,
    sync: Arc<dyn IotlbSync>,
}

impl IommuDomain {
    /// Create an empty domain with a no-op sync hook
    pub fn new(asid: AddressSpaceId) -> Self {
        Self::with_sync(asid, Arc::new(NoopSync))
    }

    /// Create an empty domain that reports changes to `sync`
    pub fn with_sync(asid: AddressSpaceId, sync: Arc<dyn IotlbSync>) -> Self {
        Self {
            asid,
            state: Mutex::new(DomainState {
                arena: MappingArena::new(),
                epoch: 0,
            }),
            sync,
        }
    }

    /// Address-space identifier
    pub fn asid(&self) -> AddressSpaceId {
        self.asid
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Map `length` bytes at `iova` to `pa`
    ///
    /// All-or-nothing: the range is checked against every existing record
    /// before anything is recorded.
    ///
    /// # Errors
    /// - `InvalidArgument` if `iova`, `pa` or `length` is misaligned, the
    ///   range is empty or overflows, or `permissions` is empty
    /// - `Conflict` if any page of the range is already mapped
    pub fn map(&self, iova: u64, pa: u64, length: u64, permissions: Permissions) -> Result<()> {
        let epoch = self.apply_map(IommuMapping::new(iova, pa, length, permissions))?;
        self.notify_sync(epoch);
        Ok(())
    }

    /// Remove the mapping that exactly covers `[iova, iova + length)`
    ///
    /// # Errors
    /// - `InvalidArgument` for a misaligned or empty range
    /// - `NotFound` if no record matches exactly (including partial unmaps of
    ///   a larger mapping)
    pub fn unmap(&self, iova: u64, length: u64) -> Result<()> {
        let epoch = self.apply_unmap(iova, length)?;
        self.notify_sync(epoch);
        Ok(())
    }

    /// Map every entry of `entries` as one change
    ///
    /// The whole batch is validated first (alignment, overlap with existing
    /// mappings, overlap between entries) and applied under one lock
    /// acquisition. On failure nothing is mapped and the error names the
    /// first offending entry. A successful non-empty batch bumps the epoch
    /// once.
    pub fn bulk_map(&self, entries: &[IommuMapping]) -> Result<()> {
        if let Some(epoch) = self.apply_bulk_map(entries)? {
            self.notify_sync(epoch);
        }
        Ok(())
    }

    /// Clear every mapping, returning how many were removed
    ///
    /// Always succeeds and always bumps the epoch, even on an empty domain.
    pub fn revoke(&self) -> usize {
        let (cleared, epoch) = self.apply_revoke();
        self.notify_sync(epoch);
        cleared
    }

    /// Translate a device address
    pub fn translate(&self, iova: u64) -> Option<Translation> {
        let state = self.state.lock();
        let mapping = state.arena.find_containing(iova)?;

        Some(Translation {
            iova,
            pa: mapping.pa + (iova - mapping.iova),
            page: align_down(iova),
            permissions: mapping.permissions,
            epoch: state.epoch,
        })
    }

    /// Copy of every mapping, in IOVA order
    pub fn mappings(&self) -> Vec<IommuMapping> {
        self.state.lock().arena.iter().copied().collect()
    }

    /// Mappings intersecting `[iova, iova + length)`
    pub fn mappings_in(&self, iova: u64, length: u64) -> Vec<IommuMapping> {
        self.state
            .lock()
            .arena
            .iter()
            .filter(|m| m.overlaps(iova, length))
            .copied()
            .collect()
    }

    /// Number of mapping records
    pub fn mapping_count(&self) -> usize {
        self.state.lock().arena.len()
    }

    /// Total bytes mapped
    pub fn mapped_bytes(&self) -> u64 {
        self.state.lock().arena.iter().map(|m| m.length).sum()
    }

    /// Invoke the sync hook for an epoch produced by an `apply_*` call
    pub(crate) fn notify_sync(&self, epoch: u64) {
        self.sync.sync(self.asid, epoch);
    }

    pub(crate) fn apply_map(&self, mapping: IommuMapping) -> Result<u64> {
        mapping.validate()?;

        let mut state = self.state.lock();
        if let Some(existing) = state.arena.find_overlap(mapping.iova, mapping.length) {
            log::debug!(
                "asid {}: map {:#x}+{:#x} conflicts with {:#x}+{:#x}",
                self.asid,
                mapping.iova,
                mapping.length,
                existing.iova,
                existing.length
            );
            return Err(IommuError::Conflict {
                iova: mapping.iova,
                length: mapping.length,
            });
        }

        state.arena.insert(mapping);
        let epoch = state.bump();
        drop(state);

        log::debug!(
            "asid {}: mapped iova {:#x} -> pa {:#x} ({} pages, {:?}) epoch {}",
            self.asid,
            mapping.iova,
            mapping.pa,
            mapping.pages(),
            mapping.permissions,
            epoch
        );
        Ok(epoch)
    }

    pub(crate) fn apply_unmap(&self, iova: u64, length: u64) -> Result<u64> {
        validate_range(iova, length)?;

        let mut state = self.state.lock();
        state
            .arena
            .remove_exact(iova, length)
            .ok_or(IommuError::NotFound { iova, length })?;
        let epoch = state.bump();
        drop(state);

        log::debug!(
            "asid {}: unmapped iova {:#x}+{:#x} epoch {}",
            self.asid,
            iova,
            length,
            epoch
        );
        Ok(epoch)
    }

    /// Returns `None` for an empty batch (nothing changed)
    pub(crate) fn apply_bulk_map(&self, entries: &[IommuMapping]) -> Result<Option<u64>> {
        if entries.is_empty() {
            return Ok(None);
        }

        let reject = |index: usize, error: IommuError| IommuError::Batch {
            index,
            cause: alloc::boxed::Box::new(error),
        };

        for (index, entry) in entries.iter().enumerate() {
            entry.validate().map_err(|e| reject(index, e))?;
        }

        let mut state = self.state.lock();
        for (index, entry) in entries.iter().enumerate() {
            let conflict = IommuError::Conflict {
                iova: entry.iova,
                length: entry.length,
            };
            if state.arena.find_overlap(entry.iova, entry.length).is_some() {
                return Err(reject(index, conflict));
            }
            if entries[..index]
                .iter()
                .any(|earlier| earlier.overlaps(entry.iova, entry.length))
            {
                return Err(reject(index, conflict));
            }
        }

        for entry in entries {
            state.arena.insert(*entry);
        }
        let epoch = state.bump();
        drop(state);

        log::debug!(
            "asid {}: bulk mapped {} entries epoch {}",
            self.asid,
            entries.len(),
            epoch
        );
        Ok(Some(epoch))
    }

    pub(crate) fn apply_revoke(&self) -> (usize, u64) {
        let mut state = self.state.lock();
        let cleared = state.arena.clear();
        let epoch = state.bump();
        drop(state);

        log::debug!(
            "asid {}: revoked {} mappings epoch {}",
            self.asid,
            cleared,
            epoch
        );
        (cleared, epoch)
    }
}

impl fmt::Debug for IommuDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IommuDomain")
            .field("asid", &self.asid)
            .field("epoch", &state.epoch)
            .field("mappings", &state.arena.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex as StdMutex, OnceLock, Weak};
    use std::vec::Vec;

    const RW: Permissions = Permissions::READ_WRITE;

    #[test]
    fn test_map_unmap_round_trip_epoch() {
        let domain = IommuDomain::new(1);
        assert_eq!(domain.epoch(), 0);

        domain.map(0x10000, 0x80000, 0x4000, RW).unwrap();
        assert_eq!(domain.mapping_count(), 1);
        assert_eq!(domain.mapped_bytes(), 0x4000);

        domain.unmap(0x10000, 0x4000).unwrap();
        assert!(domain.mappings_in(0x10000, 0x4000).is_empty());
        assert_eq!(domain.epoch(), 2);
    }

    #[test]
    fn test_overlapping_map_conflicts() {
        let domain = IommuDomain::new(1);
        domain.map(0x10000, 0x80000, 0x4000, RW).unwrap();
        let before = domain.mappings();
        let epoch = domain.epoch();

        let cases = [
            (0x10000, 0x1000),
            (0xf000, 0x2000),
            (0x13000, 0x4000),
            (0x0, 0x100000),
        ];
        for (iova, len) in cases {
            assert_eq!(
                domain.map(iova, 0x200000, len, RW),
                Err(IommuError::Conflict { iova, length: len })
            );
        }

        assert_eq!(domain.mappings(), before);
        assert_eq!(domain.epoch(), epoch);
    }

    #[test]
    fn test_adjacent_maps_allowed() {
        let domain = IommuDomain::new(1);
        domain.map(0x10000, 0x80000, 0x1000, RW).unwrap();
        domain.map(0x11000, 0x90000, 0x1000, Permissions::READ).unwrap();
        domain.map(0xf000, 0xa0000, 0x1000, Permissions::WRITE).unwrap();

        let iovas: Vec<u64> = domain.mappings().iter().map(|m| m.iova).collect();
        assert_eq!(iovas, vec![0xf000, 0x10000, 0x11000]);
    }

    #[test]
    fn test_misaligned_map_rejected_without_effect() {
        let domain = IommuDomain::new(1);
        assert!(matches!(
            domain.map(0x10010, 0x80000, 0x1000, RW),
            Err(IommuError::InvalidArgument { .. })
        ));
        assert!(matches!(
            domain.map(0x10000, 0x80000, 0x1001, RW),
            Err(IommuError::InvalidArgument { .. })
        ));
        assert_eq!(domain.epoch(), 0);
        assert_eq!(domain.mapping_count(), 0);
    }

    #[test]
    fn test_partial_unmap_fails() {
        let domain = IommuDomain::new(1);
        domain.map(0x10000, 0x80000, 0x4000, RW).unwrap();

        assert_eq!(
            domain.unmap(0x10000, 0x1000),
            Err(IommuError::NotFound {
                iova: 0x10000,
                length: 0x1000
            })
        );
        assert_eq!(
            domain.unmap(0x11000, 0x1000),
            Err(IommuError::NotFound {
                iova: 0x11000,
                length: 0x1000
            })
        );
        assert!(matches!(
            domain.unmap(0x10800, 0x1000),
            Err(IommuError::InvalidArgument { .. })
        ));
        assert_eq!(domain.mapping_count(), 1);
        assert_eq!(domain.epoch(), 1);
    }

    #[test]
    fn test_unmap_nonexistent() {
        let domain = IommuDomain::new(1);
        assert!(matches!(
            domain.unmap(0x10000, 0x1000),
            Err(IommuError::NotFound { .. })
        ));
        assert_eq!(domain.epoch(), 0);
    }

    #[test]
    fn test_revoke_empty_and_populated() {
        let domain = IommuDomain::new(1);
        assert_eq!(domain.revoke(), 0);
        assert_eq!(domain.epoch(), 1);

        domain.map(0x10000, 0x80000, 0x1000, RW).unwrap();
        domain.map(0x20000, 0x90000, 0x2000, RW).unwrap();
        assert_eq!(domain.revoke(), 2);
        assert_eq!(domain.mapping_count(), 0);
        assert_eq!(domain.epoch(), 4);

        // Slots are usable again after revoke
        domain.map(0x10000, 0x80000, 0x1000, RW).unwrap();
    }

    #[test]
    fn test_bulk_map_applies_atomically() {
        let domain = IommuDomain::new(1);
        let batch = [
            IommuMapping::new(0x1000, 0x100000, 0x1000, RW),
            IommuMapping::new(0x4000, 0x200000, 0x2000, Permissions::READ),
            IommuMapping::new(0x2000, 0x300000, 0x1000, RW),
        ];

        domain.bulk_map(&batch).unwrap();
        assert_eq!(domain.mapping_count(), 3);
        assert_eq!(domain.epoch(), 1);
    }

    #[test]
    fn test_bulk_map_rejects_whole_batch() {
        let domain = IommuDomain::new(1);
        domain.map(0x8000, 0x100000, 0x1000, RW).unwrap();

        // Entry 2 collides with the existing mapping
        let batch = [
            IommuMapping::new(0x1000, 0x100000, 0x1000, RW),
            IommuMapping::new(0x2000, 0x200000, 0x1000, RW),
            IommuMapping::new(0x8000, 0x300000, 0x1000, RW),
        ];
        match domain.bulk_map(&batch) {
            Err(IommuError::Batch { index, cause }) => {
                assert_eq!(index, 2);
                assert!(matches!(*cause, IommuError::Conflict { .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(domain.mapping_count(), 1);
        assert_eq!(domain.epoch(), 1);

        // Entries colliding with each other
        let batch = [
            IommuMapping::new(0x1000, 0x100000, 0x2000, RW),
            IommuMapping::new(0x2000, 0x200000, 0x1000, RW),
        ];
        assert!(matches!(
            domain.bulk_map(&batch),
            Err(IommuError::Batch { index: 1, .. })
        ));

        // Misaligned entry
        let batch = [
            IommuMapping::new(0x1000, 0x100000, 0x1000, RW),
            IommuMapping::new(0x3000, 0x200001, 0x1000, RW),
        ];
        match domain.bulk_map(&batch) {
            Err(IommuError::Batch { index, cause }) => {
                assert_eq!(index, 1);
                assert!(matches!(*cause, IommuError::InvalidArgument { .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(domain.mapping_count(), 1);
    }

    #[test]
    fn test_bulk_map_empty_is_noop() {
        let domain = IommuDomain::new(1);
        domain.bulk_map(&[]).unwrap();
        assert_eq!(domain.epoch(), 0);
    }

    #[test]
    fn test_translate_and_staleness() {
        let domain = IommuDomain::new(1);
        domain.map(0x10000, 0x80000, 0x2000, Permissions::READ).unwrap();

        let t = domain.translate(0x11234).unwrap();
        assert_eq!(t.pa, 0x81234);
        assert_eq!(t.page, 0x11000);
        assert_eq!(t.permissions, Permissions::READ);
        assert!(!t.is_stale(&domain));

        assert!(domain.translate(0x12000).is_none());

        domain.map(0x20000, 0x90000, 0x1000, RW).unwrap();
        assert!(t.is_stale(&domain));
    }

    #[test]
    fn test_top_page_maps_and_translates() {
        let top = u64::MAX & !0xfff;
        let domain = IommuDomain::new(1);
        domain.map(top, top, 0x1000, RW).unwrap();

        let t = domain.translate(u64::MAX).unwrap();
        assert_eq!(t.pa, u64::MAX);
        assert_eq!(t.page, top);
        assert_eq!(domain.mappings_in(top, 0x1000).len(), 1);

        assert!(matches!(
            domain.map(top - 0x1000, 0x80000, 0x2000, RW),
            Err(IommuError::Conflict { .. })
        ));
        domain.map(top - 0x1000, 0x80000, 0x1000, RW).unwrap();
        domain.unmap(top, 0x1000).unwrap();
        assert!(domain.translate(u64::MAX).is_none());
    }

    /// Records every sync call and checks the domain lock is free
    #[derive(Default)]
    struct LockCheckSync {
        domain: OnceLock<Weak<IommuDomain>>,
        calls: StdMutex<Vec<(AddressSpaceId, u64)>>,
    }

    impl IotlbSync for LockCheckSync {
        fn sync(&self, asid: AddressSpaceId, epoch: u64) {
            if let Some(domain) = self.domain.get().and_then(Weak::upgrade) {
                // Would spin forever if the domain lock were still held
                assert!(domain.epoch() >= epoch);
            }
            self.calls.lock().unwrap().push((asid, epoch));
        }
    }

    #[test]
    fn test_sync_hook_runs_unlocked_after_each_change() {
        let hook = Arc::new(LockCheckSync::default());
        let domain = Arc::new(IommuDomain::with_sync(7, hook.clone()));
        hook.domain.set(Arc::downgrade(&domain)).unwrap();

        domain.map(0x1000, 0x100000, 0x1000, RW).unwrap();
        domain.unmap(0x1000, 0x1000).unwrap();
        domain
            .bulk_map(&[IommuMapping::new(0x2000, 0x200000, 0x1000, RW)])
            .unwrap();
        domain.revoke();
        // Failed operations do not sync
        let _ = domain.unmap(0x9000, 0x1000);

        assert_eq!(
            *hook.calls.lock().unwrap(),
            vec![(7, 1), (7, 2), (7, 3), (7, 4)]
        );
    }
}
