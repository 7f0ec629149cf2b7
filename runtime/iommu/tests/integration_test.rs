//! Integration tests for capability-gated IOMMU domains
//!
//! TEST_SCOPE:
//!   - Domains created and driven through the shared capability table
//!   - Rights checks on every mutating operation
//!   - Sync hook invoked once per structural change, with rising epochs
//!   - Revoking an owner's capability cuts off access immediately
//!   - Revoked ids handed to another owner never reach the old domain
//!   - Concurrent mapping of disjoint ranges from several threads

use std::sync::{Arc, Mutex};
use std::thread;

use cap_broker::{CapabilityError, CapabilityTable, Rights};
use iommu::{
    AddressSpaceId, DomainGate, IommuError, IommuMapping, IotlbSync, Permissions, PAGE_SIZE,
};

#[derive(Default)]
struct RecordingSync {
    calls: Mutex<Vec<(AddressSpaceId, u64)>>,
}

impl IotlbSync for RecordingSync {
    fn sync(&self, asid: AddressSpaceId, epoch: u64) {
        self.calls.lock().unwrap().push((asid, epoch));
    }
}

#[test]
fn test_gated_domain_lifecycle() {
    let table = Arc::new(CapabilityTable::with_capacity(16).unwrap());
    let sync = Arc::new(RecordingSync::default());
    let gate = DomainGate::with_sync(Arc::clone(&table), sync.clone());

    let cap = gate.create_domain(10, Rights::DOMAIN).unwrap();
    let asid = gate.domain(cap).unwrap().asid();
    assert_eq!(table.lookup(cap).unwrap().owner, 10);

    gate.map(cap, 10, 0x10000, 0x80000, 0x4000, Permissions::READ_WRITE)
        .unwrap();
    gate.bulk_map(
        cap,
        10,
        &[
            IommuMapping::new(0x20000, 0x90000, PAGE_SIZE, Permissions::READ),
            IommuMapping::new(0x30000, 0xa0000, PAGE_SIZE, Permissions::WRITE),
        ],
    )
    .unwrap();

    let domain = gate.domain(cap).unwrap();
    let t = domain.translate(0x10010).unwrap();
    assert_eq!(t.pa, 0x80010);
    assert_eq!(domain.mapped_bytes(), 0x6000);

    gate.unmap(cap, 10, 0x10000, 0x4000).unwrap();
    assert!(t.is_stale(&domain));
    assert_eq!(gate.revoke(cap, 10).unwrap(), 2);

    gate.destroy(cap, 10).unwrap();
    assert!(table.lookup(cap).is_err());

    let calls = sync.calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![(asid, 1), (asid, 2), (asid, 3), (asid, 4), (asid, 5)]
    );
}

#[test]
fn test_failed_operations_do_not_sync() {
    let table = Arc::new(CapabilityTable::with_capacity(4).unwrap());
    let sync = Arc::new(RecordingSync::default());
    let gate = DomainGate::with_sync(table, sync.clone());
    let cap = gate.create_domain(1, Rights::DOMAIN).unwrap();

    assert!(gate
        .map(cap, 1, 0x1001, 0x80000, PAGE_SIZE, Permissions::READ)
        .is_err());
    assert!(gate.unmap(cap, 1, 0x1000, PAGE_SIZE).is_err());
    assert!(gate
        .map(cap, 2, 0x1000, 0x80000, PAGE_SIZE, Permissions::READ)
        .is_err());
    gate.bulk_map(cap, 1, &[]).unwrap();

    assert!(sync.calls.lock().unwrap().is_empty());
    assert_eq!(gate.domain(cap).unwrap().epoch(), 0);
}

#[test]
fn test_owner_revocation_cuts_access() {
    let table = Arc::new(CapabilityTable::with_capacity(8).unwrap());
    let sync = Arc::new(RecordingSync::default());
    let gate = DomainGate::with_sync(Arc::clone(&table), sync.clone());
    let cap = gate.create_domain(5, Rights::DOMAIN).unwrap();
    gate.map(cap, 5, 0x1000, 0x80000, PAGE_SIZE, Permissions::READ)
        .unwrap();
    let domain = gate.domain(cap).unwrap();

    assert_eq!(table.revoke_owner(5), 1);

    assert_eq!(
        gate.map(cap, 5, 0x2000, 0x90000, PAGE_SIZE, Permissions::READ),
        Err(IommuError::Unauthorized(CapabilityError::NotFound { id: cap }))
    );
    assert!(gate.domain(cap).is_none());

    // The revoked domain is retired eagerly, with a final sync
    assert_eq!(gate.reap(), 1);
    assert_eq!(gate.domain_count(), 0);
    assert_eq!(domain.mapping_count(), 0);
    assert_eq!(domain.translate(0x1000), None);
    assert_eq!(
        *sync.calls.lock().unwrap(),
        vec![(domain.asid(), 1), (domain.asid(), 2)]
    );
}

#[test]
fn test_revoked_id_reused_by_another_owner() {
    let table = Arc::new(CapabilityTable::with_capacity(8).unwrap());
    let sync = Arc::new(RecordingSync::default());
    let gate = DomainGate::with_sync(Arc::clone(&table), sync.clone());

    let cap = gate.create_domain(1, Rights::DOMAIN).unwrap();
    gate.map(cap, 1, 0x1000, 0x80000, PAGE_SIZE, Permissions::READ_WRITE)
        .unwrap();
    let old = gate.domain(cap).unwrap();

    table.remove(cap).unwrap();
    let recycled = table.alloc(Rights::DOMAIN, 2).unwrap();
    assert_eq!(recycled, cap);

    // Owner 2 holds a valid capability on the slot but no domain behind it
    assert_eq!(
        gate.map(recycled, 2, 0x2000, 0x90000, PAGE_SIZE, Permissions::READ),
        Err(IommuError::UnknownDomain)
    );
    assert_eq!(gate.revoke(recycled, 2), Err(IommuError::UnknownDomain));
    assert_eq!(gate.destroy(recycled, 2), Err(IommuError::UnknownDomain));
    assert!(gate.domain(recycled).is_none());
    assert_eq!(table.lookup(recycled).unwrap().owner, 2);

    // Owner 1's mappings were torn down and the IOTLB told about it
    assert_eq!(old.mapping_count(), 0);
    assert_eq!(old.translate(0x1000), None);
    assert_eq!(
        *sync.calls.lock().unwrap(),
        vec![(old.asid(), 1), (old.asid(), 2)]
    );
}

#[test]
fn test_recreated_domain_on_recycled_id_starts_empty() {
    let table = Arc::new(CapabilityTable::with_capacity(8).unwrap());
    let sync = Arc::new(RecordingSync::default());
    let gate = DomainGate::with_sync(Arc::clone(&table), sync.clone());

    let cap = gate.create_domain(1, Rights::DOMAIN).unwrap();
    gate.map(cap, 1, 0x1000, 0x80000, PAGE_SIZE, Permissions::READ)
        .unwrap();
    let old = gate.domain(cap).unwrap();
    table.remove(cap).unwrap();

    let fresh = gate.create_domain(2, Rights::DOMAIN).unwrap();
    assert_eq!(fresh, cap);
    let new = gate.domain(fresh).unwrap();

    assert_eq!(new.mapping_count(), 0);
    assert_eq!(new.translate(0x1000), None);
    assert_eq!(old.mapping_count(), 0);
    assert_eq!(gate.domain_count(), 1);
    assert_eq!(
        *sync.calls.lock().unwrap(),
        vec![(old.asid(), 1), (old.asid(), 2)]
    );
    assert!(matches!(
        gate.map(fresh, 1, 0x1000, 0x80000, PAGE_SIZE, Permissions::READ),
        Err(IommuError::Unauthorized(CapabilityError::NotOwner { .. }))
    ));
}

#[test]
fn test_restricted_rights() {
    let table = Arc::new(CapabilityTable::with_capacity(8).unwrap());
    let gate = DomainGate::new(table);
    let read_only = gate
        .create_domain(1, Rights::DOMAIN.restrict(Rights::MAP))
        .unwrap();

    gate.map(read_only, 1, 0x1000, 0x80000, PAGE_SIZE, Permissions::READ)
        .unwrap();
    match gate.unmap(read_only, 1, 0x1000, PAGE_SIZE) {
        Err(IommuError::Unauthorized(CapabilityError::InsufficientRights { missing, .. })) => {
            assert_eq!(missing, Rights::UNMAP);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_concurrent_disjoint_maps() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 32;

    let table = Arc::new(CapabilityTable::with_capacity(8).unwrap());
    let gate = Arc::new(DomainGate::new(table));
    let cap = gate.create_domain(1, Rights::DOMAIN).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let iova = (t * PER_THREAD + i) * PAGE_SIZE;
                    gate.map(cap, 1, iova, iova + 0x1000_0000, PAGE_SIZE, Permissions::READ)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let domain = gate.domain(cap).unwrap();
    assert_eq!(domain.mapping_count() as u64, THREADS * PER_THREAD);
    assert_eq!(domain.epoch(), THREADS * PER_THREAD);

    let mappings = domain.mappings();
    assert!(mappings.windows(2).all(|w| w[0].iova + w[0].length <= w[1].iova));
}

#[test]
fn test_concurrent_overlapping_maps_single_winner() {
    let table = Arc::new(CapabilityTable::with_capacity(8).unwrap());
    let gate = Arc::new(DomainGate::new(table));
    let cap = gate.create_domain(1, Rights::DOMAIN).unwrap();

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.map(cap, 1, 0x4000, 0x100000 * (t + 1), 0x2000, Permissions::READ)
                    .is_ok()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(gate.domain(cap).unwrap().mapping_count(), 1);
}
