//! Capability Table - slot allocation and reference counting
//!
//! The table maps a 16-bit [`CapId`] to a [`CapabilityEntry`]. Ids are slot
//! indices: a slot is either live or on the free list, and the free list is
//! consulted before the bump pointer so revoked ids come back first.
//!
//! ## Refcount convention
//!
//! `alloc` hands out an entry with refcount 1 (the creator's reference).
//! `inc`/`dec` move it by exactly one. `dec` at zero is a contract violation
//! reported as [`CapabilityError::InvalidState`]; the count never underflows.
//! An entry whose count reached zero stays in the table until `remove`
//! (or use [`CapabilityTable::release`], which does both).
//!
//! ## Nonces
//!
//! Every allocation is stamped with a table-wide nonce that is never handed
//! out twice, not even across [`CapabilityTable::teardown`]. An id says which
//! slot; the `(id, nonce)` pair names one particular capability. Registries
//! that bind resources to capabilities record the nonce and treat a
//! mismatch as a revoked capability.

use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;
use static_assertions::{assert_eq_size, const_assert};

use crate::{CapabilityError, Result, Rights};

/// Upper bound on table size imposed by the 16-bit id space
pub const MAX_CAPABILITIES: usize = 1 << 16;

/// Slots in a table built with [`TableConfig::default`]
pub const DEFAULT_TABLE_CAPACITY: usize = 256;

const_assert!(DEFAULT_TABLE_CAPACITY <= MAX_CAPABILITIES);

/// Owner of a capability (process or driver identifier)
pub type OwnerId = u32;

/// Capability identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapId(u16);

assert_eq_size!(CapId, u16);

impl CapId {
    /// Wrap a raw id received across the ABI
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw id for handing back across the ABI
    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// Snapshot of a live capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapabilityEntry {
    pub id: CapId,
    pub rights: Rights,
    pub owner: OwnerId,
    pub refcount: u32,
    /// Allocation stamp, unique for the lifetime of the table
    pub nonce: u64,
}

/// Table sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// Number of slots (1..=MAX_CAPABILITIES)
    pub capacity: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_TABLE_CAPACITY,
        }
    }
}

/// Slot storage guarded by the table lock
struct Slots {
    /// Entry per slot ever handed out; `None` means the slot is free
    entries: Vec<Option<CapabilityEntry>>,
    /// Freed slots, reused before bumping `next_slot`
    free_slots: Vec<u16>,
    /// Next never-used slot
    next_slot: usize,
    /// Maximum slots available
    capacity: usize,
    /// Number of live entries
    live: usize,
    /// Stamp for the next allocation
    next_nonce: u64,
}

impl Slots {
    fn new(capacity: usize, next_nonce: u64) -> Self {
        Self {
            entries: Vec::new(),
            free_slots: Vec::new(),
            next_slot: 0,
            capacity,
            live: 0,
            next_nonce,
        }
    }

    fn allocate(&mut self) -> Result<CapId> {
        // Try to reuse a freed slot first
        if let Some(slot) = self.free_slots.pop() {
            return Ok(CapId(slot));
        }

        if self.next_slot >= self.capacity {
            return Err(CapabilityError::ResourceExhausted {
                capacity: self.capacity,
            });
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.push(None);
        // capacity <= MAX_CAPABILITIES, so every slot index fits in u16
        Ok(CapId(slot as u16))
    }

    fn get(&self, id: CapId) -> Result<&CapabilityEntry> {
        self.entries
            .get(id.slot())
            .and_then(Option::as_ref)
            .ok_or(CapabilityError::NotFound { id })
    }

    fn get_mut(&mut self, id: CapId) -> Result<&mut CapabilityEntry> {
        self.entries
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .ok_or(CapabilityError::NotFound { id })
    }

    fn take(&mut self, id: CapId) -> Result<CapabilityEntry> {
        let entry = self
            .entries
            .get_mut(id.slot())
            .and_then(Option::take)
            .ok_or(CapabilityError::NotFound { id })?;
        self.free_slots.push(id.0);
        self.live -= 1;
        Ok(entry)
    }

    fn authorize(&self, id: CapId, owner: OwnerId, needed: Rights) -> Result<CapabilityEntry> {
        let entry = *self.get(id)?;

        if entry.refcount == 0 {
            return Err(CapabilityError::InvalidState { id, refcount: 0 });
        }
        if entry.owner != owner {
            return Err(CapabilityError::NotOwner { id, owner });
        }

        let missing = entry.rights.missing(needed);
        if !missing.is_empty() {
            return Err(CapabilityError::InsufficientRights { id, missing });
        }

        Ok(entry)
    }
}

/// Global capability table
///
/// One instance per runtime context. All methods take `&self`; the table is
/// internally locked and can be shared across cores behind an `Arc`.
pub struct CapabilityTable {
    slots: Mutex<Slots>,
}

impl CapabilityTable {
    /// Create a table with [`DEFAULT_TABLE_CAPACITY`] slots
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::new(DEFAULT_TABLE_CAPACITY, 1)),
        }
    }

    /// Create a table from a configuration
    ///
    /// # Errors
    /// Returns `InvalidCapacity` if the capacity is zero or exceeds the
    /// 16-bit id space
    pub fn from_config(config: TableConfig) -> Result<Self> {
        let capacity = config.capacity;
        if capacity == 0 || capacity > MAX_CAPABILITIES {
            return Err(CapabilityError::InvalidCapacity { capacity });
        }

        log::debug!("capability table: {} slots", capacity);
        Ok(Self {
            slots: Mutex::new(Slots::new(capacity, 1)),
        })
    }

    /// Create a table with `capacity` slots
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::from_config(TableConfig { capacity })
    }

    /// Allocate a capability with refcount 1
    ///
    /// # Errors
    /// Returns `ResourceExhausted` when every slot is live
    pub fn alloc(&self, rights: Rights, owner: OwnerId) -> Result<CapId> {
        self.alloc_entry(rights, owner).map(|entry| entry.id)
    }

    /// Allocate a capability with refcount 1 and return the whole entry
    ///
    /// Registries use the returned nonce to recognise the capability later.
    pub fn alloc_entry(&self, rights: Rights, owner: OwnerId) -> Result<CapabilityEntry> {
        let mut slots = self.slots.lock();
        let id = slots.allocate()?;

        let entry = CapabilityEntry {
            id,
            rights,
            owner,
            refcount: 1,
            nonce: slots.next_nonce,
        };
        slots.next_nonce += 1;
        slots.entries[id.slot()] = Some(entry);
        slots.live += 1;

        log::trace!(
            "alloc {} owner={} rights={:?} nonce={}",
            id,
            owner,
            rights,
            entry.nonce
        );
        Ok(entry)
    }

    /// Look up a capability
    pub fn lookup(&self, id: CapId) -> Result<CapabilityEntry> {
        self.slots.lock().get(id).copied()
    }

    /// Take an additional reference, returning the new count
    ///
    /// # Errors
    /// `NotFound` for a free slot; `InvalidState` if the count would
    /// overflow
    pub fn inc(&self, id: CapId) -> Result<u32> {
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(id)?;

        entry.refcount = entry
            .refcount
            .checked_add(1)
            .ok_or(CapabilityError::InvalidState {
                id,
                refcount: entry.refcount,
            })?;
        Ok(entry.refcount)
    }

    /// Drop a reference, returning the new count
    ///
    /// The entry stays in the table at count zero.
    ///
    /// # Errors
    /// `NotFound` for a free slot; `InvalidState` if the count is already
    /// zero
    pub fn dec(&self, id: CapId) -> Result<u32> {
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(id)?;

        if entry.refcount == 0 {
            return Err(CapabilityError::InvalidState { id, refcount: 0 });
        }
        entry.refcount -= 1;
        Ok(entry.refcount)
    }

    /// Drop a reference and free the slot once the count reaches zero
    pub fn release(&self, id: CapId) -> Result<u32> {
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(id)?;

        if entry.refcount == 0 {
            return Err(CapabilityError::InvalidState { id, refcount: 0 });
        }
        entry.refcount -= 1;

        let remaining = entry.refcount;
        if remaining == 0 {
            slots.take(id)?;
            log::trace!("release {}: last reference, slot freed", id);
        }
        Ok(remaining)
    }

    /// Force-remove a capability regardless of its refcount (revocation)
    pub fn remove(&self, id: CapId) -> Result<CapabilityEntry> {
        let entry = self.slots.lock().take(id)?;
        log::debug!(
            "remove {} owner={} refcount={}",
            id,
            entry.owner,
            entry.refcount
        );
        Ok(entry)
    }

    /// Remove `id` only while it still carries `nonce`
    ///
    /// # Errors
    /// `NotFound` if the slot is free or was reallocated since
    pub fn remove_exact(&self, id: CapId, nonce: u64) -> Result<CapabilityEntry> {
        let mut slots = self.slots.lock();
        if slots.get(id)?.nonce != nonce {
            return Err(CapabilityError::NotFound { id });
        }
        let entry = slots.take(id)?;
        log::debug!("remove {} owner={} nonce={}", id, entry.owner, nonce);
        Ok(entry)
    }

    /// Remove every capability held by `owner`, returning how many went
    pub fn revoke_owner(&self, owner: OwnerId) -> usize {
        let revoked = self.revoke_where(|entry| entry.owner == owner).len();
        if revoked > 0 {
            log::debug!("revoked {} capabilities of owner {}", revoked, owner);
        }
        revoked
    }

    /// Remove every entry matching `pred` in one critical section
    ///
    /// `pred` runs under the table lock; it may take locks that come after
    /// the table in lock order but must not touch this table.
    pub fn revoke_where(
        &self,
        mut pred: impl FnMut(&CapabilityEntry) -> bool,
    ) -> Vec<CapabilityEntry> {
        let mut slots = self.slots.lock();
        let doomed: Vec<CapId> = slots
            .entries
            .iter()
            .flatten()
            .filter(|entry| pred(entry))
            .map(|entry| entry.id)
            .collect();

        // ids were collected under the same lock, so they are live
        doomed
            .into_iter()
            .filter_map(|id| slots.take(id).ok())
            .collect()
    }

    /// Check that `owner` holds `id` with at least `needed` rights
    ///
    /// # Errors
    /// `NotFound`, `InvalidState` (refcount zero), `NotOwner` or
    /// `InsufficientRights`
    pub fn authorize(&self, id: CapId, owner: OwnerId, needed: Rights) -> Result<CapabilityEntry> {
        self.slots.lock().authorize(id, owner, needed)
    }

    /// Authorize and run `f` while the table lock is still held
    ///
    /// This is the lock-order anchor for operations that pair a capability
    /// check with a second locked resource: the table lock is taken first and
    /// the resource lock inside `f`. The capability cannot be revoked between
    /// the check and the operation. `f` must not block or touch this table.
    pub fn with_authorized<R>(
        &self,
        id: CapId,
        owner: OwnerId,
        needed: Rights,
        f: impl FnOnce(&CapabilityEntry) -> R,
    ) -> Result<R> {
        let slots = self.slots.lock();
        let entry = slots.authorize(id, owner, needed)?;
        Ok(f(&entry))
    }

    /// Remove every entry, returning how many were live
    ///
    /// Ends the table's lifecycle; the table remains usable afterwards and
    /// starts handing out ids from zero again. Nonces keep counting up.
    pub fn teardown(&self) -> usize {
        let mut slots = self.slots.lock();
        let live = slots.live;
        let capacity = slots.capacity;
        let next_nonce = slots.next_nonce;
        *slots = Slots::new(capacity, next_nonce);

        log::debug!("capability table torn down ({} live entries dropped)", live);
        live
    }

    /// Copy of every live entry, in id order
    pub fn snapshot(&self) -> Vec<CapabilityEntry> {
        self.slots.lock().entries.iter().flatten().copied().collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }

    /// Check if no entries are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slot count
    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("CapabilityTable")
            .field("live", &slots.live)
            .field("capacity", &slots.capacity)
            .field("free_slots", &slots.free_slots.len())
            .finish()
    }
}
