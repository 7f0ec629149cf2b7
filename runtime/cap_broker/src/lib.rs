//! Capability Broker - Reference-counted capability table for Keystone
//!
//! # Purpose
//! Owns the mapping from capability id to `{rights, owner, refcount}` and
//! answers the one question every other trust-boundary component asks:
//! "may this owner do this with that capability?"
//!
//! # Integration Points
//! - Depends on: nothing (leaf component)
//! - Provides to: IPC endpoint broker, IOMMU domain gate
//! - IPC endpoints: none
//! - Capabilities required: none, this crate is where they live
//!
//! # Architecture
//! A [`CapabilityTable`] is an explicit object owned by the runtime context
//! and shared by reference (usually `Arc`). Slots are handed out from a bump
//! pointer plus a free list, so a removed id is reused by the next `alloc`.
//! Every mutation serializes through a single spinlock; critical sections are
//! O(1) except owner revocation and teardown.
//!
//! Callers that combine an authorization check with an operation on another
//! locked resource use [`CapabilityTable::with_authorized`], which fixes the
//! lock order as table first, resource second.
//!
//! # Testing Strategy
//! - Unit tests: refcount arithmetic, slot reuse, authorization outcomes
//! - Integration tests: capacity scenarios, concurrent inc/dec
//! - Property tests: refcount never underflows, ids unique while live

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod rights;
mod table;

pub use rights::Rights;
pub use table::{
    CapId, CapabilityEntry, CapabilityTable, OwnerId, TableConfig, DEFAULT_TABLE_CAPACITY,
    MAX_CAPABILITIES,
};

use thiserror::Error;

/// Error types for capability operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("Capability table exhausted ({capacity} slots)")]
    ResourceExhausted { capacity: usize },

    #[error("Capability {id} not found")]
    NotFound { id: CapId },

    #[error("Capability {id} in invalid state (refcount {refcount})")]
    InvalidState { id: CapId, refcount: u32 },

    #[error("Capability {id} is not owned by {owner}")]
    NotOwner { id: CapId, owner: OwnerId },

    #[error("Capability {id} is missing rights {missing:?}")]
    InsufficientRights { id: CapId, missing: Rights },

    #[error("Invalid table capacity: {capacity}")]
    InvalidCapacity { capacity: usize },
}

pub type Result<T> = core::result::Result<T, CapabilityError>;
