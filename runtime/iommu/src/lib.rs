//! IOMMU Domains - Capability-scoped device-memory mapping for Keystone
//!
//! # Purpose
//! Records which device-visible address ranges (IOVAs) translate to which
//! physical ranges, per address-translation domain. Every device-memory
//! grant in the system is one of these records.
//!
//! # Integration Points
//! - Depends on: Capability Broker (authorization only, via [`DomainGate`])
//! - Provides to: driver runtime, DMA buffer management
//! - IPC endpoints: none
//! - Capabilities required: `MAP`, `UNMAP`, `REVOKE` on a domain capability
//!
//! # Architecture
//! An [`IommuDomain`] owns a spinlock around an arena of mapping records and
//! an epoch counter. Every structural change (map, unmap, bulk map, revoke)
//! bumps the epoch, which is the only signal cached translations use to
//! detect staleness. After the lock is dropped the domain calls its
//! [`IotlbSync`] hook so hardware caches can be invalidated.
//!
//! Mappings are page aligned, never overlap, and are only removed by an
//! exact-match unmap or a full revoke. Partial unmaps fail.
//!
//! # Testing Strategy
//! - Unit tests: alignment checks, overlap detection, arena linking, epochs
//! - Integration tests: gated map/unmap through the capability table
//! - Property tests: arbitrary map/unmap scripts never produce overlaps

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod arena;
mod domain;
mod gate;
mod page;

pub use domain::{AddressSpaceId, IommuDomain, IotlbSync, NoopSync, Translation};
pub use gate::DomainGate;
pub use page::{align_down, is_aligned, pages_needed, PAGE_SHIFT, PAGE_SIZE};

use alloc::boxed::Box;
use bitflags::bitflags;
use cap_broker::CapabilityError;
use thiserror::Error;

/// Error types for IOMMU operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IommuError {
    /// Misaligned address or length, empty range, overflow, no permissions
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    #[error("Range {iova:#x}+{length:#x} overlaps an existing mapping")]
    Conflict { iova: u64, length: u64 },

    #[error("No mapping exactly matches {iova:#x}+{length:#x}")]
    NotFound { iova: u64, length: u64 },

    #[error("Bulk map entry {index} rejected: {cause}")]
    Batch { index: usize, cause: Box<IommuError> },

    #[error("Unknown domain capability")]
    UnknownDomain,

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] CapabilityError),
}

pub type Result<T> = core::result::Result<T, IommuError>;

bitflags! {
    /// Device access permissions for a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Permissions: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// One IOVA → physical translation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IommuMapping {
    /// Device-visible address (page aligned)
    pub iova: u64,

    /// Physical address (page aligned)
    pub pa: u64,

    /// Size in bytes (page multiple, non-zero)
    pub length: u64,

    pub permissions: Permissions,
}

impl IommuMapping {
    pub fn new(iova: u64, pa: u64, length: u64, permissions: Permissions) -> Self {
        Self {
            iova,
            pa,
            length,
            permissions,
        }
    }

    /// Number of pages covered
    pub fn pages(&self) -> u64 {
        pages_needed(self.length)
    }

    /// Check if `iova` falls inside this mapping
    pub fn contains(&self, iova: u64) -> bool {
        iova >= self.iova && iova - self.iova < self.length
    }

    /// Check the record against the translation granule
    ///
    /// # Errors
    /// Returns `InvalidArgument` for misaligned fields, an empty or
    /// overflowing range, or empty permissions
    pub fn validate(&self) -> Result<()> {
        if !is_aligned(self.iova) {
            return Err(IommuError::InvalidArgument {
                reason: "iova not page aligned",
            });
        }
        if !is_aligned(self.pa) {
            return Err(IommuError::InvalidArgument {
                reason: "physical address not page aligned",
            });
        }
        validate_range(self.iova, self.length)?;
        if page::range_last(self.pa, self.length).is_none() {
            return Err(IommuError::InvalidArgument {
                reason: "physical range overflows",
            });
        }
        if self.permissions.is_empty() {
            return Err(IommuError::InvalidArgument {
                reason: "mapping without permissions",
            });
        }
        Ok(())
    }

    fn overlaps(&self, iova: u64, length: u64) -> bool {
        page::ranges_overlap(self.iova, self.length, iova, length)
    }
}

/// Validate an IOVA range used by map or unmap
fn validate_range(iova: u64, length: u64) -> Result<()> {
    if length == 0 {
        return Err(IommuError::InvalidArgument {
            reason: "zero-length range",
        });
    }
    if !is_aligned(iova) || !is_aligned(length) {
        return Err(IommuError::InvalidArgument {
            reason: "range not page aligned",
        });
    }
    if page::range_last(iova, length).is_none() {
        return Err(IommuError::InvalidArgument {
            reason: "iova range overflows",
        });
    }
    Ok(())
}
