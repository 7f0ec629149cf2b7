//! Capability rights
//!
//! Rights are a 32-bit mask carried by every capability entry. The table
//! stores them verbatim; the gates in the IPC and IOMMU crates decide which
//! bits an operation needs.

use bitflags::bitflags;

bitflags! {
    /// Rights granted by a capability
    ///
    /// [`Rights::restrict`] narrows a mask; nothing widens one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Rights: u32 {
        /// Enqueue messages on an endpoint
        const SEND = 1 << 0;
        /// Dequeue messages from an endpoint
        const RECV = 1 << 1;
        /// Install translations in an IOMMU domain
        const MAP = 1 << 2;
        /// Remove translations from an IOMMU domain
        const UNMAP = 1 << 3;
        /// Destroy the underlying resource
        const REVOKE = 1 << 4;

        /// Everything an endpoint owner normally holds
        const ENDPOINT = Self::SEND.bits() | Self::RECV.bits() | Self::REVOKE.bits();
        /// Everything an IOMMU domain owner normally holds
        const DOMAIN = Self::MAP.bits() | Self::UNMAP.bits() | Self::REVOKE.bits();
    }
}

impl Rights {
    /// Rights from `needed` that this mask does not grant
    #[inline]
    pub fn missing(self, needed: Rights) -> Rights {
        needed.difference(self)
    }

    /// Narrow to the intersection with `mask`
    #[inline]
    pub fn restrict(self, mask: Rights) -> Rights {
        self & mask
    }
}
