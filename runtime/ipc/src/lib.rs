//! Keystone IPC - Capability-gated endpoints and fast notifications
//!
//! # Purpose
//! Moves fixed four-word messages between tasks. Endpoints are bounded FIFO
//! queues with a blocking receive; the fast path is a per-core ring for
//! kernel-to-user notifications that never blocks and never allocates.
//!
//! # Integration Points
//! - Depends on: Capability Broker (authorization via `with_authorized`)
//! - Provides to: drivers, services, the kernel notification path
//! - IPC endpoints: [`Endpoint`], reached through [`EndpointBroker`] or a [`Door`]
//! - Capabilities required: `SEND`, `RECV`, `REVOKE` on an endpoint capability
//!
//! # Architecture
//! - [`Message`] is exactly four `u64` words; a [`Descriptor`] says how many
//!   leading words carry meaning. The rest must be zero on send and is
//!   zero-filled on receive.
//! - [`Endpoint`] keeps a ring of messages under a mutex, with a condition
//!   variable for receivers. Sends never block: a send to a full or
//!   unconfigured endpoint is dropped. Each accepted send wakes one receiver.
//! - [`FastIpcChannel`] is a spinlock-guarded ring with O(1) operations and
//!   a register-style receive ([`FastRegisters`]) that reports an empty ring
//!   with the [`FAST_NO_MESSAGE`] sentinel.
//! - [`EndpointBroker`] maps capability ids to endpoints. Lock order is
//!   capability table, then registry, then endpoint; no lock is held while a
//!   receiver sleeps.
//!
//! Without the `std` feature only the message types and the fast path are
//! built.
//!
//! # Testing Strategy
//! - Unit tests: descriptor padding, endpoint states, ring wraparound
//! - Integration tests: blocking receive across threads, broker rights
//! - Property tests: endpoint FIFO order against a queue model
//! - Benchmarks: fast path send/receive, endpoint round trip

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(test, not(feature = "std")))]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod fastpath;
mod message;

#[cfg(feature = "std")]
pub mod broker;
#[cfg(feature = "std")]
pub mod door;
#[cfg(feature = "std")]
pub mod endpoint;

pub use fastpath::{
    FastIpc, FastIpcChannel, FastRegisters, FASTIPC_QUEUE_DEPTH, FAST_NO_MESSAGE, FAST_OK,
};
pub use message::{Descriptor, Message, MESSAGE_WORDS};

#[cfg(feature = "std")]
pub use broker::EndpointBroker;
#[cfg(feature = "std")]
pub use door::{Door, DoorOutcome};
#[cfg(feature = "std")]
pub use endpoint::{Endpoint, EndpointState};

use cap_broker::CapabilityError;
use thiserror::Error;

/// Error types for IPC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Endpoint has no storage, or was reset while the caller waited
    #[error("Endpoint closed")]
    Closed,

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    /// Non-blocking receive on an empty queue
    #[error("No message available")]
    WouldBlock,

    #[error("Receive timed out")]
    TimedOut,

    #[error("Core {core} out of range ({cores} cores)")]
    InvalidCore { core: usize, cores: usize },

    #[error("Unknown endpoint capability")]
    UnknownEndpoint,

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] CapabilityError),
}

pub type Result<T> = core::result::Result<T, IpcError>;

/// Why a send was not enqueued
///
/// Only [`Endpoint::try_send`] reports these; `send` drops silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Endpoint has no storage")]
    Unconfigured,

    #[error("Endpoint full ({capacity} messages)")]
    Full { capacity: usize },

    /// Word `word` lies beyond the descriptor and is non-zero
    #[error("Word {word} beyond descriptor is non-zero")]
    NonZeroPadding { word: usize },
}
