//! Doors - call targets that are either in-process or behind a capability
//!
//! A [`Door::Local`] runs a handler in the caller's context and returns its
//! reply. A [`Door::Remote`] forwards the message through an
//! [`EndpointBroker`] using the capability it carries; the far side picks
//! it up with a normal receive, so there is no reply.

use alloc::sync::Arc;
use core::fmt;

use cap_broker::{CapId, OwnerId};

use crate::{EndpointBroker, Message, Result};

/// In-process door handler
pub type Handler = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// Dispatch target
#[derive(Clone)]
pub enum Door {
    Local(Handler),
    Remote(CapId),
}

/// What a door call produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorOutcome {
    /// Reply from a local handler
    Reply(Message),
    /// Message handed to the remote endpoint (or dropped if it was full)
    Forwarded,
}

impl Door {
    /// Door backed by an in-process handler
    pub fn local<F>(handler: F) -> Self
    where
        F: Fn(&Message) -> Message + Send + Sync + 'static,
    {
        Door::Local(Arc::new(handler))
    }

    /// Door backed by an endpoint capability
    pub fn remote(cap: CapId) -> Self {
        Door::Remote(cap)
    }

    /// Deliver `message` on behalf of `caller`
    ///
    /// # Errors
    /// Remote doors report the broker's authorization errors (`SEND` is
    /// required); local doors never fail.
    pub fn call(
        &self,
        broker: &EndpointBroker,
        caller: OwnerId,
        message: Message,
    ) -> Result<DoorOutcome> {
        match self {
            Door::Local(handler) => Ok(DoorOutcome::Reply(handler(&message))),
            Door::Remote(cap) => {
                broker.send(*cap, caller, message)?;
                Ok(DoorOutcome::Forwarded)
            }
        }
    }
}

impl fmt::Debug for Door {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Door::Local(_) => f.write_str("Door::Local(..)"),
            Door::Remote(cap) => write!(f, "Door::Remote({})", cap),
        }
    }
}
