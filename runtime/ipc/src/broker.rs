//! Endpoint Broker - capability-gated endpoint registry
//!
//! Every endpoint created here is bound to a capability in the shared
//! [`CapabilityTable`]. Callers name the endpoint by capability id and
//! their owner id; the broker checks rights before touching the queue:
//!
//! - `send` needs `SEND`
//! - `recv` needs `RECV`
//! - `destroy` needs `REVOKE`
//!
//! Sends are authorized and enqueued while the table lock is held, so a
//! revocation cannot land between the check and the enqueue. Receives are
//! authorized under the lock, which is then released before the caller goes
//! to sleep on the endpoint.
//!
//! Bindings carry the capability's nonce. An endpoint whose capability was
//! removed from the table directly is closed (queue dropped, receivers woken
//! with `Closed`) by the next call that finds its id reallocated, by
//! [`EndpointBroker::create_endpoint`] reusing the id, or by
//! [`EndpointBroker::reap`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;
use spin::Mutex;

use cap_broker::{CapId, CapabilityEntry, CapabilityTable, OwnerId, Rights};

use crate::{Descriptor, Endpoint, IpcError, Message, Result, SendError};

struct Binding {
    nonce: u64,
    endpoint: Arc<Endpoint>,
}

/// Registry of capability-bound endpoints
pub struct EndpointBroker {
    /// Shared capability table
    table: Arc<CapabilityTable>,

    /// Endpoints reachable through a capability
    endpoints: Mutex<BTreeMap<CapId, Binding>>,
}

impl EndpointBroker {
    pub fn new(table: Arc<CapabilityTable>) -> Self {
        Self {
            table,
            endpoints: Mutex::new(BTreeMap::new()),
        }
    }

    /// The capability table this broker authorizes against
    pub fn table(&self) -> &Arc<CapabilityTable> {
        &self.table
    }

    /// Create a configured endpoint and a capability for it
    ///
    /// An endpoint still registered under a recycled id is closed first.
    ///
    /// # Errors
    /// - `InvalidArgument` if `capacity` is zero
    /// - `Unauthorized(ResourceExhausted)` if the table is full
    /// - `UnknownEndpoint` if the new capability was revoked and its id
    ///   rebound before registration finished
    pub fn create_endpoint(
        &self,
        owner: OwnerId,
        rights: Rights,
        capacity: usize,
        descriptor: Descriptor,
    ) -> Result<CapId> {
        let endpoint = Arc::new(Endpoint::with_config(capacity, descriptor)?);
        let entry = self.table.alloc_entry(rights, owner)?;
        let cap = entry.id;

        let binding = Binding {
            nonce: entry.nonce,
            endpoint,
        };
        if let Some(displaced) = self.bind(cap, binding) {
            if displaced.nonce == entry.nonce {
                return Err(IpcError::UnknownEndpoint);
            }
            Self::retire(cap, displaced);
        }

        log::debug!(
            "endpoint {} created for owner {} (capacity {})",
            cap,
            owner,
            capacity
        );
        Ok(cap)
    }

    /// Endpoint behind a live capability, without any rights check
    pub fn endpoint(&self, cap: CapId) -> Option<Arc<Endpoint>> {
        let (nonce, endpoint) = self
            .endpoints
            .lock()
            .get(&cap)
            .map(|binding| (binding.nonce, Arc::clone(&binding.endpoint)))?;
        let live = self.table.lookup(cap).is_ok_and(|entry| entry.nonce == nonce);
        live.then_some(endpoint)
    }

    /// Register `binding`; the binding with the lower nonce is handed back
    fn bind(&self, cap: CapId, binding: Binding) -> Option<Binding> {
        let mut endpoints = self.endpoints.lock();
        let newer = endpoints
            .get(&cap)
            .is_some_and(|current| current.nonce > binding.nonce);
        if newer {
            return Some(binding);
        }
        endpoints.insert(cap, binding)
    }

    fn unbind(&self, cap: CapId, nonce: u64) -> Option<Binding> {
        let mut endpoints = self.endpoints.lock();
        let matches = endpoints
            .get(&cap)
            .is_some_and(|binding| binding.nonce == nonce);
        if matches {
            endpoints.remove(&cap)
        } else {
            None
        }
    }

    /// Endpoint bound to the authorized `entry`
    ///
    /// Called under the table lock. A binding from an earlier capability on
    /// the same slot is unregistered and returned through `stale`.
    fn bound(
        &self,
        entry: &CapabilityEntry,
        stale: &mut Option<Binding>,
    ) -> Result<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.lock();
        let current = endpoints
            .get(&entry.id)
            .map(|binding| (binding.nonce, Arc::clone(&binding.endpoint)));

        match current {
            Some((nonce, endpoint)) if nonce == entry.nonce => Ok(endpoint),
            Some(_) => {
                *stale = endpoints.remove(&entry.id);
                Err(IpcError::UnknownEndpoint)
            }
            None => Err(IpcError::UnknownEndpoint),
        }
    }

    /// Close an endpoint whose capability is gone
    fn retire(cap: CapId, binding: Binding) {
        binding.endpoint.init();
        log::debug!("endpoint {} retired after revocation", cap);
    }

    /// Run `op` on the endpoint while `cap` is held authorized
    fn gated<T>(
        &self,
        cap: CapId,
        owner: OwnerId,
        needed: Rights,
        op: impl FnOnce(&CapabilityEntry, Arc<Endpoint>) -> T,
    ) -> Result<T> {
        let mut stale = None;
        let outcome = self.table.with_authorized(cap, owner, needed, |entry| {
            let endpoint = self.bound(entry, &mut stale)?;
            Ok::<_, IpcError>(op(entry, endpoint))
        });

        if let Some(binding) = stale {
            Self::retire(cap, binding);
        }
        outcome?
    }

    /// Send through `cap` (needs `SEND`)
    ///
    /// Like [`Endpoint::send`], a full endpoint drops the message without
    /// an error; only authorization failures are reported.
    pub fn send(&self, cap: CapId, owner: OwnerId, message: Message) -> Result<()> {
        self.try_send(cap, owner, message).map(|outcome| {
            if let Err(reason) = outcome {
                log::trace!("{}: send dropped: {}", cap, reason);
            }
        })
    }

    /// Send through `cap`, returning the endpoint's verdict
    ///
    /// The outer result is authorization, the inner one is delivery.
    pub fn try_send(
        &self,
        cap: CapId,
        owner: OwnerId,
        message: Message,
    ) -> Result<core::result::Result<(), SendError>> {
        self.gated(cap, owner, Rights::SEND, |_, endpoint| endpoint.try_send(message))
    }

    /// Receive through `cap` (needs `RECV`), sleeping while it is empty
    pub fn recv(&self, cap: CapId, owner: OwnerId) -> Result<Message> {
        // Every lock is released here, before the endpoint can block
        let endpoint = self.gated(cap, owner, Rights::RECV, |_, endpoint| endpoint)?;
        endpoint.recv()
    }

    /// Receive through `cap` (needs `RECV`), giving up after `timeout`
    pub fn recv_timeout(&self, cap: CapId, owner: OwnerId, timeout: Duration) -> Result<Message> {
        let endpoint = self.gated(cap, owner, Rights::RECV, |_, endpoint| endpoint)?;
        endpoint.recv_timeout(timeout)
    }

    /// Close the endpoint and remove its capability (needs `REVOKE`)
    ///
    /// Receivers sleeping on the endpoint wake up with `Closed`.
    pub fn destroy(&self, cap: CapId, owner: OwnerId) -> Result<()> {
        let (endpoint, nonce) = self.gated(cap, owner, Rights::REVOKE, |entry, endpoint| {
            self.endpoints.lock().remove(&cap);
            (endpoint, entry.nonce)
        })?;

        endpoint.init();
        // Fails only if the capability was revoked concurrently
        self.table.remove_exact(cap, nonce)?;
        log::debug!("endpoint {} destroyed", cap);
        Ok(())
    }

    /// Destroy every endpoint whose capability belongs to `owner`
    ///
    /// Returns the number of endpoints destroyed.
    pub fn destroy_owner(&self, owner: OwnerId) -> usize {
        let revoked = self.table.revoke_where(|entry| {
            entry.owner == owner
                && self
                    .endpoints
                    .lock()
                    .get(&entry.id)
                    .is_some_and(|binding| binding.nonce == entry.nonce)
        });

        let mut destroyed = 0;
        for entry in revoked {
            if let Some(binding) = self.unbind(entry.id, entry.nonce) {
                binding.endpoint.init();
                destroyed += 1;
            }
        }

        if destroyed > 0 {
            log::debug!("destroyed {} endpoints of owner {}", destroyed, owner);
        }
        destroyed
    }

    /// Close every endpoint whose capability is no longer live
    ///
    /// Returns the number of endpoints closed.
    pub fn reap(&self) -> usize {
        let bound: Vec<(CapId, u64)> = self
            .endpoints
            .lock()
            .iter()
            .map(|(cap, binding)| (*cap, binding.nonce))
            .collect();

        let mut reaped = 0;
        for (cap, nonce) in bound {
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

    /// Number of registered endpoints, including any not yet reaped
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }
}

impl fmt::Debug for EndpointBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointBroker")
            .field("endpoints", &self.endpoint_count())
            .field("table", &self.table)
            .finish()
    }
}
