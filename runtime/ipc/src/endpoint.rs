//! Endpoint - bounded FIFO message queue with blocking receive
//!
//! ## States
//!
//! ```text
//!  Uninitialized --init--> Empty --configure--> ConfiguredEmpty <--> ConfiguredNonEmpty
//!                            ^                        |                   |
//!                            +--------- init ---------+-------------------+
//! ```
//!
//! `init` empties the queue, clears storage and descriptor and wakes every
//! blocked receiver; those receivers return `Closed`. `configure` installs
//! storage of a given capacity and resets the indices. Any operation on an
//! uninitialized endpoint initializes it first.
//!
//! ## Indices
//!
//! `read_index` and `write_index` count dequeued and enqueued messages with
//! wrapping arithmetic, so `write_index - read_index` (wrapping) is always
//! the occupancy and never exceeds the capacity. The ring position of the
//! oldest message is tracked separately in `head`.

use alloc::vec::Vec;
use core::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{Descriptor, IpcError, Message, Result, SendError};

/// Observable endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Uninitialized,
    /// Initialized, no storage installed
    Empty,
    ConfiguredEmpty,
    ConfiguredNonEmpty,
}

/// Queue state guarded by the endpoint mutex
struct Queue {
    /// Backing storage; empty means unconfigured
    buffer: Vec<Message>,
    /// Ring position of the oldest message
    head: usize,
    read_index: usize,
    write_index: usize,
    initialized: bool,
    descriptor: Descriptor,
    /// Bumped by `init` so sleeping receivers can tell they were reset
    generation: u64,
    /// Receivers currently asleep on the condvar
    waiting: usize,
}

impl Queue {
    const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            head: 0,
            read_index: 0,
            write_index: 0,
            initialized: false,
            descriptor: Descriptor::EMPTY,
            generation: 0,
            waiting: 0,
        }
    }

    fn ensure_initialized(&mut self) {
        if !self.initialized {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.buffer = Vec::new();
        self.head = 0;
        self.read_index = 0;
        self.write_index = 0;
        self.initialized = true;
        self.descriptor = Descriptor::EMPTY;
        self.generation = self.generation.wrapping_add(1);
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn is_configured(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn len(&self) -> usize {
        self.write_index.wrapping_sub(self.read_index)
    }

    fn push(&mut self, message: Message) -> core::result::Result<(), SendError> {
        if !self.is_configured() {
            return Err(SendError::Unconfigured);
        }
        let capacity = self.capacity();
        if self.len() == capacity {
            return Err(SendError::Full { capacity });
        }
        if let Some(word) = self.descriptor.padding_violation(&message) {
            return Err(SendError::NonZeroPadding { word });
        }

        let tail = (self.head + self.len()) % capacity;
        self.buffer[tail] = message;
        self.write_index = self.write_index.wrapping_add(1);
        Ok(())
    }

    fn pop(&mut self) -> Option<Message> {
        if self.len() == 0 {
            return None;
        }

        let message = core::mem::take(&mut self.buffer[self.head]);
        self.head = (self.head + 1) % self.capacity();
        self.read_index = self.read_index.wrapping_add(1);
        Some(self.descriptor.zero_fill(message))
    }

    fn state(&self) -> EndpointState {
        match (self.initialized, self.is_configured(), self.len()) {
            (false, _, _) => EndpointState::Uninitialized,
            (true, false, _) => EndpointState::Empty,
            (true, true, 0) => EndpointState::ConfiguredEmpty,
            (true, true, _) => EndpointState::ConfiguredNonEmpty,
        }
    }
}

/// Bounded FIFO message queue
pub struct Endpoint {
    queue: Mutex<Queue>,
    /// Signalled once per enqueued message, and broadcast on `init`
    ready: Condvar,
}

impl Endpoint {
    /// Create an uninitialized endpoint
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::new()),
            ready: Condvar::new(),
        }
    }

    /// Create an endpoint already configured with `capacity` slots
    pub fn with_config(capacity: usize, descriptor: Descriptor) -> Result<Self> {
        let endpoint = Self::new();
        endpoint.configure(capacity, descriptor)?;
        Ok(endpoint)
    }

    // The queue is left consistent at every unlock, so a panic elsewhere
    // while holding the lock does not invalidate it.
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset to the empty, unconfigured state
    ///
    /// Idempotent. Queued messages are discarded and every blocked receiver
    /// wakes up with `Closed`.
    pub fn init(&self) {
        let mut queue = self.lock();
        let discarded = queue.len();
        queue.reset();
        drop(queue);

        self.ready.notify_all();
        if discarded > 0 {
            log::debug!("endpoint init discarded {} queued messages", discarded);
        }
    }

    /// Install storage for `capacity` messages of the given shape
    ///
    /// Resets the indices; anything queued before is discarded.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `capacity` is zero
    pub fn configure(&self, capacity: usize, descriptor: Descriptor) -> Result<()> {
        if capacity == 0 {
            return Err(IpcError::InvalidArgument {
                reason: "endpoint capacity must be non-zero",
            });
        }

        let mut queue = self.lock();
        queue.ensure_initialized();
        queue.buffer = alloc::vec![Message::zeroed(); capacity];
        queue.head = 0;
        queue.read_index = 0;
        queue.write_index = 0;
        queue.descriptor = descriptor;

        log::debug!(
            "endpoint configured: capacity {} descriptor {} words",
            capacity,
            descriptor.words()
        );
        Ok(())
    }

    /// Enqueue a message, reporting why it was not accepted
    ///
    /// Never blocks. A rejected message leaves the endpoint untouched.
    pub fn try_send(&self, message: Message) -> core::result::Result<(), SendError> {
        let mut queue = self.lock();
        queue.ensure_initialized();
        queue.push(message)?;
        drop(queue);

        self.ready.notify_one();
        Ok(())
    }

    /// Enqueue a message, dropping it silently if it cannot be accepted
    ///
    /// Messages are dropped when the endpoint is unconfigured or full, and
    /// rejected when a word beyond the descriptor is non-zero.
    pub fn send(&self, message: Message) {
        if let Err(reason) = self.try_send(message) {
            log::trace!("endpoint send dropped: {}", reason);
        }
    }

    /// Dequeue the oldest message, sleeping while the queue is empty
    ///
    /// # Errors
    /// Returns `Closed` if the endpoint is unconfigured, or is reset by
    /// `init` while the caller sleeps
    pub fn recv(&self) -> Result<Message> {
        self.recv_until(None)
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`
    ///
    /// # Errors
    /// `Closed` as for `recv`, or `TimedOut` if nothing arrived in time
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        // A deadline too far out to represent is no deadline
        self.recv_until(Instant::now().checked_add(timeout))
    }

    /// Dequeue the oldest message without sleeping
    ///
    /// # Errors
    /// `Closed` if unconfigured, `WouldBlock` if empty
    pub fn try_recv(&self) -> Result<Message> {
        let mut queue = self.lock();
        queue.ensure_initialized();
        if !queue.is_configured() {
            return Err(IpcError::Closed);
        }
        queue.pop().ok_or(IpcError::WouldBlock)
    }

    fn recv_until(&self, deadline: Option<Instant>) -> Result<Message> {
        let mut queue = self.lock();
        queue.ensure_initialized();
        let generation = queue.generation;

        loop {
            if queue.generation != generation || !queue.is_configured() {
                return Err(IpcError::Closed);
            }
            if let Some(message) = queue.pop() {
                return Ok(message);
            }

            let timeout = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(IpcError::TimedOut);
                    }
                    Some(deadline - now)
                }
            };

            queue.waiting += 1;
            queue = match timeout {
                None => self
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    self.ready
                        .wait_timeout(queue, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
            queue.waiting -= 1;
        }
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no messages are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage slots installed (zero when unconfigured)
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Check if a send would be dropped for lack of space
    pub fn is_full(&self) -> bool {
        let queue = self.lock();
        queue.is_configured() && queue.len() == queue.capacity()
    }

    /// Receivers currently sleeping in `recv`
    pub fn waiting(&self) -> usize {
        self.lock().waiting
    }

    pub fn descriptor(&self) -> Descriptor {
        self.lock().descriptor
    }

    pub fn state(&self) -> EndpointState {
        self.lock().state()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.lock();
        f.debug_struct("Endpoint")
            .field("state", &queue.state())
            .field("len", &queue.len())
            .field("capacity", &queue.capacity())
            .field("descriptor", &queue.descriptor.words())
            .finish()
    }
}
