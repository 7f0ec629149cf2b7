//! Fast IPC - per-core notification rings
//!
//! A bounded ring per core, guarded by a spinlock that only ever covers O(1)
//! work. Producers never block: a send to a full ring is dropped and
//! counted. Consumers read through [`FastIpcChannel::recv_registers`], which
//! hands back the four message words plus a status word without going
//! through the endpoint machinery.
//!
//! Channels are cache-line padded in [`FastIpc`] so cores polling their own
//! ring do not contend on a neighbour's lock.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam::utils::CachePadded;
use spin::Mutex;

use crate::{IpcError, Message, Result, MESSAGE_WORDS};

/// Default ring depth per core
pub const FASTIPC_QUEUE_DEPTH: usize = 16;

/// `FastRegisters::status` when a message was delivered
pub const FAST_OK: u64 = 0;

/// `FastRegisters::status` when the ring was empty
pub const FAST_NO_MESSAGE: u64 = u64::MAX;

/// Register block returned by a fast receive
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastRegisters {
    /// [`FAST_OK`] or [`FAST_NO_MESSAGE`]
    pub status: u64,

    /// Message words; all zero when `status` is `FAST_NO_MESSAGE`
    pub words: [u64; MESSAGE_WORDS],
}

impl FastRegisters {
    const EMPTY: Self = Self {
        status: FAST_NO_MESSAGE,
        words: [0; MESSAGE_WORDS],
    };

    /// The delivered message, if any
    pub fn message(&self) -> Option<Message> {
        (self.status == FAST_OK).then_some(Message(self.words))
    }
}

struct Ring<const N: usize> {
    slots: [Message; N],
    head: usize,
    len: usize,
}

/// One bounded notification ring
pub struct FastIpcChannel<const N: usize = FASTIPC_QUEUE_DEPTH> {
    ring: Mutex<Ring<N>>,
    dropped: AtomicU64,
}

impl<const N: usize> FastIpcChannel<N> {
    /// Create an empty channel
    ///
    /// # Panics
    /// Panics if `N` is zero
    pub const fn new() -> Self {
        assert!(N > 0, "fast channel depth must be non-zero");

        Self {
            ring: Mutex::new(Ring {
                slots: [Message::zeroed(); N],
                head: 0,
                len: 0,
            }),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message, or drop it if the ring is full
    pub fn send(&self, message: Message) {
        let mut ring = self.ring.lock();
        if ring.len == N {
            drop(ring);
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::trace!("fast channel full, message dropped ({} total)", total);
            return;
        }

        let tail = (ring.head + ring.len) % N;
        ring.slots[tail] = message;
        ring.len += 1;
    }

    /// Dequeue the oldest message, if any
    pub fn try_recv(&self) -> Option<Message> {
        let mut ring = self.ring.lock();
        if ring.len == 0 {
            return None;
        }

        let head = ring.head;
        let message = ring.slots[head];
        ring.head = (head + 1) % N;
        ring.len -= 1;
        Some(message)
    }

    /// Register-style receive
    ///
    /// Returns `FAST_OK` with the oldest message's words, or
    /// `FAST_NO_MESSAGE` with all words zeroed when the ring is empty.
    #[inline]
    pub fn recv_registers(&self) -> FastRegisters {
        match self.try_recv() {
            Some(Message(words)) => FastRegisters {
                status: FAST_OK,
                words,
            },
            None => FastRegisters::EMPTY,
        }
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Messages dropped because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for FastIpcChannel<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for FastIpcChannel<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastIpcChannel")
            .field("len", &self.len())
            .field("capacity", &N)
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// One fast channel per core, fixed at construction
pub struct FastIpc<const N: usize = FASTIPC_QUEUE_DEPTH> {
    channels: Box<[CachePadded<FastIpcChannel<N>>]>,
}

impl<const N: usize> FastIpc<N> {
    /// # Errors
    /// Returns `InvalidArgument` if `cores` is zero
    pub fn new(cores: usize) -> Result<Self> {
        if cores == 0 {
            return Err(IpcError::InvalidArgument {
                reason: "fast path needs at least one core",
            });
        }

        let channels = (0..cores)
            .map(|_| CachePadded::new(FastIpcChannel::new()))
            .collect();
        log::debug!("fast path ready: {} cores x {} slots", cores, N);
        Ok(Self { channels })
    }

    /// Number of cores served
    pub fn cores(&self) -> usize {
        self.channels.len()
    }

    /// Channel for `core`
    ///
    /// # Errors
    /// Returns `InvalidCore` if `core` is out of range
    pub fn channel(&self, core: usize) -> Result<&FastIpcChannel<N>> {
        self.channels
            .get(core)
            .map(|channel| &**channel)
            .ok_or(IpcError::InvalidCore {
                core,
                cores: self.channels.len(),
            })
    }

    /// Post a notification to `core`'s ring (dropped if full)
    pub fn send(&self, core: usize, message: Message) -> Result<()> {
        self.channel(core)?.send(message);
        Ok(())
    }

    /// Fast receive on `core`'s ring
    pub fn recv(&self, core: usize) -> Result<FastRegisters> {
        Ok(self.channel(core)?.recv_registers())
    }

    /// Messages dropped across every core
    pub fn dropped(&self) -> u64 {
        self.channels.iter().map(|channel| channel.dropped()).sum()
    }
}

impl<const N: usize> fmt::Debug for FastIpc<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastIpc")
            .field("cores", &self.cores())
            .field("depth", &N)
            .field("dropped", &self.dropped())
            .finish()
    }
}
