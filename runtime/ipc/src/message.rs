//! Wire format: four-word messages and their descriptors

use static_assertions::{assert_eq_align, assert_eq_size};

use crate::{IpcError, Result};

/// Number of words in every message
pub const MESSAGE_WORDS: usize = 4;

/// Fixed-size IPC payload
///
/// Layout matches four consecutive registers, so it can be copied straight
/// in and out of a register block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Message(pub [u64; MESSAGE_WORDS]);

assert_eq_size!(Message, [u8; 32]);
assert_eq_align!(Message, u64);

impl Message {
    pub const fn new(words: [u64; MESSAGE_WORDS]) -> Self {
        Self(words)
    }

    /// All-zero message
    pub const fn zeroed() -> Self {
        Self([0; MESSAGE_WORDS])
    }

    pub const fn words(&self) -> &[u64; MESSAGE_WORDS] {
        &self.0
    }

    /// Word `index`, or `None` past the end
    pub fn word(&self, index: usize) -> Option<u64> {
        self.0.get(index).copied()
    }
}

impl From<[u64; MESSAGE_WORDS]> for Message {
    fn from(words: [u64; MESSAGE_WORDS]) -> Self {
        Self(words)
    }
}

impl From<Message> for [u64; MESSAGE_WORDS] {
    fn from(message: Message) -> Self {
        message.0
    }
}

/// Message shape: how many leading words are meaningful (0..=4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Descriptor {
    words: u8,
}

impl Descriptor {
    /// No meaningful words; only all-zero messages conform
    pub const EMPTY: Self = Self { words: 0 };

    /// Every word is meaningful
    pub const FULL: Self = Self {
        words: MESSAGE_WORDS as u8,
    };

    /// # Errors
    /// Returns `InvalidArgument` if `words` exceeds [`MESSAGE_WORDS`]
    pub fn new(words: usize) -> Result<Self> {
        if words > MESSAGE_WORDS {
            return Err(IpcError::InvalidArgument {
                reason: "descriptor longer than a message",
            });
        }
        Ok(Self { words: words as u8 })
    }

    /// Number of meaningful words
    pub const fn words(self) -> usize {
        self.words as usize
    }

    /// Index of the first non-zero word past the meaningful prefix
    pub fn padding_violation(self, message: &Message) -> Option<usize> {
        message
            .0
            .iter()
            .enumerate()
            .skip(self.words())
            .find(|(_, word)| **word != 0)
            .map(|(index, _)| index)
    }

    /// Check that every word past the meaningful prefix is zero
    pub fn conforms(self, message: &Message) -> bool {
        self.padding_violation(message).is_none()
    }

    /// Copy of `message` with every word past the prefix cleared
    pub fn zero_fill(self, message: Message) -> Message {
        let mut words = message.0;
        for word in words.iter_mut().skip(self.words()) {
            *word = 0;
        }
        Message(words)
    }
}
