//! Channel address space: allocation of unique channels and decoding of
//! identities packed into client channels.
//!
//! Every node on the bus is addressed by 64-bit channels. Object ids issued by
//! an AI node are themselves channels drawn from that node's range, so the
//! allocator here is called once per generated object and once per connected
//! client. Allocation and release are O(1).

use std::collections::VecDeque;
use thiserror::Error;

/// A 64-bit bus address.
pub type Channel = u64;

/// Distributed object id as carried in message bodies.
pub type DoId = u32;

/// Errors raised by [`IdAllocator`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every value in the range is currently held.
    #[error("id range [{min}, {max}) exhausted")]
    Exhausted { min: u64, max: u64 },

    /// The value lies outside the allocator's range.
    #[error("id {0} is outside the allocator range")]
    OutOfRange(u64),

    /// The value is not currently held (double free).
    #[error("id {0} is not allocated")]
    NotAllocated(u64),
}

/// Issues and reclaims unique values from `[min, max)`.
///
/// Fresh values are handed out in ascending order until the range has been
/// walked once; after that, released values are recycled in the order they
/// were freed. A bitmap of held values rejects double frees.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    min: u64,
    max: u64,
    /// Next never-issued value
    next_fresh: u64,
    /// Released values waiting for reuse
    free_list: VecDeque<u64>,
    /// One bit per value in the range, set while held
    held: Vec<u64>,
    held_count: u64,
}

impl IdAllocator {
    /// Creates an allocator over `[min, max)`.
    ///
    /// An empty range (`max <= min`) is valid and is always exhausted.
    pub fn new(min: u64, max: u64) -> Self {
        let span = max.saturating_sub(min);
        let words = span.div_ceil(64) as usize;

        Self {
            min,
            max: min + span,
            next_fresh: min,
            free_list: VecDeque::new(),
            held: vec![0; words],
            held_count: 0,
        }
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Number of values currently held.
    pub fn len(&self) -> u64 {
        self.held_count
    }

    pub fn is_empty(&self) -> bool {
        self.held_count == 0
    }

    /// Returns true if `value` is currently held.
    pub fn is_allocated(&self, value: u64) -> bool {
        match self.slot(value) {
            Some((word, bit)) => self.held[word] & bit != 0,
            None => false,
        }
    }

    /// Takes an unused value out of the pool.
    pub fn allocate(&mut self) -> Result<u64, AllocError> {
        let value = if self.next_fresh < self.max {
            let value = self.next_fresh;
            self.next_fresh += 1;
            value
        } else if let Some(value) = self.free_list.pop_front() {
            value
        } else {
            return Err(AllocError::Exhausted {
                min: self.min,
                max: self.max,
            });
        };

        // Both sources only ever yield in-range, unheld values.
        if let Some((word, bit)) = self.slot(value) {
            self.held[word] |= bit;
        }
        self.held_count += 1;
        Ok(value)
    }

    /// Returns `value` to the pool so it can be issued again.
    pub fn free(&mut self, value: u64) -> Result<(), AllocError> {
        let (word, bit) = self.slot(value).ok_or(AllocError::OutOfRange(value))?;
        if self.held[word] & bit == 0 {
            return Err(AllocError::NotAllocated(value));
        }

        self.held[word] &= !bit;
        self.held_count -= 1;
        self.free_list.push_back(value);
        Ok(())
    }

    fn slot(&self, value: u64) -> Option<(usize, u64)> {
        if value < self.min || value >= self.max {
            return None;
        }
        let offset = value - self.min;
        Some(((offset / 64) as usize, 1u64 << (offset % 64)))
    }
}

/// Identity packed into a client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderIdentity {
    pub account_id: u32,
    pub avatar_id: u32,
}

/// The sub-range of channels assigned to connected clients.
///
/// A client channel is `min + (account_id << 32) + avatar_id`, so the
/// identity of any sender is recovered with two shifts and a mask, without a
/// lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientChannelRange {
    pub min: Channel,
    pub max: Channel,
}

impl ClientChannelRange {
    pub fn new(min: Channel, max: Channel) -> Self {
        Self { min, max }
    }

    /// Returns true if `channel` lies within `[min, max]`.
    pub fn contains(&self, channel: Channel) -> bool {
        self.min <= channel && channel <= self.max
    }

    /// Decodes the account and avatar packed into a client channel.
    ///
    /// Returns `None` for channels outside the client range.
    pub fn identity(&self, channel: Channel) -> Option<SenderIdentity> {
        if !self.contains(channel) {
            return None;
        }
        let offset = channel - self.min;
        Some(SenderIdentity {
            account_id: (offset >> 32) as u32,
            avatar_id: (offset & 0xFFFF_FFFF) as u32,
        })
    }

    pub fn avatar_id(&self, channel: Channel) -> Option<u32> {
        self.identity(channel).map(|identity| identity.avatar_id)
    }

    pub fn account_id(&self, channel: Channel) -> Option<u32> {
        self.identity(channel).map(|identity| identity.account_id)
    }

    /// Composes the channel a client with this identity is reachable on.
    ///
    /// Returns `None` if the result would fall outside the range.
    pub fn channel_for(&self, identity: SenderIdentity) -> Option<Channel> {
        let offset = ((identity.account_id as u64) << 32) | identity.avatar_id as u64;
        let channel = self.min.checked_add(offset)?;
        self.contains(channel).then_some(channel)
    }
}

impl Default for ClientChannelRange {
    fn default() -> Self {
        Self::new(crate::CLIENT_CHANNEL_MIN, crate::CLIENT_CHANNEL_MAX)
    }
}
