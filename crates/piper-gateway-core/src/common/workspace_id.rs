//! # Workspace identifiers
//!
//! Every synthesis request writes its audio to a file of its own. The file
//! name embeds a [`WorkspaceId`], a ULID-style 128-bit value:
//!
//! ```text
//!  Bit Index:  127            80 79           0
//!              +----------------+-------------+
//!  Field:      | timestamp (48) | random (80) |
//!              +----------------+-------------+
//!              |<-- MSB -- 128 bits -- LSB -->|
//! ```
//!
//! The timestamp keeps names roughly sortable by creation time; the 80 random
//! bits make a collision between two requests in the same millisecond a
//! 1-in-2^80 event. Generation takes no lock and touches no shared counter.

use crate::common::source::{RandSource, SystemClock, ThreadRandom, TimeSource};
use core::fmt;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const BITS_PER_CHAR: usize = 5;

/// A 128-bit, time-prefixed, randomly-suffixed identifier.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WorkspaceId {
    id: u128,
}

impl WorkspaceId {
    pub const TIMESTAMP_BITS: u32 = 48;
    pub const RANDOM_BITS: u32 = 80;

    pub const TIMESTAMP_SHIFT: u32 = Self::RANDOM_BITS;

    pub const TIMESTAMP_MASK: u128 = (1 << Self::TIMESTAMP_BITS) - 1;
    pub const RANDOM_MASK: u128 = (1 << Self::RANDOM_BITS) - 1;

    /// Length of the Crockford base32 rendering: ceil(128 / 5).
    pub const ENCODED_LEN: usize = 26;

    /// Builds an identifier from its parts. Out-of-range bits are masked off.
    #[must_use]
    pub const fn from_components(timestamp: u128, random: u128) -> Self {
        let t = (timestamp & Self::TIMESTAMP_MASK) << Self::TIMESTAMP_SHIFT;
        let r = random & Self::RANDOM_MASK;
        Self { id: t | r }
    }

    #[must_use]
    pub const fn from_raw(raw: u128) -> Self {
        Self { id: raw }
    }

    /// Milliseconds since the Unix epoch, truncated to 48 bits.
    pub const fn timestamp(&self) -> u128 {
        (self.id >> Self::TIMESTAMP_SHIFT) & Self::TIMESTAMP_MASK
    }

    pub const fn random(&self) -> u128 {
        self.id & Self::RANDOM_MASK
    }

    /// Generates an identifier from the system clock and the thread-local RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_with(&SystemClock, &ThreadRandom)
    }

    /// Generates an identifier from the given sources.
    #[must_use]
    pub fn generate_with<T, R>(time: &T, rng: &R) -> Self
    where
        T: TimeSource<u128>,
        R: RandSource<u128>,
    {
        Self::from_components(time.current_millis(), rng.rand())
    }

    /// Writes the Crockford base32 form into `buf` without allocating.
    pub fn encode_to_buf(&self, buf: &mut [u8; Self::ENCODED_LEN]) {
        let input = self.id.to_be_bytes();
        // 26 chars carry 130 bits; the two leading pad bits are zero.
        let mut bits = Self::ENCODED_LEN * BITS_PER_CHAR - input.len() * 8;
        let mut acc = 0_u16;
        let mut out = 0;
        for &b in &input {
            acc = (acc << 8) | u16::from(b);
            bits += 8;
            while bits >= BITS_PER_CHAR {
                bits -= BITS_PER_CHAR;
                buf[out] = ALPHABET[((acc >> bits) & 0x1F) as usize];
                out += 1;
            }
        }
    }

    /// Encodes this identifier as 26 Crockford base32 characters.
    pub fn encode(&self) -> String {
        let mut buf = [0_u8; Self::ENCODED_LEN];
        self.encode_to_buf(&mut buf);
        buf.iter().map(|&b| char::from(b)).collect()
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0_u8; Self::ENCODED_LEN];
        self.encode_to_buf(&mut buf);
        // Every byte comes from ALPHABET, which is ASCII.
        f.write_str(core::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceId")
            .field("timestamp", &self.timestamp())
            .field("random", &self.random())
            .field("encoded", &self.encode())
            .finish()
    }
}
