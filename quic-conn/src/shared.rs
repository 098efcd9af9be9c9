use std::{fmt, ops};

use rand::{Rng, RngCore};

/// Longest connection ID permitted by QUIC version 1
pub(crate) const MAX_CID_SIZE: usize = 20;

/// Protocol-level identifier for a connection.
///
/// Either endpoint may change the identifier it is reached through over the life of a
/// connection, so a connection accepts a small set of them at any time.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct a connection ID from its raw bytes
    ///
    /// # Panics
    ///
    /// If `bytes` is longer than 20 bytes.
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// The zero-length connection ID
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; MAX_CID_SIZE],
    };

    /// Generate a random connection ID of `len` bytes
    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill(&mut res.bytes[..len]);
        res
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
