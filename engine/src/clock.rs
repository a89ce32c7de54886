//! Server clock used as a pull cursor.
//!
//! The server hands out a monotonically increasing clock for every update it
//! accepts. The client never invents clock values; it only stores the ones
//! it receives and sends them back to ask for newer updates.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, server-issued logical timestamp.
///
/// Ordering follows the server's issue order for a single document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerClock(pub u64);

impl ServerClock {
    /// Clock preceding every update.
    pub const ZERO: ServerClock = ServerClock(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Encode for a storage record.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    /// Decode a storage record written by [`ServerClock::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            Error::StorageUnavailable(format!("invalid server clock record ({} bytes)", bytes.len()))
        })?;
        Ok(Self(u64::from_be_bytes(raw)))
    }

    /// Keep whichever clock is newer.
    pub fn merge(&mut self, other: ServerClock) {
        if other > *self {
            *self = other;
        }
    }
}

impl fmt::Display for ServerClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ServerClock {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
