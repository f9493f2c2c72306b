//! Logical clock used for last-writer-wins conflict resolution.

use std::fmt;

/// Encoded width of a clocktime in bytes.
pub const CLOCKTIME_SIZE: usize = 8;

/// Totally ordered 64-bit logical timestamp.
///
/// Stored big-endian as the first bytes of every value so that byte order and
/// numeric order agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Wrap a raw clock value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw clock value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Decode from the first `CLOCKTIME_SIZE` bytes of `bytes`.
    ///
    /// Returns `None` when fewer bytes are available.
    pub fn from_prefix(bytes: &[u8]) -> Option<Self> {
        let prefix: [u8; CLOCKTIME_SIZE] = bytes.get(..CLOCKTIME_SIZE)?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(prefix)))
    }

    /// Big-endian encoding.
    pub fn to_bytes(self) -> [u8; CLOCKTIME_SIZE] {
        self.0.to_be_bytes()
    }

    /// Whether a write stamped `self` may replace a record stamped `existing`.
    ///
    /// Ties are accepted; only strictly older writes are rejected.
    pub fn accepts_over(self, existing: ClockTime) -> bool {
        self >= existing
    }
}

impl From<u64> for ClockTime {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
