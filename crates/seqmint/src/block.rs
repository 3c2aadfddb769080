//! # Persisted sequence block
//!
//! One fixed 28-byte record at offset 0 of the agent's sequence file. The
//! `sequence` field is the reservation ceiling: it is always at or above any
//! sequence value the agent has handed out, so a crash between writes can
//! skip values but never repeat one.
//!
//! The layout is little-endian and single-host; agents never exchange block
//! files. The magic is the same arithmetic corruption check the original
//! on-disk format used, kept verbatim so existing files stay readable.

use core::fmt;
use thiserror::Error;

/// Serialized size of a [`SeqBlock`].
pub const BLOCK_LEN: usize = 28;

/// Current block format version.
pub const BLOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("sequence file holds {got} bytes, a block is {BLOCK_LEN}")]
    Truncated { got: usize },
    #[error("block magic check failed: {block}")]
    Corrupt { block: SeqBlock },
}

/// The persisted record: `{version, label, sequence, timestamp, magic}`.
///
/// `timestamp` is the Unix second of the last successful label renewal.
/// Invariant: `magic == |timestamp - (sequence + label + version)|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqBlock {
    pub version: u32,
    pub label: u32,
    pub sequence: u32,
    pub timestamp: u64,
    pub magic: u64,
}

impl Default for SeqBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqBlock {
    pub const fn new() -> Self {
        Self {
            version: BLOCK_VERSION,
            label: 0,
            sequence: 0,
            timestamp: 0,
            magic: 0,
        }
    }

    const fn field_sum(&self) -> u64 {
        self.sequence as u64 + self.label as u64 + self.version as u64
    }

    /// Recomputes `magic` from the other fields. Must be called before every
    /// write of the block.
    pub const fn update_magic(&mut self) {
        self.magic = self.timestamp.abs_diff(self.field_sum());
    }

    pub const fn valid_magic(&self) -> bool {
        self.magic == self.timestamp.abs_diff(self.field_sum())
    }

    /// Serializes the block, little-endian.
    pub fn encode(&self) -> [u8; BLOCK_LEN] {
        let mut buf = [0u8; BLOCK_LEN];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.label.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[20..28].copy_from_slice(&self.magic.to_le_bytes());
        buf
    }

    /// Deserializes a block, verifying length and magic.
    ///
    /// # Errors
    ///
    /// [`BlockError::Truncated`] for a short or oversized buffer,
    /// [`BlockError::Corrupt`] if the magic check fails. A corrupt block is
    /// fatal at startup; the agent must refuse to run rather than risk
    /// reissuing sequence values.
    pub fn decode(buf: &[u8]) -> Result<Self, BlockError> {
        if buf.len() != BLOCK_LEN {
            return Err(BlockError::Truncated { got: buf.len() });
        }
        let block = Self {
            version: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            label: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            sequence: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            timestamp: u64::from_le_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
            magic: u64::from_le_bytes([
                buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
            ]),
        };
        if !block.valid_magic() {
            return Err(BlockError::Corrupt { block });
        }
        Ok(block)
    }
}

impl fmt::Display for SeqBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block://V{}/L{}/S{}/T{}/M{}",
            self.version, self.label, self.sequence, self.timestamp, self.magic
        )
    }
}
