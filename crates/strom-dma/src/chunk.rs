//! # Source Chunks
//!
//! A transfer is a list of chunks laid end to end in GPU memory. Each chunk
//! reads either from pinned host memory or from a file; its destination is
//! implied by the lengths of the chunks before it.

use strom_core::{Error, Result};

/// Wire tag of a host-memory chunk
pub const CHUNK_TAG_MEMORY: u8 = b'm';
/// Wire tag of a file chunk
pub const CHUNK_TAG_FILE: u8 = b'f';

/// One source range of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// User memory at `addr`
    HostMemory {
        /// User virtual address
        addr: u64,
        /// Bytes to copy
        length: u64,
    },
    /// File contents at `offset`
    FileOffset {
        /// Byte offset in the file
        offset: u64,
        /// Bytes to copy
        length: u64,
    },
}

impl Chunk {
    /// Decode a wire chunk
    pub fn from_raw(tag: u8, location: u64, length: u64) -> Result<Self> {
        match tag {
            CHUNK_TAG_MEMORY => Ok(Self::HostMemory {
                addr: location,
                length,
            }),
            CHUNK_TAG_FILE => Ok(Self::FileOffset {
                offset: location,
                length,
            }),
            _ => {
                log::error!("strom: unknown chunk source tag {:#04x}", tag);
                Err(Error::InvalidArgument)
            },
        }
    }

    /// Bytes this chunk contributes
    pub const fn length(&self) -> u64 {
        match self {
            Self::HostMemory { length, .. } | Self::FileOffset { length, .. } => *length,
        }
    }

    /// Whether the chunk reads from the file
    pub const fn is_file_backed(&self) -> bool {
        matches!(self, Self::FileOffset { .. })
    }
}

/// Validate a chunk list and return its total length
///
/// Rejects empty lists, zero-length chunks, and ranges that wrap around.
pub fn total_length(chunks: &[Chunk]) -> Result<u64> {
    if chunks.is_empty() {
        log::error!("strom: empty chunk list");
        return Err(Error::InvalidArgument);
    }
    chunks.iter().enumerate().try_fold(0u64, |total, (i, chunk)| {
        let (start, length) = match *chunk {
            Chunk::HostMemory { addr, length } => (addr, length),
            Chunk::FileOffset { offset, length } => (offset, length),
        };
        if length == 0 || start.checked_add(length).is_none() {
            log::error!("strom: chunk {} has invalid range {:#x}+{:#x}", i, start, length);
            return Err(Error::InvalidArgument);
        }
        total.checked_add(length).ok_or(Error::InvalidArgument)
    })
}

/// Whether any chunk reads from the file
pub fn needs_file(chunks: &[Chunk]) -> bool {
    chunks.iter().any(Chunk::is_file_backed)
}
