//! # Command Interface
//!
//! Fixed-layout request blocks identified by numeric command codes.
//!
//! | Code | Command                | Request block          |
//! |------|------------------------|------------------------|
//! | 0x80 | check file             | [`CheckFileCmd`]       |
//! | 0x81 | map GPU memory         | [`MapGpuMemoryCmd`]    |
//! | 0x82 | unmap GPU memory       | [`UnmapGpuMemoryCmd`]  |
//! | 0x83 | GPU memory info        | [`InfoGpuMemoryCmd`]   |
//! | 0x84 | memcpy SSD → GPU       | [`MemcpySsdToGpuCmd`]  |
//! | 0x85 | memcpy SSD → GPU async | [`MemcpySsdToGpuCmd`]  |
//! | 0x86 | wait for memcpy        | [`MemcpyWaitCmd`]      |
//! | 0x87 | debug file probe       | [`DebugCmd`]           |
//!
//! Output fields are written back into the request block. [`dispatch`]
//! folds the outcome into `0` or a negative errno.

use core::mem::size_of;

use strom_core::{Error, MappingHandle, Pid, Result, TaskId};
use strom_dma::{Chunk, MemcpyRequest, PageLocation, PageProbe};

use crate::instance::Strom;

// =============================================================================
// COMMAND CODES
// =============================================================================

/// Numeric command identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    /// Admission check on a file descriptor
    CheckFile           = 0x80,
    /// Pin GPU memory
    MapGpuMemory        = 0x81,
    /// Unpin GPU memory
    UnmapGpuMemory      = 0x82,
    /// Copy out a mapping's page table
    InfoGpuMemory       = 0x83,
    /// Copy and wait
    MemcpySsdToGpu      = 0x84,
    /// Copy without waiting
    MemcpySsdToGpuAsync = 0x85,
    /// Wait for an asynchronous copy
    MemcpySsdToGpuWait  = 0x86,
    /// Log page-cache residency and block mapping of a file range
    Debug               = 0x87,
}

impl CommandCode {
    /// Every command, in code order
    pub const ALL: [Self; 8] = [
        Self::CheckFile,
        Self::MapGpuMemory,
        Self::UnmapGpuMemory,
        Self::InfoGpuMemory,
        Self::MemcpySsdToGpu,
        Self::MemcpySsdToGpuAsync,
        Self::MemcpySsdToGpuWait,
        Self::Debug,
    ];

    /// Decode a raw command code
    pub fn from_raw(code: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.raw() == code)
            .ok_or(Error::InvalidArgument)
    }

    /// Raw command code
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

// =============================================================================
// REQUEST BLOCKS
// =============================================================================

/// Request block for [`CommandCode::CheckFile`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CheckFileCmd {
    /// File descriptor to check
    pub fdesc: i32,
}

/// Request block for [`CommandCode::MapGpuMemory`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MapGpuMemoryCmd {
    /// Out: mapping handle
    pub handle: u64,
    /// Out: GPU page size in bytes
    pub gpu_page_sz: u32,
    /// Out: number of GPU pages
    pub gpu_npages: u32,
    /// GPU virtual address
    pub vaddress: u64,
    /// Bytes to map
    pub length: u64,
}

/// Request block for [`CommandCode::UnmapGpuMemory`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UnmapGpuMemoryCmd {
    /// Mapping handle
    pub handle: u64,
}

/// Fixed part of the [`CommandCode::InfoGpuMemory`] block
///
/// The physical-address array follows it and is passed separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InfoGpuMemoryCmd {
    /// Mapping handle
    pub handle: u64,
    /// Capacity of the physical-address array
    pub nrooms: u32,
    /// Out: page-table format version
    pub version: u32,
    /// Out: GPU page size in bytes
    pub page_size: u32,
    /// Out: total page-table entries
    pub entries: u32,
}

/// One wire chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct StromDmaChunk {
    /// `b'm'` for host memory, `b'f'` for file
    pub source: u8,
    /// Reserved
    pub _pad: [u8; 7],
    /// Host address or file offset
    pub location: u64,
    /// Bytes
    pub length: u64,
}

impl StromDmaChunk {
    /// Host-memory chunk
    pub const fn memory(addr: u64, length: u64) -> Self {
        Self {
            source: strom_dma::CHUNK_TAG_MEMORY,
            _pad: [0; 7],
            location: addr,
            length,
        }
    }

    /// File chunk
    pub const fn file(offset: u64, length: u64) -> Self {
        Self {
            source: strom_dma::CHUNK_TAG_FILE,
            _pad: [0; 7],
            location: offset,
            length,
        }
    }
}

/// Fixed part of the memcpy blocks; the chunk array follows it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MemcpySsdToGpuCmd {
    /// Out: task id
    pub dma_task_id: u64,
    /// Destination mapping handle
    pub handle: u64,
    /// Destination offset from the mapped virtual address
    pub offset: u64,
    /// Source file descriptor, negative for none
    pub fdesc: i32,
    /// Number of chunks that follow
    pub nchunks: u32,
}

/// Request block for [`CommandCode::MemcpySsdToGpuWait`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MemcpyWaitCmd {
    /// Task id returned by the async memcpy
    pub dma_task_id: u64,
}

/// Request block for [`CommandCode::Debug`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DebugCmd {
    /// File descriptor
    pub fdesc: i32,
    /// Reserved
    pub _pad: u32,
    /// Byte offset of the range
    pub offset: u64,
    /// Bytes in the range
    pub length: u64,
}

static_assertions::const_assert_eq!(size_of::<CheckFileCmd>(), 4);
static_assertions::const_assert_eq!(size_of::<MapGpuMemoryCmd>(), 32);
static_assertions::const_assert_eq!(size_of::<UnmapGpuMemoryCmd>(), 8);
static_assertions::const_assert_eq!(size_of::<InfoGpuMemoryCmd>(), 24);
static_assertions::const_assert_eq!(size_of::<StromDmaChunk>(), 24);
static_assertions::const_assert_eq!(size_of::<MemcpySsdToGpuCmd>(), 32);
static_assertions::const_assert_eq!(size_of::<MemcpyWaitCmd>(), 8);
static_assertions::const_assert_eq!(size_of::<DebugCmd>(), 24);

// =============================================================================
// COMMANDS
// =============================================================================

/// A decoded command with its request block and trailing arrays
#[derive(Debug)]
pub enum Command<'a> {
    /// Admission check
    CheckFile(&'a CheckFileCmd),
    /// Pin GPU memory
    MapGpuMemory(&'a mut MapGpuMemoryCmd),
    /// Unpin GPU memory
    UnmapGpuMemory(&'a UnmapGpuMemoryCmd),
    /// Page-table copy-out
    InfoGpuMemory {
        /// Fixed block
        cmd: &'a mut InfoGpuMemoryCmd,
        /// Physical-address array, `nrooms` long
        physical: &'a mut [u64],
    },
    /// Copy and wait
    MemcpySsdToGpu {
        /// Fixed block
        cmd: &'a mut MemcpySsdToGpuCmd,
        /// Chunk array, `nchunks` long
        chunks: &'a [StromDmaChunk],
    },
    /// Copy without waiting
    MemcpySsdToGpuAsync {
        /// Fixed block
        cmd: &'a mut MemcpySsdToGpuCmd,
        /// Chunk array, `nchunks` long
        chunks: &'a [StromDmaChunk],
    },
    /// Wait for a copy
    MemcpySsdToGpuWait(&'a MemcpyWaitCmd),
    /// File probe
    Debug(&'a DebugCmd),
}

impl Command<'_> {
    /// Code this command is issued under
    pub fn code(&self) -> CommandCode {
        match self {
            Self::CheckFile(_) => CommandCode::CheckFile,
            Self::MapGpuMemory(_) => CommandCode::MapGpuMemory,
            Self::UnmapGpuMemory(_) => CommandCode::UnmapGpuMemory,
            Self::InfoGpuMemory { .. } => CommandCode::InfoGpuMemory,
            Self::MemcpySsdToGpu { .. } => CommandCode::MemcpySsdToGpu,
            Self::MemcpySsdToGpuAsync { .. } => CommandCode::MemcpySsdToGpuAsync,
            Self::MemcpySsdToGpuWait(_) => CommandCode::MemcpySsdToGpuWait,
            Self::Debug(_) => CommandCode::Debug,
        }
    }
}

/// Run `command` on behalf of `caller`
pub fn execute(strom: &Strom, caller: Pid, command: Command<'_>) -> Result<()> {
    match command {
        Command::CheckFile(cmd) => strom.check_file(cmd.fdesc),
        Command::MapGpuMemory(cmd) => {
            let mapping = strom.map_gpu_memory(caller, cmd.vaddress, cmd.length)?;
            cmd.handle = mapping.handle.id();
            cmd.gpu_page_sz = mapping.page_size.bytes() as u32;
            cmd.gpu_npages = mapping.entries;
            Ok(())
        },
        Command::UnmapGpuMemory(cmd) => strom.unmap_gpu_memory(MappingHandle::new(cmd.handle)),
        Command::InfoGpuMemory { cmd, physical } => {
            let capacity = physical.len().min(cmd.nrooms as usize);
            let info = strom.info_gpu_memory(MappingHandle::new(cmd.handle), capacity)?;
            cmd.version = info.version;
            cmd.page_size = info.page_size.bytes() as u32;
            cmd.entries = info.entries;
            for (slot, phys) in physical.iter_mut().zip(&info.physical) {
                *slot = phys.raw();
            }
            Ok(())
        },
        Command::MemcpySsdToGpu { cmd, chunks } => {
            let id = strom.memcpy_ssd2gpu(memcpy_request(cmd, chunks)?)?;
            cmd.dma_task_id = id.id();
            Ok(())
        },
        Command::MemcpySsdToGpuAsync { cmd, chunks } => {
            let id = strom.memcpy_ssd2gpu_async(memcpy_request(cmd, chunks)?)?;
            cmd.dma_task_id = id.id();
            Ok(())
        },
        Command::MemcpySsdToGpuWait(cmd) => {
            strom.memcpy_ssd2gpu_wait(TaskId::new(cmd.dma_task_id))
        },
        Command::Debug(cmd) => strom.probe_file(cmd.fdesc, cmd.offset, cmd.length, log_probe),
    }
}

fn log_probe(probe: PageProbe) {
    match probe.location {
        PageLocation::Cached(dma) => {
            log::info!("strom: file index={} cached at {:?}", probe.index, dma)
        },
        PageLocation::Block(block) => {
            log::info!("strom: file index={} blocknr={}", probe.index, block)
        },
        PageLocation::Unmapped(errno) => {
            log::info!("strom: file index={} block lookup failed: {}", probe.index, errno)
        },
    }
}

/// Decode `code`, run `command`, and fold the outcome into an errno
///
/// Returns `0` on success. A code that does not match the command's request
/// block is `-EINVAL`.
pub fn dispatch(strom: &Strom, caller: Pid, code: u32, command: Command<'_>) -> i32 {
    let outcome = CommandCode::from_raw(code).and_then(|decoded| {
        if decoded != command.code() {
            log::error!("strom: command {:#x} issued with a {:?} block", code, command.code());
            return Err(Error::InvalidArgument);
        }
        execute(strom, caller, command)
    });
    match outcome {
        Ok(()) => 0,
        Err(e) => {
            log::debug!("strom: command {:#x} failed: {}", code, e);
            e.errno()
        },
    }
}

fn memcpy_request(cmd: &MemcpySsdToGpuCmd, chunks: &[StromDmaChunk]) -> Result<MemcpyRequest> {
    if cmd.nchunks as usize != chunks.len() {
        log::error!(
            "strom: memcpy declares {} chunks but carries {}",
            cmd.nchunks,
            chunks.len()
        );
        return Err(Error::InvalidArgument);
    }
    let chunks = chunks
        .iter()
        .map(|c| Chunk::from_raw(c.source, c.location, c.length))
        .collect::<Result<Vec<_>>>()?;
    Ok(MemcpyRequest {
        handle: MappingHandle::new(cmd.handle),
        fd: (cmd.fdesc >= 0).then_some(cmd.fdesc),
        offset: cmd.offset,
        chunks,
    })
}
