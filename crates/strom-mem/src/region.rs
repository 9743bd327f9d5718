//! # Mapped Region
//!
//! One pinned GPU virtual range and its immutable page table.
//!
//! Offsets used by the geometry helpers are *region positions*: byte
//! distances from the rounded-down base address, not from the
//! caller's virtual address.
//!
//! ```text
//!  base                 base+offset (caller's vaddr)
//!   │◄──── offset ─────►│◄──────────── length ────────────►│
//!   ├───────────────────┼──────────┬──────────────┬────────┤
//!   │     page 0        │          │   page 1     │ page 2 │
//!   └───────────────────┴──────────┴──────────────┴────────┘
//!                                  ▲
//!                          first destination page boundary
//! ```

use spin::Mutex;
use strom_core::sync::WaitSlot;
use strom_core::{Error, GpuAddr, GpuPageSize, MappingHandle, PhysAddr, Pid, RawPageTable, Result};

/// Usage state, only touched with the owning shard locked
#[derive(Debug, Default)]
pub(crate) struct RegionUsage {
    pub(crate) refcount: u32,
    pub(crate) teardown: WaitSlot,
}

/// A pinned GPU memory region
#[derive(Debug)]
pub struct MappedRegion {
    handle: MappingHandle,
    owner: Pid,
    base: GpuAddr,
    offset: u64,
    length: u64,
    page_size: GpuPageSize,
    table: RawPageTable,
    pub(crate) usage: Mutex<RegionUsage>,
}

impl MappedRegion {
    pub(crate) fn new(
        handle: MappingHandle,
        owner: Pid,
        base: GpuAddr,
        offset: u64,
        length: u64,
        page_size: GpuPageSize,
        table: RawPageTable,
    ) -> Self {
        Self {
            handle,
            owner,
            base,
            offset,
            length,
            page_size,
            table,
            usage: Mutex::new(RegionUsage::default()),
        }
    }

    /// Handle of this region
    pub fn handle(&self) -> MappingHandle {
        self.handle
    }

    /// Process that mapped the region
    pub fn owner(&self) -> Pid {
        self.owner
    }

    /// Virtual address rounded down to the mapping boundary
    pub fn base(&self) -> GpuAddr {
        self.base
    }

    /// Low bits discarded by the rounding
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length requested by the caller
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bytes pinned from `base`
    pub fn mapped_length(&self) -> u64 {
        self.offset + self.length
    }

    /// Device page granularity
    pub fn page_size(&self) -> GpuPageSize {
        self.page_size
    }

    /// Page-table format version
    pub fn version(&self) -> u32 {
        self.table.version
    }

    /// Physical pages, in virtual order
    pub fn pages(&self) -> &[PhysAddr] {
        &self.table.pages
    }

    pub(crate) fn table(&self) -> &RawPageTable {
        &self.table
    }

    /// Current number of users
    pub fn refcount(&self) -> u32 {
        self.usage.lock().refcount
    }

    /// Region position of `offset` bytes past the caller's address,
    /// provided `len` bytes from there fit in the mapping
    pub fn window(&self, offset: u64, len: u64) -> Result<u64> {
        let start = self.offset.checked_add(offset).ok_or(Error::InvalidArgument)?;
        let end = start.checked_add(len).ok_or(Error::InvalidArgument)?;
        if end > self.mapped_length() {
            log::error!(
                "strom: range {:#x}..{:#x} exceeds mapping {} of {:#x} bytes",
                start,
                end,
                self.handle,
                self.mapped_length()
            );
            return Err(Error::InvalidArgument);
        }
        Ok(start)
    }
}

// =============================================================================
// TESTS
// =============================================================================
