//! # STROM Collaborator Traits
//!
//! The narrow interfaces through which the core reaches the outside world.
//!
//! ## Collaborators
//!
//! ```text
//!                 ┌──────────────┐
//!   Map/Unmap ──► │   GpuPager   │  pin / unpin device pages, eviction notice
//!                 └──────────────┘
//!                 ┌──────────────┐
//!   host chunk ─► │  HostMemory  │  pin / release user pages
//!                 └──────────────┘
//!                 ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//!   file chunk ─► │  FileTable   │──►│  SourceFile  │──►│ BlockDevice │
//!                 └──────────────┘   └──────────────┘   └─────────────┘
//!                 ┌──────────────┐
//!                 │ BlockMapper  │  file page -> on-disk block
//!                 └──────────────┘
//!                 ┌──────────────────┐
//!   runs ───────► │ TransferChannel  │  memory->GPU and storage->GPU
//!                 └──────────────────┘
//! ```

use core::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::types::*;

// =============================================================================
// GPU PAGER
// =============================================================================

/// Why a mapping is being unpinned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    /// The owner asked for the mapping to go away
    Unmap,
    /// The GPU driver revoked the pages
    Evicted,
}

/// Callback the pager fires when it revokes a pinned range on its own
///
/// Firing it triggers an unsolicited teardown of the mapping. Dropping it
/// without firing does nothing.
pub struct EvictionNotice {
    hook: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl EvictionNotice {
    /// Wrap a teardown hook
    pub fn new(hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            hook: Some(Box::new(hook)),
        }
    }

    /// A notice that does nothing when fired
    pub fn noop() -> Self {
        Self { hook: None }
    }

    /// Deliver the eviction
    pub fn fire(mut self) {
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}

impl fmt::Debug for EvictionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionNotice")
            .field("armed", &self.hook.is_some())
            .finish()
    }
}

/// Page table returned by the pager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPageTable {
    /// Page-table format version
    pub version: u32,
    /// Raw page-size code (see [`GpuPageSize::from_raw`])
    pub page_size: u32,
    /// One physical address per device page, in virtual order
    pub pages: Vec<PhysAddr>,
}

/// Pins GPU virtual ranges to physical pages
pub trait GpuPager: Send + Sync {
    /// Pin `[base, base + length)` and return its page table
    ///
    /// `notice` must be fired if the pages are later revoked.
    fn pin(&self, base: GpuAddr, length: u64, notice: EvictionNotice) -> Result<RawPageTable>;

    /// Release a table obtained from [`GpuPager::pin`]
    fn unpin(&self, base: GpuAddr, table: &RawPageTable, cause: TeardownCause) -> Result<()>;
}

// =============================================================================
// HOST MEMORY
// =============================================================================

/// One pinned host page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPage {
    /// Bus address usable as a DMA source
    pub dma: DmaAddr,
}

/// Pins user memory for DMA
pub trait HostMemory: Send + Sync {
    /// Pin up to `count` pages starting at the page-aligned `addr`
    ///
    /// Returning fewer pages than requested is a partial failure; the caller
    /// releases whatever it got.
    fn pin_user_pages(&self, addr: u64, count: usize) -> Result<Vec<HostPage>>;

    /// Drop the references taken by pinning or by a page-cache lookup
    fn release_pages(&self, pages: &[HostPage]);
}

// =============================================================================
// FILES
// =============================================================================

bitflags! {
    /// Open mode of a source file
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        /// Opened for reading
        const READ = 1 << 0;
        /// Opened for writing
        const WRITE = 1 << 1;
        /// Opened with O_DIRECT
        const DIRECT = 1 << 2;
    }
}

/// Identity of the module providing a filesystem implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u64);

/// Filesystems eligible for the direct storage path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsKind {
    /// ext4
    Ext4,
    /// XFS
    Xfs,
}

impl FsKind {
    /// Superblock magic
    pub const fn magic(self) -> u64 {
        match self {
            Self::Ext4 => 0xEF53,
            Self::Xfs => 0x5846_5342,
        }
    }

    /// Registered filesystem type name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
        }
    }

    /// All eligible filesystems
    pub const ALL: [FsKind; 2] = [FsKind::Ext4, FsKind::Xfs];
}

/// What a file's superblock says about its filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsIdentity {
    /// Superblock magic
    pub magic: u64,
    /// Filesystem type name
    pub name: String,
    /// Module owning the filesystem type, `None` if built in
    pub owner: Option<ModuleId>,
}

/// Block device underneath a file
pub trait BlockDevice: Send + Sync {
    /// Major device number
    fn major(&self) -> u32;

    /// Disk name, e.g. `nvme0n1`
    fn disk_name(&self) -> &str;

    /// Whether the device driver exposes the namespace identify operation
    fn supports_identify(&self) -> bool;

    /// Run the identify operation, returning the namespace id or an error code
    fn identify(&self) -> core::result::Result<u32, i32>;
}

/// An open file that may back file chunks
pub trait SourceFile: Send + Sync {
    /// Mode the file was opened with
    fn mode(&self) -> FileMode;

    /// Filesystem identity from the superblock
    fn filesystem(&self) -> FsIdentity;

    /// File size in bytes
    fn size(&self) -> u64;

    /// Filesystem block size
    fn block_size(&self) -> u64;

    /// Block device the filesystem lives on
    fn block_device(&self) -> &dyn BlockDevice;

    /// Look up a page-cache page, taking a reference on it if resident
    fn find_cached_page(&self, index: u64) -> Option<HostPage>;
}

/// Resolves caller file descriptors
pub trait FileTable: Send + Sync {
    /// Take a reference on the file behind `fd`
    fn open(&self, fd: i32) -> Result<Arc<dyn SourceFile>>;
}

/// Filesystem-specific file-page to disk-block translation
pub trait BlockMapper: Send + Sync {
    /// Module currently providing block mapping for `kind`, if loaded
    fn provider(&self, kind: FsKind) -> Option<ModuleId>;

    /// On-disk block backing page `index` of `file`
    fn resolve_block(&self, file: &dyn SourceFile, index: u64) -> Result<u64>;
}

// =============================================================================
// TRANSFER CHANNELS
// =============================================================================

/// Source side of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Host memory (pinned user pages or page cache) to GPU
    Memory,
    /// NVMe storage to GPU
    Storage,
}

/// One copy submitted to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRequest {
    /// Source: a DMA address for memory, a byte address on disk for storage
    pub src: u64,
    /// Destination GPU physical address
    pub dst: PhysAddr,
    /// Bytes to copy
    pub length: u64,
}

/// Completion continuation handed to a channel with each submission
///
/// It runs exactly once: when [`CopyCompletion::complete`] is called, or
/// when the token is dropped without being completed.
pub struct CopyCompletion {
    on_complete: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CopyCompletion {
    /// Wrap a continuation
    pub fn new(on_complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Signal completion
    pub fn complete(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(f) = self.on_complete.take() {
            f();
        }
    }
}

impl Drop for CopyCompletion {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for CopyCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyCompletion")
            .field("pending", &self.on_complete.is_some())
            .finish()
    }
}

/// Asynchronous DMA channel
pub trait TransferChannel: Send + Sync {
    /// Queue a copy; `done` must be completed (or dropped) once it finishes
    ///
    /// On error the channel drops `done`, which counts as completion.
    fn submit_copy(&self, request: CopyRequest, done: CopyCompletion) -> Result<()>;
}

// =============================================================================
// TESTS
// =============================================================================
