//! # Test Doubles
//!
//! In-memory collaborators for exercising the registries and the copy engine
//! without a GPU or an NVMe device. Enabled by the `testing` feature.
//!
//! Geometry of the doubles:
//! - GPU page `i` of every pin lives at `phys_base + i * phys_stride`; the
//!   default stride is twice the page size so neighbouring pages are never
//!   physically contiguous.
//! - A host page at user address `a` has DMA address `dma_offset + a`, so a
//!   contiguous user buffer is DMA-contiguous unless [`MockHostMemory::scattered`]
//!   is used.
//! - Page-cache page `i` of a file has DMA address `cache_dma_base + i * page`.
//! - File page `i` lives on disk block `base_block + i`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::env::StromEnv;
use crate::error::{Error, Result};
use crate::traits::*;
use crate::types::*;

/// Module id the mock mapper reports for ext4
pub const EXT4_MODULE: ModuleId = ModuleId(0xE4);
/// Module id the mock mapper reports for XFS
pub const XFS_MODULE: ModuleId = ModuleId(0x5F5);
/// Error code the mocks use for injected collaborator failures
pub const MOCK_EIO: i32 = -5;

// =============================================================================
// GPU PAGER
// =============================================================================

#[derive(Debug, Default)]
struct PagerState {
    fail_next: Option<Error>,
    revoke_next: bool,
    notices: Vec<(GpuAddr, EvictionNotice)>,
    pinned: Vec<GpuAddr>,
    unpins: Vec<(GpuAddr, TeardownCause)>,
}

/// Scripted GPU pager
#[derive(Debug)]
pub struct MockPager {
    page_size: u32,
    phys_base: u64,
    phys_stride: u64,
    state: Mutex<PagerState>,
}

impl MockPager {
    /// Pager reporting `page_size` pages
    pub fn new(page_size: GpuPageSize) -> Self {
        Self {
            page_size: page_size.raw(),
            phys_base: 0x40_0000_0000,
            phys_stride: page_size.bytes() * 2,
            state: Mutex::new(PagerState::default()),
        }
    }

    /// Pager reporting an arbitrary raw page-size code (64 KiB layout)
    pub fn with_raw_page_size(code: u32) -> Self {
        let mut pager = Self::new(GpuPageSize::Size64K);
        pager.page_size = code;
        pager
    }

    /// Override the physical page layout
    pub fn with_layout(mut self, base: u64, stride: u64) -> Self {
        self.phys_base = base;
        self.phys_stride = stride;
        self
    }

    /// Physical address the pager hands out for page `index`
    pub fn page_phys(&self, index: u64) -> PhysAddr {
        PhysAddr::new(self.phys_base + index * self.phys_stride)
    }

    /// Make the next pin fail
    pub fn fail_next_pin(&self, error: Error) {
        self.state.lock().fail_next = Some(error);
    }

    /// Fire the eviction notice of the next pin before the pin returns
    pub fn revoke_next_pin(&self) {
        self.state.lock().revoke_next = true;
    }

    /// Revoke the pages pinned at `base`, firing its eviction notice
    pub fn evict(&self, base: GpuAddr) -> bool {
        let notice = {
            let mut state = self.state.lock();
            let position = state.notices.iter().position(|(b, _)| *b == base);
            position.map(|index| state.notices.remove(index).1)
        };
        match notice {
            Some(notice) => {
                notice.fire();
                true
            },
            None => false,
        }
    }

    /// Number of pins not yet unpinned
    pub fn live_pins(&self) -> usize {
        self.state.lock().pinned.len()
    }

    /// Every unpin seen so far
    pub fn unpins(&self) -> Vec<(GpuAddr, TeardownCause)> {
        self.state.lock().unpins.clone()
    }
}

impl GpuPager for MockPager {
    fn pin(&self, base: GpuAddr, length: u64, notice: EvictionNotice) -> Result<RawPageTable> {
        let bytes = GpuPageSize::from_raw(self.page_size).map_or(64 << 10, GpuPageSize::bytes);
        let count = length.div_ceil(bytes);
        let revoked = {
            let mut state = self.state.lock();
            if let Some(error) = state.fail_next.take() {
                return Err(error);
            }
            state.pinned.push(base);
            if core::mem::take(&mut state.revoke_next) {
                Some(notice)
            } else {
                state.notices.push((base, notice));
                None
            }
        };
        if let Some(notice) = revoked {
            notice.fire();
        }
        Ok(RawPageTable {
            version: 0x0001_0000,
            page_size: self.page_size,
            pages: (0..count).map(|i| self.page_phys(i)).collect(),
        })
    }

    fn unpin(&self, base: GpuAddr, _table: &RawPageTable, cause: TeardownCause) -> Result<()> {
        let stale = {
            let mut state = self.state.lock();
            if let Some(index) = state.pinned.iter().position(|b| *b == base) {
                state.pinned.remove(index);
            }
            state.unpins.push((base, cause));
            let position = state.notices.iter().position(|(b, _)| *b == base);
            position.map(|index| state.notices.remove(index))
        };
        drop(stale);
        Ok(())
    }
}

// =============================================================================
// HOST MEMORY
// =============================================================================

#[derive(Debug, Default)]
struct HostState {
    pin_limit: Option<usize>,
    fail_next: Option<Error>,
}

/// Host memory with page accounting and injectable pin failures
#[derive(Debug)]
pub struct MockHostMemory {
    page_size: u64,
    dma_offset: u64,
    scatter: bool,
    live: Arc<AtomicI64>,
    state: Mutex<HostState>,
}

impl MockHostMemory {
    /// Host memory with `page_size` pages
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            dma_offset: 0x8000_0000_0000,
            scatter: false,
            live: Arc::new(AtomicI64::new(0)),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Give every host page a DMA address far from its neighbours
    pub fn scattered(mut self) -> Self {
        self.scatter = true;
        self
    }

    /// Grant at most `max` pages per pin call (partial pinning)
    pub fn limit_pins(&self, max: usize) {
        self.state.lock().pin_limit = Some(max);
    }

    /// Make the next pin call fail outright
    pub fn fail_next(&self, error: Error) {
        self.state.lock().fail_next = Some(error);
    }

    /// DMA address of user address `addr`
    pub fn dma_of(&self, addr: u64) -> u64 {
        if self.scatter {
            let frame = addr / self.page_size;
            self.dma_offset + frame * self.page_size * 2 + addr % self.page_size
        } else {
            self.dma_offset + addr
        }
    }

    /// Page references currently held (pins plus page-cache lookups)
    pub fn live_pages(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Shared reference counter for page-cache lookups
    pub fn ledger(&self) -> Arc<AtomicI64> {
        self.live.clone()
    }
}

impl HostMemory for MockHostMemory {
    fn pin_user_pages(&self, addr: u64, count: usize) -> Result<Vec<HostPage>> {
        let granted = {
            let mut state = self.state.lock();
            if let Some(error) = state.fail_next.take() {
                return Err(error);
            }
            state.pin_limit.map_or(count, |max| max.min(count))
        };
        let pages = (0..granted as u64)
            .map(|i| {
                let page_addr = addr + i * self.page_size;
                HostPage {
                    dma: DmaAddr::new(self.dma_of(page_addr)),
                }
            })
            .collect();
        self.live.fetch_add(granted as i64, Ordering::SeqCst);
        Ok(pages)
    }

    fn release_pages(&self, pages: &[HostPage]) {
        self.live.fetch_sub(pages.len() as i64, Ordering::SeqCst);
    }
}

// =============================================================================
// FILES
// =============================================================================

/// Block device double
#[derive(Debug, Clone)]
pub struct MockBlockDevice {
    /// Major number
    pub major: u32,
    /// Disk name
    pub name: String,
    /// Identify outcome, `None` if the operation is missing
    pub identify: Option<core::result::Result<u32, i32>>,
}

impl MockBlockDevice {
    /// A healthy NVMe namespace
    pub fn nvme(name: &str) -> Self {
        Self {
            major: 259,
            name: name.into(),
            identify: Some(Ok(1)),
        }
    }
}

impl BlockDevice for MockBlockDevice {
    fn major(&self) -> u32 {
        self.major
    }

    fn disk_name(&self) -> &str {
        &self.name
    }

    fn supports_identify(&self) -> bool {
        self.identify.is_some()
    }

    fn identify(&self) -> core::result::Result<u32, i32> {
        self.identify.unwrap_or(Err(-25))
    }
}

/// File double with page-cache residency
#[derive(Debug)]
pub struct MockFile {
    mode: FileMode,
    fs: FsIdentity,
    size: u64,
    block_size: u64,
    device: MockBlockDevice,
    page_size: u64,
    resident: BTreeSet<u64>,
    cache_dma_base: u64,
    ledger: Option<Arc<AtomicI64>>,
}

impl MockFile {
    /// Readable ext4 file of `size` bytes on `nvme0n1`
    pub fn ext4(size: u64) -> Self {
        Self {
            mode: FileMode::READ,
            fs: FsIdentity {
                magic: FsKind::Ext4.magic(),
                name: FsKind::Ext4.name().into(),
                owner: Some(EXT4_MODULE),
            },
            size,
            block_size: 4096,
            device: MockBlockDevice::nvme("nvme0n1"),
            page_size: 4096,
            resident: BTreeSet::new(),
            cache_dma_base: 0xC000_0000_0000,
            ledger: None,
        }
    }

    /// Readable XFS file of `size` bytes on `nvme0n1`
    pub fn xfs(size: u64) -> Self {
        Self::ext4(size).with_filesystem(FsIdentity {
            magic: FsKind::Xfs.magic(),
            name: FsKind::Xfs.name().into(),
            owner: Some(XFS_MODULE),
        })
    }

    /// Override the open mode
    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the filesystem identity
    pub fn with_filesystem(mut self, fs: FsIdentity) -> Self {
        self.fs = fs;
        self
    }

    /// Override the filesystem block size
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Override the block device
    pub fn with_device(mut self, device: MockBlockDevice) -> Self {
        self.device = device;
        self
    }

    /// Mark pages as page-cache resident
    pub fn with_resident(mut self, pages: impl IntoIterator<Item = u64>) -> Self {
        self.resident.extend(pages);
        self
    }

    /// Count page-cache references against a host memory double
    pub fn with_ledger(mut self, ledger: Arc<AtomicI64>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// DMA address of page-cache page `index`
    pub fn cache_dma(&self, index: u64) -> u64 {
        self.cache_dma_base + index * self.page_size
    }
}

impl SourceFile for MockFile {
    fn mode(&self) -> FileMode {
        self.mode
    }

    fn filesystem(&self) -> FsIdentity {
        self.fs.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn block_device(&self) -> &dyn BlockDevice {
        &self.device
    }

    fn find_cached_page(&self, index: u64) -> Option<HostPage> {
        if !self.resident.contains(&index) {
            return None;
        }
        if let Some(ledger) = &self.ledger {
            ledger.fetch_add(1, Ordering::SeqCst);
        }
        Some(HostPage {
            dma: DmaAddr::new(self.cache_dma(index)),
        })
    }
}

/// Descriptor table double
#[derive(Debug, Default)]
pub struct MockFileTable {
    files: Mutex<HashMap<i32, Arc<MockFile>>>,
}

impl MockFileTable {
    /// Install `file` at `fd`
    pub fn insert(&self, fd: i32, file: MockFile) -> Arc<MockFile> {
        let file = Arc::new(file);
        self.files.lock().insert(fd, file.clone());
        file
    }
}

impl FileTable for MockFileTable {
    fn open(&self, fd: i32) -> Result<Arc<dyn SourceFile>> {
        match self.files.lock().get(&fd) {
            Some(file) => Ok(file.clone() as Arc<dyn SourceFile>),
            None => Err(Error::BadDescriptor),
        }
    }
}

/// Block mapper double: page `i` lives on block `base_block + i`
#[derive(Debug)]
pub struct MockBlockMapper {
    providers: Mutex<HashMap<FsKind, ModuleId>>,
    base_block: u64,
    fail_at: Mutex<Option<u64>>,
}

impl MockBlockMapper {
    /// Mapper with both filesystems loaded
    pub fn new() -> Self {
        let mut providers = HashMap::new();
        providers.insert(FsKind::Ext4, EXT4_MODULE);
        providers.insert(FsKind::Xfs, XFS_MODULE);
        Self {
            providers: Mutex::new(providers),
            base_block: 0x1000,
            fail_at: Mutex::new(None),
        }
    }

    /// Pretend the module for `kind` is not loaded
    pub fn unload(&self, kind: FsKind) {
        self.providers.lock().remove(&kind);
    }

    /// Fail resolution of page `index`
    pub fn fail_at(&self, index: u64) {
        *self.fail_at.lock() = Some(index);
    }

    /// Block backing page `index`
    pub fn block_of(&self, index: u64) -> u64 {
        self.base_block + index
    }
}

impl Default for MockBlockMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockMapper for MockBlockMapper {
    fn provider(&self, kind: FsKind) -> Option<ModuleId> {
        self.providers.lock().get(&kind).copied()
    }

    fn resolve_block(&self, _file: &dyn SourceFile, index: u64) -> Result<u64> {
        if *self.fail_at.lock() == Some(index) {
            return Err(Error::DriverError(MOCK_EIO));
        }
        Ok(self.block_of(index))
    }
}

// =============================================================================
// TRANSFER CHANNELS
// =============================================================================

/// When a recording channel completes its submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Inside `submit_copy`
    Immediate,
    /// When the test calls [`RecordingChannel::complete_all`]
    Deferred,
}

/// Ordered log of submissions across channels
pub type Journal = Arc<Mutex<Vec<(ChannelKind, CopyRequest)>>>;

#[derive(Debug, Default)]
struct ChannelState {
    requests: Vec<CopyRequest>,
    pending: Vec<CopyCompletion>,
    attempts: usize,
    fail_at: Option<usize>,
}

/// Channel double that records every request
#[derive(Debug)]
pub struct RecordingChannel {
    kind: ChannelKind,
    mode: CompletionMode,
    journal: Option<Journal>,
    state: Mutex<ChannelState>,
}

impl RecordingChannel {
    /// Channel of `kind` completing per `mode`
    pub fn new(kind: ChannelKind, mode: CompletionMode) -> Self {
        Self {
            kind,
            mode,
            journal: None,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Also append accepted requests to a shared journal
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Reject the submission attempt with this zero-based index
    pub fn fail_at(&self, attempt: usize) {
        self.state.lock().fail_at = Some(attempt);
    }

    /// Accepted requests, in order
    pub fn requests(&self) -> Vec<CopyRequest> {
        self.state.lock().requests.clone()
    }

    /// Submissions not yet completed
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Complete every pending submission, returning how many ran
    pub fn complete_all(&self) -> usize {
        let pending = core::mem::take(&mut self.state.lock().pending);
        let count = pending.len();
        for done in pending {
            done.complete();
        }
        count
    }
}

impl TransferChannel for RecordingChannel {
    fn submit_copy(&self, request: CopyRequest, done: CopyCompletion) -> Result<()> {
        let mut state = self.state.lock();
        let attempt = state.attempts;
        state.attempts += 1;
        if state.fail_at == Some(attempt) {
            drop(state);
            drop(done);
            return Err(Error::DriverError(MOCK_EIO));
        }
        state.requests.push(request);
        if let Some(journal) = &self.journal {
            journal.lock().push((self.kind, request));
        }
        match self.mode {
            CompletionMode::Immediate => {
                drop(state);
                done.complete();
            },
            CompletionMode::Deferred => state.pending.push(done),
        }
        Ok(())
    }
}

// =============================================================================
// ENVIRONMENT
// =============================================================================

/// A complete set of doubles
#[derive(Debug)]
pub struct MockEnv {
    /// GPU pager
    pub pager: Arc<MockPager>,
    /// Host memory
    pub host: Arc<MockHostMemory>,
    /// Descriptor table
    pub files: Arc<MockFileTable>,
    /// Block mapper
    pub blocks: Arc<MockBlockMapper>,
    /// Memory channel
    pub memory: Arc<RecordingChannel>,
    /// Storage channel
    pub storage: Arc<RecordingChannel>,
    /// Submissions on both channels, in order
    pub journal: Journal,
}

impl MockEnv {
    /// Doubles whose channels complete inside `submit_copy`
    pub fn new(page_size: GpuPageSize) -> Self {
        Self::with_mode(page_size, CompletionMode::Immediate)
    }

    /// Doubles whose channels complete only on demand
    pub fn deferred(page_size: GpuPageSize) -> Self {
        Self::with_mode(page_size, CompletionMode::Deferred)
    }

    /// Doubles using `mode` for both channels
    pub fn with_mode(page_size: GpuPageSize, mode: CompletionMode) -> Self {
        Self::with_parts(MockPager::new(page_size), MockHostMemory::new(4096), mode)
    }

    /// Doubles built around a custom pager and host memory
    pub fn with_parts(pager: MockPager, host: MockHostMemory, mode: CompletionMode) -> Self {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        Self {
            pager: Arc::new(pager),
            host: Arc::new(host),
            files: Arc::default(),
            blocks: Arc::default(),
            memory: Arc::new(
                RecordingChannel::new(ChannelKind::Memory, mode).with_journal(journal.clone()),
            ),
            storage: Arc::new(
                RecordingChannel::new(ChannelKind::Storage, mode).with_journal(journal.clone()),
            ),
            journal,
        }
    }

    /// Install a file whose page-cache hits are counted by the host double
    pub fn add_file(&self, fd: i32, file: MockFile) -> Arc<MockFile> {
        self.files.insert(fd, file.with_ledger(self.host.ledger()))
    }

    /// Ordered submissions on both channels
    pub fn submissions(&self) -> Vec<(ChannelKind, CopyRequest)> {
        self.journal.lock().clone()
    }

    /// Complete everything pending on both channels
    pub fn complete_all(&self) -> usize {
        self.memory.complete_all() + self.storage.complete_all()
    }

    /// Collaborator bundle over these doubles
    pub fn env(&self) -> StromEnv {
        StromEnv {
            pager: self.pager.clone(),
            host: self.host.clone(),
            files: self.files.clone(),
            blocks: self.blocks.clone(),
            memory_channel: self.memory.clone(),
            storage_channel: self.storage.clone(),
        }
    }
}
