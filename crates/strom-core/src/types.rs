//! # STROM Core Types
//!
//! Strongly typed addresses and identifiers.
//!
//! Three address spaces meet in a transfer and must never be mixed up:
//! - [`GpuAddr`]: a GPU virtual address supplied by the caller
//! - [`PhysAddr`]: a GPU physical page address from the pinned page table
//! - [`DmaAddr`]: a bus address of a pinned host page

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in the caller's GPU virtual address space. Only the pager
/// collaborator can turn it into physical pages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Align down to a power-of-two boundary
    #[inline]
    pub const fn align_down(self, alignment: u64) -> Self {
        Self(self.0 & !(alignment - 1))
    }

    /// Bytes below the given power-of-two boundary
    #[inline]
    pub const fn offset_within(self, alignment: u64) -> u64 {
        self.0 & (alignment - 1)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#016x}", self.0)
    }
}

// =============================================================================
// PHYSICAL ADDRESS (device pages)
// =============================================================================

/// GPU physical page address, the destination of every transfer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#016x}", self.0)
    }
}

// =============================================================================
// DMA ADDRESS (host pages)
// =============================================================================

/// Bus address of a pinned host page
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DmaAddr(u64);

impl DmaAddr {
    /// Create a new DMA address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaAddr(0x{:016x})", self.0)
    }
}

// =============================================================================
// PROCESS IDENTITY
// =============================================================================

/// Identity of the process that requested an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// GPU PAGE SIZE
// =============================================================================

/// Device page granularities the pager may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GpuPageSize {
    /// 4 KiB device pages
    Size4K = 0,
    /// 64 KiB device pages
    Size64K = 1,
    /// 128 KiB device pages
    Size128K = 2,
}

impl GpuPageSize {
    /// Decode the pager's raw page-size code
    pub const fn from_raw(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Size4K),
            1 => Some(Self::Size64K),
            2 => Some(Self::Size128K),
            _ => None,
        }
    }

    /// Raw page-size code
    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Page size in bytes
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 4 << 10,
            Self::Size64K => 64 << 10,
            Self::Size128K => 128 << 10,
        }
    }
}

impl fmt::Display for GpuPageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}K", self.bytes() >> 10)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque, type-tagged identifier
///
/// The marker keeps mapping handles and task ids from being mixed up.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a handle from its raw id
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({:#x})", core::any::type_name::<T>(), self.id)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.id)
    }
}

/// Marker for mapped GPU memory
#[derive(Debug)]
pub enum MappingMarker {}
/// Marker for DMA tasks
#[derive(Debug)]
pub enum TaskMarker {}

/// Handle to a mapped GPU memory region
pub type MappingHandle = Handle<MappingMarker>;
/// Identifier of an in-flight DMA task
pub type TaskId = Handle<TaskMarker>;

/// Monotonic handle source, starting at 1
pub struct HandleAllocator<T> {
    next: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HandleAllocator<T> {
    /// Create a new allocator
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            _marker: PhantomData,
        }
    }

    /// Allocate the next handle
    pub fn allocate(&self) -> Handle<T> {
        Handle::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl<T> Default for HandleAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleAllocator")
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
