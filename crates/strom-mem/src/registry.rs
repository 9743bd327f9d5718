//! # Mapping Registry
//!
//! Sharded table of pinned GPU regions with reference-counted teardown.
//!
//! Lock order inside one operation: pending-map lock, then shard lock,
//! then the region's usage lock. Unpinning and waking always happen with no
//! lock held.

use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;
use strom_core::shard::ShardedTable;
use strom_core::sync::{self, Waiter};
use strom_core::{
    Error, EvictionNotice, GpuAddr, GpuPageSize, GpuPager, HandleAllocator, MappingHandle,
    MappingMarker, PhysAddr, Pid, Result, StromConfig, TeardownCause,
};

use crate::region::MappedRegion;

// =============================================================================
// STATISTICS
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    mapped: AtomicU64,
    released: AtomicU64,
    evicted: AtomicU64,
}

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Regions mapped since creation
    pub total_mapped: u64,
    /// Regions torn down since creation
    pub total_released: u64,
    /// Teardowns triggered by the pager
    pub evictions: u64,
}

// =============================================================================
// INFO
// =============================================================================

/// Copy of a region's page table, as returned by [`MappingRegistry::info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Region handle
    pub handle: MappingHandle,
    /// Page-table format version
    pub version: u32,
    /// Device page granularity
    pub page_size: GpuPageSize,
    /// Total number of page-table entries
    pub entries: u32,
    /// The first `min(entries, capacity)` physical pages
    pub physical: Vec<PhysAddr>,
}

/// A freshly mapped region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Region handle
    pub handle: MappingHandle,
    /// Device page granularity
    pub page_size: GpuPageSize,
    /// Number of page-table entries
    pub entries: u32,
}

/// A map call between pin and registration
#[derive(Debug)]
struct PendingMap {
    handle: MappingHandle,
    revoked: bool,
}

fn take_pending_locked(pending: &mut Vec<PendingMap>, handle: MappingHandle) -> bool {
    match pending.iter().position(|p| p.handle == handle) {
        Some(index) => pending.swap_remove(index).revoked,
        None => false,
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Registry of pinned GPU regions
pub struct MappingRegistry {
    table: ShardedTable<MappingHandle, Arc<MappedRegion>>,
    pager: Arc<dyn GpuPager>,
    handles: HandleAllocator<MappingMarker>,
    bound: u64,
    counters: Counters,
    pending: Mutex<Vec<PendingMap>>,
}

impl MappingRegistry {
    /// Create an empty registry on top of `pager`
    pub fn new(config: &StromConfig, pager: Arc<dyn GpuPager>) -> Arc<Self> {
        Arc::new(Self {
            table: ShardedTable::new(config.mapping_shards),
            pager,
            handles: HandleAllocator::new(),
            bound: config.gpu_bound_size(),
            counters: Counters::default(),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Pin `[vaddr, vaddr + length)` and register it for `owner`
    pub fn map(self: &Arc<Self>, owner: Pid, vaddr: GpuAddr, length: u64) -> Result<Mapping> {
        if length == 0 || vaddr.raw().checked_add(length).is_none() {
            log::error!("strom: invalid mapping request {} + {:#x}", vaddr, length);
            return Err(Error::InvalidArgument);
        }
        let base = vaddr.align_down(self.bound);
        let offset = vaddr.offset_within(self.bound);
        let mapped_length = offset + length;

        let handle = self.handles.allocate();
        self.pending.lock().push(PendingMap {
            handle,
            revoked: false,
        });
        let table = match self.pager.pin(base, mapped_length, self.eviction_notice(handle)) {
            Ok(table) => table,
            Err(e) => {
                self.take_pending(handle);
                log::error!(
                    "strom: failed to pin GPU memory {}..+{:#x}: {}",
                    base,
                    mapped_length,
                    e
                );
                return Err(e);
            },
        };

        let page_size = match GpuPageSize::from_raw(table.page_size) {
            Some(page_size) => page_size,
            None => {
                log::error!("strom: unknown GPU page size code {}", table.page_size);
                self.take_pending(handle);
                self.rollback(base, &table, TeardownCause::Unmap);
                return Err(Error::InvalidArgument);
            },
        };
        if (table.pages.len() as u64).saturating_mul(page_size.bytes()) < mapped_length {
            log::error!(
                "strom: page table of {} entries does not cover {:#x} bytes",
                table.pages.len(),
                mapped_length
            );
            self.take_pending(handle);
            self.rollback(base, &table, TeardownCause::Unmap);
            return Err(Error::InvalidArgument);
        }

        let mapping = Mapping {
            handle,
            page_size,
            entries: table.pages.len() as u32,
        };
        log::info!(
            "strom: mapped handle={} owner={} version={} page_size={} entries={}",
            handle,
            owner,
            table.version,
            page_size,
            mapping.entries
        );
        for (i, phys) in table.pages.iter().enumerate() {
            log::debug!(
                "strom: V:{:#018x} <--> P:{:#018x}",
                base.raw() + i as u64 * page_size.bytes(),
                phys.raw()
            );
        }

        let region = Arc::new(MappedRegion::new(
            handle,
            owner,
            base,
            offset,
            length,
            page_size,
            table,
        ));
        // Pending lock before shard lock: a notice either sees the handle
        // pending or finds it in its shard.
        let revoked = {
            let mut pending = self.pending.lock();
            let revoked = take_pending_locked(&mut pending, handle);
            if !revoked {
                self.table.lock(&handle).insert(handle, region.clone());
            }
            revoked
        };
        if revoked {
            log::warn!("strom: GPU memory (handle={}) evicted while being mapped", handle);
            self.rollback(base, region.table(), TeardownCause::Evicted);
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            return Err(Error::BadAddress);
        }
        self.counters.mapped.fetch_add(1, Ordering::Relaxed);
        Ok(mapping)
    }

    /// Take a reference on a live region
    pub fn acquire(self: &Arc<Self>, handle: MappingHandle) -> Result<RegionRef> {
        let shard = self.table.lock(&handle);
        match shard.get(&handle) {
            Some(region) => {
                region.usage.lock().refcount += 1;
                Ok(RegionRef {
                    region: region.clone(),
                    registry: self.clone(),
                })
            },
            None => {
                drop(shard);
                log::error!("strom: P2P GPU memory (handle={}) not found", handle);
                Err(Error::NotFound)
            },
        }
    }

    /// Give a reference back
    pub fn release(&self, region: RegionRef) {
        drop(region);
    }

    /// Remove a region and unpin it once its last user is gone
    pub fn teardown(&self, handle: MappingHandle, cause: TeardownCause) -> Result<()> {
        self.remove_and_unpin(handle, cause).map_err(|e| {
            log::error!("strom: P2P GPU memory (handle={}) not found", handle);
            e
        })
    }

    /// Copy out a region's page table, at most `capacity` entries
    pub fn info(self: &Arc<Self>, handle: MappingHandle, capacity: usize) -> Result<RegionInfo> {
        let region = self.acquire(handle)?;
        let pages = region.pages();
        Ok(RegionInfo {
            handle,
            version: region.version(),
            page_size: region.page_size(),
            entries: pages.len() as u32,
            physical: pages[..pages.len().min(capacity)].to_vec(),
        })
    }

    /// Number of live regions
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no region is live
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Lifetime statistics
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_mapped: self.counters.mapped.load(Ordering::Relaxed),
            total_released: self.counters.released.load(Ordering::Relaxed),
            evictions: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn table(&self) -> &ShardedTable<MappingHandle, Arc<MappedRegion>> {
        &self.table
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Notice handed to the pager for `handle`
    ///
    /// The pager may fire it before `map` has registered the region; the
    /// handle is then still pending and `map` performs the teardown.
    fn eviction_notice(self: &Arc<Self>, handle: MappingHandle) -> EvictionNotice {
        let registry = Arc::downgrade(self);
        EvictionNotice::new(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            {
                let mut pending = registry.pending.lock();
                if let Some(entry) = pending.iter_mut().find(|p| p.handle == handle) {
                    entry.revoked = true;
                    return;
                }
            }
            match registry.remove_and_unpin(handle, TeardownCause::Evicted) {
                Ok(()) => {
                    registry.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    log::warn!("strom: GPU memory (handle={}) evicted by the driver", handle);
                },
                Err(_) => log::debug!("strom: eviction of handle={} after release", handle),
            }
        })
    }

    fn take_pending(&self, handle: MappingHandle) -> bool {
        take_pending_locked(&mut self.pending.lock(), handle)
    }

    fn rollback(&self, base: GpuAddr, table: &strom_core::RawPageTable, cause: TeardownCause) {
        if let Err(e) = self.pager.unpin(base, table, cause) {
            log::error!("strom: failed to roll back pin of {}: {}", base, e);
        }
    }

    fn remove_and_unpin(&self, handle: MappingHandle, cause: TeardownCause) -> Result<()> {
        let mut shard = self.table.lock(&handle);
        let region = shard.remove(&handle).ok_or(Error::NotFound)?;
        let parked = {
            let mut usage = region.usage.lock();
            if usage.refcount > 0 {
                let (waiter, token) = sync::current_waiter();
                let displaced = usage.teardown.install(waiter);
                Some((token, displaced))
            } else {
                None
            }
        };
        drop(shard);

        if let Some((token, displaced)) = parked {
            log::debug!("strom: handle={} teardown waits for its users", handle);
            sync::park_and_forward(token, displaced);
        }

        if let Err(e) = self.pager.unpin(region.base(), region.table(), cause) {
            log::error!("strom: failed to unpin GPU memory (handle={}): {}", handle, e);
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        log::info!("strom: released GPU memory (handle={}, cause={:?})", handle, cause);
        Ok(())
    }

    fn put(&self, region: &MappedRegion) {
        let shard = self.table.lock(&region.handle());
        let waiter: Option<Waiter> = {
            let mut usage = region.usage.lock();
            match usage.refcount.checked_sub(1) {
                Some(0) => {
                    usage.refcount = 0;
                    usage.teardown.take()
                },
                Some(n) => {
                    usage.refcount = n;
                    None
                },
                None => {
                    log::error!("strom: refcount underflow on handle={}", region.handle());
                    None
                },
            }
        };
        drop(shard);
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }
}

impl fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingRegistry")
            .field("table", &self.table)
            .field("bound", &self.bound)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// REGION REFERENCE
// =============================================================================

/// A counted reference to a live region; dropping it releases the count
pub struct RegionRef {
    region: Arc<MappedRegion>,
    registry: Arc<MappingRegistry>,
}

impl RegionRef {
    /// Uncounted handle on the region geometry
    ///
    /// Only meaningful while this reference is held; it does not keep the
    /// region registered or pinned.
    pub fn shared(&self) -> Arc<MappedRegion> {
        self.region.clone()
    }
}

impl Deref for RegionRef {
    type Target = MappedRegion;

    fn deref(&self) -> &MappedRegion {
        &self.region
    }
}

impl Drop for RegionRef {
    fn drop(&mut self) {
        self.registry.put(&self.region);
    }
}

impl fmt::Debug for RegionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegionRef").field(&self.region.handle()).finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
