//! Read-only snapshots of the registry for diagnostics.

use strom_core::{GpuAddr, GpuPageSize, MappingHandle, PhysAddr, Pid};

use crate::registry::MappingRegistry;

/// Point-in-time view of one live region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionStatus {
    /// Region handle
    pub handle: MappingHandle,
    /// Process that mapped it
    pub owner: Pid,
    /// Users at the time of the snapshot
    pub refcount: u32,
    /// Rounded-down base address
    pub base: GpuAddr,
    /// Bytes between `base` and the caller's address
    pub offset: u64,
    /// Requested length
    pub length: u64,
    /// Page-table format version
    pub version: u32,
    /// Device page granularity
    pub page_size: GpuPageSize,
    /// Physical pages, in virtual order
    pub pages: Vec<PhysAddr>,
}

impl MappingRegistry {
    /// Snapshot every live region, ordered by handle
    ///
    /// Each shard is read under its own lock; the snapshot is consistent
    /// per region, not across the whole registry.
    pub fn snapshot(&self) -> Vec<RegionStatus> {
        let mut out = Vec::new();
        self.table().for_each_shard(|_, shard| {
            out.extend(shard.values().map(|region| RegionStatus {
                handle: region.handle(),
                owner: region.owner(),
                refcount: region.refcount(),
                base: region.base(),
                offset: region.offset(),
                length: region.length(),
                version: region.version(),
                page_size: region.page_size(),
                pages: region.pages().to_vec(),
            }));
        });
        out.sort_by_key(|status| status.handle.id());
        out
    }
}
