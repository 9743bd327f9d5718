//! # Configuration
//!
//! Tunables for the registries and the address geometry.

use crate::error::{Error, Result};

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default shard count of the mapping registry
pub const DEFAULT_MAPPING_SHARDS: usize = 48;
/// Default shard count of the task registry
pub const DEFAULT_TASK_SHARDS: usize = 100;
/// Default GPU mapping alignment shift (64 KiB)
pub const DEFAULT_GPU_BOUND_SHIFT: u32 = 16;
/// Default host page size
pub const DEFAULT_HOST_PAGE_SIZE: u64 = 4096;

// =============================================================================
// CONFIG
// =============================================================================

/// STROM configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StromConfig {
    /// Number of independently locked mapping shards
    pub mapping_shards: usize,
    /// Number of independently locked task shards
    pub task_shards: usize,
    /// Virtual addresses are rounded down to `1 << gpu_bound_shift` before pinning
    pub gpu_bound_shift: u32,
    /// Host page size; also the only accepted filesystem block size
    pub host_page_size: u64,
}

impl StromConfig {
    /// Create the default configuration
    pub const fn new() -> Self {
        Self {
            mapping_shards: DEFAULT_MAPPING_SHARDS,
            task_shards: DEFAULT_TASK_SHARDS,
            gpu_bound_shift: DEFAULT_GPU_BOUND_SHIFT,
            host_page_size: DEFAULT_HOST_PAGE_SIZE,
        }
    }

    /// GPU mapping alignment in bytes
    #[inline]
    pub const fn gpu_bound_size(&self) -> u64 {
        1 << self.gpu_bound_shift
    }

    /// Check the configuration for usable values
    pub fn validate(&self) -> Result<()> {
        if self.mapping_shards == 0 || self.task_shards == 0 {
            log::error!("strom: shard counts must be non-zero");
            return Err(Error::InvalidArgument);
        }
        if !(12..=30).contains(&self.gpu_bound_shift) {
            log::error!("strom: gpu_bound_shift {} out of range", self.gpu_bound_shift);
            return Err(Error::InvalidArgument);
        }
        if !self.host_page_size.is_power_of_two() {
            log::error!("strom: host page size {} is not a power of two", self.host_page_size);
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for StromConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
