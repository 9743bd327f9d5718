//! # Strom Instance
//!
//! Wires the mapping registry and the task registry over one set of
//! collaborators.

use core::fmt;
use std::sync::Arc;

use strom_core::{
    GpuAddr, MappingHandle, Pid, Result, StromConfig, StromEnv, TaskId, TeardownCause,
};
use strom_dma::{MemcpyRequest, PageProbe, TaskRegistry, TaskStats};
use strom_mem::{Mapping, MappingRegistry, RegionInfo, RegionStatus, RegistryStats};

use crate::status;

/// One SSD-to-GPU transfer core
pub struct Strom {
    config: StromConfig,
    mappings: Arc<MappingRegistry>,
    tasks: TaskRegistry,
}

impl Strom {
    /// Build a core over `env`
    pub fn new(config: StromConfig, env: StromEnv) -> Result<Self> {
        config.validate()?;
        let mappings = MappingRegistry::new(&config, env.pager.clone());
        let tasks = TaskRegistry::new(&config, env, mappings.clone());
        log::info!(
            "strom: initialized ({} mapping shards, {} task shards, {:#x} byte GPU bound)",
            config.mapping_shards,
            config.task_shards,
            config.gpu_bound_size()
        );
        Ok(Self {
            config,
            mappings,
            tasks,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &StromConfig {
        &self.config
    }

    /// Mapping registry
    pub fn mappings(&self) -> &Arc<MappingRegistry> {
        &self.mappings
    }

    /// Task registry
    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Pin `[vaddr, vaddr + length)` of GPU memory for `caller`
    pub fn map_gpu_memory(&self, caller: Pid, vaddr: u64, length: u64) -> Result<Mapping> {
        self.mappings.map(caller, GpuAddr::new(vaddr), length)
    }

    /// Unpin a mapping, waiting for in-flight users
    pub fn unmap_gpu_memory(&self, handle: MappingHandle) -> Result<()> {
        self.mappings.teardown(handle, TeardownCause::Unmap)
    }

    /// Page table of a mapping, at most `capacity` physical addresses
    pub fn info_gpu_memory(&self, handle: MappingHandle, capacity: usize) -> Result<RegionInfo> {
        self.mappings.info(handle, capacity)
    }

    /// Whether the file behind `fd` may be read by the storage path
    pub fn check_file(&self, fd: i32) -> Result<()> {
        self.tasks.check_file(fd)
    }

    /// Copy and block until the copy completes
    pub fn memcpy_ssd2gpu(&self, request: MemcpyRequest) -> Result<TaskId> {
        self.tasks.memcpy(request)
    }

    /// Copy without waiting
    pub fn memcpy_ssd2gpu_async(&self, request: MemcpyRequest) -> Result<TaskId> {
        self.tasks.admit(request)
    }

    /// Block until task `id` completes
    pub fn memcpy_ssd2gpu_wait(&self, id: TaskId) -> Result<()> {
        self.tasks.wait(id)
    }

    /// Report page-cache residency and block mapping of a file range
    pub fn probe_file<F>(&self, fd: i32, offset: u64, length: u64, visit: F) -> Result<()>
    where
        F: FnMut(PageProbe),
    {
        self.tasks.probe(fd, offset, length, visit)
    }

    /// No region mapped and no task in flight
    pub fn is_idle(&self) -> bool {
        self.mappings.is_empty() && self.tasks.is_empty()
    }

    /// Every live region, ordered by handle
    pub fn snapshot(&self) -> Vec<RegionStatus> {
        self.mappings.snapshot()
    }

    /// Human-readable dump of every live region
    pub fn status_text(&self) -> String {
        status::render(&self.snapshot())
    }

    /// Mapping statistics
    pub fn mapping_stats(&self) -> RegistryStats {
        self.mappings.stats()
    }

    /// Task statistics
    pub fn task_stats(&self) -> TaskStats {
        self.tasks.stats()
    }
}

impl fmt::Debug for Strom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strom")
            .field("config", &self.config)
            .field("mappings", &self.mappings)
            .field("tasks", &self.tasks)
            .finish()
    }
}
