//! # Task Registry
//!
//! Admission, waiting and cleanup of DMA tasks.
//!
//! A task pins one mapping reference from admission until its cleanup; the
//! mapping therefore cannot be torn down underneath an in-flight copy.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strom_core::{
    Error, HandleAllocator, MappingHandle, Result, SourceFile, StromConfig, StromEnv, TaskId,
    TaskMarker,
};
use strom_mem::MappingRegistry;

use crate::admission;
use crate::chunk::{self, Chunk};
use crate::engine::{probe_file, CopyEngine, PageProbe};
use crate::task::{Task, TaskHolds, TaskTable};

/// A storage-to-GPU copy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemcpyRequest {
    /// Destination mapping
    pub handle: MappingHandle,
    /// Source file, required if any chunk is file-backed
    pub fd: Option<i32>,
    /// Bytes past the mapped virtual address where the first chunk lands
    pub offset: u64,
    /// Source chunks, laid out back to back
    pub chunks: Vec<Chunk>,
}

/// Task statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Tasks admitted
    pub admitted: u64,
    /// Requests rejected before registration
    pub rejected: u64,
}

/// Registry of in-flight DMA tasks
pub struct TaskRegistry {
    tasks: Arc<TaskTable>,
    mappings: Arc<MappingRegistry>,
    engine: CopyEngine,
    env: StromEnv,
    ids: HandleAllocator<TaskMarker>,
    page_size: u64,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl TaskRegistry {
    /// Create an empty registry copying into regions of `mappings`
    pub fn new(config: &StromConfig, env: StromEnv, mappings: Arc<MappingRegistry>) -> Self {
        Self {
            tasks: Arc::new(TaskTable::new(config.task_shards)),
            mappings,
            engine: CopyEngine::new(env.clone(), config.host_page_size),
            env,
            ids: HandleAllocator::new(),
            page_size: config.host_page_size,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Run the admission check on the file behind `fd`
    pub fn check_file(&self, fd: i32) -> Result<()> {
        let file = self.env.files.open(fd)?;
        admission::check_file(file.as_ref(), self.page_size, self.env.blocks.as_ref())
    }

    /// Admit a task and start submitting its runs
    ///
    /// Once this returns `Ok`, completion may already have happened.
    pub fn admit(&self, request: MemcpyRequest) -> Result<TaskId> {
        self.prepare(request)
            .map_err(|e| {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                e
            })
            .and_then(|task| {
                let id = task.id();
                self.admitted.fetch_add(1, Ordering::Relaxed);
                self.tasks.register(task.clone());
                log::debug!("strom: DMA task {} admitted", id);
                self.engine.launch(&self.tasks, task).map(|()| id)
            })
    }

    /// Park until task `id` completes; `NotFound` means it already has
    pub fn wait(&self, id: TaskId) -> Result<()> {
        self.tasks.wait(id)
    }

    /// Admit a task and wait for it
    pub fn memcpy(&self, request: MemcpyRequest) -> Result<TaskId> {
        let id = self.admit(request)?;
        match self.wait(id) {
            Ok(()) | Err(Error::NotFound) => Ok(id),
            Err(e) => Err(e),
        }
    }

    /// Unregister task `id` and release everything it holds
    pub fn cleanup(&self, id: TaskId) -> Result<()> {
        self.tasks.cleanup(id)
    }

    /// Whether task `id` is still in flight
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains(id)
    }

    /// Number of in-flight tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is in flight
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Lifetime statistics
    pub fn stats(&self) -> TaskStats {
        TaskStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Report where each page of a file range lives, one page at a time
    pub fn probe<F>(&self, fd: i32, offset: u64, length: u64, visit: F) -> Result<()>
    where
        F: FnMut(PageProbe),
    {
        let file = self.env.files.open(fd)?;
        admission::check_file(file.as_ref(), self.page_size, self.env.blocks.as_ref())?;
        probe_file(&self.env, file.as_ref(), self.page_size, offset, length, visit);
        Ok(())
    }

    fn prepare(&self, request: MemcpyRequest) -> Result<Arc<Task>> {
        let total = chunk::total_length(&request.chunks)?;
        let region = self.mappings.acquire(request.handle)?;
        let dest_start = region.window(request.offset, total)?;

        let file: Option<Arc<dyn SourceFile>> = if chunk::needs_file(&request.chunks) {
            let Some(fd) = request.fd else {
                log::error!("strom: file chunks without a file descriptor");
                return Err(Error::BadDescriptor);
            };
            let file = self.env.files.open(fd)?;
            admission::check_file(file.as_ref(), self.page_size, self.env.blocks.as_ref())?;
            Some(file)
        } else {
            None
        };

        Ok(Arc::new(Task::new(
            self.ids.allocate(),
            request.chunks,
            dest_start,
            total,
            TaskHolds {
                region,
                file,
                pins: Vec::new(),
            },
        )))
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks)
            .field("engine", &self.engine)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PageLocation;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use strom_core::testing::{
        CompletionMode, MockEnv, MockFile, MockHostMemory, MockPager, MOCK_EIO,
    };
    use strom_core::{ChannelKind, GpuAddr, GpuPageSize, Pid, TeardownCause, UnsupportedReason};

    const KIB: u64 = 1024;
    const GPU_VA: u64 = 0x1_0000_0000;
    const HOST_VA: u64 = 0x7000_0000;

    fn setup(mock: &MockEnv) -> (Arc<MappingRegistry>, TaskRegistry) {
        let config = StromConfig::default();
        let env = mock.env();
        let mappings = MappingRegistry::new(&config, env.pager.clone());
        let tasks = TaskRegistry::new(&config, env, mappings.clone());
        (mappings, tasks)
    }

    fn host_request(handle: MappingHandle, offset: u64, length: u64) -> MemcpyRequest {
        MemcpyRequest {
            handle,
            fd: None,
            offset,
            chunks: vec![Chunk::HostMemory {
                addr: HOST_VA,
                length,
            }],
        }
    }

    fn file_request(handle: MappingHandle, fd: i32, length: u64) -> MemcpyRequest {
        MemcpyRequest {
            handle,
            fd: Some(fd),
            offset: 0,
            chunks: vec![Chunk::FileOffset { offset: 0, length }],
        }
    }

    #[test]
    fn test_memcpy_splits_at_gpu_pages() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 256 * KIB).unwrap().handle;

        let id = tasks.memcpy(host_request(handle, 61_440, 196_608)).unwrap();
        assert!(!tasks.contains(id));

        let requests = mock.memory.requests();
        let lengths: Vec<u64> = requests.iter().map(|r| r.length).collect();
        assert_eq!(lengths, vec![4096, 65536, 65536, 61440]);
        assert_eq!(requests[0].dst, mock.pager.page_phys(0).offset(61_440));
        assert_eq!(requests[1].dst, mock.pager.page_phys(1));
        assert_eq!(requests[0].src, mock.host.dma_of(HOST_VA));
        assert!(mock.storage.requests().is_empty());

        assert_eq!(mappings.acquire(handle).unwrap().refcount(), 1);
        assert_eq!(mock.host.live_pages(), 0);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_contiguous_gpu_pages_still_split() {
        let pager = MockPager::new(GpuPageSize::Size64K).with_layout(0x40_0000_0000, 64 * KIB);
        let mock = MockEnv::with_parts(pager, MockHostMemory::new(4096), CompletionMode::Immediate);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 256 * KIB).unwrap().handle;

        tasks.memcpy(host_request(handle, 61_440, 196_608)).unwrap();
        let lengths: Vec<u64> = mock.memory.requests().iter().map(|r| r.length).collect();
        assert_eq!(lengths, vec![4096, 65536, 65536, 61440]);
        assert_eq!(mock.memory.requests()[1].dst, mock.pager.page_phys(1));
    }

    #[test]
    fn test_scattered_host_pages_never_merge() {
        let host = MockHostMemory::new(4096).scattered();
        let mock = MockEnv::with_parts(
            MockPager::new(GpuPageSize::Size64K),
            host,
            CompletionMode::Immediate,
        );
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;

        tasks.memcpy(host_request(handle, 0, 3 * 4096)).unwrap();
        let requests = mock.memory.requests();
        assert_eq!(requests.len(), 3);
        for (i, request) in requests.iter().enumerate() {
            assert_eq!(request.length, 4096);
            assert_eq!(request.src, mock.host.dma_of(HOST_VA + i as u64 * 4096));
        }
    }

    #[test]
    fn test_host_pin_error_registers_nothing() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;
        mock.host.fail_next(Error::OutOfMemory);

        assert_eq!(tasks.admit(host_request(handle, 0, 4096)), Err(Error::OutOfMemory));
        assert!(tasks.is_empty());
        assert!(mock.submissions().is_empty());
        assert_eq!(mappings.snapshot()[0].refcount, 0);
    }

    #[test]
    fn test_async_task_holds_region_until_completion() {
        let mock = MockEnv::deferred(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 128 * KIB).unwrap().handle;

        let id = tasks.admit(host_request(handle, 0, 128 * KIB)).unwrap();
        assert!(tasks.contains(id));
        assert_eq!(mock.memory.pending(), 2);
        assert_eq!(mappings.snapshot()[0].refcount, 1);
        assert_eq!(mock.host.live_pages(), 32);

        assert_eq!(mock.complete_all(), 2);
        assert!(!tasks.contains(id));
        assert_eq!(tasks.wait(id), Err(Error::NotFound));
        assert_eq!(mappings.snapshot()[0].refcount, 0);
        assert_eq!(mock.host.live_pages(), 0);
    }

    #[test]
    fn test_wait_parks_until_completion() {
        let mock = MockEnv::deferred(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let tasks = Arc::new(tasks);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;
        let id = tasks.admit(host_request(handle, 0, 8 * KIB)).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let tasks = tasks.clone();
            thread::spawn(move || {
                let _ = tasks.wait(id);
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        mock.complete_all();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_second_waiter_does_not_strand_first() {
        let mock = MockEnv::deferred(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let tasks = Arc::new(tasks);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;
        let id = tasks.admit(host_request(handle, 0, 4 * KIB)).unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let tasks = tasks.clone();
                thread::spawn(move || {
                    let _ = tasks.wait(id);
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        mock.complete_all();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_file_chunks_route_by_residency() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let file = mock.add_file(5, MockFile::ext4(1 << 20).with_resident([1]));
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;

        tasks.memcpy(file_request(handle, 5, 5 * 4096)).unwrap();

        let kinds: Vec<ChannelKind> = mock.submissions().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![ChannelKind::Storage, ChannelKind::Memory, ChannelKind::Storage]
        );
        let submissions = mock.submissions();
        assert_eq!(submissions[0].1.src, mock.blocks.block_of(0) * 4096);
        assert_eq!(submissions[1].1.src, file.cache_dma(1));
        assert_eq!(submissions[2].1.length, 3 * 4096);
        assert_eq!(submissions[2].1.dst, mock.pager.page_phys(0).offset(2 * 4096));
        assert_eq!(mock.host.live_pages(), 0);
        assert_eq!(Arc::strong_count(&file), 2);
    }

    #[test]
    fn test_unsupported_file_never_submits() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        mock.add_file(5, MockFile::ext4(1 << 20).with_block_size(1024));
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;

        let result = tasks.admit(file_request(handle, 5, 4096));
        assert_eq!(
            result,
            Err(Error::Unsupported(UnsupportedReason::BlockSizeMismatch(1024)))
        );
        assert!(mock.submissions().is_empty());
        assert!(tasks.is_empty());
        assert_eq!(mappings.snapshot()[0].refcount, 0);
        assert_eq!(tasks.stats().rejected, 1);
    }

    #[test]
    fn test_check_file() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (_, tasks) = setup(&mock);
        mock.add_file(5, MockFile::xfs(1 << 20));
        mock.add_file(6, MockFile::ext4(512));
        assert!(tasks.check_file(5).is_ok());
        assert_eq!(
            tasks.check_file(6),
            Err(Error::Unsupported(UnsupportedReason::FileTooSmall(512)))
        );
        assert_eq!(tasks.check_file(7), Err(Error::BadDescriptor));
    }

    #[test]
    fn test_invalid_requests_register_nothing() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;

        let mut zero = host_request(handle, 0, 4096);
        zero.chunks.push(Chunk::HostMemory {
            addr: HOST_VA,
            length: 0,
        });
        assert_eq!(tasks.admit(zero), Err(Error::InvalidArgument));

        let missing = host_request(MappingHandle::new(999), 0, 4096);
        assert_eq!(tasks.admit(missing), Err(Error::NotFound));

        let too_long = host_request(handle, 4096, 64 * KIB);
        assert_eq!(tasks.admit(too_long), Err(Error::InvalidArgument));

        let mut no_fd = file_request(handle, 0, 4096);
        no_fd.fd = None;
        assert_eq!(tasks.admit(no_fd), Err(Error::BadDescriptor));

        assert!(tasks.is_empty());
        assert!(mock.submissions().is_empty());
        assert_eq!(mappings.snapshot()[0].refcount, 0);
    }

    #[test]
    fn test_partial_pin_fails_before_submission() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;
        mock.host.limit_pins(3);

        let mut request = host_request(handle, 0, 4096);
        request.chunks.push(Chunk::HostMemory {
            addr: HOST_VA + 0x10_0000,
            length: 8 * 4096,
        });
        assert_eq!(tasks.admit(request), Err(Error::BadAddress));
        assert!(mock.submissions().is_empty());
        assert!(tasks.is_empty());
        assert_eq!(mock.host.live_pages(), 0);
        assert_eq!(mappings.snapshot()[0].refcount, 0);
    }

    #[test]
    fn test_submission_failure_drains_and_cleans_up() {
        let mock = MockEnv::deferred(GpuPageSize::Size4K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 16 * KIB).unwrap().handle;
        mock.memory.fail_at(2);

        let result = tasks.admit(host_request(handle, 0, 16 * KIB));
        assert_eq!(result, Err(Error::DriverError(MOCK_EIO)));
        assert_eq!(mock.memory.pending(), 2);
        assert_eq!(tasks.len(), 1);

        mock.complete_all();
        assert!(tasks.is_empty());
        assert_eq!(mock.host.live_pages(), 0);
        assert_eq!(mappings.snapshot()[0].refcount, 0);
    }

    #[test]
    fn test_teardown_waits_for_inflight_task() {
        let mock = MockEnv::deferred(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;
        tasks.admit(host_request(handle, 0, 4096)).unwrap();

        let (tx, rx) = mpsc::channel();
        let teardown = {
            let mappings = mappings.clone();
            thread::spawn(move || {
                mappings.teardown(handle, TeardownCause::Unmap).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(mock.pager.live_pins(), 1);

        mock.complete_all();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        teardown.join().unwrap();
        assert_eq!(mock.pager.live_pins(), 0);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_duplicate_cleanup_is_noop() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (mappings, tasks) = setup(&mock);
        let handle = mappings.map(Pid(1), GpuAddr::new(GPU_VA), 64 * KIB).unwrap().handle;
        let id = tasks.admit(host_request(handle, 0, 4096)).unwrap();
        assert_eq!(tasks.cleanup(id), Err(Error::NotFound));
        assert_eq!(tasks.stats().admitted, 1);
    }

    #[test]
    fn test_probe_requires_eligible_file() {
        let mock = MockEnv::new(GpuPageSize::Size64K);
        let (_, tasks) = setup(&mock);
        mock.add_file(5, MockFile::ext4(1 << 20).with_resident([0]));
        let mut probes = Vec::new();
        tasks.probe(5, 0, 8192, |p| probes.push(p)).unwrap();
        assert_eq!(probes.len(), 2);
        assert!(matches!(probes[0].location, PageLocation::Cached(_)));
        mock.add_file(6, MockFile::ext4(1 << 20).with_mode(strom_core::FileMode::WRITE));
        assert_eq!(
            tasks.probe(6, 0, 4096, |_| panic!("ineligible file probed")),
            Err(Error::Unsupported(UnsupportedReason::NoReadPermission))
        );
    }
}
