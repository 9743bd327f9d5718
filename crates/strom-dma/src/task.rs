//! # DMA Tasks
//!
//! A task owns everything a transfer needs until its last copy completes:
//! the mapping reference, the source file and every pinned page.
//!
//! ## Outstanding Count
//!
//! ```text
//!  admit ──► outstanding = 1  (admission bias)
//!  submit ─► +1 per run handed to a channel
//!  channel completion ─► -1
//!  launch done ─► -1  (bias dropped)
//!                  │
//!                  ▼ reaches 0 exactly once
//!               cleanup(id)
//! ```
//!
//! The bias keeps a fast channel from completing the task while runs are
//! still being planned.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;
use strom_core::shard::ShardedTable;
use strom_core::sync::{self, WaitSlot};
use strom_core::{Error, Result, SourceFile, TaskId};
use strom_mem::{MappedRegion, RegionRef};

use crate::chunk::Chunk;
use crate::engine::PinnedPages;

// =============================================================================
// TASK
// =============================================================================

/// Resources released by cleanup
pub(crate) struct TaskHolds {
    pub(crate) region: RegionRef,
    pub(crate) file: Option<Arc<dyn SourceFile>>,
    pub(crate) pins: Vec<PinnedPages>,
}

#[derive(Default)]
struct TaskState {
    waiter: WaitSlot,
    holds: Option<TaskHolds>,
}

/// One in-flight transfer
pub struct Task {
    id: TaskId,
    chunks: Vec<Chunk>,
    dest_start: u64,
    total_length: u64,
    outstanding: AtomicUsize,
    state: Mutex<TaskState>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        chunks: Vec<Chunk>,
        dest_start: u64,
        total_length: u64,
        holds: TaskHolds,
    ) -> Self {
        Self {
            id,
            chunks,
            dest_start,
            total_length,
            outstanding: AtomicUsize::new(1),
            state: Mutex::new(TaskState {
                waiter: WaitSlot::new(),
                holds: Some(holds),
            }),
        }
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Source chunks, in destination order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Region position receiving the first byte
    pub fn dest_start(&self) -> u64 {
        self.dest_start
    }

    /// Sum of all chunk lengths
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Submissions not yet completed, including the admission bias
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn begin_submission(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true for the call that brings the count to zero
    pub(crate) fn finish_submission(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Destination region and source file, while the task still holds them
    pub(crate) fn targets(&self) -> Option<(Arc<MappedRegion>, Option<Arc<dyn SourceFile>>)> {
        let state = self.state.lock();
        state
            .holds
            .as_ref()
            .map(|holds| (holds.region.shared(), holds.file.clone()))
    }

    /// Keep pinned pages alive until cleanup
    pub(crate) fn retain(&self, pins: Vec<PinnedPages>) {
        let leftover = {
            let mut state = self.state.lock();
            match state.holds.as_mut() {
                Some(holds) => {
                    holds.pins.extend(pins);
                    None
                },
                None => Some(pins),
            }
        };
        drop(leftover);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("chunks", &self.chunks.len())
            .field("total_length", &self.total_length)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

// =============================================================================
// TASK TABLE
// =============================================================================

/// Sharded table of live tasks
pub(crate) struct TaskTable {
    table: ShardedTable<TaskId, Arc<Task>>,
}

impl TaskTable {
    pub(crate) fn new(shards: usize) -> Self {
        Self {
            table: ShardedTable::new(shards),
        }
    }

    pub(crate) fn register(&self, task: Arc<Task>) {
        let id = task.id();
        self.table.lock(&id).insert(id, task);
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.table.lock(&id).contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Park until task `id` is cleaned up; `NotFound` means it already was
    pub(crate) fn wait(&self, id: TaskId) -> Result<()> {
        let shard = self.table.lock(&id);
        let Some(task) = shard.get(&id) else {
            return Err(Error::NotFound);
        };
        let (waiter, token) = sync::current_waiter();
        let displaced = task.state.lock().waiter.install(waiter);
        drop(shard);
        sync::park_and_forward(token, displaced);
        Ok(())
    }

    /// Unregister task `id`, release what it holds, and wake its waiter
    pub(crate) fn cleanup(&self, id: TaskId) -> Result<()> {
        let removed = self.table.lock(&id).remove(&id);
        let Some(task) = removed else {
            log::warn!("strom: cleanup of unknown DMA task {}", id);
            return Err(Error::NotFound);
        };

        let (holds, waiter) = {
            let mut state = task.state.lock();
            (state.holds.take(), state.waiter.take())
        };
        drop(holds);
        if let Some(waiter) = waiter {
            waiter.wake();
        }
        log::debug!("strom: DMA task {} completed", id);
        Ok(())
    }
}

impl fmt::Debug for TaskTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTable").field("table", &self.table).finish()
    }
}
