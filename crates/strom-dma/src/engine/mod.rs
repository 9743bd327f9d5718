//! # Scatter-Gather Copy Engine
//!
//! Drives one task from chunk list to channel submissions.
//!
//! ```text
//!   chunks ──► Resolver ──► SourceUnits ──► CopyCursor ──► TransferRuns
//!               │ pins host pages             │ splits at GPU page
//!               │ probes page cache           │ boundaries, merges
//!               │ maps file blocks            │ contiguous sources
//!               ▼                             ▼
//!           PinnedPages (held by task)    submit on Memory/Storage channel
//! ```
//!
//! Resolution finishes before the first submission, so an admission failure
//! never leaves copies in flight.

mod cursor;
mod resolve;

use core::fmt;
use std::sync::Arc;

use strom_core::{CopyCompletion, CopyRequest, Result, StromEnv};

pub use cursor::{plan_runs, CopyCursor, DestinationLayout, TransferRun};
pub use resolve::{probe_file, PageLocation, PageProbe, PinnedPages, SourceUnit};

use crate::task::{Task, TaskTable};
use resolve::Resolver;

/// Turns tasks into channel submissions
pub struct CopyEngine {
    env: StromEnv,
    page_size: u64,
}

impl CopyEngine {
    /// Engine over `env` with `page_size` host pages
    pub fn new(env: StromEnv, page_size: u64) -> Self {
        Self { env, page_size }
    }

    /// Resolve, plan and submit every run of a registered task
    ///
    /// On a resolution failure the task is cleaned up before returning. On a
    /// submission failure no further runs are issued; runs already in flight
    /// complete and the task is cleaned up by the last of them.
    pub(crate) fn launch(&self, tasks: &Arc<TaskTable>, task: Arc<Task>) -> Result<()> {
        let Some((region, file)) = task.targets() else {
            log::error!("strom: DMA task {} launched after cleanup", task.id());
            return Err(strom_core::Error::NotFound);
        };

        let resolver = Resolver::new(&self.env, file.as_deref(), self.page_size);
        let mut pins = Vec::new();
        let units = match resolver.resolve(task.chunks(), &mut pins) {
            Ok(units) => units,
            Err(e) => {
                log::error!("strom: DMA task {} failed to resolve sources: {}", task.id(), e);
                drop(pins);
                let _ = tasks.cleanup(task.id());
                return Err(e);
            },
        };
        task.retain(pins);
        log::debug!(
            "strom: DMA task {} resolved {} units for {:#x} bytes",
            task.id(),
            units.len(),
            task.total_length()
        );

        let layout = DestinationLayout::of(&region);
        let mut cursor =
            CopyCursor::new(layout, task.dest_start(), |run| self.submit(tasks, &task, run));
        let planned = units
            .into_iter()
            .try_for_each(|unit| cursor.push(unit))
            .and_then(|()| cursor.finish());
        if let Err(e) = &planned {
            log::error!("strom: DMA task {} stopped submitting: {}", task.id(), e);
        }

        // Drop the admission bias.
        if task.finish_submission() {
            let _ = tasks.cleanup(task.id());
        }
        planned
    }

    fn submit(&self, tasks: &Arc<TaskTable>, task: &Arc<Task>, run: TransferRun) -> Result<()> {
        log::trace!(
            "strom: task {} {:?} src={:#x} dst={:#x} len={:#x}",
            task.id(),
            run.channel,
            run.src,
            run.dst.raw(),
            run.length
        );
        task.begin_submission();
        let done = {
            let tasks = tasks.clone();
            let task = task.clone();
            CopyCompletion::new(move || {
                if task.finish_submission() {
                    let _ = tasks.cleanup(task.id());
                }
            })
        };
        let request = CopyRequest {
            src: run.src,
            dst: run.dst,
            length: run.length,
        };
        self.env.channel(run.channel).submit_copy(request, done)
    }
}

impl fmt::Debug for CopyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyEngine")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}
