//! # STROM DMA
//!
//! Storage admission, transfer tasks and the scatter-gather copy engine.
//!
//! ## Task Flow
//!
//! ```text
//!   MemcpyRequest
//!        │ validate chunks, acquire region, check window
//!        │ open + admit source file (ext4/XFS on NVMe)
//!        ▼
//!   TaskRegistry::admit ──► Task registered (outstanding = 1)
//!        │
//!        ▼
//!   CopyEngine::launch ──► runs submitted on Memory / Storage channels
//!        │
//!        ▼
//!   last completion ──► cleanup: release region, file, pages; wake waiter
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod chunk;
pub mod engine;
pub mod registry;
pub mod task;

// Re-exports
pub use chunk::{Chunk, CHUNK_TAG_FILE, CHUNK_TAG_MEMORY};
pub use engine::{CopyEngine, PageLocation, PageProbe, TransferRun};
pub use registry::{MemcpyRequest, TaskRegistry, TaskStats};
pub use task::Task;
