//! # STROM Core
//!
//! Foundational types, errors and collaborator contracts for the STROM
//! SSD-to-GPU direct transfer core.
//!
//! Nothing in this crate touches hardware. The GPU pager, host memory
//! pinning, the filesystem block mapper and the two DMA channels are all
//! reached through the traits in [`traits`], bundled together as a
//! [`StromEnv`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       strom-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │  Error / Config     │  │
//! │  │ (GpuPager,  │  │ (GpuAddr,   │  │                     │  │
//! │  │  Channels)  │  │  Handle<T>) │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌─────────────────────────┐  ┌──────────────────────────┐  │
//! │  │  ShardedTable<K, V>     │  │  WaitSlot / Waiter       │  │
//! │  └─────────────────────────┘  └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod env;
pub mod error;
pub mod shard;
pub mod sync;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports for convenience
pub use config::StromConfig;
pub use env::StromEnv;
pub use error::{Error, Result, UnsupportedReason};
pub use traits::*;
pub use types::*;
