//! # STROM Memory Management
//!
//! Registry of pinned GPU memory regions addressed by opaque handles.
//!
//! ## Region Lifecycle
//!
//! ```text
//!        map()                 acquire() / drop(RegionRef)
//!   ──────────────► ┌────────┐ ◄─────────────────────────► refcount ± 1
//!                   │ LIVE   │
//!                   └───┬────┘
//!   teardown() or       │  removed from its shard first:
//!   eviction notice     │  no new acquire can find it
//!                       ▼
//!                   ┌────────┐  refcount > 0: teardown parks until the
//!                   │DRAINING│  last RegionRef is dropped
//!                   └───┬────┘
//!                       ▼
//!                   unpin + free
//! ```
//!
//! A [`RegionRef`] is the only way to use a region; dropping it releases
//! the reference, so a release can never be forgotten or doubled.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod region;
pub mod registry;
pub mod status;

// Re-exports
pub use region::MappedRegion;
pub use registry::{Mapping, MappingRegistry, RegionInfo, RegionRef, RegistryStats};
pub use status::RegionStatus;
