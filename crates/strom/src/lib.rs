//! # STROM
//!
//! Direct SSD-to-GPU transfer core: pinned GPU mappings, storage admission
//! and a scatter-gather copy engine behind a numeric command interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  command layer (0x80 ..= 0x87)                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                       Strom (one per process)                    │
//! │  ┌─────────────────────┐          ┌───────────────────────────┐  │
//! │  │  MappingRegistry    │◄─────────│  TaskRegistry             │  │
//! │  │  handle → region    │ acquire  │  admission · CopyEngine   │  │
//! │  └─────────────────────┘          └───────────────────────────┘  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  StromEnv: pager · host memory · files · block mapper · channels │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Strom`] can be used directly, or installed once per process with
//! [`init`] and reached through [`get`].

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod global;
pub mod instance;
pub mod status;

// Re-exports
pub use command::{dispatch, execute, Command, CommandCode};
pub use global::{get, init, is_initialized, shutdown};
pub use instance::Strom;
pub use strom_core::{Error, Result, StromConfig, StromEnv};
pub use strom_dma::{Chunk, MemcpyRequest};
