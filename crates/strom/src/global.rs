//! # Process-Wide Instance
//!
//! At most one [`Strom`] per process, created by [`init`] and dropped by
//! [`shutdown`] once nothing is mapped or in flight.

use std::sync::Arc;

use spin::RwLock;
use strom_core::{Error, Result, StromConfig, StromEnv};

use crate::instance::Strom;

static INSTANCE: RwLock<Option<Arc<Strom>>> = RwLock::new(None);

/// Create the process-wide instance
///
/// Fails with `Busy` if one already exists.
pub fn init(config: StromConfig, env: StromEnv) -> Result<Arc<Strom>> {
    let mut guard = INSTANCE.write();
    if guard.is_some() {
        log::error!("strom: already initialized");
        return Err(Error::Busy);
    }
    let strom = Arc::new(Strom::new(config, env)?);
    *guard = Some(strom.clone());
    Ok(strom)
}

/// The process-wide instance
pub fn get() -> Result<Arc<Strom>> {
    INSTANCE.read().clone().ok_or(Error::NotInitialized)
}

/// Whether [`init`] has run without a matching [`shutdown`]
pub fn is_initialized() -> bool {
    INSTANCE.read().is_some()
}

/// Drop the process-wide instance
///
/// Fails with `Busy` while any region is mapped or any task is in flight.
pub fn shutdown() -> Result<()> {
    let mut guard = INSTANCE.write();
    let Some(strom) = guard.as_ref() else {
        return Err(Error::NotInitialized);
    };
    if !strom.is_idle() {
        log::warn!(
            "strom: shutdown refused with {} regions and {} tasks live",
            strom.mappings().len(),
            strom.tasks().len()
        );
        return Err(Error::Busy);
    }
    *guard = None;
    log::info!("strom: shut down");
    Ok(())
}
