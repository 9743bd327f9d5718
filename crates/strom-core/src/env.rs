//! Collaborator bundle shared by the registries and the copy engine.

use core::fmt;
use std::sync::Arc;

use crate::traits::*;

/// Every external collaborator the core talks to
#[derive(Clone)]
pub struct StromEnv {
    /// GPU page pinning
    pub pager: Arc<dyn GpuPager>,
    /// Host page pinning
    pub host: Arc<dyn HostMemory>,
    /// Descriptor resolution
    pub files: Arc<dyn FileTable>,
    /// File page to disk block translation
    pub blocks: Arc<dyn BlockMapper>,
    /// Host memory to GPU channel
    pub memory_channel: Arc<dyn TransferChannel>,
    /// NVMe to GPU channel
    pub storage_channel: Arc<dyn TransferChannel>,
}

impl StromEnv {
    /// Channel serving `kind`
    pub fn channel(&self, kind: ChannelKind) -> &Arc<dyn TransferChannel> {
        match kind {
            ChannelKind::Memory => &self.memory_channel,
            ChannelKind::Storage => &self.storage_channel,
        }
    }
}

impl fmt::Debug for StromEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StromEnv").finish_non_exhaustive()
    }
}
