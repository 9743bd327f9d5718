//! Source resolution: turn chunks into channel-addressed units.
//!
//! Host chunks are pinned page by page. File chunks are probed in the page
//! cache first; resident pages go to the memory channel, everything else is
//! translated to a disk block and goes to the storage channel.

use core::fmt;
use std::sync::Arc;

use strom_core::{
    ChannelKind, DmaAddr, Error, HostMemory, HostPage, Result, SourceFile, StromEnv,
};

use crate::chunk::Chunk;

// =============================================================================
// SOURCE UNIT
// =============================================================================

/// A contiguous source range no larger than one host page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceUnit {
    /// Channel that can read the source
    pub channel: ChannelKind,
    /// Channel source address
    pub src: u64,
    /// Bytes
    pub length: u64,
}

// =============================================================================
// PINNED PAGES
// =============================================================================

/// Host page references released on drop
pub struct PinnedPages {
    host: Arc<dyn HostMemory>,
    pages: Vec<HostPage>,
}

impl PinnedPages {
    /// Take ownership of page references obtained from `host`
    pub fn new(host: Arc<dyn HostMemory>, pages: Vec<HostPage>) -> Self {
        Self { host, pages }
    }

    /// Add one more page reference
    pub fn push(&mut self, page: HostPage) {
        self.pages.push(page);
    }

    /// Held pages
    pub fn pages(&self) -> &[HostPage] {
        &self.pages
    }

    /// Number of held pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no page is held
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            self.host.release_pages(&self.pages);
        }
    }
}

impl fmt::Debug for PinnedPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedPages").field("pages", &self.pages.len()).finish()
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

pub(crate) struct Resolver<'a> {
    env: &'a StromEnv,
    file: Option<&'a dyn SourceFile>,
    page_size: u64,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(env: &'a StromEnv, file: Option<&'a dyn SourceFile>, page_size: u64) -> Self {
        Self {
            env,
            file,
            page_size,
        }
    }

    /// Resolve every chunk; page references taken so far land in `pins`
    pub(crate) fn resolve(
        &self,
        chunks: &[Chunk],
        pins: &mut Vec<PinnedPages>,
    ) -> Result<Vec<SourceUnit>> {
        let mut units = Vec::new();
        for chunk in chunks {
            match *chunk {
                Chunk::HostMemory { addr, length } => {
                    self.resolve_host(addr, length, &mut units, pins)?
                },
                Chunk::FileOffset { offset, length } => {
                    self.resolve_file(offset, length, &mut units, pins)?
                },
            }
        }
        Ok(units)
    }

    fn resolve_host(
        &self,
        addr: u64,
        length: u64,
        units: &mut Vec<SourceUnit>,
        pins: &mut Vec<PinnedPages>,
    ) -> Result<()> {
        let page = self.page_size;
        let end = addr.checked_add(length).ok_or(Error::BadAddress)?;
        let first = addr & !(page - 1);
        let count = usize::try_from((end - first).div_ceil(page)).map_err(|_| Error::BadAddress)?;

        let pinned = PinnedPages::new(
            self.env.host.clone(),
            self.env.host.pin_user_pages(first, count)?,
        );
        if pinned.len() < count {
            log::error!(
                "strom: pinned {} of {} host pages at {:#x}",
                pinned.len(),
                count,
                first
            );
            return Err(Error::BadAddress);
        }

        let mut pos = addr;
        for host_page in pinned.pages().iter().take(count) {
            let within = pos % page;
            let span = (page - within).min(end - pos);
            units.push(SourceUnit {
                channel: ChannelKind::Memory,
                src: host_page.dma.raw() + within,
                length: span,
            });
            pos += span;
        }
        pins.push(pinned);
        Ok(())
    }

    fn resolve_file(
        &self,
        offset: u64,
        length: u64,
        units: &mut Vec<SourceUnit>,
        pins: &mut Vec<PinnedPages>,
    ) -> Result<()> {
        let Some(file) = self.file else {
            log::error!("strom: file chunk without a file descriptor");
            return Err(Error::BadDescriptor);
        };
        let page = self.page_size;
        let block_size = file.block_size();
        let end = offset.checked_add(length).ok_or(Error::InvalidArgument)?;
        let mut cached = PinnedPages::new(self.env.host.clone(), Vec::new());

        let mut pos = offset;
        while pos < end {
            let index = pos / page;
            let within = pos % page;
            let span = (page - within).min(end - pos);
            match file.find_cached_page(index) {
                Some(host_page) => {
                    units.push(SourceUnit {
                        channel: ChannelKind::Memory,
                        src: host_page.dma.raw() + within,
                        length: span,
                    });
                    cached.push(host_page);
                },
                None => {
                    let block = self.env.blocks.resolve_block(file, index)?;
                    let src = block
                        .checked_mul(block_size)
                        .and_then(|byte| byte.checked_add(within))
                        .ok_or(Error::InvalidArgument)?;
                    units.push(SourceUnit {
                        channel: ChannelKind::Storage,
                        src,
                        length: span,
                    });
                },
            }
            pos += span;
        }

        if !cached.is_empty() {
            pins.push(cached);
        }
        Ok(())
    }
}

// =============================================================================
// PROBE
// =============================================================================

/// Where a file page would be read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    /// Resident in the page cache
    Cached(DmaAddr),
    /// On disk at this block
    Block(u64),
    /// Block mapping failed with this errno
    Unmapped(i32),
}

/// Location of one file page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProbe {
    /// Page index in the file
    pub index: u64,
    /// Where it lives
    pub location: PageLocation,
}

/// Report where every page of `[offset, offset + length)` lives
///
/// The range is clipped to the file size and each page is handed to `visit`
/// as soon as it is located. Page-cache references taken by the lookup are
/// dropped immediately.
pub fn probe_file<F>(
    env: &StromEnv,
    file: &dyn SourceFile,
    page_size: u64,
    offset: u64,
    length: u64,
    mut visit: F,
) where
    F: FnMut(PageProbe),
{
    let end = offset.saturating_add(length).min(file.size());
    if offset >= end {
        return;
    }
    for index in offset / page_size..end.div_ceil(page_size) {
        let location = match file.find_cached_page(index) {
            Some(page) => {
                env.host.release_pages(&[page]);
                PageLocation::Cached(page.dma)
            },
            None => match env.blocks.resolve_block(file, index) {
                Ok(block) => PageLocation::Block(block),
                Err(e) => PageLocation::Unmapped(e.errno()),
            },
        };
        visit(PageProbe { index, location });
    }
}
