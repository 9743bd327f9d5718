//! Text rendering of the region snapshot.

use core::fmt::Write;

use strom_mem::RegionStatus;

/// First line of every dump
pub const HEADLINE: &str = "# Strom Mapped GPU Memory";

/// Render `regions` one block each, separated by blank lines
pub fn render(regions: &[RegionStatus]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", HEADLINE);
    for region in regions {
        let _ = write_region(&mut out, region);
    }
    out
}

fn write_region(out: &mut String, region: &RegionStatus) -> core::fmt::Result {
    let page_size = region.page_size.bytes();
    writeln!(out, "handle: {}", region.handle)?;
    writeln!(out, "owner: {}", region.owner)?;
    writeln!(out, "refcnt: {}", region.refcount)?;
    writeln!(out, "version: {}", region.version)?;
    writeln!(out, "page_size: {}", page_size)?;
    writeln!(out, "entries: {}", region.pages.len())?;
    for (index, phys) in region.pages.iter().enumerate() {
        let virt = region.base.offset(page_size * index as u64);
        writeln!(out, "PTE: V:{:#x} <--> P:{:#x}", virt.raw(), phys.raw())?;
    }
    writeln!(out)
}
