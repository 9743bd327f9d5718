//! # Copy Cursor
//!
//! Merges source units into the fewest transfer runs that never cross a
//! device page-table boundary.
//!
//! ```text
//!  destination pages:  |   P0 (64K)   |   P1 (64K)   |   P2 (64K)   |
//!  units (4K each):      u u u u u u u u u u u u u u u u u u u u ...
//!                      └──── run 0 ───┘└─── run 1 ───┘└─── run 2 ...
//!                                     ▲ boundary: flush, rebind to P1
//! ```
//!
//! A run is flushed when:
//! - the next unit's source does not continue the pending run (this
//!   includes a change of channel),
//! - the destination reaches a page boundary; a unit straddling the
//!   boundary is split there and the remainder starts a new run bound to
//!   the next physical page,
//! - the input ends.

use strom_core::{ChannelKind, Error, PhysAddr, Result};
use strom_mem::MappedRegion;

use super::resolve::SourceUnit;

// =============================================================================
// DESTINATION LAYOUT
// =============================================================================

/// Page-table geometry of a destination region
#[derive(Debug, Clone, Copy)]
pub struct DestinationLayout<'a> {
    page_size: u64,
    pages: &'a [PhysAddr],
}

impl<'a> DestinationLayout<'a> {
    /// Layout over an explicit page table
    pub fn new(page_size: u64, pages: &'a [PhysAddr]) -> Self {
        Self { page_size, pages }
    }

    /// Layout of a mapped region
    pub fn of(region: &'a MappedRegion) -> Self {
        Self::new(region.page_size().bytes(), region.pages())
    }

    /// Physical address of region position `pos`
    pub fn phys_at(&self, pos: u64) -> Option<PhysAddr> {
        let index = usize::try_from(pos / self.page_size).ok()?;
        self.pages.get(index).map(|p| p.offset(pos % self.page_size))
    }

    /// First page boundary strictly after `pos`
    pub fn boundary_after(&self, pos: u64) -> u64 {
        (pos / self.page_size + 1) * self.page_size
    }
}

// =============================================================================
// TRANSFER RUN
// =============================================================================

/// One submission: contiguous on both sides, inside one destination page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRun {
    /// Channel to submit on
    pub channel: ChannelKind,
    /// Channel source address
    pub src: u64,
    /// Destination physical address
    pub dst: PhysAddr,
    /// Region position of `dst`
    pub position: u64,
    /// Bytes
    pub length: u64,
}

impl TransferRun {
    fn continues(&self, channel: ChannelKind, src: u64) -> bool {
        self.channel == channel && self.src + self.length == src
    }
}

// =============================================================================
// CURSOR
// =============================================================================

/// Streaming run builder; each flushed run goes to the sink immediately
pub struct CopyCursor<'a, F> {
    layout: DestinationLayout<'a>,
    position: u64,
    pending: Option<TransferRun>,
    sink: F,
}

impl<'a, F> CopyCursor<'a, F>
where
    F: FnMut(TransferRun) -> Result<()>,
{
    /// Start writing at region position `start`
    pub fn new(layout: DestinationLayout<'a>, start: u64, sink: F) -> Self {
        Self {
            layout,
            position: start,
            pending: None,
            sink,
        }
    }

    /// Region position the next byte lands at
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Feed the next source unit
    pub fn push(&mut self, unit: SourceUnit) -> Result<()> {
        let mut src = unit.src;
        let mut remaining = unit.length;

        while remaining > 0 {
            let boundary = self.layout.boundary_after(self.position);
            let span = remaining.min(boundary - self.position);

            if !matches!(&self.pending, Some(run) if run.continues(unit.channel, src)) {
                self.flush()?;
            }
            match self.pending.as_mut() {
                Some(run) => run.length += span,
                None => {
                    let dst = self.layout.phys_at(self.position).ok_or_else(|| {
                        log::error!(
                            "strom: destination position {:#x} outside the page table",
                            self.position
                        );
                        Error::InvalidArgument
                    })?;
                    self.pending = Some(TransferRun {
                        channel: unit.channel,
                        src,
                        dst,
                        position: self.position,
                        length: span,
                    });
                },
            }

            self.position += span;
            src += span;
            remaining -= span;
            if self.position == boundary {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Flush the last pending run
    pub fn finish(mut self) -> Result<()> {
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(run) => (self.sink)(run),
            None => Ok(()),
        }
    }
}

/// Plan every run for `units` written from region position `start`
pub fn plan_runs(
    layout: DestinationLayout<'_>,
    start: u64,
    units: impl IntoIterator<Item = SourceUnit>,
) -> Result<Vec<TransferRun>> {
    let mut runs = Vec::new();
    let mut cursor = CopyCursor::new(layout, start, |run| {
        runs.push(run);
        Ok(())
    });
    for unit in units {
        cursor.push(unit)?;
    }
    cursor.finish()?;
    Ok(runs)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KIB: u64 = 1024;

    fn pages(count: u64, page_size: u64) -> Vec<PhysAddr> {
        // Reverse order keeps neighbouring pages physically apart.
        (0..count)
            .map(|i| PhysAddr::new(0x100_0000_0000 + (count - i) * page_size * 3))
            .collect()
    }

    fn host_units(src: u64, length: u64, unit: u64) -> Vec<SourceUnit> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < length {
            let len = unit.min(length - pos);
            out.push(SourceUnit {
                channel: ChannelKind::Memory,
                src: src + pos,
                length: len,
            });
            pos += len;
        }
        out
    }

    #[test]
    fn test_boundary_split_example() {
        let table = pages(4, 64 * KIB);
        let layout = DestinationLayout::new(64 * KIB, &table);
        let units = host_units(0x8000_0000, 196_608, 4 * KIB);
        let runs = plan_runs(layout, 61_440, units).unwrap();
        let lengths: Vec<u64> = runs.iter().map(|r| r.length).collect();
        assert_eq!(lengths, vec![4096, 65536, 65536, 61440]);
        assert_eq!(runs[0].dst, table[0].offset(61_440));
        assert_eq!(runs[1].dst, table[1]);
        assert_eq!(runs[3].dst, table[3]);
        assert_eq!(runs[1].src, 0x8000_0000 + 4096);
    }

    #[test]
    fn test_unit_straddling_boundary_is_split() {
        let table = pages(2, 4 * KIB);
        let layout = DestinationLayout::new(4 * KIB, &table);
        let unit = SourceUnit {
            channel: ChannelKind::Storage,
            src: 0x10_0000,
            length: 4 * KIB,
        };
        let runs = plan_runs(layout, 1024, [unit]).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].length, runs[0].dst), (3 * KIB, table[0].offset(1024)));
        assert_eq!((runs[1].length, runs[1].dst), (KIB, table[1]));
        assert_eq!(runs[1].src, 0x10_0000 + 3 * KIB);
    }

    #[test]
    fn test_channel_change_flushes() {
        let table = pages(1, 64 * KIB);
        let layout = DestinationLayout::new(64 * KIB, &table);
        let units = [
            SourceUnit {
                channel: ChannelKind::Memory,
                src: 0x1000,
                length: 4096,
            },
            SourceUnit {
                channel: ChannelKind::Storage,
                src: 0x2000,
                length: 4096,
            },
            SourceUnit {
                channel: ChannelKind::Storage,
                src: 0x3000,
                length: 4096,
            },
        ];
        let runs = plan_runs(layout, 0, units).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].channel, ChannelKind::Memory);
        assert_eq!((runs[1].channel, runs[1].length), (ChannelKind::Storage, 8192));
    }

    #[test]
    fn test_discontiguous_source_flushes() {
        let table = pages(1, 64 * KIB);
        let layout = DestinationLayout::new(64 * KIB, &table);
        let units = [
            SourceUnit {
                channel: ChannelKind::Memory,
                src: 0x1000,
                length: 4096,
            },
            SourceUnit {
                channel: ChannelKind::Memory,
                src: 0x9000,
                length: 4096,
            },
        ];
        let runs = plan_runs(layout, 0, units).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].dst, table[0].offset(4096));
    }

    #[test]
    fn test_run_ending_on_boundary_flushes_eagerly() {
        let table = pages(2, 4 * KIB);
        let layout = DestinationLayout::new(4 * KIB, &table);
        let mut flushed = Vec::new();
        let mut cursor = CopyCursor::new(layout, 0, |run: TransferRun| {
            flushed.push(run.length);
            Ok(())
        });
        cursor.push(host_units(0x1000, 4096, 4096)[0]).unwrap();
        assert_eq!(cursor.position(), 4096);
        cursor.finish().unwrap();
        assert_eq!(flushed, vec![4096]);
    }

    #[test]
    fn test_destination_overflow_rejected() {
        let table = pages(1, 4 * KIB);
        let layout = DestinationLayout::new(4 * KIB, &table);
        let result = plan_runs(layout, 0, host_units(0, 8 * KIB, 4 * KIB));
        assert_eq!(result, Err(Error::InvalidArgument));
    }

    #[test]
    fn test_sink_error_stops_planning() {
        let table = pages(4, 4 * KIB);
        let layout = DestinationLayout::new(4 * KIB, &table);
        let mut calls = 0;
        let mut cursor = CopyCursor::new(layout, 0, |_| {
            calls += 1;
            Err(Error::DriverError(-5))
        });
        let result = host_units(0, 16 * KIB, 4 * KIB)
            .into_iter()
            .try_for_each(|unit| cursor.push(unit));
        assert_eq!(result, Err(Error::DriverError(-5)));
        drop(cursor);
        assert_eq!(calls, 1);
    }

    fn arb_units() -> impl Strategy<Value = Vec<SourceUnit>> {
        prop::collection::vec((any::<bool>(), any::<bool>(), 1u64..20_000), 1..24)
            .prop_map(|specs| {
                let mut src = 0x1_0000_0000u64;
                specs
                    .into_iter()
                    .map(|(storage, jump, length)| {
                        if jump {
                            src += 0x10_0000;
                        }
                        let unit = SourceUnit {
                            channel: if storage {
                                ChannelKind::Storage
                            } else {
                                ChannelKind::Memory
                            },
                            src,
                            length,
                        };
                        src += length;
                        unit
                    })
                    .collect()
            })
    }

    proptest! {
        #[test]
        fn test_runs_tile_destination(
            units in arb_units(),
            code in 0u32..3,
            start in 0u64..200_000,
        ) {
            let page_size = strom_core::GpuPageSize::from_raw(code).unwrap().bytes();
            let total: u64 = units.iter().map(|u| u.length).sum();
            let table = pages((start + total).div_ceil(page_size) + 1, page_size);
            let layout = DestinationLayout::new(page_size, &table);
            let runs = plan_runs(layout, start, units.clone()).unwrap();

            // Runs tile [start, start + total) in order, without gaps or overlaps.
            let mut expected = start;
            for run in &runs {
                prop_assert!(run.length > 0);
                prop_assert_eq!(run.position, expected);
                expected += run.length;

                // No run crosses a page boundary.
                let page = run.position / page_size;
                prop_assert_eq!((run.position + run.length - 1) / page_size, page);
                prop_assert_eq!(run.dst, layout.phys_at(run.position).unwrap());
            }
            prop_assert_eq!(expected, start + total);

            // Source bytes are preserved in order.
            let mut src_bytes = units.iter().map(|u| (u.channel, u.src, u.length));
            let mut current = src_bytes.next();
            for run in &runs {
                let mut left = run.length;
                let mut src = run.src;
                while left > 0 {
                    let (channel, unit_src, unit_len) = current.unwrap();
                    prop_assert_eq!(channel, run.channel);
                    prop_assert_eq!(src, unit_src);
                    let take = left.min(unit_len);
                    left -= take;
                    src += take;
                    current = if take == unit_len {
                        src_bytes.next()
                    } else {
                        Some((channel, unit_src + take, unit_len - take))
                    };
                }
            }
            prop_assert!(current.is_none());
        }
    }
}
