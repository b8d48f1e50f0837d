//! Range-partition dispatch table.
//!
//! A table partitions the byte range `0..=limit` into sorted, non-overlapping, contiguous
//! entries. Installing a range splits the entries it overlaps, so the partition stays complete
//! after every mutation. Small tables also keep a direct-mapped index per native unit.

use std::cell::Cell;

use crate::fault::ConfigError;
use crate::memory::config::AccessSide;

/// Spaces with at most this many native units get a direct-mapped lookup.
pub const DIRECT_MAP_UNITS: u64 = 1 << 16;

/// One partition entry, in inclusive byte addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEntry<H> {
    /// First byte covered.
    pub start: u64,
    /// Last byte covered.
    pub end: u64,
    /// Byte the handler sees as its offset zero.
    pub origin: u64,
    /// Bound handler.
    pub handler: H,
}

/// Partitioned lookup from byte address to handler.
#[derive(Debug, Clone)]
pub struct DispatchTable<H> {
    limit: u64,
    unit_log2: u32,
    entries: Vec<DispatchEntry<H>>,
    direct: Option<Vec<u32>>,
    last_hit: Cell<usize>,
}

impl<H: Clone> DispatchTable<H> {
    /// Creates a table covering `0..=limit` with a single default entry.
    #[must_use]
    pub fn new(limit: u64, unit_log2: u32, default: H) -> Self {
        let mut table = Self {
            limit,
            unit_log2,
            entries: vec![DispatchEntry {
                start: 0,
                end: limit,
                origin: 0,
                handler: default,
            }],
            direct: None,
            last_hit: Cell::new(0),
        };
        table.rebuild_direct();
        table
    }

    /// Highest byte address covered.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Current partition, in address order.
    #[must_use]
    pub fn entries(&self) -> &[DispatchEntry<H>] {
        &self.entries
    }

    /// Binds `start..=end` to `handler`, splitting whatever it overlaps.
    pub fn install(&mut self, start: u64, end: u64, origin: u64, handler: H) {
        self.install_ranges(&[(start, end, origin)], &handler);
    }

    /// Binds several ranges to clones of one handler, rebuilding the lookup index once.
    pub fn install_ranges(&mut self, ranges: &[(u64, u64, u64)], handler: &H) {
        for &(start, end, origin) in ranges {
            let (first, last) = self.isolate(start, end);
            self.entries.splice(
                first..last,
                std::iter::once(DispatchEntry {
                    start,
                    end,
                    origin,
                    handler: handler.clone(),
                }),
            );
        }
        self.rebuild_direct();
    }

    /// Replaces the handler of every entry inside `start..=end` with `wrap(old)`, keeping each
    /// piece's origin. Entries straddling the bounds are split first.
    pub fn map_range(&mut self, start: u64, end: u64, mut wrap: impl FnMut(&H) -> H) {
        let (first, last) = self.isolate(start, end);
        for entry in &mut self.entries[first..last] {
            entry.handler = wrap(&entry.handler);
        }
        self.rebuild_direct();
    }

    /// Rewrites handlers across the whole table; `rewrite` returns `None` to keep an entry.
    /// Returns the number of entries rewritten.
    pub fn rewrite_all(&mut self, mut rewrite: impl FnMut(&H) -> Option<H>) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            if let Some(handler) = rewrite(&entry.handler) {
                entry.handler = handler;
                changed += 1;
            }
        }
        if changed > 0 {
            self.rebuild_direct();
        }
        changed
    }

    /// Resolves a byte address to its handler and origin.
    ///
    /// Addresses beyond the limit resolve to the last entry; callers mask addresses first.
    #[must_use]
    pub fn resolve(&self, byte: u64) -> (&H, u64) {
        let index = self.index_of(byte);
        let entry = &self.entries[index];
        (&entry.handler, entry.origin)
    }

    /// Resolves a byte address to its full entry.
    #[must_use]
    pub fn entry_at(&self, byte: u64) -> &DispatchEntry<H> {
        &self.entries[self.index_of(byte)]
    }

    /// Checks that the entries tile `0..=limit` without gaps or overlaps.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CoverageGap`] naming the first byte not covered exactly once.
    pub fn verify_coverage(&self, side: AccessSide) -> Result<(), ConfigError> {
        let mut expected = 0u64;
        for entry in &self.entries {
            if entry.start != expected || entry.end < entry.start {
                return Err(ConfigError::CoverageGap {
                    side,
                    address: expected,
                });
            }
            if entry.end == self.limit {
                return Ok(());
            }
            expected = entry.end + 1;
        }
        Err(ConfigError::CoverageGap {
            side,
            address: expected,
        })
    }

    fn index_of(&self, byte: u64) -> usize {
        if let Some(direct) = &self.direct {
            let unit = usize::try_from(byte >> self.unit_log2).unwrap_or(usize::MAX);
            if let Some(&index) = direct.get(unit) {
                return index as usize;
            }
            return self.entries.len() - 1;
        }
        let cached = self.last_hit.get();
        if let Some(entry) = self.entries.get(cached) {
            if entry.start <= byte && byte <= entry.end {
                return cached;
            }
        }
        let index = self
            .entries
            .partition_point(|entry| entry.end < byte)
            .min(self.entries.len() - 1);
        self.last_hit.set(index);
        index
    }

    /// Splits entries so that boundaries fall at `start` and `end + 1`; returns the index range
    /// of entries inside `start..=end`.
    fn isolate(&mut self, start: u64, end: u64) -> (usize, usize) {
        self.split_at(start);
        if end < self.limit {
            self.split_at(end + 1);
        }
        let first = self.entries.partition_point(|entry| entry.end < start);
        let last = self.entries.partition_point(|entry| entry.start <= end);
        (first, last)
    }

    fn split_at(&mut self, byte: u64) {
        let index = self.entries.partition_point(|entry| entry.end < byte);
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        if entry.start == byte {
            return;
        }
        let tail = DispatchEntry {
            start: byte,
            end: entry.end,
            origin: entry.origin,
            handler: entry.handler.clone(),
        };
        entry.end = byte - 1;
        self.entries.insert(index + 1, tail);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn rebuild_direct(&mut self) {
        self.last_hit.set(0);
        let units = (self.limit >> self.unit_log2) + 1;
        if units > DIRECT_MAP_UNITS {
            self.direct = None;
            return;
        }
        let mut direct = self.direct.take().unwrap_or_default();
        direct.clear();
        direct.reserve(units as usize);
        for (index, entry) in self.entries.iter().enumerate() {
            let first = entry.start >> self.unit_log2;
            let last = entry.end >> self.unit_log2;
            direct.extend(std::iter::repeat(index as u32).take((last - first + 1) as usize));
        }
        self.direct = Some(direct);
    }
}

#[cfg(test)]
mod tests {
    use super::DispatchTable;
    use crate::memory::config::AccessSide;
    use proptest::prelude::*;

    #[test]
    fn install_splits_neighbours_and_keeps_their_origin() {
        let mut table = DispatchTable::new(0xff, 0, 'u');
        table.install(0x10, 0x3f, 0x10, 'a');
        table.install(0x20, 0x2f, 0x20, 'b');
        let spans: Vec<_> = table
            .entries()
            .iter()
            .map(|entry| (entry.start, entry.end, entry.origin, entry.handler))
            .collect();
        assert_eq!(
            spans,
            vec![
                (0x00, 0x0f, 0x00, 'u'),
                (0x10, 0x1f, 0x10, 'a'),
                (0x20, 0x2f, 0x20, 'b'),
                (0x30, 0x3f, 0x10, 'a'),
                (0x40, 0xff, 0x00, 'u'),
            ]
        );
        assert_eq!(table.resolve(0x35), (&'a', 0x10));
        assert!(table.verify_coverage(AccessSide::Read).is_ok());
    }

    #[test]
    fn map_range_wraps_only_the_covered_pieces() {
        let mut table = DispatchTable::new(0xff, 0, 1u32);
        table.install(0x40, 0x7f, 0x40, 2);
        table.map_range(0x30, 0x4f, |old| old * 10);
        assert_eq!(table.resolve(0x2f).0, &1);
        assert_eq!(table.resolve(0x30).0, &10);
        assert_eq!(table.resolve(0x4f), (&20, 0x40));
        assert_eq!(table.resolve(0x50).0, &2);
    }

    #[test]
    fn large_tables_fall_back_to_binary_search() {
        let mut table = DispatchTable::new(0xff_ffff, 0, 0u8);
        table.install(0x10_0000, 0x1f_ffff, 0x10_0000, 1);
        assert_eq!(table.resolve(0x0f_ffff).0, &0);
        assert_eq!(table.resolve(0x10_0000).0, &1);
        assert_eq!(table.resolve(0x1f_ffff).0, &1);
        assert_eq!(table.resolve(0x20_0000).0, &0);
    }

    proptest! {
        #[test]
        fn arbitrary_installs_keep_a_complete_partition(
            ranges in prop::collection::vec((0u64..0x400, 0u64..0x80), 1..24)
        ) {
            let mut table = DispatchTable::new(0x3ff, 0, usize::MAX);
            for (index, (start, len)) in ranges.iter().enumerate() {
                let end = (start + len).min(0x3ff);
                table.install(*start, end, *start, index);
            }
            prop_assert!(table.verify_coverage(AccessSide::Write).is_ok());
            for byte in 0..=0x3ffu64 {
                let expected = ranges
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, (start, len))| *start <= byte && byte <= (start + len).min(0x3ff))
                    .map_or(usize::MAX, |(index, _)| index);
                prop_assert_eq!(*table.resolve(byte).0, expected);
            }
        }
    }
}
