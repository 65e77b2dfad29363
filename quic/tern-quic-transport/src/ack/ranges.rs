// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::ops::RangeInclusive;
use smallvec::SmallVec;

/// The number of ranges tracked before the lowest ones are shed
pub const DEFAULT_LIMIT: usize = 256;

/// A set of received packet numbers stored as disjoint ranges, largest first.
///
/// Adjacent and overlapping insertions are merged. When the set is full the lowest
/// range is dropped to make room for a larger one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckRanges {
    ranges: SmallVec<[RangeInclusive<u64>; 4]>,
    limit: usize,
}

impl Default for AckRanges {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

impl AckRanges {
    pub fn new(limit: usize) -> Self {
        Self {
            ranges: SmallVec::new(),
            limit: limit.max(1),
        }
    }

    /// Inserts a packet number; dropping smaller values if needed
    #[inline]
    pub fn insert_packet_number(&mut self, packet_number: u64) -> Result<(), AckRangesError> {
        self.insert_packet_number_range(packet_number..=packet_number)
    }

    /// Inserts a range of packet numbers; dropping smaller values if needed
    pub fn insert_packet_number_range(
        &mut self,
        range: RangeInclusive<u64>,
    ) -> Result<(), AckRangesError> {
        let (start, end) = range.into_inner();
        debug_assert!(start <= end);

        // first index whose range lies entirely below the new one (not even adjacent)
        let below = self
            .ranges
            .iter()
            .position(|r| r.end().saturating_add(1) < start)
            .unwrap_or(self.ranges.len());
        // first index whose range touches or overlaps the new one
        let above = self
            .ranges
            .iter()
            .position(|r| *r.start() <= end.saturating_add(1))
            .unwrap_or(self.ranges.len());

        if above < below {
            // merge everything in above..below into a single range
            let merged_start = start.min(*self.ranges[below - 1].start());
            let merged_end = end.max(*self.ranges[above].end());
            self.ranges.drain(above..below);
            self.ranges.insert(above, merged_start..=merged_end);
            return Ok(());
        }

        if self.ranges.len() < self.limit {
            self.ranges.insert(below, start..=end);
            return Ok(());
        }

        // full: shed the lowest range if the new one is larger
        if below == self.ranges.len() {
            return Err(AckRangesError::RangeInsertionFailed { min: start, max: end });
        }

        let dropped = self.ranges.pop().map(RangeInclusive::into_inner);
        self.ranges.insert(below, start..=end);
        match dropped {
            Some((min, max)) => Err(AckRangesError::LowestRangeDropped { min, max }),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn contains(&self, packet_number: u64) -> bool {
        // ranges are sorted descending
        self.ranges
            .binary_search_by(|range| {
                if *range.start() > packet_number {
                    core::cmp::Ordering::Less
                } else if *range.end() < packet_number {
                    core::cmp::Ordering::Greater
                } else {
                    core::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Removes every packet number at or below `packet_number`.
    ///
    /// Returns true if anything was removed.
    pub fn remove_up_to(&mut self, packet_number: u64) -> bool {
        let before = self.ranges.clone();
        self.ranges.retain(|range| *range.end() > packet_number);
        if let Some(last) = self.ranges.last_mut() {
            if *last.start() <= packet_number {
                *last = (packet_number + 1)..=*last.end();
            }
        }
        before != self.ranges
    }

    #[inline]
    pub fn max_value(&self) -> Option<u64> {
        self.ranges.first().map(|range| *range.end())
    }

    /// Returns the number of disjoint ranges
    #[inline]
    pub fn interval_len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates the ranges from largest to smallest
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &RangeInclusive<u64>> + '_ {
        self.ranges.iter()
    }

    /// Returns true if `packet_number` would open a new gap below the largest value
    #[inline]
    pub fn is_gap(&self, packet_number: u64) -> bool {
        self.max_value()
            .is_some_and(|largest| packet_number > largest.saturating_add(1))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckRangesError {
    RangeInsertionFailed { min: u64, max: u64 },
    LowestRangeDropped { min: u64, max: u64 },
}
