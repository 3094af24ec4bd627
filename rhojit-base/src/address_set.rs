//! A bounded set of address ranges.
//! This is used to remember which addresses belonged to classes and method bodies that have been
//! unloaded. The number of ranges is fixed when the set is created, and once it is full new
//! ranges are folded into existing ones. That makes [`AddressSet::may_contain`] answer `true` for
//! some addresses that were never added, but it never answers `false` for one that was.

/// A closed range of addresses, `start..=end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: usize,
    end: usize,
}
impl AddressRange {
    #[must_use]
    pub fn new(start: usize, end: usize) -> AddressRange {
        debug_assert!(start <= end);
        AddressRange { start, end }
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub fn covers(&self, address: usize) -> bool {
        self.start <= address && address <= self.end
    }

    /// Widen this range so that it also covers `start..=end`
    fn add(&mut self, start: usize, end: usize) {
        self.start = self.start.min(start);
        self.end = self.end.max(end);
    }
}

pub const DEFAULT_MAX_ADDRESS_RANGES: usize = 255;

#[derive(Debug, Clone)]
pub struct AddressSet {
    /// Sorted, with `ranges[i].end < ranges[i + 1].start`
    ranges: Vec<AddressRange>,
    max_ranges: usize,
}
impl AddressSet {
    /// Create a set which will hold at most `max_ranges` separate ranges.
    /// A maximum of zero is treated as one, since the set has to be able to hold something.
    #[must_use]
    pub fn new(max_ranges: usize) -> AddressSet {
        let max_ranges = max_ranges.max(1);
        AddressSet {
            ranges: Vec::with_capacity(max_ranges),
            max_ranges,
        }
    }

    #[must_use]
    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn max_ranges(&self) -> usize {
        self.max_ranges
    }

    /// Whether the address might have been added.
    /// This can be a false positive (after ranges were merged) but never a false negative.
    #[must_use]
    pub fn may_contain(&self, address: usize) -> bool {
        let index = self.first_higher_range_index(address);
        self.ranges
            .get(index)
            .map_or(false, |range| range.covers(address))
    }

    pub fn add_single(&mut self, address: usize) {
        self.add(address, address);
    }

    /// Add the closed range `start..=end`
    pub fn add(&mut self, start: usize, end: usize) {
        debug_assert!(start <= end, "Range start {:#x} after end {:#x}", start, end);
        tracing::trace!("Address set add [{:#x} - {:#x}]", start, end);

        let higher_than_start = self.first_higher_range_index(start);
        let higher_than_end = self.first_higher_range_index(end);

        if higher_than_start == higher_than_end {
            self.add_within_gap(higher_than_start, start, end);
        } else {
            debug_assert!(higher_than_start < higher_than_end);
            self.add_spanning(higher_than_start, higher_than_end, start, end);
        }

        #[cfg(debug_assertions)]
        self.check_ordering();
    }

    /// Both ends of the new range land on the same index, so at most one existing range is
    /// touched.
    fn add_within_gap(&mut self, first_higher: usize, start: usize, end: usize) {
        let count = self.ranges.len();
        if let Some(higher) = self
            .ranges
            .get_mut(first_higher)
            .filter(|range| range.covers(start) || range.covers(end))
        {
            tracing::trace!("1) Intersects existing range {}", first_higher);
            higher.add(start, end);
            return;
        }

        if count < self.max_ranges {
            tracing::trace!("2) Adding new range at {}", first_higher);
            self.ranges
                .insert(first_higher, AddressRange::new(start, end));
            return;
        }

        // Out of space, so something has to be widened and that will produce false positives.
        // The costs are the number of addresses which would become false positives.
        let extend_down_cost = match self.ranges.get(first_higher) {
            Some(higher) if higher.covers(end) => 0,
            Some(higher) => higher.start - end,
            None => usize::MAX,
        };
        let extend_up_cost = match first_higher.checked_sub(1).map(|i| &self.ranges[i]) {
            Some(lower) if lower.covers(start) => 0,
            Some(lower) => start - lower.end,
            None => usize::MAX,
        };

        let mut best_merge_cost = usize::MAX;
        let mut best_merge_index = 0;
        if extend_up_cost > 0 && extend_down_cost > 0 {
            for (i, pair) in self.ranges.windows(2).enumerate() {
                let cost = pair[1].start - pair[0].end;
                if cost < best_merge_cost {
                    best_merge_cost = cost;
                    best_merge_index = i;
                }
            }
        }

        if best_merge_cost < extend_down_cost.min(extend_up_cost) {
            tracing::trace!(
                "3) Merging range {} into {} to make room, cost={}",
                best_merge_index,
                best_merge_index + 1,
                best_merge_cost
            );
            let lower = self.ranges.remove(best_merge_index);
            // The range that was at `best_merge_index + 1` shifted down into its place
            self.ranges[best_merge_index].start = lower.start;

            let hole = if first_higher <= best_merge_index {
                first_higher
            } else {
                first_higher - 1
            };
            self.ranges.insert(hole, AddressRange::new(start, end));
        } else if extend_down_cost < extend_up_cost {
            tracing::trace!(
                "4) Extending range {} down, cost={}",
                first_higher,
                extend_down_cost
            );
            self.ranges[first_higher].add(start, end);
        } else {
            tracing::trace!(
                "5) Extending range {} up, cost={}",
                first_higher - 1,
                extend_up_cost
            );
            self.ranges[first_higher - 1].add(start, end);
        }
    }

    /// The new range overlaps with one or more existing ranges.
    fn add_spanning(&mut self, higher_than_start: usize, higher_than_end: usize, start: usize, end: usize) {
        let new_start = start.min(self.ranges[higher_than_start].start);

        let end_range = self
            .ranges
            .get(higher_than_end)
            .filter(|range| range.covers(end))
            .copied();
        if let Some(end_range) = end_range {
            tracing::trace!(
                "6) Collapsing ranges {} to {} with start {:#x}",
                higher_than_start,
                higher_than_end,
                new_start
            );
            self.ranges[higher_than_start] = AddressRange::new(new_start, end_range.end);
            self.ranges.drain(higher_than_start + 1..=higher_than_end);
        } else if higher_than_end - higher_than_start == 1 {
            tracing::trace!("7) Intersects existing range {}", higher_than_start);
            self.ranges[higher_than_start].add(start, end);
        } else {
            tracing::trace!(
                "8) Collapsing ranges {} to {} with end {:#x}",
                higher_than_start,
                higher_than_end - 1,
                end
            );
            self.ranges[higher_than_start] = AddressRange::new(new_start, end);
            self.ranges.drain(higher_than_start + 1..higher_than_end);
        }
    }

    /// Index of the first range whose end is at or after `address`, or the number of ranges if
    /// there is none. If a range contains the address then that index is returned immediately.
    fn first_higher_range_index(&self, address: usize) -> usize {
        let mut result = self.ranges.len();
        let mut low = 0;
        let mut high = self.ranges.len();
        while low < high {
            let index = low + (high - low) / 2;
            let candidate = &self.ranges[index];
            if address <= candidate.end {
                if candidate.start <= address {
                    return index;
                }

                // This could be the answer, but nothing above it can be
                result = index;
                high = index;
            } else {
                low = index + 1;
            }
        }

        result
    }

    #[cfg(debug_assertions)]
    fn check_ordering(&self) {
        for (i, pair) in self.ranges.windows(2).enumerate() {
            debug_assert!(
                pair[0].end < pair[1].start,
                "Range {} [{:#x} - {:#x}] overlaps previous range ending at {:#x}",
                i + 1,
                pair[1].start,
                pair[1].end,
                pair[0].end
            );
        }
        debug_assert!(self.ranges.len() <= self.max_ranges);
    }
}

impl Default for AddressSet {
    fn default() -> Self {
        AddressSet::new(DEFAULT_MAX_ADDRESS_RANGES)
    }
}
