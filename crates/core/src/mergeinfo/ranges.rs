//! A set of revisions stored as disjoint inclusive intervals.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionSet {
    /// Sorted, non-overlapping, non-adjacent `(lo, hi)` intervals.
    intervals: Vec<(i64, i64)>,
}

impl RevisionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[(i64, i64)] {
        &self.intervals
    }

    pub fn contains(&self, rev: i64) -> bool {
        let idx = self.intervals.partition_point(|&(_, hi)| hi < rev);
        self.intervals.get(idx).is_some_and(|&(lo, _)| lo <= rev)
    }

    /// Add `[lo, hi]`, merging with touching intervals.
    pub fn insert(&mut self, lo: i64, hi: i64) {
        if lo > hi {
            return;
        }
        let start = self.intervals.partition_point(|&(_, h)| h < lo.saturating_sub(1));
        let end = self.intervals.partition_point(|&(l, _)| l <= hi.saturating_add(1));
        let (mut new_lo, mut new_hi) = (lo, hi);
        if start < end {
            new_lo = new_lo.min(self.intervals[start].0);
            new_hi = new_hi.max(self.intervals[end - 1].1);
        }
        self.intervals.splice(start..end, [(new_lo, new_hi)]);
    }

    pub fn extend(&mut self, other: &RevisionSet) {
        for &(lo, hi) in &other.intervals {
            self.insert(lo, hi);
        }
    }

    /// The parts of `[lo, hi]` not covered by this set.
    pub fn uncovered(&self, lo: i64, hi: i64) -> RevisionSet {
        let mut out = RevisionSet::new();
        let mut cursor = lo;
        for &(l, h) in &self.intervals {
            if h < cursor {
                continue;
            }
            if l > hi {
                break;
            }
            if l > cursor {
                out.intervals.push((cursor, (l - 1).min(hi)));
            }
            cursor = h.saturating_add(1);
            if cursor > hi {
                break;
            }
        }
        if cursor <= hi {
            out.intervals.push((cursor, hi));
        }
        out
    }
}

impl fmt::Display for RevisionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .intervals
            .iter()
            .map(|&(lo, hi)| if lo == hi { lo.to_string() } else { format!("{lo}-{hi}") })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
