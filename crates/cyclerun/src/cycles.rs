//! Cycle ranges and the shared sequence motors pull from.
//!
//! Every cycle in a range is handed out exactly once across all motors; a
//! motor claims a contiguous segment (its stride) in one atomic step.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Index of one unit of work. Cycles seed deterministic value generation.
pub type Cycle = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error("invalid cycle range `{0}`: {1}")]
    InvalidRange(String, &'static str),
    #[error("cycle {cycle} is outside range {range}")]
    OutOfRange { cycle: Cycle, range: CycleRange },
}

/// Cycles `[start, end)`. An open end means the sequence never exhausts on
/// its own. The textual form `A..B` includes `B`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRange {
    pub start: Cycle,
    pub end: Option<Cycle>,
}

impl CycleRange {
    pub fn new(start: Cycle, end: Cycle) -> Self {
        Self {
            start,
            end: Some(end.max(start)),
        }
    }

    pub fn unbounded(start: Cycle) -> Self {
        Self { start, end: None }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end.is_some_and(|end| end == self.start)
    }

    pub fn contains(&self, cycle: Cycle) -> bool {
        cycle >= self.start && self.end.is_none_or(|end| cycle < end)
    }
}

impl Default for CycleRange {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl fmt::Display for CycleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) if self.start == 0 => write!(f, "{end}"),
            Some(end) if end > self.start => write!(f, "{}..{}", self.start, end - 1),
            Some(_) => write!(f, "{}..{} (empty)", self.start, self.start),
            None => write!(f, "{}..", self.start),
        }
    }
}

fn parse_count(raw: &str, original: &str) -> Result<u64, CycleError> {
    let raw = raw.trim().replace('_', "");
    let (digits, multiplier) = match raw.chars().last() {
        Some('k' | 'K') => (&raw[..raw.len() - 1], 1_000),
        Some('m' | 'M') => (&raw[..raw.len() - 1], 1_000_000),
        Some('b' | 'B') => (&raw[..raw.len() - 1], 1_000_000_000),
        _ => (raw.as_str(), 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| CycleError::InvalidRange(original.to_string(), "not a cycle count"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| CycleError::InvalidRange(original.to_string(), "cycle count overflows"))
}

impl FromStr for CycleRange {
    type Err = CycleError;

    /// Accepts a count `N` (cycles `0` through `N - 1`), the inclusive form
    /// `A..B` and the open form `A..`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CycleError::InvalidRange(s.to_string(), "empty"));
        }
        match trimmed.split_once("..") {
            None => Ok(CycleRange::new(0, parse_count(trimmed, s)?)),
            Some((start, end)) => {
                let start = if start.trim().is_empty() {
                    0
                } else {
                    parse_count(start, s)?
                };
                if end.trim().is_empty() {
                    return Ok(CycleRange::unbounded(start));
                }
                let end = parse_count(end, s)?;
                if end < start {
                    return Err(CycleError::InvalidRange(
                        s.to_string(),
                        "end is before start",
                    ));
                }
                let end = end.checked_add(1).ok_or_else(|| {
                    CycleError::InvalidRange(s.to_string(), "cycle count overflows")
                })?;
                Ok(CycleRange::new(start, end))
            }
        }
    }
}

/// A contiguous run of cycles claimed by one motor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleSegment {
    next: Cycle,
    end: Cycle,
}

impl CycleSegment {
    pub fn new(start: Cycle, end: Cycle) -> Self {
        Self {
            next: start,
            end: end.max(start),
        }
    }

    pub fn empty() -> Self {
        Self { next: 0, end: 0 }
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.next >= self.end
    }
}

impl Iterator for CycleSegment {
    type Item = Cycle;

    fn next(&mut self) -> Option<Cycle> {
        if self.next >= self.end {
            return None;
        }
        let cycle = self.next;
        self.next += 1;
        Some(cycle)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

/// Thread-safe monotonic cursor over a [`CycleRange`].
#[derive(Debug)]
pub struct CycleSequence {
    range: CycleRange,
    next: AtomicU64,
}

impl CycleSequence {
    pub fn new(range: CycleRange) -> Self {
        Self {
            range,
            next: AtomicU64::new(range.start),
        }
    }

    pub fn range(&self) -> CycleRange {
        self.range
    }

    fn limit(&self) -> Cycle {
        self.range.end.unwrap_or(Cycle::MAX)
    }

    /// Claims a single cycle.
    pub fn next(&self) -> Option<Cycle> {
        let segment = self.next_segment(1);
        if segment.is_empty() {
            None
        } else {
            Some(segment.next)
        }
    }

    /// Claims up to `stride` consecutive cycles, clipped at the range end.
    /// Returns an empty segment once the range is exhausted.
    pub fn next_segment(&self, stride: u64) -> CycleSegment {
        let stride = stride.max(1);
        let limit = self.limit();
        let claimed = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current >= limit {
                    None
                } else {
                    Some(current.saturating_add(stride).min(limit))
                }
            });
        match claimed {
            Ok(start) => CycleSegment::new(start, start.saturating_add(stride).min(limit)),
            Err(_) => CycleSegment::empty(),
        }
    }

    /// Next cycle that will be handed out.
    pub fn position(&self) -> Cycle {
        self.next.load(Ordering::Acquire).min(self.limit())
    }

    /// Moves the cursor. Cycles before `cycle` that were never claimed are skipped.
    pub fn seek(&self, cycle: Cycle) -> Result<(), CycleError> {
        let valid = cycle >= self.range.start && self.range.end.is_none_or(|end| cycle <= end);
        if !valid {
            return Err(CycleError::OutOfRange {
                cycle,
                range: self.range,
            });
        }
        self.next.store(cycle, Ordering::Release);
        Ok(())
    }

    /// Unclaimed cycles, or `None` for an open range.
    pub fn remaining(&self) -> Option<u64> {
        self.range.end.map(|end| end - self.position())
    }

    pub fn is_exhausted(&self) -> bool {
        self.position() >= self.limit()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_range_forms() {
        assert_eq!("1000".parse::<CycleRange>(), Ok(CycleRange::new(0, 1000)));
        assert_eq!("10..20".parse::<CycleRange>(), Ok(CycleRange::new(10, 21)));
        assert_eq!("0..999".parse::<CycleRange>().unwrap().len(), Some(1000));
        assert_eq!("7..7".parse::<CycleRange>().unwrap().len(), Some(1));
        assert_eq!("5..".parse::<CycleRange>(), Ok(CycleRange::unbounded(5)));
        assert_eq!("2K".parse::<CycleRange>(), Ok(CycleRange::new(0, 2000)));
        assert_eq!(
            "1M..1_500_000".parse::<CycleRange>(),
            Ok(CycleRange::new(1_000_000, 1_500_001))
        );
        assert!("20..10".parse::<CycleRange>().is_err());
        assert!("ten".parse::<CycleRange>().is_err());
        assert!("".parse::<CycleRange>().is_err());
    }

    #[test]
    fn segments_are_clipped_at_range_end() {
        let sequence = CycleSequence::new(CycleRange::new(0, 10));
        let first: Vec<_> = sequence.next_segment(4).collect();
        let second: Vec<_> = sequence.next_segment(4).collect();
        let third: Vec<_> = sequence.next_segment(4).collect();
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(second, vec![4, 5, 6, 7]);
        assert_eq!(third, vec![8, 9]);
        assert!(sequence.next_segment(4).is_empty());
        assert!(sequence.is_exhausted());
        assert_eq!(sequence.remaining(), Some(0));
        assert_eq!(sequence.next(), None);
    }

    #[test]
    fn open_range_never_exhausts() {
        let sequence = CycleSequence::new(CycleRange::unbounded(100));
        assert_eq!(sequence.next(), Some(100));
        assert_eq!(sequence.next_segment(3).count(), 3);
        assert_eq!(sequence.position(), 104);
        assert_eq!(sequence.remaining(), None);
        assert!(!sequence.is_exhausted());
    }

    #[test]
    fn seek_validates_bounds() {
        let sequence = CycleSequence::new(CycleRange::new(10, 20));
        assert!(sequence.seek(15).is_ok());
        assert_eq!(sequence.next(), Some(15));
        assert!(sequence.seek(20).is_ok());
        assert!(sequence.is_exhausted());
        assert!(sequence.seek(21).is_err());
        assert!(sequence.seek(9).is_err());
    }

    proptest! {
        #[test]
        fn concurrent_pulls_cover_range_exactly_once(
            len in 0u64..2_000,
            stride in 1u64..64,
            threads in 1usize..8,
        ) {
            let sequence = Arc::new(CycleSequence::new(CycleRange::new(0, len)));
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let sequence = Arc::clone(&sequence);
                    std::thread::spawn(move || {
                        let mut seen = Vec::new();
                        loop {
                            let segment = sequence.next_segment(stride);
                            if segment.is_empty() {
                                break;
                            }
                            seen.extend(segment);
                        }
                        seen
                    })
                })
                .collect();

            let mut all = Vec::new();
            for handle in handles {
                all.extend(handle.join().unwrap());
            }
            let unique: BTreeSet<_> = all.iter().copied().collect();
            prop_assert_eq!(all.len() as u64, len);
            prop_assert_eq!(unique.len() as u64, len);
            prop_assert_eq!(unique.into_iter().collect::<Vec<_>>(), (0..len).collect::<Vec<_>>());
        }
    }
}
