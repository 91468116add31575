//! Half-open `[start, end)` interval algebra over UTC millisecond timestamps.

use serde::{Deserialize, Serialize};

/// A half-open interval `[start, end)` in UTC milliseconds.
///
/// `start < end` is an invariant of every live `Interval`; constructors that
/// would produce an empty or inverted interval return `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

/// Bounds to clip an interval to; either side may be left open.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bounds {
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
}

impl Interval {
    pub fn new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t < self.end
    }

    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Clips this interval to `bounds`, returning `None` if the clip is empty.
    pub fn trim(&self, bounds: Bounds) -> Option<Self> {
        let start = bounds.start_at.map_or(self.start, |b| self.start.max(b));
        let end = bounds.end_at.map_or(self.end, |b| self.end.min(b));
        Interval::new(start, end)
    }

    /// The overlap of `self` and `other`, or `None` if they don't overlap.
    pub fn intersect(&self, other: &Interval) -> Option<Self> {
        Interval::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// `self` minus `other`, as 0, 1, or 2 disjoint intervals.
    pub fn subtract(&self, other: &Interval) -> Vec<Interval> {
        let Some(overlap) = self.intersect(other) else {
            return vec![*self];
        };
        let mut out = Vec::with_capacity(2);
        if let Some(left) = Interval::new(self.start, overlap.start) {
            out.push(left);
        }
        if let Some(right) = Interval::new(overlap.end, self.end) {
            out.push(right);
        }
        out
    }
}

/// An entity that carries a mutable `[start, end)` interval, such as a
/// timeline entry whose bounds are rewritten in place during recomputation.
pub trait HasInterval {
    fn start_time_utc(&self) -> i64;
    fn end_time_utc(&self) -> i64;
    fn set_start_time_utc(&mut self, t: i64);
    fn set_end_time_utc(&mut self, t: i64);
}

/// Mutates `entity`'s interval fields in place to match `interval`.
pub fn update_interval<E: HasInterval>(entity: &mut E, interval: Interval) {
    entity.set_start_time_utc(interval.start);
    entity.set_end_time_utc(interval.end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_and_inverted() {
        assert!(Interval::new(0, 0).is_none());
        assert!(Interval::new(10, 5).is_none());
        assert!(Interval::new(0, 10).is_some());
    }

    #[test]
    fn trim_clips_both_sides() {
        let i = Interval::new(0, 100).unwrap();
        assert_eq!(
            i.trim(Bounds {
                start_at: Some(10),
                end_at: Some(90)
            }),
            Interval::new(10, 90)
        );
        assert_eq!(
            i.trim(Bounds {
                start_at: Some(200),
                end_at: None
            }),
            None,
            "clipping past the end is empty"
        );
    }

    #[test]
    fn intersect_disjoint_is_none() {
        let a = Interval::new(0, 10).unwrap();
        let b = Interval::new(10, 20).unwrap();
        assert_eq!(a.intersect(&b), None, "half-open: touching is not overlapping");
    }

    #[test]
    fn subtract_middle_leaves_two_pieces() {
        let a = Interval::new(0, 100).unwrap();
        let b = Interval::new(40, 60).unwrap();
        assert_eq!(
            a.subtract(&b),
            vec![Interval::new(0, 40).unwrap(), Interval::new(60, 100).unwrap()]
        );
    }

    #[test]
    fn subtract_covering_leaves_nothing() {
        let a = Interval::new(10, 20).unwrap();
        let b = Interval::new(0, 100).unwrap();
        assert_eq!(a.subtract(&b), Vec::<Interval>::new());
    }

    #[test]
    fn subtract_disjoint_is_unchanged() {
        let a = Interval::new(0, 10).unwrap();
        let b = Interval::new(20, 30).unwrap();
        assert_eq!(a.subtract(&b), vec![a]);
    }

    struct Entry {
        start: i64,
        end: i64,
    }

    impl HasInterval for Entry {
        fn start_time_utc(&self) -> i64 {
            self.start
        }
        fn end_time_utc(&self) -> i64 {
            self.end
        }
        fn set_start_time_utc(&mut self, t: i64) {
            self.start = t;
        }
        fn set_end_time_utc(&mut self, t: i64) {
            self.end = t;
        }
    }

    #[test]
    fn update_interval_mutates_in_place() {
        let mut e = Entry { start: 0, end: 10 };
        update_interval(&mut e, Interval::new(5, 15).unwrap());
        assert_eq!((e.start, e.end), (5, 15));
    }
}
