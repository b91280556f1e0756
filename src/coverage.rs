//! # Coverage
//!
//! How concurrent a run actually was. Workers cannot be forced to overlap, so
//! after the join we compare the ticks they really started and stopped at:
//! per worker against its own deadlines, across the workers of one kind, and
//! between the latency and bandwidth kinds.
use crate::record::ThreadRecord;

/// Per-worker lateness against its own deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadCoverage {
    /// `actual_start - target start`
    pub start_overshoot: i64,
    /// `actual_stop - target stop`
    pub stop_overshoot: i64,
    /// `actual_stop - actual_start`
    pub active_ticks: i64,
}

impl ThreadCoverage {
    pub fn of(record: &ThreadRecord) -> Self {
        let diff = |a: u64, b: u64| a.wrapping_sub(b) as i64;
        ThreadCoverage {
            start_overshoot: diff(record.actual_start, record.deadlines.start),
            stop_overshoot: diff(record.actual_stop, record.deadlines.stop),
            active_ticks: diff(record.actual_stop, record.actual_start),
        }
    }
}

/// Extremes of the actual start and stop ticks across one kind of worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCoverage {
    pub start_min: u64,
    pub start_max: u64,
    pub stop_min: u64,
    pub stop_max: u64,
}

impl ClassCoverage {
    /// `None` when no worker of this kind ran.
    pub fn of<'a>(records: impl IntoIterator<Item = &'a ThreadRecord>) -> Option<Self> {
        records.into_iter().fold(None, |acc, r| {
            Some(match acc {
                None => ClassCoverage {
                    start_min: r.actual_start,
                    start_max: r.actual_start,
                    stop_min: r.actual_stop,
                    stop_max: r.actual_stop,
                },
                Some(c) => ClassCoverage {
                    start_min: c.start_min.min(r.actual_start),
                    start_max: c.start_max.max(r.actual_start),
                    stop_min: c.stop_min.min(r.actual_stop),
                    stop_max: c.stop_max.max(r.actual_stop),
                },
            })
        })
    }

    pub fn start_spread(&self) -> u64 {
        self.start_max - self.start_min
    }

    pub fn stop_spread(&self) -> u64 {
        self.stop_max - self.stop_min
    }
}

/// Whole-run concurrency coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coverage {
    pub latency: Option<ClassCoverage>,
    pub bandwidth: Option<ClassCoverage>,
}

impl Coverage {
    pub fn new(latency: &[ThreadRecord], bandwidth: &[ThreadRecord]) -> Self {
        Coverage {
            latency: ClassCoverage::of(latency),
            bandwidth: ClassCoverage::of(bandwidth),
        }
    }

    /// Earliest bandwidth start minus earliest latency start.
    pub fn start_skew(&self) -> Option<i64> {
        let (lat, bw) = (self.latency?, self.bandwidth?);
        Some(bw.start_min.wrapping_sub(lat.start_min) as i64)
    }

    /// Earliest bandwidth stop minus earliest latency stop.
    pub fn stop_skew(&self) -> Option<i64> {
        let (lat, bw) = (self.latency?, self.bandwidth?);
        Some(bw.stop_min.wrapping_sub(lat.stop_min) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WorkerKind;
    use crate::sync::Deadlines;

    fn record(kind: WorkerKind, start: u64, stop: u64) -> ThreadRecord {
        ThreadRecord {
            kind,
            thread_num: 0,
            cpu: 0,
            deadlines: Deadlines { start: 100, stop: 1_000 },
            actual_start: start,
            actual_stop: stop,
            samples: 1,
            average: Some(1.0),
        }
    }

    #[test]
    fn per_thread_overshoot() {
        let c = ThreadCoverage::of(&record(WorkerKind::Latency, 103, 1_020));
        assert_eq!(c.start_overshoot, 3);
        assert_eq!(c.stop_overshoot, 20);
        assert_eq!(c.active_ticks, 917);
    }

    #[test]
    fn class_extremes_and_spreads() {
        let lat = [
            record(WorkerKind::Latency, 105, 1_010),
            record(WorkerKind::Latency, 101, 1_040),
            record(WorkerKind::Latency, 110, 1_002),
        ];
        let c = ClassCoverage::of(&lat).unwrap();
        assert_eq!((c.start_min, c.start_max), (101, 110));
        assert_eq!((c.stop_min, c.stop_max), (1_002, 1_040));
        assert_eq!(c.start_spread(), 9);
        assert_eq!(c.stop_spread(), 38);
    }

    #[test]
    fn cross_class_skew_needs_both_kinds() {
        let lat = [record(WorkerKind::Latency, 120, 1_030)];
        let bw = [record(WorkerKind::Bandwidth, 100, 1_050)];
        let cov = Coverage::new(&lat, &bw);
        assert_eq!(cov.start_skew(), Some(-20));
        assert_eq!(cov.stop_skew(), Some(20));

        let only_lat = Coverage::new(&lat, &[]);
        assert_eq!(only_lat.bandwidth, None);
        assert_eq!(only_lat.start_skew(), None);
        assert_eq!(only_lat.stop_skew(), None);
    }
}
