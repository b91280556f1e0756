//! # Sync
//!
//! Barrier-free start/stop coordination. Every worker gets the same absolute
//! tick deadlines up front; it spins on the clock until the start deadline and
//! checks the stop deadline only between batches. Nothing here blocks: the
//! only waiting is the start spin, and the only observable ordering is the
//! actual ticks each worker records.
use crate::clock::Clock;

/// Target start and stop ticks of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub start: u64,
    pub stop: u64,
}

impl Deadlines {
    /// Deadlines `delay_ticks` after `now`, lasting `duration_ticks`.
    pub fn plan(now: u64, delay_ticks: u64, duration_ticks: u64) -> Self {
        let start = now.saturating_add(delay_ticks);
        Deadlines {
            start,
            stop: start.saturating_add(duration_ticks),
        }
    }

    /// Both deadlines shifted later by `offset_ticks`.
    pub fn offset(self, offset_ticks: u64) -> Self {
        Deadlines {
            start: self.start.saturating_add(offset_ticks),
            stop: self.stop.saturating_add(offset_ticks),
        }
    }
}

/// Busy-wait until `clock` reads at least `deadline`; returns that reading.
#[inline(never)]
pub fn spin_until<C: Clock>(clock: &C, deadline: u64) -> u64 {
    loop {
        let now = clock.now();
        if now >= deadline {
            return now;
        }
    }
}

/// Count, sum and minimum of per-batch samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
}

impl Default for RunningStat {
    fn default() -> Self {
        RunningStat {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
        }
    }
}

impl RunningStat {
    pub fn push(&mut self, sample: f64) {
        self.count += 1;
        self.sum += sample;
        self.min = self.min.min(sample);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Mean of all samples.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Mean with the single lowest sample dropped when there are at least two.
    pub fn mean_without_min(&self) -> Option<f64> {
        match self.count {
            0 => None,
            1 => Some(self.sum),
            n => Some((self.sum - self.min) / (n - 1) as f64),
        }
    }
}

impl FromIterator<f64> for RunningStat {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stat = RunningStat::default();
        for sample in iter {
            stat.push(sample);
        }
        stat
    }
}

/// Result of a deadline-bounded batch run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchRun {
    pub stat: RunningStat,
    /// Tick observed by the check that ended the run.
    pub actual_stop: u64,
    /// Ticks already past the stop deadline before the first batch, if any.
    pub shortfall_ticks: Option<u64>,
}

/// Run `batch` until a between-batch clock check reaches `stop_tick`.
///
/// The clock is read once before the first batch; if the deadline has already
/// passed no batch runs and the overshoot is reported as a shortfall. A batch
/// that is in flight when the deadline passes always completes.
pub fn run_batches<C, F>(clock: &C, stop_tick: u64, mut batch: F) -> BatchRun
where
    C: Clock,
    F: FnMut() -> f64,
{
    let mut stat = RunningStat::default();
    let first = clock.now();
    if first >= stop_tick {
        return BatchRun {
            stat,
            actual_stop: first,
            shortfall_ticks: Some(first - stop_tick),
        };
    }

    loop {
        stat.push(batch());
        let now = clock.now();
        if now >= stop_tick {
            return BatchRun {
                stat,
                actual_stop: now,
                shortfall_ticks: None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;

    #[test]
    fn plan_adds_delay_then_duration() {
        let d = Deadlines::plan(1_000, 500, 2_000);
        assert_eq!(d, Deadlines { start: 1_500, stop: 3_500 });
        assert_eq!(d.offset(10), Deadlines { start: 1_510, stop: 3_510 });
        assert_eq!(Deadlines::plan(u64::MAX - 1, 5, 5).stop, u64::MAX);
    }

    #[test]
    fn spin_returns_first_reading_at_or_past_deadline() {
        let clock = SteppingClock::new(0, 3);
        assert_eq!(spin_until(&clock, 10), 12);
        // already past
        assert_eq!(spin_until(&clock, 5), 15);
    }

    #[test]
    fn latency_average_drops_the_minimum() {
        let stat: RunningStat = [4.0, 2.0, 6.0, 8.0].into_iter().collect();
        assert_eq!(stat.mean_without_min(), Some((20.0 - 2.0) / 3.0));
        let single: RunningStat = [5.5].into_iter().collect();
        assert_eq!(single.mean_without_min(), Some(5.5));
        assert_eq!(RunningStat::default().mean_without_min(), None);
    }

    #[test]
    fn bandwidth_average_keeps_everything() {
        let stat: RunningStat = [1.0, 2.0, 3.0, 10.0].into_iter().collect();
        assert_eq!(stat.mean(), Some(4.0));
        assert_eq!(stat.min(), Some(1.0));
        assert_eq!(RunningStat::default().mean(), None);
    }

    #[test]
    fn batches_run_until_a_check_reaches_stop() {
        let clock = SteppingClock::new(100, 10);
        let mut calls = 0;
        let run = run_batches(&clock, 150, || {
            calls += 1;
            1.0
        });
        // reads: 100 (pre-check), 110, 120, 130, 140, 150
        assert_eq!(calls, 5);
        assert_eq!(run.stat.count(), 5);
        assert_eq!(run.actual_stop, 150);
        assert!(run.actual_stop >= 150);
        assert_eq!(run.shortfall_ticks, None);
    }

    #[test]
    fn shortfall_runs_no_batch() {
        let clock = SteppingClock::new(200, 1);
        let run = run_batches(&clock, 150, || unreachable!());
        assert_eq!(run.stat.count(), 0);
        assert_eq!(run.stat.mean_without_min(), None);
        assert_eq!(run.shortfall_ticks, Some(50));
        assert!(run.actual_stop >= 150);
    }

    #[test]
    fn spin_then_run_never_undershoots() {
        let clock = SteppingClock::new(0, 7);
        let d = Deadlines::plan(clock.now(), 100, 1_000);
        let start = spin_until(&clock, d.start);
        let run = run_batches(&clock, d.stop, || 0.5);
        assert!(start >= d.start);
        assert!(run.actual_stop >= d.stop);
        assert!(run.stat.count() > 0);
    }
}
