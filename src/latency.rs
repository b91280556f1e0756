//! # Latency
//!
//! Latency worker: chase the dependent-load cycle in fixed-size batches
//! between the start and stop deadlines, timing every batch. The lowest batch
//! is dropped before averaging, since the last batch of a run often executes
//! after the load generators have already stopped.
use crate::chase::{ChaseGraph, ChaseParams, UNROLL};
use crate::clock::{Clock, HwClock, Timebase};
use crate::error::Result;
use crate::record::{ThreadRecord, WorkerKind};
use crate::sync::{Deadlines, run_batches, spin_until};
use log::{debug, info, warn};
use std::hint::black_box;
use std::time::Instant;

/// Inputs of one latency worker, fixed before it is spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyWorker {
    pub thread_num: usize,
    pub cpu: usize,
    pub deadlines: Deadlines,
    pub params: ChaseParams,
    /// Shuffle seed for a private graph.
    pub seed: u64,
    /// Unrolled chase iterations per batch; each is `UNROLL` dependent loads.
    pub iterations: usize,
    /// Cycle steps to advance before measuring.
    pub offset_steps: usize,
    /// Walk the whole cycle once before the start deadline.
    pub warmup: bool,
    pub cycle_time_ns: f64,
}

impl LatencyWorker {
    /// Dependent loads per batch.
    pub fn steps_per_batch(&self) -> usize {
        self.iterations * UNROLL
    }

    /// Build a private graph unless `shared` is given, then measure.
    pub fn run<C: Clock>(
        &self,
        shared: Option<&ChaseGraph>,
        clock: &C,
        timebase: Timebase,
    ) -> Result<ThreadRecord> {
        match shared {
            Some(graph) => Ok(self.measure(graph, clock, timebase)),
            None => {
                let graph = ChaseGraph::build(self.params, self.seed)?;
                Ok(self.measure(&graph, clock, timebase))
            }
        }
    }

    /// Measure over a built graph.
    pub fn measure<C: Clock>(&self, graph: &ChaseGraph, clock: &C, timebase: Timebase) -> ThreadRecord {
        let (cpu, num) = (self.cpu, self.thread_num);
        let mut cursor = graph.head();

        if self.warmup {
            cursor = graph.chase(cursor, graph.cycle_len());
            info!("CPU{cpu} LATTHREAD{num}: warmed up");
        }
        cursor = graph.chase(cursor, self.offset_steps);

        info!(
            "CPU{cpu} LATTHREAD{num}: cacheline_count = {}, iterations = {}, randomize = {}, \
             hugepages = {}, {} start = {:#x}, offset = {}",
            graph.params().cacheline_count,
            self.iterations,
            graph.params().randomize,
            graph.params().hugepages,
            HwClock::NAME,
            self.deadlines.start,
            self.offset_steps,
        );

        let actual_start = spin_until(clock, self.deadlines.start);
        info!("CPU{cpu} LATTHREAD{num}: started at {} = {actual_start:#x}", HwClock::NAME);

        let steps = self.steps_per_batch();
        let run = run_batches(clock, self.deadlines.stop, || {
            let t0 = Instant::now();
            cursor = graph.chase(cursor, steps);
            let ns = t0.elapsed().as_nanos() as f64 / steps.max(1) as f64;
            debug!(
                "CPU{cpu} LATTHREAD{num}: {ns:.6} ns, {:.6} cycles",
                ns / self.cycle_time_ns
            );
            ns
        });
        black_box(cursor);

        if let Some(deficit) = run.shortfall_ticks {
            warn!(
                "CPU{cpu} LATTHREAD{num}: the hwclock has passed the expected stop time without \
                 any measurements. Increase the start delay so threads can finish their setup; \
                 a suggested value to add to the current delay is {:.6} seconds",
                timebase.seconds(deficit)
            );
        }

        ThreadRecord {
            kind: WorkerKind::Latency,
            thread_num: num,
            cpu,
            deadlines: self.deadlines,
            actual_start,
            actual_stop: run.actual_stop,
            samples: run.stat.count(),
            average: run.stat.mean_without_min(),
        }
    }
}

/// Convert a latency in nanoseconds to CPU cycles.
pub fn cycles(latency_ns: f64, cycle_time_ns: f64) -> f64 {
    latency_ns / cycle_time_ns
}
