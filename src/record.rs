use crate::sync::Deadlines;
use std::fmt;

/// Which measurement loop a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Latency,
    Bandwidth,
}

impl WorkerKind {
    /// Prefix of worker thread names.
    pub fn thread_prefix(self) -> &'static str {
        match self {
            WorkerKind::Latency => "lat_thread",
            WorkerKind::Bandwidth => "bw_thread",
        }
    }

    /// Tag used in per-thread log lines.
    pub fn tag(self) -> &'static str {
        match self {
            WorkerKind::Latency => "LATTHREAD",
            WorkerKind::Bandwidth => "BWTHREAD",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Latency => f.write_str("latency"),
            WorkerKind::Bandwidth => f.write_str("bandwidth"),
        }
    }
}

/// Outcome of one worker thread, handed back through its join handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadRecord {
    pub kind: WorkerKind,
    pub thread_num: usize,
    pub cpu: usize,
    /// Targets the worker was given.
    pub deadlines: Deadlines,
    /// First tick read at or after `deadlines.start`.
    pub actual_start: u64,
    /// Tick of the check that ended the run, at or after `deadlines.stop`.
    pub actual_stop: u64,
    /// Batches measured.
    pub samples: u64,
    /// Nanoseconds per dependent load for latency workers, bytes per second
    /// for bandwidth workers. `None` when no batch ran.
    pub average: Option<f64>,
}
