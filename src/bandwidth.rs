//! # Bandwidth
//!
//! Bandwidth worker: stream over a private buffer one word per cache line,
//! reading or writing, between the start and stop deadlines. A fine delay after
//! every access and a coarse delay after every pass let the caller throttle the
//! traffic down to a target level. Every batch counts toward the average.
use crate::accessor::{MemoryAccessor, NativeAccessor, delay};
use crate::alloc::{self, HugePages, Region};
use crate::clock::{Clock, HwClock, Timebase};
use crate::error::{Error, Result};
use crate::format_size;
use crate::record::{ThreadRecord, WorkerKind};
use crate::sync::{Deadlines, run_batches, spin_until};
use log::{debug, info, warn};
use std::time::Instant;

/// Direction of bandwidth traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Read,
    Write,
}

/// Inputs of one bandwidth worker, fixed before it is spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthWorker {
    pub thread_num: usize,
    pub cpu: usize,
    pub deadlines: Deadlines,
    /// Bytes per pass.
    pub buflen: usize,
    /// Passes per batch.
    pub iterations: usize,
    /// Delay iterations after each access.
    pub fine_delay: usize,
    /// Delay iterations after each pass.
    pub coarse_delay: usize,
    pub cacheline_bytes: usize,
    pub hugepages: HugePages,
    pub mode: AccessMode,
}

impl BandwidthWorker {
    /// Bytes accounted to one batch.
    pub fn bytes_per_batch(&self) -> f64 {
        self.iterations as f64 * self.buflen as f64
    }

    /// Allocate the buffer, then measure.
    pub fn run<C: Clock>(&self, clock: &C, timebase: Timebase) -> Result<ThreadRecord> {
        let word = std::mem::size_of::<usize>();
        if self.cacheline_bytes < word || self.cacheline_bytes % word != 0 {
            return Err(Error::CachelineAlignment {
                cacheline_bytes: self.cacheline_bytes,
                pointer_bytes: word,
            });
        }
        let bytes = self.buflen.div_ceil(self.cacheline_bytes) * self.cacheline_bytes;
        let mut buffer = alloc::allocate(bytes, self.hugepages, alloc::page_size())?;
        Ok(self.measure(&mut buffer, clock, timebase))
    }

    /// Measure over an allocated buffer of at least `buflen` bytes.
    pub fn measure<C: Clock>(&self, buffer: &mut Region, clock: &C, timebase: Timebase) -> ThreadRecord {
        let (cpu, num) = (self.cpu, self.thread_num);
        info!(
            "CPU{cpu} BWTHREAD{num}: buflen = {} ({}), iterations = {}, fine delay = {}, \
             coarse delay = {}, cacheline_bytes = {}, hugepages = {}, mode = {:?}, {} start = {:#x}",
            self.buflen,
            format_size(self.buflen as f32),
            self.iterations,
            self.fine_delay,
            self.coarse_delay,
            self.cacheline_bytes,
            self.hugepages,
            self.mode,
            HwClock::NAME,
            self.deadlines.start,
        );

        let base = buffer.as_mut_ptr();
        let len = self.buflen.min(buffer.len());

        let actual_start = spin_until(clock, self.deadlines.start);
        info!("CPU{cpu} BWTHREAD{num}: started at {} = {actual_start:#x}", HwClock::NAME);

        let bytes = self.bytes_per_batch();
        let run = run_batches(clock, self.deadlines.stop, || {
            let t0 = Instant::now();
            for _ in 0..self.iterations {
                match self.mode {
                    AccessMode::Read => {
                        read_pass::<NativeAccessor>(base, len, self.cacheline_bytes, self.fine_delay)
                    }
                    AccessMode::Write => {
                        write_pass::<NativeAccessor>(base, len, self.cacheline_bytes, self.fine_delay)
                    }
                }
                delay(self.coarse_delay);
            }
            let bw = bytes / t0.elapsed().as_secs_f64().max(1e-9);
            debug!("CPU{cpu} BWTHREAD{num}: {:.6} MB/sec", bw / 1e6);
            bw
        });

        if let Some(deficit) = run.shortfall_ticks {
            warn!(
                "CPU{cpu} BWTHREAD{num}: the hwclock has passed the expected stop time without \
                 any measurements. Increase the start delay by at least {:.6} seconds",
                timebase.seconds(deficit)
            );
        }

        ThreadRecord {
            kind: WorkerKind::Bandwidth,
            thread_num: num,
            cpu,
            deadlines: self.deadlines,
            actual_start,
            actual_stop: run.actual_stop,
            samples: run.stat.count(),
            average: run.stat.mean(),
        }
    }
}

/// One read per cache line over `[base, base + len)`.
#[inline(never)]
fn read_pass<A: MemoryAccessor>(base: *const u8, len: usize, line: usize, fine_delay: usize) {
    let mut offset = 0;
    while offset < len {
        // SAFETY: `offset` is line aligned and the buffer is rounded up to whole lines.
        std::hint::black_box(unsafe { A::read_line(base.add(offset) as *const usize) });
        delay(fine_delay);
        offset += line;
    }
}

/// One write per cache line over `[base, base + len)`.
#[inline(never)]
fn write_pass<A: MemoryAccessor>(base: *mut u8, len: usize, line: usize, fine_delay: usize) {
    let mut offset = 0;
    while offset < len {
        // SAFETY: as in `read_pass`.
        unsafe { A::write_line(base.add(offset) as *mut usize, 0) };
        delay(fine_delay);
        offset += line;
    }
}
