//! # Config
//!
//! The immutable description of a run. Built once (by the CLI or by a caller of
//! the library), validated, and then only read: workers receive the pieces
//! they need by value before they are spawned.
use crate::alloc::HugePages;
use crate::bandwidth::AccessMode;
use crate::chase::ChaseParams;
use crate::clock::Timebase;
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Default CPU cycle time, 2.6 GHz.
pub const DEFAULT_CYCLE_TIME_NS: f64 = 1e9 / 2600e6;

/// How long after planning the workers start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartDelay {
    Ticks(u64),
    Seconds(f64),
}

impl StartDelay {
    pub fn ticks(&self, timebase: Timebase) -> u64 {
        match *self {
            StartDelay::Ticks(ticks) => ticks,
            StartDelay::Seconds(seconds) => timebase.ticks(seconds),
        }
    }

    pub fn seconds(&self, timebase: Timebase) -> f64 {
        match *self {
            StartDelay::Ticks(ticks) => timebase.seconds(ticks),
            StartDelay::Seconds(seconds) => seconds,
        }
    }
}

impl Default for StartDelay {
    fn default() -> Self {
        if cfg!(target_arch = "x86_64") {
            StartDelay::Ticks(0x3000_0000)
        } else {
            StartDelay::Ticks(200_000)
        }
    }
}

/// Latency worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyConfig {
    /// One latency worker per CPU.
    pub cpus: BTreeSet<usize>,
    /// Latency CPUs that walk the cycle once before starting.
    pub warmup_cpus: BTreeSet<usize>,
    pub cacheline_bytes: usize,
    pub cacheline_count: usize,
    /// Unrolled chase iterations between deadline checks.
    pub iterations: usize,
    pub stride: usize,
    pub randomize: bool,
    /// Cycle steps between the starting points of consecutive workers.
    /// Defaults to the cycle length split evenly over the workers.
    pub offset: Option<usize>,
    /// Extra ticks added to both deadlines of every worker after the first.
    pub secondary_delay: u64,
    pub hugepages: HugePages,
    /// All workers chase one graph built up front.
    pub shared_memory: bool,
    /// CPU that builds the shared graph; defaults to the lowest latency CPU.
    pub shared_init_cpu: Option<usize>,
    pub clear_cache: bool,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        LatencyConfig {
            cpus: BTreeSet::new(),
            warmup_cpus: BTreeSet::new(),
            cacheline_bytes: 64,
            // 1 MiB plus one line
            cacheline_count: 1024 * 1024 / 64 + 1,
            iterations: 10_000_000,
            stride: 1,
            randomize: false,
            offset: None,
            secondary_delay: 0,
            hugepages: HugePages::None,
            shared_memory: false,
            shared_init_cpu: None,
            clear_cache: false,
        }
    }
}

impl LatencyConfig {
    pub fn chase_params(&self) -> ChaseParams {
        ChaseParams {
            cacheline_bytes: self.cacheline_bytes,
            cacheline_count: self.cacheline_count,
            stride: self.stride,
            randomize: self.randomize,
            clear_cache: self.clear_cache,
            hugepages: self.hugepages,
        }
    }

    /// Step distance between consecutive workers' starting points.
    pub fn offset_steps(&self) -> usize {
        match self.offset {
            Some(offset) => offset,
            None if self.cpus.len() > 1 => self.chase_params().cycle_len() / self.cpus.len(),
            None => 0,
        }
    }

    pub fn init_cpu(&self) -> Option<usize> {
        self.shared_init_cpu.or_else(|| self.cpus.first().copied())
    }

    /// Region size in bytes.
    pub fn region_bytes(&self) -> usize {
        self.cacheline_bytes.saturating_mul(self.cacheline_count)
    }
}

/// Bandwidth worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthConfig {
    /// One bandwidth worker per CPU.
    pub cpus: BTreeSet<usize>,
    pub buflen: usize,
    /// Buffer passes between deadline checks.
    pub iterations: usize,
    pub fine_delay: usize,
    pub coarse_delay: usize,
    pub cacheline_bytes: usize,
    pub hugepages: HugePages,
    pub mode: AccessMode,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        BandwidthConfig {
            cpus: BTreeSet::new(),
            buflen: 8192 * 1024,
            iterations: 1000,
            fine_delay: 0,
            coarse_delay: 0,
            cacheline_bytes: 64,
            hugepages: HugePages::None,
            mode: AccessMode::Read,
        }
    }
}

/// A complete run.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Seconds between the start and stop deadlines.
    pub duration: f64,
    pub start_delay: StartDelay,
    /// Shuffle seed; derived from the wall clock when absent.
    pub random_seed: Option<u64>,
    /// Hardware clock frequency override in Hz.
    pub hwclock_freq: Option<u64>,
    /// Used only to express latency in cycles.
    pub cycle_time_ns: f64,
    pub latency: LatencyConfig,
    pub bandwidth: BandwidthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            duration: 10.0,
            start_delay: StartDelay::default(),
            random_seed: None,
            hwclock_freq: None,
            cycle_time_ns: DEFAULT_CYCLE_TIME_NS,
            latency: LatencyConfig::default(),
            bandwidth: BandwidthConfig::default(),
        }
    }
}

impl Config {
    /// Reject configurations that cannot produce meaningful numbers.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if !self.duration.is_finite() || self.duration <= 0.0 {
            return invalid(format!("duration must be positive, got {}", self.duration));
        }
        if let StartDelay::Seconds(s) = self.start_delay {
            if !s.is_finite() || s < 0.0 {
                return invalid(format!("start delay must be non-negative, got {s} seconds"));
            }
        }
        if !self.cycle_time_ns.is_finite() || self.cycle_time_ns <= 0.0 {
            return invalid(format!("cycle time must be positive, got {} ns", self.cycle_time_ns));
        }

        let lat = &self.latency;
        lat.chase_params().validate()?;
        if lat.iterations == 0 {
            return invalid("latency iterations must be at least 1".into());
        }
        if let Some(cpu) = lat.warmup_cpus.difference(&lat.cpus).next() {
            return invalid(format!(
                "CPU {cpu} was to run warmup latency, but it is not to run a latency thread"
            ));
        }

        let bw = &self.bandwidth;
        let word = std::mem::size_of::<usize>();
        if bw.cacheline_bytes < word || bw.cacheline_bytes % word != 0 {
            return Err(Error::CachelineAlignment {
                cacheline_bytes: bw.cacheline_bytes,
                pointer_bytes: word,
            });
        }
        if bw.buflen == 0 {
            return invalid("bandwidth buffer length must be non-zero".into());
        }
        if bw.iterations == 0 {
            return invalid("bandwidth iterations must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.latency.region_bytes(), 1024 * 1024 + 64);
        assert_eq!(config.bandwidth.buflen, 8 * 1024 * 1024);
    }

    #[test]
    fn stride_preconditions_surface_as_errors() {
        let mut config = Config::default();
        config.latency.stride = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidStride { .. })));
        config.latency.stride = config.latency.cacheline_count;
        config.latency.randomize = true;
        assert!(matches!(config.validate(), Err(Error::RandomizeSelfLoop { .. })));
    }

    #[test]
    fn warmup_cpu_must_run_latency() {
        let mut config = Config::default();
        config.latency.cpus.insert(1);
        config.latency.warmup_cpus.insert(2);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        config.latency.warmup_cpus = [1].into();
        config.validate().unwrap();
    }

    #[test]
    fn non_positive_duration_is_rejected() {
        let config = Config {
            duration: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_offset_splits_the_cycle() {
        let mut lat = LatencyConfig {
            cacheline_count: 1000,
            stride: 2,
            ..LatencyConfig::default()
        };
        assert_eq!(lat.offset_steps(), 0);
        lat.cpus = [0, 1, 2, 3].into();
        assert_eq!(lat.offset_steps(), 125);
        lat.offset = Some(7);
        assert_eq!(lat.offset_steps(), 7);
    }

    #[test]
    fn init_cpu_defaults_to_lowest_latency_cpu() {
        let mut lat = LatencyConfig {
            cpus: [5, 3, 9].into(),
            ..LatencyConfig::default()
        };
        assert_eq!(lat.init_cpu(), Some(3));
        lat.shared_init_cpu = Some(9);
        assert_eq!(lat.init_cpu(), Some(9));
    }

    #[test]
    fn delay_converts_through_the_timebase() {
        let tb = Timebase::new(1_000_000);
        assert_eq!(StartDelay::Seconds(0.25).ticks(tb), 250_000);
        assert_eq!(StartDelay::Ticks(500_000).seconds(tb), 0.5);
    }
}
