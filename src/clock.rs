//! # Clock
//!
//! The hardware counter every deadline is expressed in: the TSC on x86_64,
//! `CNTVCT_EL0` on aarch64, and a monotonic nanosecond counter elsewhere. The
//! counter is shared by all CPUs, so a tick read on one worker can be compared
//! with a tick read on another.
use log::{info, warn};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// A monotonic tick source.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// The platform hardware counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HwClock;

impl HwClock {
    /// Name of the counter, for reports.
    pub const NAME: &'static str = if cfg!(target_arch = "x86_64") {
        "TSC"
    } else if cfg!(target_arch = "aarch64") {
        "CNTVCT"
    } else {
        "MONOTONIC"
    };
}

impl Clock for HwClock {
    #[inline(always)]
    fn now(&self) -> u64 {
        read_hwcounter()
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn read_hwcounter() -> u64 {
    // SAFETY: rdtsc is available on every x86_64 CPU.
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn read_hwcounter() -> u64 {
    let tick: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0 on Linux.
    unsafe {
        std::arch::asm!("isb", "mrs {0}, cntvct_el0", out(reg) tick, options(nostack, preserves_flags));
    }
    tick
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn read_hwcounter() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Frequency the platform reports or assumes, if any.
pub fn platform_default_frequency() -> Option<u64> {
    #[cfg(target_arch = "x86_64")]
    {
        const DEFAULT_TSC_HZ: u64 = 2_900_000_000;
        warn!(
            "Assuming hwcounter frequency = {DEFAULT_TSC_HZ} Hz; use --hwclock-freq to override \
             or --estimate-hwclock-freq to measure an estimate"
        );
        Some(DEFAULT_TSC_HZ)
    }

    #[cfg(target_arch = "aarch64")]
    {
        let freq: u64;
        // SAFETY: CNTFRQ_EL0 is readable from EL0 on Linux.
        unsafe {
            std::arch::asm!("isb", "mrs {0}, cntfrq_el0", out(reg) freq, options(nostack, preserves_flags));
        }
        (freq != 0).then_some(freq)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Some(1_000_000_000)
    }
}

/// Sample `clock` across `rounds` wall-clock intervals of length `interval`,
/// optionally pinned to `cpu`, and return the mean ticks per second.
pub fn estimate_frequency<C: Clock>(
    clock: &C,
    cpu: Option<usize>,
    rounds: u32,
    interval: Duration,
) -> u64 {
    let rounds = rounds.max(1);
    info!(
        "estimating hwclock frequency on cpu {} for {rounds} iterations",
        cpu.map_or_else(|| "any".to_string(), |c| c.to_string())
    );

    thread::scope(|s| {
        s.spawn(|| {
            if let Some(cpu) = cpu {
                if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
                    warn!("Couldn't pin frequency estimation to CPU {cpu}");
                }
            }
            let mut total_hz = 0f64;
            for _ in 0..rounds {
                let tick_start = clock.now();
                let wall_start = Instant::now();
                while wall_start.elapsed() < interval {}
                let ticks = clock.now().wrapping_sub(tick_start);
                let elapsed = wall_start.elapsed().as_secs_f64();
                info!("hwcounter_diff = {ticks}");
                total_hz += ticks as f64 / elapsed;
            }
            (total_hz / rounds as f64) as u64
        })
        .join()
        .unwrap_or(0)
    })
}

/// Tick frequency of the run. Fixed once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    hz: u64,
}

impl Timebase {
    pub fn new(hz: u64) -> Self {
        Timebase { hz: hz.max(1) }
    }

    /// Override, else platform default, else a one-second estimate.
    pub fn resolve(override_hz: Option<u64>) -> Self {
        static PLATFORM: OnceLock<u64> = OnceLock::new();
        match override_hz.filter(|&hz| hz != 0) {
            Some(hz) => Timebase::new(hz),
            None => Timebase::new(*PLATFORM.get_or_init(|| {
                platform_default_frequency().unwrap_or_else(|| {
                    estimate_frequency(&HwClock, None, 1, Duration::from_secs(1))
                })
            })),
        }
    }

    pub fn hz(&self) -> u64 {
        self.hz
    }

    pub fn ticks(&self, seconds: f64) -> u64 {
        (seconds * self.hz as f64) as u64
    }

    pub fn seconds(&self, ticks: u64) -> f64 {
        ticks as f64 / self.hz as f64
    }

    pub fn signed_seconds(&self, ticks: i64) -> f64 {
        ticks as f64 / self.hz as f64
    }
}

/// A fake clock that advances by `step` on every read.
#[derive(Debug)]
pub struct SteppingClock {
    now: AtomicU64,
    step: u64,
}

impl SteppingClock {
    pub fn new(start: u64, step: u64) -> Self {
        SteppingClock {
            now: AtomicU64::new(start),
            step,
        }
    }

    /// Current value without advancing.
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_counter_is_monotonic() {
        let clock = HwClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn stepping_clock_advances_per_read() {
        let clock = SteppingClock::new(100, 7);
        assert_eq!(clock.now(), 100);
        assert_eq!(clock.now(), 107);
        assert_eq!(clock.peek(), 114);
    }

    #[test]
    fn timebase_conversions() {
        let tb = Timebase::new(2_000_000_000);
        assert_eq!(tb.ticks(0.5), 1_000_000_000);
        assert_eq!(tb.seconds(4_000_000_000), 2.0);
        assert_eq!(tb.signed_seconds(-1_000_000_000), -0.5);
    }

    #[test]
    fn override_wins_over_platform_default() {
        assert_eq!(Timebase::resolve(Some(25_000_000)).hz(), 25_000_000);
    }

    #[test]
    fn estimate_is_positive() {
        let hz = estimate_frequency(&HwClock, None, 2, Duration::from_millis(20));
        assert!(hz > 0);
    }
}
