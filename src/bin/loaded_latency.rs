//! Loaded latency: pointer-chase latency measured while bandwidth threads
//! load the memory system.
//!
//! One latency thread per `--lat-cpu` and one bandwidth thread per `--bw-cpu`
//! all start at the same hardware clock tick and stop after `--duration`
//! seconds. Set `RUST_LOG=debug` to see every batch sample.

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use loaded_latency::alloc::HugePages;
use loaded_latency::bandwidth::AccessMode;
use loaded_latency::clock::{HwClock, Timebase, estimate_frequency};
use loaded_latency::config::{BandwidthConfig, Config, DEFAULT_CYCLE_TIME_NS, LatencyConfig, StartDelay};
use loaded_latency::orchestrator::{Orchestrator, time_seed};
use loaded_latency::{Result, report};
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::time::Duration;

// use more performant mimalloc allocator over the glibc default
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "loaded-latency",
    version,
    about = "Memory latency under bandwidth load",
    disable_help_flag = true
)]
struct Args {
    /// Print help (`-h` selects latency hugepages)
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Seconds between the start and stop of every measuring thread
    #[arg(short = 'D', long, default_value_t = 10.0)]
    duration: f64,

    /// Seed for the latency cycle shuffle; derived from the time when absent
    #[arg(short = 'S', long, value_parser = parse_u64)]
    random_seed: Option<u64>,

    /// Seconds to wait for every thread to finish its setup
    #[arg(short = 'd', long, conflicts_with = "delay_ticks")]
    delay_seconds: Option<f64>,

    /// Hardware clock ticks to wait for every thread to finish its setup
    #[arg(long, value_parser = parse_u64)]
    delay_ticks: Option<u64>,

    /// Print start and stop overshoot for every thread
    #[arg(long)]
    show_per_thread_concurrency: bool,

    /// Disable speculative store bypass (may reduce performance)
    #[arg(short = 'Q', long)]
    mitigate_spectre_v4: bool,

    /// Override the hardware clock frequency in Hz
    #[arg(short = 'q', long, value_parser = parse_u64)]
    hwclock_freq: Option<u64>,

    /// Estimate the hardware clock frequency on this CPU, print it, and exit
    #[arg(long, value_name = "CPU", value_parser = parse_usize)]
    estimate_hwclock_freq: Option<usize>,

    /// CPU frequency, only used to express latency in cycles
    #[arg(short = 'f', long, conflicts_with = "cpu_cycle_time_ns")]
    cpu_freq_mhz: Option<f64>,

    /// CPU cycle time, only used to express latency in cycles
    #[arg(short = 't', long)]
    cpu_cycle_time_ns: Option<f64>,

    /// CPU to run a latency thread on; repeat for each CPU
    #[arg(short = 'l', long = "lat-cpu", value_name = "CPU", value_parser = parse_usize)]
    lat_cpus: Vec<usize>,

    /// Number of cache lines in the latency region
    #[arg(short = 'n', long, value_parser = parse_usize)]
    lat_cacheline_count: Option<usize>,

    /// Extra ticks before secondary latency threads start and stop
    #[arg(short = 'e', long, value_parser = parse_u64, default_value_t = 0)]
    lat_secondary_delay: u64,

    /// Unrolled chase iterations between clock checks
    #[arg(short = 'i', long, value_parser = parse_usize)]
    lat_iterations: Option<usize>,

    /// Latency node size in bytes
    #[arg(short = 'z', long, value_parser = parse_usize)]
    lat_cacheline_bytes: Option<usize>,

    /// Cache lines between consecutive nodes of the cycle
    #[arg(short = 'j', long, value_parser = parse_usize)]
    lat_cacheline_stride: Option<usize>,

    /// Cycle steps between the starting points of consecutive latency threads
    #[arg(short = 'o', long, value_parser = parse_usize)]
    lat_offset: Option<usize>,

    /// Flush the latency region from the cache after building it
    #[arg(short = 'c', long)]
    lat_clear_cache: bool,

    /// Shuffle the visiting order of the latency cycle
    #[arg(short = 'r', long)]
    lat_randomize: bool,

    /// Hugepage size for the latency region (`help` lists the sizes)
    #[arg(short = 'h', long, value_parser = parse_hugepages, default_value = "none")]
    lat_use_hugepages: HugePagesArg,

    /// Latency CPU that walks the cycle once before starting; repeat as needed
    #[arg(short = 'w', long = "lat-warmup-cpu", value_name = "CPU", value_parser = parse_usize)]
    lat_warmup_cpus: Vec<usize>,

    /// All latency threads chase one graph
    #[arg(short = 's', long)]
    lat_shared_memory: bool,

    /// CPU that builds the shared graph
    #[arg(short = 'u', long, value_name = "CPU", value_parser = parse_usize)]
    lat_shared_memory_init_cpu: Option<usize>,

    /// CPU to run a bandwidth thread on; repeat for each CPU
    #[arg(short = 'B', long = "bw-cpu", value_name = "CPU", value_parser = parse_usize)]
    bw_cpus: Vec<usize>,

    /// Buffer passes between clock checks
    #[arg(short = 'I', long, value_parser = parse_usize)]
    bw_iterations: Option<usize>,

    /// Bandwidth buffer length in bytes
    #[arg(short = 'L', long, value_parser = parse_usize)]
    bw_buflen: Option<usize>,

    /// Delay iterations after every access
    #[arg(short = 'F', long, default_value_t = 0, value_parser = parse_usize)]
    bw_fine_delay: usize,

    /// Delay iterations after every pass
    #[arg(short = 'C', long, default_value_t = 0, value_parser = parse_usize)]
    bw_coarse_delay: usize,

    /// Hugepage size for bandwidth buffers (`help` lists the sizes)
    #[arg(short = 'H', long, value_parser = parse_hugepages, default_value = "none")]
    bw_use_hugepages: HugePagesArg,

    /// Bytes between consecutive bandwidth accesses
    #[arg(short = 'Z', long, value_parser = parse_usize)]
    bw_cacheline_bytes: Option<usize>,

    /// Write instead of read
    #[arg(short = 'W', long)]
    bw_write: bool,
}

/// Accepts decimal, or hex with a `0x` prefix.
fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid integer '{s}': {e}"))
}

fn parse_usize(s: &str) -> std::result::Result<usize, String> {
    let value = parse_u64(s)?;
    usize::try_from(value).map_err(|e| format!("integer '{s}' out of range: {e}"))
}

/// A hugepage size, or a request for the table of sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HugePagesArg {
    Policy(HugePages),
    Help,
}

impl HugePagesArg {
    fn policy(self) -> HugePages {
        match self {
            HugePagesArg::Policy(policy) => policy,
            HugePagesArg::Help => HugePages::None,
        }
    }
}

fn parse_hugepages(s: &str) -> std::result::Result<HugePagesArg, String> {
    if s.eq_ignore_ascii_case("help") {
        return Ok(HugePagesArg::Help);
    }
    s.parse()
        .map(HugePagesArg::Policy)
        .map_err(|e: loaded_latency::Error| e.to_string())
}

/// Known hugepage spellings with the ordinal each one also answers to.
fn hugepage_table() -> String {
    let mut table = String::from("hugepage sizes (name = ordinal):\n");
    for (name, policy) in HugePages::NAMES {
        let ordinal = HugePages::ALL.iter().position(|p| *p == policy).unwrap_or_default();
        table.push_str(&format!("  {name:<8} = {ordinal}\n"));
    }
    table
}

fn build_config(args: &Args) -> Config {
    let lat_cpus: BTreeSet<usize> = args.lat_cpus.iter().copied().collect();
    let bw_cpus: BTreeSet<usize> = args.bw_cpus.iter().copied().collect();
    for cpu in lat_cpus.intersection(&bw_cpus) {
        warn!("CPU{cpu} runs both a latency and a bandwidth thread");
    }

    let start_delay = match (args.delay_seconds, args.delay_ticks) {
        (Some(seconds), _) => StartDelay::Seconds(seconds),
        (None, Some(ticks)) => StartDelay::Ticks(ticks),
        (None, None) => StartDelay::default(),
    };
    let cycle_time_ns = match (args.cpu_freq_mhz, args.cpu_cycle_time_ns) {
        (Some(mhz), _) => 1e3 / mhz,
        (None, Some(ns)) => ns,
        (None, None) => DEFAULT_CYCLE_TIME_NS,
    };

    let lat_defaults = LatencyConfig::default();
    let latency = LatencyConfig {
        cpus: lat_cpus,
        warmup_cpus: args.lat_warmup_cpus.iter().copied().collect(),
        cacheline_bytes: args.lat_cacheline_bytes.unwrap_or(lat_defaults.cacheline_bytes),
        cacheline_count: args.lat_cacheline_count.unwrap_or(lat_defaults.cacheline_count),
        iterations: args.lat_iterations.unwrap_or(lat_defaults.iterations),
        stride: args.lat_cacheline_stride.unwrap_or(lat_defaults.stride),
        randomize: args.lat_randomize,
        offset: args.lat_offset,
        secondary_delay: args.lat_secondary_delay,
        hugepages: args.lat_use_hugepages.policy(),
        shared_memory: args.lat_shared_memory,
        shared_init_cpu: args.lat_shared_memory_init_cpu,
        clear_cache: args.lat_clear_cache,
    };

    let bw_defaults = BandwidthConfig::default();
    let bandwidth = BandwidthConfig {
        cpus: bw_cpus,
        buflen: args.bw_buflen.unwrap_or(bw_defaults.buflen),
        iterations: args.bw_iterations.unwrap_or(bw_defaults.iterations),
        fine_delay: args.bw_fine_delay,
        coarse_delay: args.bw_coarse_delay,
        cacheline_bytes: args.bw_cacheline_bytes.unwrap_or(bw_defaults.cacheline_bytes),
        hugepages: args.bw_use_hugepages.policy(),
        mode: if args.bw_write { AccessMode::Write } else { AccessMode::Read },
    };

    Config {
        duration: args.duration,
        start_delay,
        random_seed: Some(args.random_seed.unwrap_or_else(time_seed)),
        hwclock_freq: args.hwclock_freq,
        cycle_time_ns,
        latency,
        bandwidth,
    }
}

#[cfg(target_os = "linux")]
mod speculation {
    use log::{info, warn};

    const PR_GET_SPECULATION_CTRL: libc::c_int = 52;
    const PR_SET_SPECULATION_CTRL: libc::c_int = 53;
    const PR_SPEC_STORE_BYPASS: libc::c_ulong = 0;
    const PR_SPEC_ENABLE: libc::c_ulong = 1 << 1;
    const PR_SPEC_DISABLE: libc::c_ulong = 1 << 2;

    /// Allow speculative store bypass unless `mitigate` is set, then report
    /// what the kernel reports back.
    pub fn apply(mitigate: bool) {
        let requested = if mitigate { PR_SPEC_DISABLE } else { PR_SPEC_ENABLE };
        // SAFETY: prctl with integer arguments only.
        let set = unsafe { libc::prctl(PR_SET_SPECULATION_CTRL, PR_SPEC_STORE_BYPASS, requested, 0 as libc::c_ulong, 0 as libc::c_ulong) };
        // SAFETY: as above.
        let status = unsafe { libc::prctl(PR_GET_SPECULATION_CTRL, PR_SPEC_STORE_BYPASS, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) };
        if set != 0 {
            warn!(
                "Couldn't set speculative store bypass control: {}",
                std::io::Error::last_os_error()
            );
        }
        info!(
            "speculative store bypass: requested {} (retval = {set:#x}), status is {} (retval = {status:#x})",
            if mitigate { "disabled" } else { "enabled" },
            if status >= 0 && (status as libc::c_ulong & PR_SPEC_ENABLE) != 0 {
                "enabled"
            } else {
                "disabled"
            },
        );
    }
}

#[cfg(not(target_os = "linux"))]
mod speculation {
    pub fn apply(mitigate: bool) {
        if mitigate {
            log::warn!("speculative store bypass control is only available on Linux");
        }
    }
}

fn run(args: &Args) -> Result<()> {
    if let Some(cpu) = args.estimate_hwclock_freq {
        let hz = estimate_frequency(&HwClock, Some(cpu), 10, Duration::from_secs(1));
        println!("the estimated hwclock frequency on CPU {cpu} in Hz is {hz}");
        return Ok(());
    }

    if [args.lat_use_hugepages, args.bw_use_hugepages].contains(&HugePagesArg::Help) {
        print!("{}", hugepage_table());
        return Ok(());
    }

    speculation::apply(args.mitigate_spectre_v4);

    let config = build_config(args);
    let timebase = Timebase::resolve(config.hwclock_freq);
    let seed = config.random_seed.unwrap_or_default();
    info!("main program pid = {}", std::process::id());
    println!("{}", report::settings(&config, timebase, seed));

    let orchestrator = Orchestrator::new(&config, HwClock, timebase)?;
    let results = orchestrator.run()?;

    println!(
        "{}",
        report::summary(
            &results,
            orchestrator.timebase(),
            config.cycle_time_ns,
            args.show_per_thread_concurrency
        )
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn flags_map_onto_config() {
        let args = Args::parse_from([
            "loaded-latency",
            "-l", "2", "-l", "4", "-w", "4",
            "-B", "6",
            "--delay-ticks", "0x1000",
            "-f", "2000",
            "-S", "7",
            "-h", "2M",
            "-W",
        ]);
        let config = build_config(&args);
        assert_eq!(config.latency.cpus, [2, 4].into());
        assert_eq!(config.latency.warmup_cpus, [4].into());
        assert_eq!(config.bandwidth.cpus, [6].into());
        assert_eq!(config.start_delay, StartDelay::Ticks(0x1000));
        assert_eq!(config.cycle_time_ns, 0.5);
        assert_eq!(config.random_seed, Some(7));
        assert_eq!(config.latency.hugepages, HugePages::Size2M);
        assert_eq!(config.bandwidth.mode, AccessMode::Write);
        config.validate().unwrap();
    }

    #[test]
    fn delay_forms_are_exclusive() {
        let parsed = Args::try_parse_from(["loaded-latency", "-d", "1.0", "--delay-ticks", "5"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_hugepage_size_is_rejected() {
        assert!(Args::try_parse_from(["loaded-latency", "-H", "3M"]).is_err());
    }

    #[test]
    fn size_and_count_flags_accept_hex() {
        let args = Args::parse_from([
            "loaded-latency",
            "-L", "0x40",
            "-n", "0x4001",
            "-i", "0x10",
            "-I", "0X8",
            "-o", "0x20",
            "-l", "0x3",
            "-B", "0x5",
            "-Z", "0x40",
        ]);
        let config = build_config(&args);
        assert_eq!(config.bandwidth.buflen, 64);
        assert_eq!(config.latency.cacheline_count, 16385);
        assert_eq!(config.latency.iterations, 16);
        assert_eq!(config.bandwidth.iterations, 8);
        assert_eq!(config.latency.offset, Some(32));
        assert_eq!(config.latency.cpus, [3].into());
        assert_eq!(config.bandwidth.cpus, [5].into());
        assert_eq!(config.bandwidth.cacheline_bytes, 64);
        assert!(Args::try_parse_from(["loaded-latency", "-L", "0xzz"]).is_err());
    }

    #[test]
    fn hugepage_help_lists_every_size() {
        let args = Args::parse_from(["loaded-latency", "-H", "help"]);
        assert_eq!(args.bw_use_hugepages, HugePagesArg::Help);
        assert_eq!(build_config(&args).bandwidth.hugepages, HugePages::None);

        let table = hugepage_table();
        assert!(table.contains("none     = 0"));
        assert!(table.contains("2MB      = 3"));
        assert!(table.contains("16G      = 7"));
        assert_eq!(table.lines().count(), HugePages::NAMES.len() + 1);
    }
}
