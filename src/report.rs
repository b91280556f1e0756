//! # Report
//!
//! Plain-text rendering of a run's settings and results for the CLI.
use crate::clock::{HwClock, Timebase};
use crate::config::Config;
use crate::coverage::{ClassCoverage, ThreadCoverage};
use crate::format_size;
use crate::latency::cycles;
use crate::orchestrator::RunReport;
use crate::record::ThreadRecord;
use std::fmt::Write;

/// Effective settings of a run, one per line.
pub fn settings(config: &Config, timebase: Timebase, seed: u64) -> String {
    let mut out = String::new();
    let delay_ticks = config.start_delay.ticks(timebase);
    let lat = &config.latency;
    let bw = &config.bandwidth;

    // writing into a String cannot fail
    let _ = writeln!(out, "duration            = {} seconds", config.duration);
    let _ = writeln!(
        out,
        "delay               = {:.6} seconds ({delay_ticks} {} ticks at {} Hz)",
        config.start_delay.seconds(timebase),
        HwClock::NAME,
        timebase.hz()
    );
    let _ = writeln!(out, "random_seed         = {seed}");
    let _ = writeln!(
        out,
        "cycle_time_ns       = {:.6} ({:.3} MHz)",
        config.cycle_time_ns,
        1e3 / config.cycle_time_ns
    );

    let _ = writeln!(out, "\nbandwidth settings:");
    let _ = writeln!(out, "bw_cpus             = {:?}", bw.cpus);
    let _ = writeln!(out, "bw_iterations       = {}", bw.iterations);
    let _ = writeln!(out, "bw_buflen           = {} ({})", bw.buflen, format_size(bw.buflen as f32));
    let _ = writeln!(out, "fine loop delay     = {}", bw.fine_delay);
    let _ = writeln!(out, "coarse loop delay   = {}", bw.coarse_delay);
    let _ = writeln!(out, "bw_cacheline_bytes  = {}", bw.cacheline_bytes);
    let _ = writeln!(out, "bw_hugepages        = {}", bw.hugepages);
    let _ = writeln!(out, "bw_mode             = {:?}", bw.mode);

    let _ = writeln!(out, "\nlatency settings:");
    let _ = writeln!(out, "lat_cpus            = {:?}", lat.cpus);
    let _ = writeln!(out, "lat_warmup_cpus     = {:?}", lat.warmup_cpus);
    let _ = writeln!(
        out,
        "lat_cacheline_count = {} ({})",
        lat.cacheline_count,
        format_size(lat.region_bytes() as f32)
    );
    let _ = writeln!(out, "lat_iterations      = {}", lat.iterations);
    let _ = writeln!(out, "lat_offset          = {}", lat.offset_steps());
    let _ = writeln!(out, "lat_secondary_delay = {}", lat.secondary_delay);
    let _ = writeln!(out, "lat_randomize       = {}", lat.randomize);
    let _ = writeln!(out, "lat_hugepages       = {}", lat.hugepages);
    let _ = writeln!(out, "lat_shared_memory   = {}", lat.shared_memory);
    if let Some(cpu) = lat.init_cpu().filter(|_| lat.shared_memory) {
        let _ = writeln!(out, "lat_shared_init_cpu = {cpu}");
    }
    let _ = writeln!(out, "lat_clear_cache     = {}", lat.clear_cache);
    let _ = writeln!(out, "lat_cacheline_stride= {}", lat.stride);
    let _ = writeln!(out, "lat_cacheline_bytes = {}", lat.cacheline_bytes);
    out
}

/// Results of a run: aggregates, then concurrency coverage.
pub fn summary(report: &RunReport, timebase: Timebase, cycle_time_ns: f64, per_thread: bool) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Total Bandwidth = {:.6} MB/sec", report.total_bandwidth() / 1e6);
    match report.average_latency() {
        Some(ns) => {
            let _ = writeln!(
                out,
                "Average Latency = {ns:.6} ns ({:.6} cycles)",
                cycles(ns, cycle_time_ns)
            );
        }
        None => {
            let _ = writeln!(out, "Average Latency = n/a");
        }
    }

    let _ = writeln!(out, "\nconcurrency coverage metrics:\n");
    if per_thread {
        for r in report.bandwidth.iter().chain(&report.latency) {
            thread_detail(&mut out, r, timebase);
        }
    }

    class_lines(&mut out, "bw", report.coverage.bandwidth, timebase);
    class_lines(&mut out, "lat", report.coverage.latency, timebase);

    let skew = |ticks: Option<i64>| match ticks {
        Some(t) => format!("{t} ({:.6} seconds)", timebase.signed_seconds(t)),
        None => "n/a".to_string(),
    };
    let _ = writeln!(out, "bw_lat_start_spread_ticks = {}", skew(report.coverage.start_skew()));
    let _ = writeln!(out, "bw_lat_stop_spread_ticks  = {}", skew(report.coverage.stop_skew()));
    out
}

fn thread_detail(out: &mut String, r: &ThreadRecord, timebase: Timebase) {
    let c = ThreadCoverage::of(r);
    let tag = r.kind.tag();
    let num = r.thread_num;
    let _ = writeln!(out, "{tag}{num} target start  = {:#x}", r.deadlines.start);
    let _ = writeln!(
        out,
        "{tag}{num} actual start  = {:#x}  diff = {} ({:.6} seconds)",
        r.actual_start,
        c.start_overshoot,
        timebase.signed_seconds(c.start_overshoot)
    );
    let _ = writeln!(out, "{tag}{num} target stop   = {:#x}", r.deadlines.stop);
    let _ = writeln!(
        out,
        "{tag}{num} actual stop   = {:#x}  diff = {} ({:.6} seconds), duration = {} ({:.6} seconds), samples = {}\n",
        r.actual_stop,
        c.stop_overshoot,
        timebase.signed_seconds(c.stop_overshoot),
        c.active_ticks,
        timebase.signed_seconds(c.active_ticks),
        r.samples
    );
}

fn class_lines(out: &mut String, prefix: &str, class: Option<ClassCoverage>, timebase: Timebase) {
    match class {
        Some(c) => {
            let _ = writeln!(
                out,
                "{prefix}_start min/max = {:#x}/{:#x}  max-min diff = {} ({:.6} seconds)",
                c.start_min,
                c.start_max,
                c.start_spread(),
                timebase.seconds(c.start_spread())
            );
            let _ = writeln!(
                out,
                "{prefix}_stop  min/max = {:#x}/{:#x}  max-min diff = {} ({:.6} seconds)\n",
                c.stop_min,
                c.stop_max,
                c.stop_spread(),
                timebase.seconds(c.stop_spread())
            );
        }
        None => {
            let _ = writeln!(out, "{prefix}_start max-min diff = n/a");
            let _ = writeln!(out, "{prefix}_stop  max-min diff = n/a\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::Coverage;
    use crate::record::WorkerKind;
    use crate::sync::Deadlines;

    fn report() -> RunReport {
        let deadlines = Deadlines { start: 1_000, stop: 3_000 };
        let latency = vec![ThreadRecord {
            kind: WorkerKind::Latency,
            thread_num: 0,
            cpu: 2,
            deadlines,
            actual_start: 1_010,
            actual_stop: 3_100,
            samples: 12,
            average: Some(85.0),
        }];
        RunReport {
            seed: 3,
            deadlines,
            coverage: Coverage::new(&latency, &[]),
            latency,
            bandwidth: Vec::new(),
        }
    }

    #[test]
    fn summary_marks_missing_classes_as_not_available() {
        let text = summary(&report(), Timebase::new(1_000), 0.5, false);
        assert!(text.contains("Average Latency = 85.000000 ns (170.000000 cycles)"));
        assert!(text.contains("bw_start max-min diff = n/a"));
        assert!(text.contains("lat_start min/max = 0x3f2/0x3f2  max-min diff = 0"));
        assert!(text.contains("bw_lat_start_spread_ticks = n/a"));
        assert!(!text.contains("LATTHREAD0 actual start"));
    }

    #[test]
    fn per_thread_detail_shows_overshoot() {
        let text = summary(&report(), Timebase::new(1_000), 0.5, true);
        assert!(text.contains("LATTHREAD0 actual start  = 0x3f2  diff = 10 (0.010000 seconds)"));
        assert!(text.contains("samples = 12"));
    }

    #[test]
    fn settings_list_effective_values() {
        let config = Config::default();
        let text = settings(&config, Timebase::new(1_000_000), 99);
        assert!(text.contains("random_seed         = 99"));
        assert!(text.contains("lat_cacheline_count = 16385 (1.00 MiB)"));
        assert!(text.contains("bw_buflen           = 8388608 (8.00 MiB)"));
    }
}
