use loaded_latency::affinity;
use loaded_latency::chase::UNROLL;
use loaded_latency::clock::{HwClock, Timebase};
use loaded_latency::config::{BandwidthConfig, Config, LatencyConfig, StartDelay};
use loaded_latency::orchestrator::Orchestrator;

fn first_cpu() -> usize {
    affinity::current_cpus()
        .ok()
        .flatten()
        .and_then(|cpus| cpus.first().copied())
        .unwrap_or(0)
}

fn short_run(latency: LatencyConfig, bandwidth: BandwidthConfig) -> Config {
    Config {
        duration: 0.2,
        start_delay: StartDelay::Seconds(0.05),
        random_seed: Some(1234),
        latency,
        bandwidth,
        ..Config::default()
    }
}

#[test]
fn single_latency_thread_over_one_mebibyte() {
    let cpu = first_cpu();
    let config = short_run(
        LatencyConfig {
            cpus: [cpu].into(),
            cacheline_count: 16384,
            iterations: 1_000,
            ..LatencyConfig::default()
        },
        BandwidthConfig::default(),
    );

    let timebase = Timebase::resolve(None);
    let report = Orchestrator::new(&config, HwClock, timebase)
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.latency.len(), 1);
    assert!(report.bandwidth.is_empty());

    let record = &report.latency[0];
    assert!(record.samples >= 1);
    assert!(record.actual_start >= record.deadlines.start);
    assert!(record.actual_stop >= record.deadlines.stop);

    let avg_ns = report.average_latency().unwrap();
    assert!(avg_ns > 0.0);
    // batches should fill the window: neither far past it nor stopping
    // early; slack covers an assumed clock frequency that differs from the
    // real one
    let steps_per_batch = (config.latency.iterations * UNROLL) as f64;
    let measured_ns = record.samples as f64 * steps_per_batch * avg_ns;
    let window_ns = config.duration * 1e9;
    assert!(measured_ns <= 10.0 * window_ns, "measured {measured_ns} ns");
    assert!(measured_ns >= 0.1 * window_ns, "measured {measured_ns} ns");
    assert!(report.coverage.bandwidth.is_none());
}

#[test]
fn latency_under_load_reports_bandwidth_and_skew() {
    let cpus = affinity::current_cpus().ok().flatten().unwrap_or_else(|| vec![0]);
    let lat_cpu = cpus[0];
    let bw_cpu = cpus.get(1).copied().unwrap_or(lat_cpu);

    let config = short_run(
        LatencyConfig {
            cpus: [lat_cpu].into(),
            cacheline_count: 4096,
            iterations: 1_000,
            randomize: true,
            ..LatencyConfig::default()
        },
        BandwidthConfig {
            cpus: [bw_cpu].into(),
            buflen: 256 * 1024,
            iterations: 4,
            ..BandwidthConfig::default()
        },
    );

    let report = Orchestrator::new(&config, HwClock, Timebase::resolve(None))
        .unwrap()
        .run()
        .unwrap();

    assert!(report.total_bandwidth() > 0.0);
    assert!(report.average_latency().unwrap() > 0.0);
    assert!(report.coverage.start_skew().is_some());
    assert!(report.coverage.stop_skew().is_some());
}
