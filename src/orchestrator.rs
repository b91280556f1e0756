//! # Orchestrator
//!
//! Plans one worker per requested CPU, spawns them, and collects their records.
//!
//! The workers are never synchronized with each other. Each one receives
//! absolute start and stop ticks computed from a single clock reading here,
//! pins itself, does its setup, and spins until the start tick. Whatever skew
//! remains is measured afterwards through [`Coverage`].
//!
//! A shared chase graph is built on the initializer CPU before any latency
//! worker exists and is only read after that.
use crate::affinity;
use crate::bandwidth::BandwidthWorker;
use crate::chase::ChaseGraph;
use crate::clock::{Clock, Timebase};
use crate::config::Config;
use crate::coverage::Coverage;
use crate::error::{Error, Result};
use crate::latency::LatencyWorker;
use crate::record::{ThreadRecord, WorkerKind};
use crate::sync::Deadlines;
use log::{debug, info};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

/// Every worker of a run, with its inputs fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub seed: u64,
    /// Deadlines of the first worker of each kind.
    pub deadlines: Deadlines,
    pub latency: Vec<LatencyWorker>,
    pub bandwidth: Vec<BandwidthWorker>,
}

/// Everything a run measured.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub seed: u64,
    pub deadlines: Deadlines,
    pub latency: Vec<ThreadRecord>,
    pub bandwidth: Vec<ThreadRecord>,
    pub coverage: Coverage,
}

impl RunReport {
    /// Sum of the bandwidth workers' averages, in bytes per second.
    pub fn total_bandwidth(&self) -> f64 {
        self.bandwidth.iter().filter_map(|r| r.average).sum()
    }

    /// Mean of the latency workers' averages in ns, over workers that measured.
    pub fn average_latency(&self) -> Option<f64> {
        let measured: Vec<f64> = self.latency.iter().filter_map(|r| r.average).collect();
        (!measured.is_empty()).then(|| measured.iter().sum::<f64>() / measured.len() as f64)
    }
}

pub struct Orchestrator<'a, C: Clock> {
    config: &'a Config,
    clock: C,
    timebase: Timebase,
}

impl<'a, C: Clock> Orchestrator<'a, C> {
    pub fn new(config: &'a Config, clock: C, timebase: Timebase) -> Result<Self> {
        config.validate()?;
        Ok(Orchestrator {
            config,
            clock,
            timebase,
        })
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    /// Read the clock once and derive every worker's inputs from it.
    pub fn plan(&self) -> Plan {
        let cfg = self.config;
        let seed = cfg.random_seed.unwrap_or_else(time_seed);

        let now = self.clock.now();
        let deadlines = Deadlines::plan(
            now,
            cfg.start_delay.ticks(self.timebase),
            self.timebase.ticks(cfg.duration),
        );

        let lat = &cfg.latency;
        let offset = lat.offset_steps();
        let latency = lat
            .cpus
            .iter()
            .enumerate()
            .map(|(num, &cpu)| LatencyWorker {
                thread_num: num,
                cpu,
                deadlines: if num > 0 {
                    deadlines.offset(lat.secondary_delay)
                } else {
                    deadlines
                },
                params: lat.chase_params(),
                seed: seed.wrapping_add(num as u64),
                iterations: lat.iterations,
                offset_steps: num * offset,
                warmup: lat.warmup_cpus.contains(&cpu),
                cycle_time_ns: cfg.cycle_time_ns,
            })
            .collect();

        let bw = &cfg.bandwidth;
        let bandwidth = bw
            .cpus
            .iter()
            .enumerate()
            .map(|(num, &cpu)| BandwidthWorker {
                thread_num: num,
                cpu,
                deadlines,
                buflen: bw.buflen,
                iterations: bw.iterations,
                fine_delay: bw.fine_delay,
                coarse_delay: bw.coarse_delay,
                cacheline_bytes: bw.cacheline_bytes,
                hugepages: bw.hugepages,
                mode: bw.mode,
            })
            .collect();

        Plan {
            seed,
            deadlines,
            latency,
            bandwidth,
        }
    }

    /// Plan, spawn every worker, join them all, and aggregate.
    pub fn run(&self) -> Result<RunReport> {
        let plan = self.plan();
        for w in &plan.bandwidth {
            info!("Bandwidth thread {} on CPU{}", w.thread_num, w.cpu);
        }
        for w in &plan.latency {
            info!(
                "Latency thread {} on CPU{}{}",
                w.thread_num,
                w.cpu,
                if w.warmup { " (warmup)" } else { "" }
            );
        }
        if plan.latency.is_empty() {
            info!("No latency threads requested!");
        }

        let shared = match self.config.latency.init_cpu() {
            Some(cpu) if self.config.latency.shared_memory => Some(self.build_shared(cpu, plan.seed)?),
            _ => None,
        };
        let shared = shared.as_ref();
        let (clock, timebase) = (&self.clock, self.timebase);

        let (latency, bandwidth) = thread::scope(|s| -> Result<_> {
            // latency first: graph construction is the slow part of setup
            let lat_handles = plan
                .latency
                .iter()
                .map(|w| {
                    spawn_worker(s, WorkerKind::Latency, w.thread_num, w.cpu, move || {
                        w.run(shared, clock, timebase)
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let bw_handles = plan
                .bandwidth
                .iter()
                .map(|w| {
                    spawn_worker(s, WorkerKind::Bandwidth, w.thread_num, w.cpu, move || {
                        w.run(clock, timebase)
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let bandwidth = join_all(bw_handles)?;
            let latency = join_all(lat_handles)?;
            Ok((latency, bandwidth))
        })?;

        for r in &bandwidth {
            info!(
                "Joined BWTHREAD{}, avg_bw = {:.6} MB/sec",
                r.thread_num,
                r.average.unwrap_or(0.0) / 1e6
            );
        }
        for r in &latency {
            info!(
                "Joined LATTHREAD{}, avg_latency = {:.6} ns",
                r.thread_num,
                r.average.unwrap_or(f64::NAN)
            );
        }

        let coverage = Coverage::new(&latency, &bandwidth);
        Ok(RunReport {
            seed: plan.seed,
            deadlines: plan.deadlines,
            latency,
            bandwidth,
            coverage,
        })
    }

    /// Build the shared graph from a thread pinned to `cpu`.
    fn build_shared(&self, cpu: usize, seed: u64) -> Result<ChaseGraph> {
        info!("latency_thread_to_setup_memory = {cpu}");
        let params = self.config.latency.chase_params();
        thread::scope(|s| -> Result<ChaseGraph> {
            let handle = thread::Builder::new()
                .name("lat_init".to_string())
                .spawn_scoped(s, move || -> Result<ChaseGraph> {
                    affinity::pin_current(cpu)?;
                    ChaseGraph::build(params, seed)
                })?;
            handle
                .join()
                .map_err(|_| Error::WorkerPanicked("lat_init".to_string()))?
        })
    }
}

fn spawn_worker<'scope, 'env, F>(
    scope: &'scope Scope<'scope, 'env>,
    kind: WorkerKind,
    thread_num: usize,
    cpu: usize,
    work: F,
) -> Result<ScopedJoinHandle<'scope, Result<ThreadRecord>>>
where
    F: FnOnce() -> Result<ThreadRecord> + Send + 'scope,
{
    let name = format!("{}_{thread_num}", kind.thread_prefix());
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn_scoped(scope, move || -> Result<ThreadRecord> {
            affinity::pin_current(cpu)?;
            affinity::raise_priority(&name);
            debug!("{name} pinned to CPU{cpu}");
            work()
        })?;
    Ok(handle)
}

fn join_all(handles: Vec<ScopedJoinHandle<'_, Result<ThreadRecord>>>) -> Result<Vec<ThreadRecord>> {
    handles
        .into_iter()
        .map(|handle| -> Result<ThreadRecord> {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            handle.join().map_err(|_| Error::WorkerPanicked(name))?
        })
        .collect()
}

/// Seed derived from the wall clock in microseconds.
pub fn time_seed() -> u64 {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() * 1_000_000 + u64::from(d.subsec_micros()))
        .unwrap_or(1);
    info!("random seed = {seed}");
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{HwClock, SteppingClock};
    use crate::config::StartDelay;

    fn allowed_cpu() -> usize {
        affinity::current_cpus()
            .ok()
            .flatten()
            .and_then(|cpus| cpus.first().copied())
            .unwrap_or(0)
    }

    fn small_config() -> Config {
        let mut config = Config {
            duration: 0.05,
            start_delay: StartDelay::Seconds(0.05),
            random_seed: Some(7),
            ..Config::default()
        };
        config.latency.cacheline_count = 4096;
        config.latency.iterations = 1_000;
        config.bandwidth.buflen = 256 * 1024;
        config.bandwidth.iterations = 2;
        config
    }

    #[test]
    fn plan_staggers_secondary_latency_workers() {
        let mut config = small_config();
        config.start_delay = StartDelay::Ticks(1_000);
        config.duration = 2.0;
        config.latency.cpus = [2, 4, 6].into();
        config.latency.warmup_cpus = [4].into();
        config.latency.secondary_delay = 50;
        config.bandwidth.cpus = [1].into();

        let orch = Orchestrator::new(&config, SteppingClock::new(10_000, 1), Timebase::new(100)).unwrap();
        let plan = orch.plan();
        assert_eq!(plan.seed, 7);
        assert_eq!(plan.deadlines, Deadlines { start: 11_000, stop: 11_200 });

        let lat = &plan.latency;
        assert_eq!(lat.iter().map(|w| w.cpu).collect::<Vec<_>>(), vec![2, 4, 6]);
        assert_eq!(lat[0].deadlines, plan.deadlines);
        assert_eq!(lat[1].deadlines, Deadlines { start: 11_050, stop: 11_250 });
        assert_eq!(lat[2].deadlines, lat[1].deadlines);
        // 4096 lines over 3 workers
        assert_eq!(
            lat.iter().map(|w| w.offset_steps).collect::<Vec<_>>(),
            vec![0, 1365, 2730]
        );
        assert_eq!(lat.iter().map(|w| w.warmup).collect::<Vec<_>>(), vec![false, true, false]);
        assert_ne!(lat[0].seed, lat[1].seed);

        assert_eq!(plan.bandwidth.len(), 1);
        assert_eq!(plan.bandwidth[0].deadlines, plan.deadlines);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = small_config();
        config.latency.stride = 0;
        assert!(Orchestrator::new(&config, HwClock, Timebase::new(1)).is_err());
    }

    #[test]
    fn run_with_both_kinds_reports_coverage() {
        let cpu = allowed_cpu();
        let mut config = small_config();
        config.latency.cpus = [cpu].into();
        config.bandwidth.cpus = [cpu].into();
        let timebase = Timebase::resolve(None);

        let report = Orchestrator::new(&config, HwClock, timebase).unwrap().run().unwrap();
        assert_eq!(report.latency.len(), 1);
        assert_eq!(report.bandwidth.len(), 1);
        for r in report.latency.iter().chain(&report.bandwidth) {
            assert!(r.actual_start >= r.deadlines.start);
            assert!(r.actual_stop >= r.deadlines.stop);
        }
        assert!(report.coverage.latency.is_some());
        assert!(report.coverage.bandwidth.is_some());
        assert!(report.coverage.start_skew().is_some());
    }

    #[test]
    fn shared_graph_run_serves_every_latency_worker() {
        let cpu = allowed_cpu();
        let mut config = small_config();
        config.latency.cpus = [cpu].into();
        config.latency.shared_memory = true;
        config.latency.randomize = true;
        let report = Orchestrator::new(&config, HwClock, Timebase::resolve(None))
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(report.latency.len(), 1);
        assert!(report.bandwidth.is_empty());
        assert_eq!(report.total_bandwidth(), 0.0);
        assert!(report.coverage.bandwidth.is_none());
    }

    #[test]
    fn aggregates_skip_workers_without_samples() {
        let record = |kind: WorkerKind, average: Option<f64>| ThreadRecord {
            kind,
            thread_num: 0,
            cpu: 0,
            deadlines: Deadlines { start: 0, stop: 1 },
            actual_start: 0,
            actual_stop: 1,
            samples: u64::from(average.is_some()),
            average,
        };
        let latency = vec![
            record(WorkerKind::Latency, Some(80.0)),
            record(WorkerKind::Latency, None),
            record(WorkerKind::Latency, Some(100.0)),
        ];
        let bandwidth = vec![
            record(WorkerKind::Bandwidth, Some(1e9)),
            record(WorkerKind::Bandwidth, Some(2e9)),
        ];
        let report = RunReport {
            seed: 1,
            deadlines: Deadlines { start: 0, stop: 1 },
            coverage: Coverage::new(&latency, &bandwidth),
            latency,
            bandwidth,
        };
        assert_eq!(report.average_latency(), Some(90.0));
        assert_eq!(report.total_bandwidth(), 3e9);
    }
}
