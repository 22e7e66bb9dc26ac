use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::{Config, LoadConfig};
use crate::error::Error;
use crate::executor::Executor;
use crate::load::{LoadHistory, LoadMonitor};
use crate::model::WritePolicy;
use crate::routine::Routine;
use crate::scheduler::{schedule, Schedule};
use crate::store::{JsonStore, LoadStore, ModelStore};
use crate::system::{Host, SystemProbe};
use crate::tolerance::{Cut, FixedBand, Tolerance};

/// Everything a benchmark thread needs besides the routine itself.
#[derive(Debug, Clone)]
struct Bench {
    executor: Executor,
    history: Arc<RwLock<LoadHistory>>,
    tolerance: Arc<dyn Tolerance>,
    store: Arc<dyn ModelStore>,
    policy: WritePolicy,
    quit: CancelToken,
}

impl Bench {
    /// Take one benchmark for `routine` and feed it back into its model.
    fn step(&self, routine: &mut Routine) {
        let at = match routine.select() {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                error!(routine = %routine.name, error = %e, "cannot pick a point to benchmark");
                return;
            }
        };

        let b = match self.executor.run(routine.exe(), &routine.exe_args, &at, &self.quit) {
            Ok(b) => b,
            Err(e) if e.is_cancelled() => {
                debug!(routine = %routine.name, point = %at, "benchmark cancelled");
                return;
            }
            Err(e) => {
                match e.output() {
                    Some(output) => {
                        warn!(routine = %routine.name, point = %at, error = %e, %output, "benchmark failed")
                    }
                    None => warn!(routine = %routine.name, point = %at, error = %e, "benchmark failed"),
                }
                return;
            }
        };
        debug!(routine = %routine.name, point = %at, flops = b.flops, wall = ?b.wall, "benchmarked");

        // the monitor keeps sampling while construction looks at the history
        let history = self.history.read().clone();
        let cut = Cut::new(&*self.tolerance, &history);
        if let Err(e) = routine.insert(b, &cut) {
            error!(routine = %routine.name, point = %at, error = %e, "cannot advance construction");
        }

        if routine.is_complete() {
            info!(routine = %routine.name, completion = routine.completion(), "model complete");
            persist(&*self.store, routine);
        } else if routine.model().write_due(&self.policy) {
            persist(&*self.store, routine);
        }
    }
}

fn persist(store: &dyn ModelStore, routine: &mut Routine) {
    let saved = match routine.model().path() {
        Some(path) => store.save(path, routine.model()),
        None => return,
    };
    match saved {
        Ok(()) => {
            trace!(routine = %routine.name, completion = routine.completion(), "model written");
            routine.mark_written();
        }
        Err(e) => error!(routine = %routine.name, error = %e, "failed to write model"),
    }
}

struct Running {
    index: usize,
    name: String,
    handle: JoinHandle<Routine>,
}

/// The model-building daemon.
///
/// The daemon owns every routine. On each tick it either collects the benchmark that is
/// running, or asks the scheduler for a routine and hands that routine to a benchmark thread.
/// At most one benchmark runs at a time.
#[derive(Debug)]
pub struct Daemon {
    routines: Vec<Routine>,
    bench: Bench,
    probe: Arc<dyn SystemProbe>,
    load: LoadConfig,
    main_sleep: Duration,
    build_only: bool,
}

impl Daemon {
    /// A daemon over `routines` that stops when `quit` is cancelled.
    pub fn new(routines: Vec<Routine>, quit: CancelToken) -> Self {
        let load = LoadConfig::default();
        Daemon {
            routines,
            bench: Bench {
                executor: Executor::default(),
                history: Arc::new(RwLock::new(LoadHistory::new(load.capacity))),
                tolerance: Arc::new(FixedBand::default()),
                store: Arc::new(JsonStore),
                policy: WritePolicy::default(),
                quit,
            },
            probe: Arc::new(Host),
            load,
            main_sleep: Duration::from_secs(1),
            build_only: false,
        }
    }

    /// A daemon for everything in `config`, resuming any models already on disk.
    pub fn from_config(config: &Config, quit: CancelToken) -> Result<Self, Error> {
        let store = JsonStore;
        let routines = config
            .routines
            .iter()
            .map(|r| r.build(&store))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Daemon::new(routines, quit)
            .executor(Executor::new(config.poll_timeout()))
            .tolerance(Arc::new(FixedBand::new(config.tolerance)))
            .write_policy(config.write_policy())
            .load(config.load.clone())
            .main_sleep(config.main_sleep())
            .build_only(config.build_only))
    }

    /// Run benchmarks with `executor`.
    pub fn executor(mut self, executor: Executor) -> Self {
        self.bench.executor = executor;
        self
    }

    /// Compare throughputs with `tolerance`.
    pub fn tolerance(mut self, tolerance: Arc<dyn Tolerance>) -> Self {
        self.bench.tolerance = tolerance;
        self
    }

    /// Keep models in `store`.
    pub fn store(mut self, store: Arc<dyn ModelStore>) -> Self {
        self.bench.store = store;
        self
    }

    /// Write models out according to `policy`.
    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.bench.policy = policy;
        self
    }

    /// Inspect the machine through `probe`.
    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Monitor load as `load` says.
    pub fn load(mut self, load: LoadConfig) -> Self {
        self.bench.history = Arc::new(RwLock::new(LoadHistory::new(load.capacity)));
        self.load = load;
        self
    }

    /// Sleep this long between ticks.
    pub fn main_sleep(mut self, main_sleep: Duration) -> Self {
        self.main_sleep = main_sleep;
        self
    }

    /// Whether to exit once every model is complete.
    pub fn build_only(mut self, build_only: bool) -> Self {
        self.build_only = build_only;
        self
    }

    /// The routines being modelled.
    pub fn routines(&self) -> &[Routine] {
        &self.routines
    }

    /// Schedule and run benchmarks until cancelled, or until every model is complete in
    /// build-only mode. Returns the routines with their final models.
    pub fn run(mut self) -> Result<Vec<Routine>, Error> {
        let monitor = self.start_monitor()?;
        info!(routines = self.routines.len(), build_only = self.build_only, "daemon started");

        let mut running: Option<Running> = None;
        loop {
            if let Some(r) = running.take() {
                if r.handle.is_finished() {
                    self.collect(r);
                } else {
                    running = Some(r);
                }
            }
            if self.bench.quit.is_cancelled() {
                break;
            }
            if running.is_none() {
                match schedule(&mut self.routines, &*self.probe) {
                    Schedule::AllComplete if self.build_only => {
                        info!("every model is complete");
                        break;
                    }
                    Schedule::AllComplete => trace!("every model is complete"),
                    Schedule::NoneEligible => trace!("no routine may run right now"),
                    Schedule::Selected(i) => running = Some(self.start(i)?),
                }
            }
            self.bench.quit.wait_timeout(self.main_sleep);
        }

        // also stops the load monitor when we got here through build-only completion
        self.bench.quit.cancel();
        if let Some(r) = running.take() {
            self.collect(r);
        }
        if monitor.join().is_err() {
            error!("load monitor panicked");
        }
        for r in &mut self.routines {
            persist(&*self.bench.store, r);
        }
        info!("daemon stopped");
        Ok(self.routines)
    }

    fn start_monitor(&self) -> Result<JoinHandle<()>, Error> {
        let sample_period = Duration::from_secs(self.load.sample_period_secs);
        let mut monitor = LoadMonitor::new(Arc::clone(&self.bench.history), Arc::clone(&self.probe), sample_period);
        if let Some(ref path) = self.load.path {
            let store = LoadStore::new(path);
            match store.read_all() {
                Ok(samples) => {
                    debug!(samples = samples.len(), path = %path.display(), "primed load history");
                    self.bench.history.write().extend(samples);
                }
                Err(e) => warn!(error = %e, "cannot read load history"),
            }
            monitor = monitor.persist_to(store, Duration::from_secs(self.load.write_period_secs));
        }
        monitor
            .spawn(self.bench.quit.clone())
            .map_err(|source| Error::Thread {
                name: "load monitor",
                source,
            })
    }

    fn start(&mut self, i: usize) -> Result<Running, Error> {
        let mut routine = self.routines.remove(i);
        let name = routine.name.clone();
        debug!(routine = %name, completion = routine.completion(), "starting benchmark");
        let bench = self.bench.clone();
        let handle = thread::Builder::new()
            .name(format!("bench-{}", name))
            .spawn(move || {
                bench.step(&mut routine);
                routine
            })
            .map_err(|source| Error::Thread {
                name: "benchmark",
                source,
            })?;
        Ok(Running { index: i, name, handle })
    }

    fn collect(&mut self, r: Running) {
        match r.handle.join() {
            Ok(routine) => {
                let at = r.index.min(self.routines.len());
                self.routines.insert(at, routine);
            }
            Err(_) => error!(routine = %r.name, "benchmark thread panicked; dropping routine"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{ParamConfig, RoutineConfig};
    use crate::routine::ConstructionMethod;
    use crate::store::ModelRecord;
    use crate::system::FixedProbe;

    // throughput grows with the parameter, so construction climbs all the way
    const SCRIPT: &str = r#"printf '1 0\n1 0\n%d\n' $(( ($1 + 1) * 1000 ))"#;

    fn routine_config(dir: &std::path::Path, name: &str, construction: ConstructionMethod) -> RoutineConfig {
        RoutineConfig {
            name: name.to_string(),
            exe_path: PathBuf::from("/bin/sh"),
            exe_args: vec!["-c".to_string(), SCRIPT.to_string(), "bench".to_string()],
            construction,
            model_path: Some(dir.join(format!("{}.json", name))),
            params: vec![ParamConfig {
                name: "n".to_string(),
                end: 8,
                ..ParamConfig::default()
            }],
            ..RoutineConfig::default()
        }
    }

    fn quiet() -> Arc<dyn SystemProbe> {
        Arc::new(FixedProbe {
            load: [0.0, 0.0, 0.0],
            users: Some(0),
        })
    }

    #[test]
    fn builds_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            main_sleep_ms: 1,
            build_only: true,
            poll_timeout_ms: 20,
            load: LoadConfig {
                path: Some(dir.path().join("load.jsonl")),
                sample_period_secs: 3600,
                ..LoadConfig::default()
            },
            routines: vec![
                routine_config(dir.path(), "gbbp", ConstructionMethod::Gbbp),
                routine_config(dir.path(), "naive", ConstructionMethod::Naive),
            ],
            ..Config::default()
        };
        let daemon = Daemon::from_config(&config, CancelToken::new()).unwrap().probe(quiet());
        let routines = daemon.run().unwrap();
        assert_eq!(routines.len(), 2);
        assert!(routines.iter().all(Routine::is_complete));

        let naive = routines.iter().find(|r| r.name == "naive").unwrap();
        // eight grid points plus the zero at the end
        assert_eq!(naive.completion(), 9);

        for name in &["gbbp", "naive"] {
            let record: ModelRecord =
                serde_json::from_slice(&std::fs::read(dir.path().join(format!("{}.json", name))).unwrap()).unwrap();
            assert!(record.complete);
            assert_eq!(record.completion as usize, record.benchmarks.len());
        }
        // the monitor flushed its one sample on the way out
        assert_eq!(LoadStore::new(dir.path().join("load.jsonl")).read_all().unwrap().len(), 1);
    }

    #[test]
    fn resumes_where_it_left_off() {
        use crate::benchmark::Benchmark;
        use crate::load::LoadHistory;

        let dir = tempfile::tempdir().unwrap();
        let rc = routine_config(dir.path(), "r", ConstructionMethod::Naive);

        // measure the first three points by hand and save
        let mut r = rc.build(&JsonStore).unwrap();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        for _ in 0..3 {
            let p = r.select().unwrap().unwrap();
            r.insert(Benchmark::estimate(p, 1000.0), &cut).unwrap();
        }
        JsonStore.save(r.model().path().unwrap(), r.model()).unwrap();
        assert_eq!(r.completion(), 4);

        let config = Config {
            main_sleep_ms: 1,
            build_only: true,
            routines: vec![rc],
            ..Config::default()
        };
        let routines = Daemon::from_config(&config, CancelToken::new())
            .unwrap()
            .probe(quiet())
            .run()
            .unwrap();
        assert!(routines[0].is_complete());
        // nothing was measured twice
        assert_eq!(routines[0].completion(), 9);
        assert_eq!(routines[0].model().repo().unique_len(), 9);
    }

    #[test]
    fn failing_benchmark_is_retried_until_quit() {
        let dir = tempfile::tempdir().unwrap();
        let mut rc = routine_config(dir.path(), "broken", ConstructionMethod::Gbbp);
        rc.exe_args = vec!["-c".to_string(), "exit 4".to_string()];
        let routine = rc.build(&JsonStore).unwrap();
        let before = routine.completion();

        let quit = CancelToken::new();
        let q = quit.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            q.cancel();
        });
        let routines = Daemon::new(vec![routine], quit)
            .probe(quiet())
            .main_sleep(Duration::from_millis(5))
            .run()
            .unwrap();
        stopper.join().unwrap();

        assert_eq!(routines.len(), 1);
        assert_eq!(routines[0].completion(), before);
        assert!(!routines[0].is_complete());
    }

    #[test]
    fn ineligible_routines_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut rc = routine_config(dir.path(), "idle", ConstructionMethod::Gbbp);
        rc.condition = crate::routine::Condition::Idle;
        let routine = rc.build(&JsonStore).unwrap();
        let before = routine.completion();

        let quit = CancelToken::new();
        let q = quit.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            q.cancel();
        });
        let busy = Arc::new(FixedProbe {
            load: [4.0, 4.0, 4.0],
            users: Some(3),
        });
        let routines = Daemon::new(vec![routine], quit)
            .probe(busy)
            .main_sleep(Duration::from_millis(5))
            .run()
            .unwrap();
        stopper.join().unwrap();
        assert_eq!(routines[0].completion(), before);
        assert!(!routines[0].executable);
    }
}
