use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Construction;
use crate::benchmark::Benchmark;
use crate::error::ConstructionError;
use crate::gbbp::Gbbp;
use crate::model::Model;
use crate::naive::Naive;
use crate::naive_bisect::NaiveBisect;
use crate::param::ParamVector;
use crate::random::Random;
use crate::system::SystemProbe;
use crate::tolerance::Cut;

// 5-minute load average below which the machine counts as idle
const IDLE_LOAD: f64 = 0.10;

/// When a routine may be benchmarked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Always.
    #[default]
    Now,
    /// Only while the 5-minute load average is below 0.10.
    Idle,
    /// Only while nobody is logged in.
    NoUsers,
}

impl Condition {
    /// Whether the condition currently holds on the machine `probe` describes.
    pub fn holds(&self, probe: &dyn SystemProbe) -> bool {
        match *self {
            Condition::Now => true,
            Condition::Idle => probe.load_average()[1] < IDLE_LOAD,
            Condition::NoUsers => match probe.interactive_users() {
                Ok(n) => n == 0,
                Err(e) => {
                    warn!(error = %e, "cannot count logged-in users");
                    false
                }
            },
        }
    }
}

/// Which [`Construction`] a routine's model is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstructionMethod {
    /// [`Naive`]: every grid point.
    Naive,
    /// [`NaiveBisect`]: breadth-first bisection of a single parameter.
    NaiveBisect,
    /// [`Random`]: grid points in random order.
    Random,
    /// [`Gbbp`] along the diagonal, then meshed.
    #[default]
    Gbbp,
    /// [`Gbbp`] along every grid line.
    GbbpNaive,
}

impl ConstructionMethod {
    /// A fresh builder for this method.
    pub fn builder(self) -> Box<dyn Construction> {
        match self {
            ConstructionMethod::Naive => Box::new(Naive::new()),
            ConstructionMethod::NaiveBisect => Box::new(NaiveBisect::new()),
            ConstructionMethod::Random => Box::new(Random::new()),
            ConstructionMethod::Gbbp => Box::new(Gbbp::diagonal()),
            ConstructionMethod::GbbpNaive => Box::new(Gbbp::boundary()),
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            ConstructionMethod::Naive => "naive",
            ConstructionMethod::NaiveBisect => "naive bisect",
            ConstructionMethod::Random => "random",
            ConstructionMethod::Gbbp => "gbbp",
            ConstructionMethod::GbbpNaive => "gbbp naive",
        }
    }

    /// Whether this method can build a model with `n_p` parameters.
    pub fn supports(self, n_p: usize) -> bool {
        match self {
            ConstructionMethod::NaiveBisect => n_p == 1,
            _ => n_p > 0,
        }
    }
}

impl fmt::Display for ConstructionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How many samples a point needs before construction moves past it.
///
/// Either threshold being met is enough. With neither set, a single sample is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleThresholds {
    /// Number of executions at the point.
    pub min_samples: Option<u32>,
    /// Total benchmark wall time at the point.
    pub min_time: Option<Duration>,
}

impl SampleThresholds {
    /// True if `execs` runs taking `time` in total are enough.
    pub fn reached(&self, execs: u32, time: Duration) -> bool {
        if self.min_samples.is_none() && self.min_time.is_none() {
            return true;
        }
        self.min_samples.map_or(false, |n| execs >= n) || self.min_time.map_or(false, |t| time >= t)
    }
}

/// A benchmarked routine: how to run it, when to run it, and its model so far.
#[derive(Debug)]
pub struct Routine {
    /// Unique name.
    pub name: String,
    /// Benchmark executable.
    pub exe_path: PathBuf,
    /// Arguments passed before the parameter values.
    pub exe_args: Vec<String>,
    /// When this routine may run.
    pub condition: Condition,
    /// Higher runs first.
    pub priority: i32,
    /// Whether `condition` held the last time the scheduler looked.
    pub executable: bool,
    /// When to advance construction past a point.
    pub thresholds: SampleThresholds,
    /// Stop construction after this many benchmarks.
    pub max_completion: Option<u64>,
    method: ConstructionMethod,
    model: Model,
    builder: Box<dyn Construction>,
}

impl Routine {
    /// A routine that builds `model` with `method`.
    ///
    /// If the model has no construction intervals yet, they are seeded here.
    pub fn new(
        name: impl Into<String>,
        exe_path: impl Into<PathBuf>,
        mut model: Model,
        method: ConstructionMethod,
    ) -> Result<Self, ConstructionError> {
        if !method.supports(model.n_p()) {
            return Err(ConstructionError::Unsupported {
                method: method.name(),
                n_p: model.n_p(),
            });
        }
        let mut builder = method.builder();
        if model.intervals().is_empty() && !model.is_complete() {
            builder.seed(&mut model)?;
        }
        Ok(Routine {
            name: name.into(),
            exe_path: exe_path.into(),
            exe_args: Vec::new(),
            condition: Condition::default(),
            priority: 0,
            executable: false,
            thresholds: SampleThresholds::default(),
            max_completion: None,
            method,
            model,
            builder,
        })
    }

    /// Set the arguments passed ahead of the parameters.
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.exe_args = args;
        self
    }

    /// Set when this routine may run.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Set the scheduling priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-point sample thresholds.
    pub fn thresholds(mut self, thresholds: SampleThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Stop construction after `max` benchmarks.
    pub fn max_completion(mut self, max: u64) -> Self {
        self.max_completion = Some(max);
        self.enforce_max_completion();
        self
    }

    /// The construction method in use.
    pub fn method(&self) -> ConstructionMethod {
        self.method
    }

    /// The model built so far.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Where the benchmark executable lives.
    pub fn exe(&self) -> &Path {
        &self.exe_path
    }

    /// True once the model needs no more benchmarks.
    pub fn is_complete(&self) -> bool {
        self.model.is_complete()
    }

    /// Number of benchmarks taken so far.
    pub fn completion(&self) -> u64 {
        self.model.completion()
    }

    /// The next point to benchmark, or `None` once the model is complete.
    pub fn select(&mut self) -> Result<Option<ParamVector>, ConstructionError> {
        if self.model.is_complete() {
            return Ok(None);
        }
        self.builder.select(&mut self.model)
    }

    /// Store a new benchmark, advancing construction once the point has enough samples.
    ///
    /// The benchmark is kept even if construction cannot use it.
    pub fn insert(&mut self, b: Benchmark, cut: &Cut<'_>) -> Result<(), ConstructionError> {
        let at = b.params.clone();
        self.model.insert(b);
        let (execs, time) = self.model.exec_stats(&at);
        let advanced = if self.thresholds.reached(execs, time) {
            self.builder.advance(&mut self.model, &at, cut)
        } else {
            debug!(routine = %self.name, point = %at, execs, "waiting for more samples");
            Ok(())
        };
        self.enforce_max_completion();
        advanced
    }

    fn enforce_max_completion(&mut self) {
        if let Some(max) = self.max_completion {
            if !self.model.is_complete() && self.model.completion() >= max {
                info!(routine = %self.name, completion = self.model.completion(), "reached maximum completion");
                self.model.mark_complete();
            }
        }
    }

    /// Forget the model's unwritten changes once it has been persisted.
    pub(crate) fn mark_written(&mut self) {
        self.model.mark_written();
    }
}

#[cfg(test)]
use crate::load::LoadHistory;
#[cfg(test)]
use crate::param::{ParamDef, ParamDefSet};
#[cfg(test)]
use crate::system::FixedProbe;
#[cfg(test)]
use crate::tolerance::FixedBand;

#[cfg(test)]
fn one_param(end: i64) -> Model {
    Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, end)]).unwrap())
}

#[test]
fn conditions() {
    let idle = FixedProbe {
        load: [2.0, 0.05, 0.5],
        users: Some(0),
    };
    let busy = FixedProbe {
        load: [0.0, 0.5, 0.0],
        users: Some(2),
    };
    let unknown = FixedProbe {
        load: [0.0, 0.0, 0.0],
        users: None,
    };
    assert!(Condition::Now.holds(&busy));
    assert!(Condition::Idle.holds(&idle));
    assert!(!Condition::Idle.holds(&busy));
    assert!(Condition::NoUsers.holds(&idle));
    assert!(!Condition::NoUsers.holds(&busy));
    assert!(!Condition::NoUsers.holds(&unknown));
}

#[test]
fn condition_names() {
    let c: Vec<Condition> = serde_json::from_str(r#"["now", "idle", "nousers"]"#).unwrap();
    assert_eq!(c, vec![Condition::Now, Condition::Idle, Condition::NoUsers]);
    let m: ConstructionMethod = serde_json::from_str(r#""gbbp_naive""#).unwrap();
    assert_eq!(m, ConstructionMethod::GbbpNaive);
}

#[test]
fn thresholds_either() {
    let none = SampleThresholds::default();
    assert!(none.reached(1, Duration::ZERO));

    let t = SampleThresholds {
        min_samples: Some(3),
        min_time: Some(Duration::from_secs(10)),
    };
    assert!(!t.reached(2, Duration::from_secs(9)));
    assert!(t.reached(3, Duration::ZERO));
    assert!(t.reached(1, Duration::from_secs(10)));

    let count_only = SampleThresholds {
        min_samples: Some(2),
        min_time: None,
    };
    assert!(!count_only.reached(1, Duration::from_secs(1000)));
}

#[test]
fn naive_bisect_needs_one_param() {
    let two = Model::new(ParamDefSet::new(vec![ParamDef::new("m", 0, 4), ParamDef::new("n", 0, 4).order(1)]).unwrap());
    assert!(matches!(
        Routine::new("r", "/bin/true", two, ConstructionMethod::NaiveBisect),
        Err(ConstructionError::Unsupported { n_p: 2, .. })
    ));
}

#[test]
fn waits_for_enough_samples() {
    let mut r = Routine::new("r", "/bin/true", one_param(4), ConstructionMethod::Naive)
        .unwrap()
        .thresholds(SampleThresholds {
            min_samples: Some(2),
            min_time: None,
        });
    let history = LoadHistory::new(1);
    let band = FixedBand::default();
    let cut = Cut::new(&band, &history);

    let p = r.select().unwrap().unwrap();
    assert_eq!(p[0], 0);
    r.insert(Benchmark::estimate(p.clone(), 1.0), &cut).unwrap();
    // one sample is not enough to move on
    assert_eq!(r.select().unwrap(), Some(p.clone()));
    r.insert(Benchmark::estimate(p, 1.0), &cut).unwrap();
    assert_eq!(r.select().unwrap().unwrap()[0], 1);
}

#[test]
fn stops_at_max_completion() {
    let mut r = Routine::new("r", "/bin/true", one_param(100), ConstructionMethod::Naive)
        .unwrap()
        .max_completion(4);
    let history = LoadHistory::new(1);
    let band = FixedBand::default();
    let cut = Cut::new(&band, &history);
    // the model already holds its boundary zero
    assert_eq!(r.completion(), 1);
    let mut runs = 0;
    while let Some(p) = r.select().unwrap() {
        r.insert(Benchmark::estimate(p, 1.0), &cut).unwrap();
        runs += 1;
    }
    assert_eq!(runs, 3);
    assert!(r.is_complete());
    assert_eq!(r.completion(), 4);
}

#[test]
fn unmatched_benchmark_is_kept() {
    let mut r = Routine::new("r", "/bin/true", one_param(8), ConstructionMethod::Gbbp).unwrap();
    let history = LoadHistory::new(1);
    let band = FixedBand::default();
    let cut = Cut::new(&band, &history);
    let before = r.completion();
    let stray = ParamVector::new(vec![5]);
    assert!(matches!(
        r.insert(Benchmark::estimate(stray.clone(), 1.0), &cut),
        Err(ConstructionError::Unmatched { .. })
    ));
    assert_eq!(r.completion(), before + 1);
    assert!(r.model().repo().contains(&stray));
    assert_eq!(r.select().unwrap(), Some(ParamVector::new(vec![0])));
}
