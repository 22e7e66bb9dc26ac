//! Daemon configuration.
//!
//! The configuration is a single JSON document. Every field has a default, so `{}` is a valid
//! (if useless) configuration:
//!
//! ```json
//! {
//!   "main_sleep_ms": 1000,
//!   "tolerance": 0.05,
//!   "write_thresholds": { "num_execs": 10, "time_secs": 60 },
//!   "load": { "path": "load.jsonl" },
//!   "routines": [
//!     {
//!       "name": "dgemm",
//!       "exe_path": "./bench-dgemm",
//!       "condition": "idle",
//!       "construction": "gbbp",
//!       "params": [
//!         { "name": "m", "start": 16, "end": 2048, "stride": 16 },
//!         { "name": "n", "start": 16, "end": 2048, "stride": 16 }
//!       ],
//!       "constraint": { "formula": "m*n", "max": 1048576 }
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Error};
use crate::model::{Model, WritePolicy};
use crate::param::{ParamConstraint, ParamDef, ParamDefSet, ProductFormula};
use crate::routine::{Condition, ConstructionMethod, Routine, SampleThresholds};
use crate::store::ModelStore;

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Milliseconds between scheduling ticks.
    pub main_sleep_ms: u64,
    /// Exit once every model is complete.
    pub build_only: bool,
    /// Upper bound, in milliseconds, on how long a running benchmark takes to notice shutdown.
    pub poll_timeout_ms: u64,
    /// Relative difference below which two throughputs count as equal.
    pub tolerance: f64,
    /// When models are written out.
    pub write_thresholds: WriteThresholds,
    /// Load monitoring.
    pub load: LoadConfig,
    /// The routines to model.
    pub routines: Vec<RoutineConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            main_sleep_ms: 1000,
            build_only: false,
            poll_timeout_ms: 5000,
            tolerance: 0.05,
            write_thresholds: WriteThresholds::default(),
            load: LoadConfig::default(),
            routines: Vec::new(),
        }
    }
}

/// When a model is written out after a benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteThresholds {
    /// After this many unwritten benchmarks.
    pub num_execs: u32,
    /// After this many seconds of unwritten benchmark wall time. Zero disables this trigger.
    pub time_secs: u64,
}

impl Default for WriteThresholds {
    fn default() -> Self {
        WriteThresholds {
            num_execs: 1,
            time_secs: 0,
        }
    }
}

/// Load monitoring settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Where to append load samples. Nothing is written if unset.
    pub path: Option<PathBuf>,
    /// Number of samples kept in memory.
    pub capacity: usize,
    /// Seconds between samples.
    pub sample_period_secs: u64,
    /// Seconds between writes to `path`.
    pub write_period_secs: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            path: None,
            capacity: 60,
            sample_period_secs: 60,
            write_period_secs: 600,
        }
    }
}

/// One routine to model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoutineConfig {
    /// Unique name, also used for the default model file.
    pub name: String,
    /// Benchmark executable.
    pub exe_path: PathBuf,
    /// Arguments passed before the parameter values.
    pub exe_args: Vec<String>,
    /// When the routine may run.
    pub condition: Condition,
    /// Higher runs first.
    pub priority: i32,
    /// How the model is built.
    pub construction: ConstructionMethod,
    /// Samples needed at a point before construction moves on.
    pub min_sample_num: Option<u32>,
    /// Seconds of samples needed at a point before construction moves on.
    pub min_sample_time: Option<f64>,
    /// Stop after this many benchmarks.
    pub max_completion: Option<u64>,
    /// Model file. Defaults to `<name>.model.json`.
    pub model_path: Option<PathBuf>,
    /// The parameters, passed to the benchmark in `order`.
    pub params: Vec<ParamConfig>,
    /// Restricts which points are benchmarked.
    pub constraint: Option<ConstraintConfig>,
}

/// One parameter of a routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamConfig {
    /// Parameter name, as used in constraint formulas.
    pub name: String,
    /// Smallest value.
    pub start: i64,
    /// Largest value.
    pub end: i64,
    /// Distance between benchmarked values.
    pub stride: i64,
    /// Shift of the stride sequence.
    pub offset: i64,
    /// Benchmark the end of the range instead of assuming zero throughput there.
    pub nonzero_end: bool,
    /// Position on the command line. Defaults to the position in this list.
    pub order: Option<usize>,
}

impl Default for ParamConfig {
    fn default() -> Self {
        ParamConfig {
            name: String::new(),
            start: 0,
            end: 0,
            stride: 1,
            offset: 0,
            nonzero_end: false,
            order: None,
        }
    }
}

/// Bounds on a product of parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConstraintConfig {
    /// A product such as `m*n*k`.
    pub formula: String,
    /// Smallest allowed value.
    pub min: Option<i64>,
    /// Largest allowed value.
    pub max: Option<i64>,
}

impl Config {
    /// Read and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), routines = config.routines.len(), "loaded configuration");
        Ok(config)
    }

    /// Check everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance >= 0.0) {
            return Err(ConfigError::Invalid {
                routine: String::new(),
                reason: format!("tolerance {} is negative", self.tolerance),
            });
        }
        let mut names = BTreeSet::new();
        for r in &self.routines {
            r.validate()?;
            if !names.insert(r.name.as_str()) {
                return Err(ConfigError::Invalid {
                    routine: r.name.clone(),
                    reason: "defined more than once".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Time between scheduling ticks.
    pub fn main_sleep(&self) -> Duration {
        Duration::from_millis(self.main_sleep_ms)
    }

    /// Cancellation latency of a running benchmark.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// When models are written out.
    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            num_execs: self.write_thresholds.num_execs,
            time: Duration::from_secs(self.write_thresholds.time_secs),
        }
    }
}

impl RoutineConfig {
    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            routine: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Check this routine on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(self.invalid("routine has no name"));
        }
        if self.params.is_empty() {
            return Err(self.invalid("no parameters"));
        }
        let mut orders = BTreeSet::new();
        for (i, p) in self.params.iter().enumerate() {
            self.def(i, p)
                .validate()
                .map_err(|e| self.invalid(e.to_string()))?;
            if !orders.insert(p.order.unwrap_or(i)) {
                return Err(self.invalid(format!("parameter `{}` reuses order {}", p.name, p.order.unwrap_or(i))));
            }
        }
        if !self.construction.supports(self.params.len()) {
            return Err(self.invalid(format!(
                "{} construction does not support {} parameters",
                self.construction,
                self.params.len()
            )));
        }
        if let Some(t) = self.min_sample_time {
            if !(t >= 0.0) || !t.is_finite() {
                return Err(self.invalid(format!("min_sample_time {} is not a duration", t)));
            }
        }
        Ok(())
    }

    fn def(&self, i: usize, p: &ParamConfig) -> ParamDef {
        let mut d = ParamDef::new(p.name.clone(), p.start, p.end)
            .stride(p.stride)
            .offset(p.offset)
            .order(p.order.unwrap_or(i));
        if p.nonzero_end {
            d = d.nonzero_end();
        }
        d
    }

    /// Where this routine's model is kept.
    pub fn model_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.model.json", self.name)))
    }

    /// The parameter space, with its constraint attached if there is one.
    pub fn param_set(&self) -> Result<ParamDefSet, ConfigError> {
        let defs = self.params.iter().enumerate().map(|(i, p)| self.def(i, p)).collect();
        let set = ParamDefSet::new(defs)?;
        let c = match self.constraint {
            Some(ref c) => c,
            None => return Ok(set),
        };
        let mut constraint = ParamConstraint::new(c.formula.clone(), c.min, c.max);
        match ProductFormula::parse(&c.formula, &set.names()) {
            Some(f) => constraint = constraint.with_evaluator(Arc::new(f)),
            None => warn!(
                routine = %self.name,
                formula = %c.formula,
                "cannot evaluate constraint; no point will satisfy it"
            ),
        }
        Ok(set.with_constraint(constraint))
    }

    /// Sample thresholds for construction.
    pub fn thresholds(&self) -> SampleThresholds {
        SampleThresholds {
            min_samples: self.min_sample_num,
            min_time: self.min_sample_time.map(Duration::from_secs_f64),
        }
    }

    /// Build the routine, resuming from its model file in `store` if there is one.
    pub fn build(&self, store: &dyn ModelStore) -> Result<Routine, Error> {
        let params = self.param_set()?;
        let path = self.model_path();
        let model = match store.load(&path)? {
            Some(record) => {
                record.check(&path, &params)?;
                info!(
                    routine = %self.name,
                    completion = record.completion,
                    complete = record.complete,
                    "resuming model"
                );
                Model::restore(params, record)
            }
            None => {
                debug!(routine = %self.name, path = %path.display(), "starting a fresh model");
                Model::new(params)
            }
        };
        let mut routine = Routine::new(self.name.clone(), self.exe_path.clone(), model.with_path(path), self.construction)?
            .args(self.exe_args.clone())
            .condition(self.condition)
            .priority(self.priority)
            .thresholds(self.thresholds());
        if let Some(max) = self.max_completion {
            routine = routine.max_completion(max);
        }
        Ok(routine)
    }
}

#[cfg(test)]
fn parse(json: &str) -> Result<Config, ConfigError> {
    let c: Config = serde_json::from_str(json).unwrap();
    c.validate()?;
    Ok(c)
}

#[test]
fn defaults() {
    let c = parse("{}").unwrap();
    assert_eq!(c, Config::default());
    assert_eq!(c.main_sleep(), Duration::from_secs(1));
    assert_eq!(c.poll_timeout(), Duration::from_secs(5));
    assert_eq!(c.write_policy(), WritePolicy::default());
    assert_eq!(c.load.capacity, 60);
}

#[test]
fn full_routine() {
    let c = parse(
        r#"{
            "routines": [{
                "name": "gemm",
                "exe_path": "/opt/bench/gemm",
                "exe_args": ["--warm"],
                "condition": "nousers",
                "priority": 3,
                "construction": "gbbp_naive",
                "min_sample_num": 2,
                "min_sample_time": 1.5,
                "params": [
                    { "name": "n", "start": 8, "end": 64, "stride": 8, "order": 1 },
                    { "name": "m", "start": 8, "end": 64, "stride": 8, "nonzero_end": true, "order": 0 }
                ],
                "constraint": { "formula": "m*n", "max": 1024 }
            }]
        }"#,
    )
    .unwrap();
    let r = &c.routines[0];
    assert_eq!(r.condition, Condition::NoUsers);
    assert_eq!(r.construction, ConstructionMethod::GbbpNaive);
    assert_eq!(r.model_path(), PathBuf::from("gemm.model.json"));
    assert_eq!(
        r.thresholds(),
        SampleThresholds {
            min_samples: Some(2),
            min_time: Some(Duration::from_millis(1500)),
        }
    );

    let set = r.param_set().unwrap();
    // sorted by order
    assert_eq!(set.names(), vec!["m", "n"]);
    assert!(set.defs()[0].nonzero_end);
    use crate::param::ParamVector;
    assert!(set.satisfies(&ParamVector::new(vec![16, 64])));
    assert!(!set.satisfies(&ParamVector::new(vec![32, 64])));
}

#[test]
fn unparseable_constraint_fails_closed() {
    let c = parse(
        r#"{ "routines": [{
            "name": "r",
            "params": [{ "name": "n", "end": 10 }],
            "constraint": { "formula": "n+1", "max": 5 }
        }] }"#,
    )
    .unwrap();
    let set = c.routines[0].param_set().unwrap();
    assert!(!set.constraint().unwrap().is_evaluable());
    assert!(!set.satisfies(&crate::param::ParamVector::new(vec![1])));
}

#[test]
fn rejects_bad_routines() {
    let bad = [
        r#"{ "routines": [{ "params": [{ "name": "n", "end": 10 }] }] }"#,
        r#"{ "routines": [{ "name": "r" }] }"#,
        r#"{ "routines": [{ "name": "r", "params": [{ "name": "n", "end": 10, "stride": 0 }] }] }"#,
        r#"{ "routines": [{ "name": "r", "params": [{ "name": "n", "start": 10, "end": 1 }] }] }"#,
        r#"{ "routines": [{ "name": "r", "params": [
            { "name": "m", "end": 10, "order": 1 }, { "name": "n", "end": 10 }
        ] }] }"#,
        r#"{ "routines": [{ "name": "r", "construction": "naive_bisect", "params": [
            { "name": "m", "end": 10 }, { "name": "n", "end": 10 }
        ] }] }"#,
        r#"{ "routines": [
            { "name": "r", "params": [{ "name": "n", "end": 10 }] },
            { "name": "r", "params": [{ "name": "n", "end": 10 }] }
        ] }"#,
    ];
    for json in &bad {
        assert!(
            matches!(parse(json), Err(ConfigError::Invalid { .. })),
            "accepted {}",
            json
        );
    }
}

#[test]
fn load_reports_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.json");
    assert!(matches!(Config::load(&missing), Err(ConfigError::Io { .. })));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json").unwrap();
    let e = Config::load(&broken).unwrap_err();
    assert!(matches!(e, ConfigError::Json { .. }));
    assert!(e.to_string().contains("broken.json"));
}

#[test]
fn build_resumes_saved_model() {
    use crate::benchmark::Benchmark;
    use crate::store::JsonStore;

    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("r.json");
    let rc = RoutineConfig {
        name: "r".to_string(),
        exe_path: PathBuf::from("/bin/true"),
        model_path: Some(model_path.clone()),
        params: vec![ParamConfig {
            name: "n".to_string(),
            end: 16,
            ..ParamConfig::default()
        }],
        ..RoutineConfig::default()
    };

    let fresh = rc.build(&JsonStore).unwrap();
    assert_eq!(fresh.completion(), 1);
    assert_eq!(fresh.model().path(), Some(model_path.as_path()));

    let mut model = Model::new(rc.param_set().unwrap());
    model.insert(Benchmark::estimate(crate::param::ParamVector::new(vec![0]), 5.0));
    model.mark_complete();
    JsonStore.save(&model_path, &model).unwrap();

    let resumed = rc.build(&JsonStore).unwrap();
    assert_eq!(resumed.completion(), 2);
    assert!(resumed.is_complete());
}

#[test]
fn build_refuses_a_model_over_other_params() {
    use crate::benchmark::Benchmark;
    use crate::error::StoreError;
    use crate::interval::Interval;
    use crate::param::ParamVector;
    use crate::store::JsonStore;

    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("r.json");
    let axis = |name: &str| ParamConfig {
        name: name.to_string(),
        end: 8,
        ..ParamConfig::default()
    };
    let mut rc = RoutineConfig {
        name: "r".to_string(),
        exe_path: PathBuf::from("/bin/true"),
        model_path: Some(model_path.clone()),
        params: vec![axis("m"), axis("n")],
        ..RoutineConfig::default()
    };

    let mut model = Model::new(rc.param_set().unwrap());
    model.insert(Benchmark::estimate(ParamVector::new(vec![4, 4]), 10.0));
    model.intervals_mut().push_top(Interval::boundary_complete());
    JsonStore.save(&model_path, &model).unwrap();
    assert!(rc.build(&JsonStore).is_ok());

    rc.params.push(axis("k"));
    match rc.build(&JsonStore) {
        Err(Error::Store(StoreError::Mismatch { path, .. })) => assert_eq!(path, model_path),
        r => panic!("unexpected {:?}", r.map(|r| r.name)),
    }
}
