use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::benchmark::Benchmark;
use crate::error::ConstructionError;
use crate::interval::{Interval, IntervalStack};
use crate::param::{ParamDefSet, ParamVector};
use crate::repository::BenchmarkRepository;
use crate::store::ModelRecord;

/// Estimates throughput at unmeasured points of a model with more than one parameter.
pub trait Interpolator: Send + Sync + fmt::Debug {
    /// The estimated throughput at `params`, or `None` if there is nothing to go on.
    fn interpolate(&self, repo: &BenchmarkRepository, params: &ParamVector) -> Option<f64>;
}

/// Inverse-square-distance weighting over the nearest measured points.
///
/// Crude, but always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct InverseDistance;

impl Interpolator for InverseDistance {
    fn interpolate(&self, repo: &BenchmarkRepository, params: &ParamVector) -> Option<f64> {
        let mut near: Vec<(f64, f64)> = repo
            .averages()
            .map(|b| {
                let d2: f64 = b
                    .params
                    .iter()
                    .zip(params.iter())
                    .map(|(&x, &y)| ((x - y) as f64).powi(2))
                    .sum();
                (d2, b.flops)
            })
            .collect();
        near.sort_by(|a, b| a.0.total_cmp(&b.0));
        let &(closest, flops) = near.first()?;
        if closest == 0.0 {
            return Some(flops);
        }
        let k = (2 * params.len()).max(1);
        let (num, den) = near
            .iter()
            .take(k)
            .fold((0.0, 0.0), |(num, den), &(d2, f)| (num + f / d2, den + 1.0 / d2));
        Some(num / den)
    }
}

/// An interpolator that never has an answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterpolation;

impl Interpolator for NoInterpolation {
    fn interpolate(&self, _: &BenchmarkRepository, _: &ParamVector) -> Option<f64> {
        None
    }
}

/// When a model has changed enough to be worth writing out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// Write after this many benchmark runs.
    pub num_execs: u32,
    /// Write after this much benchmark wall time. Zero disables the time trigger.
    pub time: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        WritePolicy {
            num_execs: 1,
            time: Duration::ZERO,
        }
    }
}

impl WritePolicy {
    /// True if `execs` runs taking `time` in total warrant a write.
    pub fn due(&self, execs: u32, time: Duration) -> bool {
        execs >= self.num_execs || (!self.time.is_zero() && time >= self.time)
    }
}

/// A performance model under construction: its samples plus its construction intervals.
#[derive(Debug, Clone)]
pub struct Model {
    params: Arc<ParamDefSet>,
    repo: BenchmarkRepository,
    intervals: IntervalStack,
    completion: u64,
    complete: bool,
    path: Option<PathBuf>,
    unwritten: (u32, Duration),
    interpolator: Arc<dyn Interpolator>,
}

impl Model {
    /// A fresh model over `params`.
    ///
    /// The ends of the parameter space that are not measured start out with zero-throughput
    /// samples.
    pub fn new(params: ParamDefSet) -> Self {
        let mut m = Self::empty(params);
        let start = m.params.start_vector();
        let mut zeros = Vec::new();
        for (j, d) in m.params.defs().iter().enumerate() {
            if !d.nonzero_end {
                zeros.push(start.with(j, d.end));
            }
        }
        if !m.params.defs().iter().all(|d| d.nonzero_end) {
            zeros.push(m.params.end_vector());
        }
        for p in zeros {
            if !m.repo.contains(&p) {
                m.insert(Benchmark::zero(p));
            }
        }
        m
    }

    /// Rebuild a model from what was persisted.
    pub fn restore(params: ParamDefSet, record: ModelRecord) -> Self {
        let mut m = Self::empty(params);
        for b in record.benchmarks {
            m.repo.insert(b);
        }
        m.completion = record.completion;
        m.intervals = record.intervals.into();
        m.complete = record.complete;
        if m.complete && !m.intervals.is_complete() {
            m.mark_complete();
        }
        m
    }

    fn empty(params: ParamDefSet) -> Self {
        Model {
            params: Arc::new(params),
            repo: BenchmarkRepository::new(),
            intervals: IntervalStack::new(),
            completion: 0,
            complete: false,
            path: None,
            unwritten: (0, Duration::ZERO),
            interpolator: Arc::new(InverseDistance),
        }
    }

    /// Remember where this model is persisted.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Use `interpolator` for estimates in more than one dimension.
    pub fn with_interpolator(mut self, interpolator: Arc<dyn Interpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    /// Where this model is persisted, if anywhere.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The parameter space.
    pub fn params(&self) -> &ParamDefSet {
        &self.params
    }

    /// The parameter space, shared.
    pub fn shared_params(&self) -> Arc<ParamDefSet> {
        Arc::clone(&self.params)
    }

    /// Number of parameters.
    pub fn n_p(&self) -> usize {
        self.params.len()
    }

    /// The samples.
    pub fn repo(&self) -> &BenchmarkRepository {
        &self.repo
    }

    /// The construction intervals.
    pub fn intervals(&self) -> &IntervalStack {
        &self.intervals
    }

    /// The construction intervals, for modification.
    pub fn intervals_mut(&mut self) -> &mut IntervalStack {
        &mut self.intervals
    }

    /// Number of benchmarks inserted.
    pub fn completion(&self) -> u64 {
        self.completion
    }

    /// True once construction has finished.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Store a sample. Returns true if it is the first at its point.
    pub fn insert(&mut self, b: Benchmark) -> bool {
        self.completion += 1;
        self.unwritten.0 += 1;
        self.unwritten.1 += b.wall;
        self.repo.insert(b)
    }

    /// The mean of all samples at `params`.
    pub fn average(&self, params: &ParamVector) -> Option<Benchmark> {
        self.repo.average(params)
    }

    /// Number of samples at `params` and their total wall time.
    pub fn exec_stats(&self, params: &ParamVector) -> (u32, Duration) {
        self.repo.exec_stats(params)
    }

    /// The model's estimate of throughput at `params`.
    pub fn lookup(&self, params: &ParamVector) -> Result<f64, ConstructionError> {
        if self.n_p() == 1 {
            return Ok(self.repo.interpolate_1d(params));
        }
        self.interpolator
            .interpolate(&self.repo, params)
            .ok_or(ConstructionError::Interpolation { n_p: self.n_p() })
    }

    /// What the model would estimate at `params` if nothing had been measured there.
    pub fn old_approximation(&mut self, params: &ParamVector) -> Result<Benchmark, ConstructionError> {
        let detached = self.repo.remove_at(params);
        let estimate = self.lookup(params);
        for b in detached {
            self.repo.insert(b);
        }
        let flops = estimate?;
        trace!(point = %params, flops, "old approximation");
        Ok(Benchmark::estimate(params.clone(), flops))
    }

    /// Replace whatever construction intervals remain with the terminal marker.
    pub fn mark_complete(&mut self) {
        self.intervals.clear();
        self.intervals.push_top(Interval::complete());
        self.complete = true;
    }

    /// Mark the model complete if no construction intervals remain. Returns true if it is
    /// complete.
    pub fn finish_if_exhausted(&mut self) -> bool {
        if self.intervals.is_empty() {
            self.mark_complete();
        }
        self.complete
    }

    /// True if enough has changed since the last write under `policy`.
    pub fn write_due(&self, policy: &WritePolicy) -> bool {
        self.unwritten.0 > 0 && policy.due(self.unwritten.0, self.unwritten.1)
    }

    /// Note that the model has just been written out.
    pub fn mark_written(&mut self) {
        self.unwritten = (0, Duration::ZERO);
    }
}

#[cfg(test)]
use crate::param::ParamDef;

#[cfg(test)]
fn pv(v: &[i64]) -> ParamVector {
    ParamVector::new(v.to_vec())
}

#[test]
fn boundary_zeros_1d() {
    let m = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 100)]).unwrap());
    assert_eq!(m.repo().len(), 1);
    assert_eq!(m.completion(), 1);
    assert_eq!(m.average(&pv(&[100])).unwrap().flops, 0.0);

    let m = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 100).nonzero_end()]).unwrap());
    assert!(m.repo().is_empty());
}

#[test]
fn boundary_zeros_2d() {
    let m = Model::new(
        ParamDefSet::new(vec![
            ParamDef::new("m", 0, 10),
            ParamDef::new("n", 0, 20).order(1),
        ])
        .unwrap(),
    );
    let points: Vec<_> = m.repo().iter().map(|b| b.params.clone()).collect();
    assert_eq!(points, vec![pv(&[0, 20]), pv(&[10, 0]), pv(&[10, 20])]);

    let m = Model::new(
        ParamDefSet::new(vec![
            ParamDef::new("m", 0, 10).nonzero_end(),
            ParamDef::new("n", 0, 20).order(1),
        ])
        .unwrap(),
    );
    let points: Vec<_> = m.repo().iter().map(|b| b.params.clone()).collect();
    assert_eq!(points, vec![pv(&[0, 20]), pv(&[10, 20])]);
}

#[test]
fn old_approximation_ignores_point() {
    let mut m = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 100)]).unwrap());
    m.insert(Benchmark::estimate(pv(&[0]), 100.0));
    m.insert(Benchmark::estimate(pv(&[50]), 10.0));
    assert_eq!(m.lookup(&pv(&[50])).unwrap(), 10.0);
    // without the sample at 50, the line from (0, 100) to (100, 0) says 50
    assert_eq!(m.old_approximation(&pv(&[50])).unwrap().flops, 50.0);
    assert_eq!(m.repo().len(), 3);
    assert_eq!(m.completion(), 3);
}

#[test]
fn lookup_needs_interpolator_in_2d() {
    let params = ParamDefSet::new(vec![
        ParamDef::new("m", 0, 10).nonzero_end(),
        ParamDef::new("n", 0, 10).nonzero_end().order(1),
    ])
    .unwrap();
    let mut m = Model::new(params.clone());
    m.insert(Benchmark::estimate(pv(&[0, 0]), 10.0));
    m.insert(Benchmark::estimate(pv(&[10, 10]), 30.0));
    assert!((m.lookup(&pv(&[5, 5])).unwrap() - 20.0).abs() < 1e-9);
    assert_eq!(m.lookup(&pv(&[0, 0])).unwrap(), 10.0);

    let m = Model::new(params).with_interpolator(Arc::new(NoInterpolation));
    assert!(matches!(
        m.lookup(&pv(&[5, 5])),
        Err(ConstructionError::Interpolation { n_p: 2 })
    ));
}

#[test]
fn completes_when_exhausted() {
    let mut m = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 10)]).unwrap());
    assert!(!m.is_complete());
    assert!(m.finish_if_exhausted());
    assert!(m.is_complete());
    assert!(m.intervals().is_complete());
}

#[test]
fn write_policy() {
    let mut m = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 10).nonzero_end()]).unwrap());
    let every = WritePolicy::default();
    let slow = WritePolicy {
        num_execs: 10,
        time: Duration::from_secs(1),
    };
    assert!(!m.write_due(&every));
    m.insert(Benchmark::new(pv(&[1]), 1, Duration::from_millis(600), Duration::ZERO));
    assert!(m.write_due(&every));
    assert!(!m.write_due(&slow));
    m.insert(Benchmark::new(pv(&[2]), 1, Duration::from_millis(600), Duration::ZERO));
    assert!(m.write_due(&slow));
    m.mark_written();
    assert!(!m.write_due(&every));
}
