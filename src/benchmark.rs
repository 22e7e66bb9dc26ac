use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::param::ParamVector;

/// One measurement of a routine at one point of its parameter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    /// Where the measurement was taken.
    pub params: ParamVector,
    /// Work units performed.
    pub complexity: u64,
    /// Throughput, in work units per wall-clock second.
    pub flops: f64,
    /// Wall-clock time of the run.
    pub wall: Duration,
    /// CPU time consumed by the run.
    pub used: Duration,
}

impl Benchmark {
    /// A measurement of `complexity` work units taking `wall` seconds.
    ///
    /// A zero wall time yields zero throughput.
    pub fn new(params: ParamVector, complexity: u64, wall: Duration, used: Duration) -> Self {
        let secs = wall.as_secs_f64();
        let flops = if secs > 0.0 { complexity as f64 / secs } else { 0.0 };
        Benchmark {
            params,
            complexity,
            flops,
            wall,
            used,
        }
    }

    /// The throughput a model assumes at the end of a parameter axis that is not measured.
    pub fn zero(params: ParamVector) -> Self {
        Benchmark {
            params,
            complexity: 0,
            flops: 0.0,
            wall: Duration::ZERO,
            used: Duration::ZERO,
        }
    }

    /// A synthesized sample with the given throughput, used for model estimates.
    pub fn estimate(params: ParamVector, flops: f64) -> Self {
        Benchmark {
            flops,
            ..Benchmark::zero(params)
        }
    }

    /// The mean of a set of samples taken at the same point.
    ///
    /// Returns `None` for an empty set.
    pub fn mean<'a, I>(samples: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Benchmark>,
    {
        let mut samples = samples.into_iter();
        let first = samples.next()?;
        let mut n = 1u32;
        let mut flops = first.flops;
        let mut wall = first.wall;
        let mut used = first.used;
        for b in samples {
            n += 1;
            flops += b.flops;
            wall += b.wall;
            used += b.used;
        }
        Some(Benchmark {
            params: first.params.clone(),
            complexity: first.complexity,
            flops: flops / f64::from(n),
            wall: wall / n,
            used: used / n,
        })
    }
}

#[test]
fn flops_from_wall_time() {
    let b = Benchmark::new(
        ParamVector::new(vec![1]),
        1_000_000,
        Duration::from_millis(3500),
        Duration::from_secs(2),
    );
    assert!((b.flops - 285_714.285).abs() < 0.01);
}

#[test]
fn mean_of_samples() {
    let p = ParamVector::new(vec![4]);
    let a = Benchmark::new(p.clone(), 100, Duration::from_secs(1), Duration::from_secs(1));
    let b = Benchmark::new(p.clone(), 100, Duration::from_secs(2), Duration::from_secs(1));
    let m = Benchmark::mean(&[a, b]).unwrap();
    assert_eq!(m.params, p);
    assert_eq!(m.flops, 75.0);
    assert_eq!(m.wall, Duration::from_millis(1500));
    assert!(Benchmark::mean(&Vec::<Benchmark>::new()).is_none());
}
