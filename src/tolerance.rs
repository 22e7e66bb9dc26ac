use std::fmt;

use crate::benchmark::Benchmark;
use crate::load::LoadHistory;

/// Decides when two throughput measurements are "the same" for the purpose of building a model.
///
/// Every method is given the recent system load so that an implementation may widen or narrow its
/// band depending on how noisy the machine has been.
pub trait Tolerance: Send + Sync + fmt::Debug {
    /// True if `a` lies within the band around `b`.
    fn contains(&self, history: &LoadHistory, a: &Benchmark, b: &Benchmark) -> bool;

    /// True if the bands around `a` and `b` overlap.
    fn intersects(&self, history: &LoadHistory, a: &Benchmark, b: &Benchmark) -> bool {
        self.contains(history, a, b)
    }

    /// True if `a` is clearly faster than `b`.
    fn greater(&self, history: &LoadHistory, a: &Benchmark, b: &Benchmark) -> bool;

    /// True if `a` is clearly slower than `b`.
    fn less(&self, history: &LoadHistory, a: &Benchmark, b: &Benchmark) -> bool;
}

/// A fixed relative-error band that ignores system load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBand {
    epsilon: f64,
}

impl FixedBand {
    /// A band of `epsilon` relative error.
    pub fn new(epsilon: f64) -> Self {
        FixedBand { epsilon }
    }

    /// The relative error this band allows.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

impl Default for FixedBand {
    fn default() -> Self {
        FixedBand::new(0.05)
    }
}

impl Tolerance for FixedBand {
    fn contains(&self, _: &LoadHistory, a: &Benchmark, b: &Benchmark) -> bool {
        let (hi, lo) = if a.flops >= b.flops {
            (a.flops, b.flops)
        } else {
            (b.flops, a.flops)
        };
        if hi <= 0.0 {
            // two zero-throughput points agree
            return true;
        }
        lo > 0.0 && hi / lo <= 1.0 + self.epsilon
    }

    fn greater(&self, _: &LoadHistory, a: &Benchmark, b: &Benchmark) -> bool {
        a.flops > b.flops * (1.0 + self.epsilon)
    }

    fn less(&self, _: &LoadHistory, a: &Benchmark, b: &Benchmark) -> bool {
        a.flops < b.flops * (1.0 - self.epsilon)
    }
}

/// A [`Tolerance`] bound to a snapshot of the load history.
#[derive(Debug, Clone, Copy)]
pub struct Cut<'a> {
    tolerance: &'a dyn Tolerance,
    history: &'a LoadHistory,
}

impl<'a> Cut<'a> {
    /// Bind `tolerance` to `history`.
    pub fn new(tolerance: &'a dyn Tolerance, history: &'a LoadHistory) -> Self {
        Cut { tolerance, history }
    }

    /// See [`Tolerance::contains`].
    pub fn contains(&self, a: &Benchmark, b: &Benchmark) -> bool {
        self.tolerance.contains(self.history, a, b)
    }

    /// See [`Tolerance::intersects`].
    pub fn intersects(&self, a: &Benchmark, b: &Benchmark) -> bool {
        self.tolerance.intersects(self.history, a, b)
    }

    /// See [`Tolerance::greater`].
    pub fn greater(&self, a: &Benchmark, b: &Benchmark) -> bool {
        self.tolerance.greater(self.history, a, b)
    }

    /// See [`Tolerance::less`].
    pub fn less(&self, a: &Benchmark, b: &Benchmark) -> bool {
        self.tolerance.less(self.history, a, b)
    }

    /// Faster than, or indistinguishable from.
    pub fn greater_or_equal(&self, a: &Benchmark, b: &Benchmark) -> bool {
        self.greater(a, b) || self.contains(a, b)
    }
}

#[cfg(test)]
fn at(flops: f64) -> Benchmark {
    Benchmark::estimate(crate::param::ParamVector::new(vec![0]), flops)
}

#[test]
fn band_edges() {
    let h = LoadHistory::new(1);
    let band = FixedBand::default();
    let cut = Cut::new(&band, &h);
    assert!(cut.contains(&at(100.0), &at(104.0)));
    assert!(cut.contains(&at(104.0), &at(100.0)));
    assert!(!cut.contains(&at(100.0), &at(106.0)));
    assert!(cut.intersects(&at(100.0), &at(104.0)));
    assert!(cut.greater(&at(106.0), &at(100.0)));
    assert!(!cut.greater(&at(104.0), &at(100.0)));
    assert!(cut.less(&at(94.0), &at(100.0)));
    assert!(!cut.less(&at(96.0), &at(100.0)));
}

#[test]
fn zeros() {
    let h = LoadHistory::new(1);
    let band = FixedBand::default();
    let cut = Cut::new(&band, &h);
    assert!(cut.contains(&at(0.0), &at(0.0)));
    assert!(!cut.contains(&at(0.0), &at(1.0)));
    assert!(cut.greater(&at(1.0), &at(0.0)));
}

#[test]
fn greater_or_equal() {
    let h = LoadHistory::new(1);
    let band = FixedBand::new(0.1);
    let cut = Cut::new(&band, &h);
    assert!(cut.greater_or_equal(&at(10.0), &at(9.5)));
    assert!(cut.greater_or_equal(&at(9.5), &at(10.0)));
    assert!(cut.greater_or_equal(&at(20.0), &at(10.0)));
    assert!(!cut.greater_or_equal(&at(8.0), &at(10.0)));
}
