use std::ops::Range;
use std::time::Duration;

use crate::benchmark::Benchmark;
use crate::param::ParamVector;

/// Which way [`BenchmarkRepository::search`] scans from its hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards larger points.
    Forward,
    /// Towards smaller points.
    Backward,
}

/// The samples of one model, kept sorted by parameter vector.
///
/// Samples taken at the same point sit next to each other, newest first.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkRepository {
    items: Vec<Benchmark>,
    unique: usize,
}

impl BenchmarkRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of distinct points that have samples.
    pub fn unique_len(&self) -> usize {
        self.unique
    }

    /// All samples, in order.
    pub fn as_slice(&self) -> &[Benchmark] {
        &self.items
    }

    /// Iterate over all samples, in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Benchmark> {
        self.items.iter()
    }

    /// Add a sample. Returns true if it is the first at its point.
    pub fn insert(&mut self, b: Benchmark) -> bool {
        let at = self.items.partition_point(|x| x.params < b.params);
        let new = self.items.get(at).map_or(true, |x| x.params != b.params);
        if new {
            self.unique += 1;
        }
        self.items.insert(at, b);
        new
    }

    /// Find the range of samples at `params`, scanning from index `hint` in direction `dir`.
    ///
    /// Sequential algorithms pass the previous hit as the hint so that repeated lookups stay
    /// cheap. The scan stops as soon as it passes where `params` would be.
    pub fn search(&self, params: &ParamVector, hint: usize, dir: Direction) -> Option<Range<usize>> {
        if self.items.is_empty() {
            return None;
        }
        let hint = hint.min(self.items.len() - 1);
        match dir {
            Direction::Forward => {
                let first = (hint..self.items.len())
                    .take_while(|&i| self.items[i].params <= *params)
                    .find(|&i| self.items[i].params == *params)?;
                let len = self.items[first..]
                    .iter()
                    .take_while(|b| b.params == *params)
                    .count();
                Some(first..first + len)
            }
            Direction::Backward => {
                let last = (0..=hint)
                    .rev()
                    .take_while(|&i| self.items[i].params >= *params)
                    .find(|&i| self.items[i].params == *params)?;
                let len = self.items[..=last]
                    .iter()
                    .rev()
                    .take_while(|b| b.params == *params)
                    .count();
                Some(last + 1 - len..last + 1)
            }
        }
    }

    /// All samples at `params`.
    pub fn find(&self, params: &ParamVector) -> &[Benchmark] {
        let start = self.items.partition_point(|x| x.params < *params);
        let end = start
            + self.items[start..]
                .iter()
                .take_while(|b| b.params == *params)
                .count();
        &self.items[start..end]
    }

    /// True if there is at least one sample at `params`.
    pub fn contains(&self, params: &ParamVector) -> bool {
        !self.find(params).is_empty()
    }

    /// The mean of all samples at `params`.
    pub fn average(&self, params: &ParamVector) -> Option<Benchmark> {
        Benchmark::mean(self.find(params))
    }

    /// The sample with the highest throughput at `params`.
    pub fn max(&self, params: &ParamVector) -> Option<&Benchmark> {
        self.find(params)
            .iter()
            .max_by(|a, b| a.flops.total_cmp(&b.flops))
    }

    /// Number of samples at `params` and their total wall time.
    pub fn exec_stats(&self, params: &ParamVector) -> (u32, Duration) {
        self.find(params)
            .iter()
            .fold((0, Duration::ZERO), |(n, t), b| (n + 1, t + b.wall))
    }

    /// Samples grouped by point, in order.
    pub fn points(&self) -> Points<'_> {
        Points { rest: &self.items }
    }

    /// The mean sample at each distinct point, in order.
    pub fn averages(&self) -> impl Iterator<Item = Benchmark> + '_ {
        self.points().filter_map(Benchmark::mean)
    }

    /// Estimate throughput at `params` from neighbouring points of a one-parameter model.
    ///
    /// Before the first point the first value holds; past the last point throughput is zero.
    pub fn interpolate_1d(&self, params: &ParamVector) -> f64 {
        let x = params[0];
        let mut prev: Option<Benchmark> = None;
        for avg in self.averages() {
            let ax = avg.params[0];
            if ax == x {
                return avg.flops;
            }
            if ax > x {
                return match prev {
                    Some(p) => {
                        let px = p.params[0];
                        p.flops + (avg.flops - p.flops) * (x - px) as f64 / (ax - px) as f64
                    }
                    None => avg.flops,
                };
            }
            prev = Some(avg);
        }
        0.0
    }

    /// Detach every sample at `params`.
    ///
    /// The caller is expected to reinsert them, or to drop them for good.
    pub fn remove_at(&mut self, params: &ParamVector) -> Vec<Benchmark> {
        let start = self.items.partition_point(|x| x.params < *params);
        let end = start + self.find(params).len();
        if end > start {
            self.unique -= 1;
        }
        self.items.drain(start..end).collect()
    }
}

impl<'a> IntoIterator for &'a BenchmarkRepository {
    type Item = &'a Benchmark;
    type IntoIter = std::slice::Iter<'a, Benchmark>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the samples of a repository, grouped by point.
#[derive(Debug, Clone)]
pub struct Points<'a> {
    rest: &'a [Benchmark],
}

impl<'a> Iterator for Points<'a> {
    type Item = &'a [Benchmark];
    fn next(&mut self) -> Option<Self::Item> {
        let first = self.rest.first()?;
        let n = self
            .rest
            .iter()
            .take_while(|b| b.params == first.params)
            .count();
        let (group, rest) = self.rest.split_at(n);
        self.rest = rest;
        Some(group)
    }
}

#[cfg(test)]
fn bench(p: i64, flops: f64) -> Benchmark {
    Benchmark::estimate(ParamVector::new(vec![p]), flops)
}

#[test]
fn insert_keeps_order() {
    let mut repo = BenchmarkRepository::new();
    for &p in &[5, 1, 9, 3, 5, 0] {
        repo.insert(bench(p, 1.0));
    }
    let ps: Vec<_> = repo.iter().map(|b| b.params[0]).collect();
    assert_eq!(ps, vec![0, 1, 3, 5, 5, 9]);
    assert_eq!(repo.unique_len(), 5);
}

#[test]
fn insert_twice() {
    let mut repo = BenchmarkRepository::new();
    let b = bench(3, 2.0);
    assert!(repo.insert(b.clone()));
    assert!(!repo.insert(b));
    assert_eq!(repo.len(), 2);
    assert_eq!(repo.unique_len(), 1);
}

#[test]
fn search_both_ways() {
    let mut repo = BenchmarkRepository::new();
    for &p in &[1, 2, 2, 2, 4, 7] {
        repo.insert(bench(p, 1.0));
    }
    let two = ParamVector::new(vec![2]);
    assert_eq!(repo.search(&two, 0, Direction::Forward), Some(1..4));
    assert_eq!(repo.search(&two, 5, Direction::Backward), Some(1..4));
    assert_eq!(repo.search(&two, 2, Direction::Forward), Some(2..4));
    // the hint is past the target
    assert_eq!(repo.search(&two, 4, Direction::Forward), None);
    assert_eq!(repo.search(&ParamVector::new(vec![3]), 0, Direction::Forward), None);
    assert_eq!(repo.search(&ParamVector::new(vec![7]), 100, Direction::Backward), Some(5..6));
    assert_eq!(BenchmarkRepository::new().search(&two, 0, Direction::Forward), None);
}

#[test]
fn average_and_max() {
    let mut repo = BenchmarkRepository::new();
    repo.insert(bench(2, 10.0));
    repo.insert(bench(2, 20.0));
    repo.insert(bench(3, 5.0));
    let two = ParamVector::new(vec![2]);
    assert_eq!(repo.average(&two).unwrap().flops, 15.0);
    assert_eq!(repo.max(&two).unwrap().flops, 20.0);
    assert!(repo.average(&ParamVector::new(vec![1])).is_none());
    assert_eq!(repo.exec_stats(&two).0, 2);
}

#[test]
fn interpolate_1d_rules() {
    let mut repo = BenchmarkRepository::new();
    repo.insert(bench(10, 100.0));
    repo.insert(bench(20, 200.0));
    repo.insert(bench(20, 400.0));
    let at = |x| repo.interpolate_1d(&ParamVector::new(vec![x]));
    assert_eq!(at(10), 100.0);
    assert_eq!(at(20), 300.0);
    assert_eq!(at(15), 200.0);
    assert_eq!(at(0), 100.0);
    assert_eq!(at(21), 0.0);
}

#[test]
fn remove_and_reinsert() {
    let mut repo = BenchmarkRepository::new();
    for &p in &[1, 2, 2, 3] {
        repo.insert(bench(p, p as f64));
    }
    let two = ParamVector::new(vec![2]);
    let detached = repo.remove_at(&two);
    assert_eq!(detached.len(), 2);
    assert_eq!(repo.len(), 2);
    assert_eq!(repo.unique_len(), 2);
    assert!(repo.remove_at(&two).is_empty());
    assert_eq!(repo.unique_len(), 2);
    for b in detached {
        repo.insert(b);
    }
    assert_eq!(repo.len(), 4);
    assert_eq!(repo.unique_len(), 3);
}

#[test]
fn grouped_points() {
    let mut repo = BenchmarkRepository::new();
    for &p in &[1, 2, 2, 3] {
        repo.insert(bench(p, 1.0));
    }
    let sizes: Vec<_> = repo.points().map(|g| g.len()).collect();
    assert_eq!(sizes, vec![1, 2, 1]);
}

#[cfg(test)]
proptest::proptest! {
    #[test]
    fn always_sorted(points in proptest::collection::vec((0i64..20, 0i64..20), 0..64)) {
        let mut repo = BenchmarkRepository::new();
        let mut unique = std::collections::BTreeSet::new();
        for (m, n) in points {
            let p = ParamVector::new(vec![m, n]);
            unique.insert(p.clone());
            repo.insert(Benchmark::estimate(p, 1.0));
        }
        proptest::prop_assert!(repo
            .as_slice()
            .windows(2)
            .all(|w| crate::param::params_cmp(&w[0].params, &w[1].params) != std::cmp::Ordering::Greater));
        proptest::prop_assert_eq!(repo.unique_len(), unique.len());
        proptest::prop_assert_eq!(repo.points().count(), unique.len());
    }
}
