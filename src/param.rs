use std::cmp::Ordering;
use std::fmt;
use std::iter::FromIterator;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ParamError;

/// A point in a routine's parameter space.
///
/// Points are totally ordered lexicographically, which is also the order the benchmark repository
/// keeps its samples in.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamVector(Vec<i64>);

impl ParamVector {
    /// Wrap the given parameter values.
    pub fn new(values: Vec<i64>) -> Self {
        ParamVector(values)
    }

    /// A copy of this point with component `i` replaced by `value`.
    pub fn with(&self, i: usize, value: i64) -> Self {
        let mut p = self.clone();
        p.0[i] = value;
        p
    }

    /// The parameter values as a plain vector.
    pub fn into_inner(self) -> Vec<i64> {
        self.0
    }
}

impl Deref for ParamVector {
    type Target = [i64];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<i64>> for ParamVector {
    fn from(v: Vec<i64>) -> Self {
        ParamVector(v)
    }
}

impl FromIterator<i64> for ParamVector {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        ParamVector(iter.into_iter().collect())
    }
}

impl fmt::Display for ParamVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Compare two points lexicographically.
pub fn params_cmp(a: &ParamVector, b: &ParamVector) -> Ordering {
    a.cmp(b)
}

/// True if `p` lies within the bounding box of the segment from `start` to `end`.
pub fn params_within(p: &[i64], start: &[i64], end: &[i64]) -> bool {
    p.iter()
        .zip(start.iter().zip(end.iter()))
        .all(|(&p, (&s, &e))| {
            let span = (e - s).abs();
            (p - e).abs() <= span && (p - s).abs() <= span
        })
}

/// The midpoint of the segment from `start` to `end`, rounding up. Not aligned.
pub fn midpoint(start: &[i64], end: &[i64]) -> ParamVector {
    start
        .iter()
        .zip(end.iter())
        .map(|(&s, &e)| (s + e + 1).div_euclid(2))
        .collect()
}

/// One dimension of a parameter space.
///
/// The dimension is the arithmetic sequence `start + offset + k * stride`, clamped to
/// `[start, end]`. Both `start` and `end` are always valid values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    /// Human-readable name of the parameter.
    pub name: String,
    /// Smallest value.
    pub start: i64,
    /// Largest value.
    pub end: i64,
    /// Distance between neighbouring values.
    pub stride: i64,
    /// Shift applied to the stride sequence.
    pub offset: i64,
    /// Whether the end of this axis must be measured rather than assumed to have zero throughput.
    pub nonzero_end: bool,
    /// Position of this parameter on the benchmark's command line.
    pub order: usize,
}

impl ParamDef {
    /// A parameter from `start` to `end` with unit stride.
    pub fn new(name: impl Into<String>, start: i64, end: i64) -> Self {
        ParamDef {
            name: name.into(),
            start,
            end,
            stride: 1,
            offset: 0,
            nonzero_end: false,
            order: 0,
        }
    }

    /// Set the stride.
    pub fn stride(mut self, stride: i64) -> Self {
        self.stride = stride;
        self
    }

    /// Set the offset.
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Mark the end of this axis as one that must be measured.
    pub fn nonzero_end(mut self) -> Self {
        self.nonzero_end = true;
        self
    }

    /// Set the command-line position.
    pub fn order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    /// Check that this definition describes a non-empty sequence.
    pub fn validate(&self) -> Result<(), ParamError> {
        let invalid = |reason: &str| ParamError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.stride <= 0 {
            return Err(invalid("stride must be positive"));
        }
        if self.start > self.end {
            return Err(invalid("start lies after end"));
        }
        Ok(())
    }

    /// Round `value` to the nearest member of this parameter's sequence.
    pub fn align(&self, value: i64) -> i64 {
        if value >= self.end {
            return self.end;
        }
        if value <= self.start {
            return self.start;
        }
        let aligned =
            (value - self.offset + self.stride / 2).div_euclid(self.stride) * self.stride + self.offset;
        aligned.max(self.start).min(self.end)
    }

    /// The grid value that follows `value`, if any.
    ///
    /// The end of the axis only counts as a grid value if it has to be measured.
    pub fn next_grid(&self, value: i64) -> Option<i64> {
        let next = self.align(value.saturating_add(self.stride));
        if next <= value || (next == self.end && !self.nonzero_end) {
            None
        } else {
            Some(next)
        }
    }

    /// Walk every grid value of this parameter in increasing order.
    pub fn grid(&self) -> Grid<'_> {
        Grid {
            def: self,
            next: Some(self.start),
        }
    }
}

/// Iterator over the grid values of a [`ParamDef`].
#[derive(Debug, Clone)]
pub struct Grid<'a> {
    def: &'a ParamDef,
    next: Option<i64>,
}

impl Iterator for Grid<'_> {
    type Item = i64;
    fn next(&mut self) -> Option<Self::Item> {
        let v = self.next?;
        self.next = self.def.next_grid(v);
        Some(v)
    }
}

/// Where a point lies relative to the axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Every component is at its start.
    Origin,
    /// Only the given component is away from its start.
    On(usize),
    /// More than one component is away from its start.
    Off,
}

/// Something that can evaluate a constraint formula at a point.
pub trait ConstraintEvaluator: Send + Sync + fmt::Debug {
    /// The value of the formula at `params`.
    fn evaluate(&self, params: &ParamVector) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Factor {
    Param(usize),
    Literal(i64),
}

/// A formula that is a product of parameters and integer literals, like `m*n*k` or `2*n`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductFormula {
    factors: Vec<Factor>,
}

impl ProductFormula {
    /// Parse `formula` against the given parameter names, in vector order.
    ///
    /// Returns `None` if the formula is anything other than a plain product.
    pub fn parse(formula: &str, names: &[&str]) -> Option<Self> {
        let mut factors = Vec::new();
        for term in formula.split('*') {
            let term = term.trim();
            if term.is_empty() {
                return None;
            }
            if let Ok(n) = term.parse::<i64>() {
                factors.push(Factor::Literal(n));
            } else {
                factors.push(Factor::Param(names.iter().position(|&n| n == term)?));
            }
        }
        Some(ProductFormula { factors })
    }
}

impl ConstraintEvaluator for ProductFormula {
    fn evaluate(&self, params: &ParamVector) -> f64 {
        self.factors
            .iter()
            .map(|f| match *f {
                Factor::Param(i) => params.get(i).copied().unwrap_or(0) as f64,
                Factor::Literal(n) => n as f64,
            })
            .product()
    }
}

/// Bounds on a formula over the parameters.
///
/// Without an evaluator the constraint cannot be checked, so no point satisfies it.
#[derive(Debug, Clone)]
pub struct ParamConstraint {
    /// The formula, as written in the configuration.
    pub formula: String,
    /// Smallest allowed value of the formula.
    pub min: Option<i64>,
    /// Largest allowed value of the formula.
    pub max: Option<i64>,
    evaluator: Option<Arc<dyn ConstraintEvaluator>>,
}

impl ParamConstraint {
    /// A constraint with no evaluator attached.
    pub fn new(formula: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        ParamConstraint {
            formula: formula.into(),
            min,
            max,
            evaluator: None,
        }
    }

    /// Attach the evaluator used to check this constraint.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConstraintEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Whether an evaluator is attached.
    pub fn is_evaluable(&self) -> bool {
        self.evaluator.is_some()
    }

    /// True if `params` lies within the bounds.
    pub fn satisfied_by(&self, params: &ParamVector) -> bool {
        let evaluator = match self.evaluator {
            Some(ref e) => e,
            None => return false,
        };
        let v = evaluator.evaluate(params);
        self.min.map_or(true, |min| v >= min as f64) && self.max.map_or(true, |max| v <= max as f64)
    }
}

/// The full parameter space of a routine.
#[derive(Debug, Clone)]
pub struct ParamDefSet {
    defs: Vec<ParamDef>,
    constraint: Option<ParamConstraint>,
}

impl ParamDefSet {
    /// Build a parameter space. Definitions are put in command-line order.
    pub fn new(mut defs: Vec<ParamDef>) -> Result<Self, ParamError> {
        for def in &defs {
            def.validate()?;
        }
        defs.sort_by_key(|d| d.order);
        Ok(ParamDefSet {
            defs,
            constraint: None,
        })
    }

    /// Restrict the space with a constraint.
    pub fn with_constraint(mut self, constraint: ParamConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// True if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// The parameter definitions, in vector order.
    pub fn defs(&self) -> &[ParamDef] {
        &self.defs
    }

    /// The constraint, if any.
    pub fn constraint(&self) -> Option<&ParamConstraint> {
        self.constraint.as_ref()
    }

    /// The parameter names, in vector order.
    pub fn names(&self) -> Vec<&str> {
        self.defs.iter().map(|d| d.name.as_str()).collect()
    }

    /// The point where every parameter is at its start.
    pub fn start_vector(&self) -> ParamVector {
        self.defs.iter().map(|d| d.start).collect()
    }

    /// The point where every parameter is at its end.
    pub fn end_vector(&self) -> ParamVector {
        self.defs.iter().map(|d| d.end).collect()
    }

    /// True if any parameter's end has to be measured.
    pub fn any_nonzero_end(&self) -> bool {
        self.defs.iter().any(|d| d.nonzero_end)
    }

    /// Check that `params` has one value per parameter.
    pub fn check(&self, params: &[i64]) -> Result<(), ParamError> {
        if params.len() != self.defs.len() {
            return Err(ParamError::LengthMismatch {
                expected: self.defs.len(),
                found: params.len(),
            });
        }
        Ok(())
    }

    /// Align every component of `params`.
    pub fn align(&self, params: &[i64]) -> ParamVector {
        self.defs
            .iter()
            .zip(params.iter())
            .map(|(d, &v)| d.align(v))
            .collect()
    }

    /// The point `step` increments along the line from `start` to `end`, aligned.
    ///
    /// The increment is the finest stride among the parameters the line moves in. Fails with
    /// [`ParamError::OutOfRange`] if the step leaves the segment.
    pub fn step_between(&self, start: &[i64], end: &[i64], step: i64) -> Result<ParamVector, ParamError> {
        self.check(start)?;
        self.check(end)?;
        if step == 0 {
            return Ok(self.align(start));
        }

        let mut axis: Option<usize> = None;
        for (i, def) in self.defs.iter().enumerate() {
            if start[i] != end[i] && axis.map_or(true, |a| def.stride < self.defs[a].stride) {
                axis = Some(i);
            }
        }
        // a segment that goes nowhere has no steps past its start
        let axis = axis.ok_or(ParamError::OutOfRange { step })?;

        let span = (end[axis] - start[axis]).abs() as f64;
        let inc = self.defs[axis].stride.saturating_mul(step) as f64;
        let p: ParamVector = start
            .iter()
            .zip(end.iter())
            .map(|(&s, &e)| s + (inc * (e - s) as f64 / span).round() as i64)
            .collect();

        if !params_within(&p, start, end) {
            return Err(ParamError::OutOfRange { step });
        }
        Ok(self.align(&p))
    }

    /// Which axis, if any, `params` lies on.
    pub fn on_axis(&self, params: &[i64]) -> Axis {
        let mut axis = Axis::Origin;
        for (i, (d, &v)) in self.defs.iter().zip(params.iter()).enumerate() {
            if v != d.start {
                if axis != Axis::Origin {
                    return Axis::Off;
                }
                axis = Axis::On(i);
            }
        }
        axis
    }

    /// True if `params` passes the constraint, or there is none.
    pub fn satisfies(&self, params: &ParamVector) -> bool {
        self.constraint.as_ref().map_or(true, |c| c.satisfied_by(params))
    }

    /// The grid point after `params` in lexicographic order, with the last parameter varying
    /// fastest. Ignores the constraint.
    pub fn next_point(&self, params: &ParamVector) -> Option<ParamVector> {
        let mut p = params.clone();
        for i in (0..self.defs.len()).rev() {
            if let Some(v) = self.defs[i].next_grid(p[i]) {
                p.0[i] = v;
                for (j, d) in self.defs.iter().enumerate().skip(i + 1) {
                    p.0[j] = d.start;
                }
                return Some(p);
            }
        }
        None
    }

    /// Every grid point, in lexicographic order. Ignores the constraint.
    pub fn points(&self) -> impl Iterator<Item = ParamVector> + '_ {
        std::iter::successors(Some(self.start_vector()), move |p| self.next_point(p))
    }
}

#[cfg(test)]
fn square(end: i64, stride: i64) -> ParamDefSet {
    ParamDefSet::new(vec![
        ParamDef::new("m", 0, end).stride(stride),
        ParamDef::new("n", 0, end).stride(stride).order(1),
    ])
    .unwrap()
}

#[test]
fn align_rounds_to_stride() {
    let d = ParamDef::new("n", 0, 100).stride(8);
    assert_eq!(d.align(0), 0);
    assert_eq!(d.align(3), 0);
    assert_eq!(d.align(4), 8);
    assert_eq!(d.align(13), 16);
    assert_eq!(d.align(97), 96);
    assert_eq!(d.align(100), 100);
    assert_eq!(d.align(1000), 100);
    assert_eq!(d.align(-5), 0);
}

#[test]
fn align_with_offset() {
    let d = ParamDef::new("n", 0, 100).stride(10).offset(3);
    assert_eq!(d.align(12), 13);
    assert_eq!(d.align(19), 23);
    assert_eq!(d.align(1), 3);
    assert_eq!(d.align(2), 3);
}

#[test]
fn align_keeps_unaligned_ends() {
    let d = ParamDef::new("n", 1, 9).stride(4);
    assert_eq!(d.align(1), 1);
    assert_eq!(d.align(9), 9);
    assert_eq!(d.align(8), 8);
    assert_eq!(d.align(5), 4);
}

#[test]
fn validate_rejects_nonsense() {
    assert!(ParamDef::new("n", 0, 10).stride(0).validate().is_err());
    assert!(ParamDef::new("n", 10, 0).validate().is_err());
    assert!(ParamDef::new("n", 5, 5).validate().is_ok());
    assert!(ParamDefSet::new(vec![ParamDef::new("n", 0, 10).stride(-1)]).is_err());
}

#[test]
fn defs_sorted_by_order() {
    let pds = ParamDefSet::new(vec![
        ParamDef::new("b", 0, 10).order(1),
        ParamDef::new("a", 0, 20).order(0),
    ])
    .unwrap();
    assert_eq!(pds.names(), vec!["a", "b"]);
    assert_eq!(pds.end_vector(), ParamVector::new(vec![20, 10]));
}

#[test]
fn step_zero_is_aligned_start() {
    let pds = square(100, 4);
    let start = ParamVector::new(vec![3, 5]);
    let end = ParamVector::new(vec![99, 99]);
    assert_eq!(pds.step_between(&start, &end, 0).unwrap(), pds.align(&start));
    // even for a degenerate segment
    assert_eq!(pds.step_between(&start, &start, 0).unwrap(), pds.align(&start));
}

#[test]
fn step_along_line() {
    let pds = ParamDefSet::new(vec![ParamDef::new("n", 0, 10)]).unwrap();
    let s = ParamVector::new(vec![0]);
    let e = ParamVector::new(vec![10]);
    for k in 0..=10 {
        assert_eq!(pds.step_between(&s, &e, k).unwrap(), ParamVector::new(vec![k]));
    }
    assert_eq!(pds.step_between(&s, &e, 11), Err(ParamError::OutOfRange { step: 11 }));
    assert_eq!(pds.step_between(&e, &s, 3).unwrap(), ParamVector::new(vec![7]));
}

#[test]
fn step_along_diagonal_uses_finest_stride() {
    let pds = ParamDefSet::new(vec![
        ParamDef::new("m", 0, 100).stride(10),
        ParamDef::new("n", 0, 50).stride(5).order(1),
    ])
    .unwrap();
    let s = pds.start_vector();
    let e = pds.end_vector();
    assert_eq!(pds.step_between(&s, &e, 1).unwrap(), ParamVector::new(vec![10, 5]));
    assert_eq!(pds.step_between(&s, &e, 4).unwrap(), ParamVector::new(vec![40, 20]));
    assert_eq!(pds.step_between(&s, &e, 10).unwrap(), e);
    assert!(pds.step_between(&s, &e, 11).is_err());
}

#[test]
fn step_perpendicular_dimension_ignored() {
    let pds = ParamDefSet::new(vec![
        ParamDef::new("m", 0, 100).stride(1),
        ParamDef::new("n", 0, 100).stride(10).order(1),
    ])
    .unwrap();
    let s = ParamVector::new(vec![40, 0]);
    let e = ParamVector::new(vec![40, 100]);
    assert_eq!(pds.step_between(&s, &e, 3).unwrap(), ParamVector::new(vec![40, 30]));
    assert!(pds.step_between(&s, &s, 1).is_err());
}

#[test]
fn step_checks_lengths() {
    let pds = square(10, 1);
    let short = ParamVector::new(vec![0]);
    assert_eq!(
        pds.step_between(&short, &short, 1),
        Err(ParamError::LengthMismatch { expected: 2, found: 1 })
    );
}

#[test]
fn midpoint_rounds_up() {
    assert_eq!(midpoint(&[0], &[10]), ParamVector::new(vec![5]));
    assert_eq!(midpoint(&[0, 3], &[3, 10]), ParamVector::new(vec![2, 7]));
    assert_eq!(midpoint(&[7], &[7]), ParamVector::new(vec![7]));
}

#[test]
fn within_segment() {
    assert!(params_within(&[5, 5], &[0, 0], &[10, 10]));
    assert!(params_within(&[0, 0], &[0, 0], &[10, 10]));
    assert!(!params_within(&[11, 5], &[0, 0], &[10, 10]));
    assert!(!params_within(&[5, 1], &[0, 0], &[10, 0]));
}

#[test]
fn axis_classification() {
    let pds = square(10, 1);
    assert_eq!(pds.on_axis(&[0, 0]), Axis::Origin);
    assert_eq!(pds.on_axis(&[3, 0]), Axis::On(0));
    assert_eq!(pds.on_axis(&[0, 10]), Axis::On(1));
    assert_eq!(pds.on_axis(&[1, 1]), Axis::Off);
}

#[test]
fn grid_excludes_zero_end() {
    let d = ParamDef::new("n", 0, 10).stride(4);
    assert_eq!(d.grid().collect::<Vec<_>>(), vec![0, 4, 8]);
    let d = d.nonzero_end();
    assert_eq!(d.grid().collect::<Vec<_>>(), vec![0, 4, 8, 10]);
    let d = ParamDef::new("n", 3, 3).nonzero_end();
    assert_eq!(d.grid().collect::<Vec<_>>(), vec![3]);
}

#[test]
fn points_lexicographic() {
    let pds = ParamDefSet::new(vec![
        ParamDef::new("m", 0, 2).nonzero_end(),
        ParamDef::new("n", 0, 1).nonzero_end().order(1),
    ])
    .unwrap();
    let all: Vec<_> = pds.points().map(ParamVector::into_inner).collect();
    assert_eq!(
        all,
        vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1], vec![2, 0], vec![2, 1]]
    );
    assert!(all.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn product_constraint() {
    let f = ProductFormula::parse("m * n*2", &["m", "n"]).unwrap();
    assert_eq!(f.evaluate(&ParamVector::new(vec![3, 4])), 24.0);
    assert!(ProductFormula::parse("m + n", &["m", "n"]).is_none());
    assert!(ProductFormula::parse("m*", &["m", "n"]).is_none());

    let c = ParamConstraint::new("m*n", None, Some(20)).with_evaluator(Arc::new(
        ProductFormula::parse("m*n", &["m", "n"]).unwrap(),
    ));
    let pds = square(10, 1).with_constraint(c);
    assert!(pds.satisfies(&ParamVector::new(vec![4, 5])));
    assert!(!pds.satisfies(&ParamVector::new(vec![5, 5])));
}

#[test]
fn constraint_without_evaluator_fails_closed() {
    let pds = square(10, 1).with_constraint(ParamConstraint::new("m*n", Some(0), None));
    assert!(!pds.satisfies(&ParamVector::new(vec![0, 0])));
    assert!(!pds.constraint().unwrap().is_evaluable());
}

#[cfg(test)]
proptest::proptest! {
    #[test]
    fn align_is_idempotent_and_bounded(
        start in -1000i64..1000,
        len in 0i64..5000,
        stride in 1i64..64,
        offset in -64i64..64,
        value in -10_000i64..10_000,
    ) {
        let d = ParamDef::new("p", start, start + len).stride(stride).offset(offset);
        let a = d.align(value);
        proptest::prop_assert!(a >= d.start && a <= d.end);
        proptest::prop_assert_eq!(d.align(a), a);
    }

    #[test]
    fn step_zero_always_aligned_start(
        s in proptest::collection::vec(0i64..100, 2),
        e in proptest::collection::vec(0i64..100, 2),
        stride in 1i64..16,
    ) {
        let pds = square(100, stride);
        proptest::prop_assert_eq!(pds.step_between(&s, &e, 0).unwrap(), pds.align(&s));
    }
}
