use tracing::debug;

use super::Construction;
use crate::error::ConstructionError;
use crate::interval::{Interval, IntervalKind};
use crate::model::Model;
use crate::param::{ParamDefSet, ParamVector};
use crate::tolerance::Cut;

/// Benchmark every grid point, in lexicographic order.
///
/// Points that violate the routine's constraint are stepped over. The point to measure next is
/// kept as a single point interval on the model's stack, so a sweep picks up where it left off.
#[derive(Debug, Clone, Copy, Default)]
pub struct Naive;

impl Naive {
    /// A new exhaustive sweep.
    pub fn new() -> Self {
        Naive
    }
}

/// The first point at or after `from` that satisfies the constraint.
pub(crate) fn first_satisfying(params: &ParamDefSet, from: Option<ParamVector>) -> Option<ParamVector> {
    let mut p = from?;
    loop {
        if params.satisfies(&p) {
            return Some(p);
        }
        p = params.next_point(&p)?;
    }
}

impl Construction for Naive {
    fn seed(&mut self, model: &mut Model) -> Result<(), ConstructionError> {
        let params = model.shared_params();
        if let Some(p) = first_satisfying(&params, Some(params.start_vector())) {
            model.intervals_mut().push_top(Interval::point(p));
        }
        model.finish_if_exhausted();
        Ok(())
    }

    fn select(&mut self, model: &mut Model) -> Result<Option<ParamVector>, ConstructionError> {
        let params = model.shared_params();
        match model.intervals().top() {
            Some((_, i)) => Ok(i.probe(&params)?),
            None => {
                model.mark_complete();
                Ok(None)
            }
        }
    }

    fn advance(&mut self, model: &mut Model, at: &ParamVector, _: &Cut<'_>) -> Result<(), ConstructionError> {
        let params = model.shared_params();
        let h = match model.intervals().top() {
            Some((h, i)) if i.kind == IntervalKind::Point && params.align(&i.start) == *at => h,
            _ => return Err(ConstructionError::Unmatched { params: at.clone() }),
        };
        model.intervals_mut().remove(h);
        match first_satisfying(&params, params.next_point(at)) {
            Some(next) => {
                model.intervals_mut().push_top(Interval::point(next));
            }
            None => debug!("sweep finished"),
        }
        model.finish_if_exhausted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::benchmark::Benchmark;
    use crate::load::LoadHistory;
    use crate::param::{ParamConstraint, ParamDef, ProductFormula};
    use crate::tolerance::FixedBand;

    fn sweep(params: ParamDefSet) -> Vec<Vec<i64>> {
        let mut model = Model::new(params);
        let mut n = Naive::new();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        n.seed(&mut model).unwrap();
        let mut seen = Vec::new();
        while let Some(p) = n.select(&mut model).unwrap() {
            model.insert(Benchmark::estimate(p.clone(), 1.0));
            n.advance(&mut model, &p, &cut).unwrap();
            seen.push(p.into_inner());
        }
        assert!(model.intervals().is_complete());
        seen
    }

    #[test]
    fn full_grid() {
        let params = ParamDefSet::new(vec![
            ParamDef::new("m", 0, 4).stride(2),
            ParamDef::new("n", 1, 3).nonzero_end().order(1),
        ])
        .unwrap();
        assert_eq!(
            sweep(params),
            vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![2, 1], vec![2, 2], vec![2, 3]]
        );
    }

    #[test]
    fn constraint_skips_points() {
        let names = ["m", "n"];
        let c = ParamConstraint::new("m*n", None, Some(2))
            .with_evaluator(Arc::new(ProductFormula::parse("m*n", &names).unwrap()));
        let params = ParamDefSet::new(vec![
            ParamDef::new("m", 1, 3).nonzero_end(),
            ParamDef::new("n", 1, 3).nonzero_end().order(1),
        ])
        .unwrap()
        .with_constraint(c);
        assert_eq!(sweep(params), vec![vec![1, 1], vec![1, 2], vec![2, 1]]);
    }

    #[test]
    fn unsatisfiable_constraint_completes_immediately() {
        let params = ParamDefSet::new(vec![ParamDef::new("n", 0, 8)])
            .unwrap()
            .with_constraint(ParamConstraint::new("n", Some(1), None));
        assert!(sweep(params).is_empty());
    }

    #[test]
    fn out_of_order_insert() {
        let mut model = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 8)]).unwrap());
        let mut n = Naive::new();
        n.seed(&mut model).unwrap();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        let p = ParamVector::new(vec![3]);
        model.insert(Benchmark::estimate(p.clone(), 1.0));
        assert!(n.advance(&mut model, &p, &cut).is_err());
        assert_eq!(n.select(&mut model).unwrap(), Some(ParamVector::new(vec![0])));
    }
}
