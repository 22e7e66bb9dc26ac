use super::Construction;
use crate::error::ConstructionError;
use crate::interval::{Interval, IntervalKind};
use crate::model::Model;
use crate::param::{midpoint, ParamVector};
use crate::tolerance::Cut;

/// Bisect a one-parameter space breadth-first, down to the parameter's stride.
///
/// Unlike [`Gbbp`](crate::Gbbp), no interval is ever settled early: every interval is split
/// until it is too small to split further.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveBisect;

impl NaiveBisect {
    /// A new breadth-first bisection.
    pub fn new() -> Self {
        NaiveBisect
    }
}

impl Construction for NaiveBisect {
    fn seed(&mut self, model: &mut Model) -> Result<(), ConstructionError> {
        let params = model.shared_params();
        if params.len() != 1 {
            return Err(ConstructionError::Unsupported {
                method: "naive bisect",
                n_p: params.len(),
            });
        }
        let start = params.start_vector();
        let end = params.end_vector();
        let whole = Interval::bisect(start.clone(), end.clone());
        if whole.is_divisible(&params) {
            model.intervals_mut().push_top(whole);
        }
        model.intervals_mut().push_top(Interval::point(start));
        if params.any_nonzero_end() {
            model.intervals_mut().push_top(Interval::point(end));
        }
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
        let (h, interval) = model
            .intervals()
            .iter()
            .find(|(_, i)| i.probe(&params).ok().flatten().as_ref() == Some(at))
            .map(|(h, i)| (h, i.clone()))
            .ok_or_else(|| ConstructionError::Unmatched { params: at.clone() })?;

        model.intervals_mut().remove(h);
        if interval.kind == IntervalKind::Bisect {
            let mid = midpoint(&interval.start, &interval.end);
            for half in vec![
                Interval::bisect(interval.start, mid.clone()),
                Interval::bisect(mid, interval.end),
            ] {
                if half.is_divisible(&params) {
                    model.intervals_mut().push_bottom(half);
                }
            }
        }
        model.finish_if_exhausted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::Benchmark;
    use crate::load::LoadHistory;
    use crate::param::{ParamDef, ParamDefSet};
    use crate::tolerance::FixedBand;

    #[test]
    fn breadth_first_to_stride() {
        let mut model = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 16).stride(2)]).unwrap());
        let mut nb = NaiveBisect::new();
        nb.seed(&mut model).unwrap();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        let mut seen = Vec::new();
        while let Some(p) = nb.select(&mut model).unwrap() {
            // a flat throughput would settle everything under GBBP
            model.insert(Benchmark::estimate(p.clone(), 5.0));
            nb.advance(&mut model, &p, &cut).unwrap();
            seen.push(p[0]);
        }
        assert_eq!(seen, vec![0, 8, 4, 12, 2, 6, 10, 14]);
        assert!(model.intervals().is_complete());
    }

    #[test]
    fn only_one_parameter() {
        let mut model = Model::new(
            ParamDefSet::new(vec![ParamDef::new("m", 0, 4), ParamDef::new("n", 0, 4).order(1)]).unwrap(),
        );
        assert!(matches!(
            NaiveBisect::new().seed(&mut model),
            Err(ConstructionError::Unsupported { n_p: 2, .. })
        ));
    }
}
