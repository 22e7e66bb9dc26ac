use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};

use super::naive::first_satisfying;
use super::Construction;
use crate::error::ConstructionError;
use crate::interval::{Interval, IntervalKind};
use crate::model::Model;
use crate::param::{ParamDefSet, ParamVector};
use crate::repository::BenchmarkRepository;
use crate::tolerance::Cut;

// random draws before falling back to scanning the grid
const DRAWS: usize = 64;

/// Benchmark grid points in random order, each at most once.
///
/// Construction starts at the start of the space and ends once every point that satisfies the
/// constraint has been measured, or when the routine's completion cap is hit.
#[derive(Debug, Clone)]
pub struct Random {
    rng: StdRng,
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Random {
    /// A sampler seeded from the operating system.
    pub fn new() -> Self {
        Random {
            rng: StdRng::from_entropy(),
        }
    }

    /// A reproducible sampler.
    pub fn seeded(seed: u64) -> Self {
        Random {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn draw(&mut self, params: &ParamDefSet) -> Option<ParamVector> {
        let mut p = Vec::with_capacity(params.len());
        for d in params.defs() {
            let v = d.align(self.rng.gen_range(d.start..=d.end));
            if v == d.end && d.start != d.end && !d.nonzero_end {
                return None;
            }
            p.push(v);
        }
        Some(ParamVector::new(p))
    }

    fn unseen(&mut self, params: &ParamDefSet, repo: &BenchmarkRepository) -> Option<ParamVector> {
        for _ in 0..DRAWS {
            if let Some(p) = self.draw(params) {
                if params.satisfies(&p) && !repo.contains(&p) {
                    return Some(p);
                }
            }
        }
        params
            .points()
            .filter(|p| params.satisfies(p) && !repo.contains(p))
            .choose(&mut self.rng)
    }
}

impl Construction for Random {
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
        if let Some(next) = self.unseen(&params, model.repo()) {
            model.intervals_mut().push_top(Interval::point(next));
        }
        model.finish_if_exhausted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::benchmark::Benchmark;
    use crate::load::LoadHistory;
    use crate::param::ParamDef;
    use crate::tolerance::FixedBand;

    #[test]
    fn visits_every_point_once() {
        let params = ParamDefSet::new(vec![
            ParamDef::new("m", 0, 12).stride(4).nonzero_end(),
            ParamDef::new("n", 0, 10).stride(5).order(1),
        ])
        .unwrap();
        let mut model = Model::new(params);
        let mut r = Random::seeded(7);
        r.seed(&mut model).unwrap();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);

        let mut seen = Vec::new();
        while let Some(p) = r.select(&mut model).unwrap() {
            model.insert(Benchmark::estimate(p.clone(), 1.0));
            r.advance(&mut model, &p, &cut).unwrap();
            seen.push(p.into_inner());
        }
        assert_eq!(seen[0], vec![0, 0]);
        let unique: BTreeSet<_> = seen.iter().cloned().collect();
        assert_eq!(unique.len(), seen.len());
        // m in {0, 4, 8, 12}, n in {0, 5}
        assert_eq!(seen.len(), 8);
        assert!(model.is_complete());
    }

    #[test]
    fn last_points_are_picked_evenly() {
        let params = ParamDefSet::new(vec![ParamDef::new("n", 0, 1000)]).unwrap();
        let mut model = Model::new(params.clone());
        for n in (0..1000).filter(|&n| n != 500 && n != 900) {
            model.insert(Benchmark::estimate(ParamVector::new(vec![n]), 1.0));
        }
        let picked: BTreeSet<_> = (0..32)
            .filter_map(|seed| Random::seeded(seed).unseen(&params, model.repo()))
            .map(|p| p[0])
            .collect();
        assert_eq!(picked, [500, 900].iter().copied().collect());
    }

    #[test]
    fn same_seed_same_order() {
        let run = |seed| {
            let mut model = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 20)]).unwrap());
            let mut r = Random::seeded(seed);
            r.seed(&mut model).unwrap();
            let history = LoadHistory::new(1);
            let band = FixedBand::default();
            let cut = Cut::new(&band, &history);
            let mut seen = Vec::new();
            while let Some(p) = r.select(&mut model).unwrap() {
                model.insert(Benchmark::estimate(p.clone(), 1.0));
                r.advance(&mut model, &p, &cut).unwrap();
                seen.push(p[0]);
            }
            seen
        };
        let a = run(42);
        assert_eq!(a, run(42));
        assert_eq!(a.len(), 20);
    }
}
