use tracing::{debug, trace, warn};

use super::Construction;
use crate::benchmark::Benchmark;
use crate::error::ConstructionError;
use crate::interval::{Handle, Interval, IntervalKind};
use crate::model::Model;
use crate::param::{midpoint, ParamDefSet, ParamVector};
use crate::tolerance::Cut;

/// How a [`Gbbp`] lays down its initial intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One interval along the diagonal of the parameter space; once that is done, one interval
    /// parallel to each axis through every point measured on the diagonal.
    Diagonal,
    /// One interval parallel to each axis through every grid position, all up front.
    Boundary,
}

/// The Geometric Bisection Building Procedure.
///
/// Each construction interval starts out by climbing away from its start, one stride at a time,
/// until throughput has fallen for two steps in a row. From there on it is bisected: a midpoint
/// whose throughput agrees with either end of its interval settles that half, and disagreement
/// splits the interval in two. The model is complete when no interval is left.
#[derive(Debug, Clone)]
pub struct Gbbp {
    layout: Layout,
}

impl Gbbp {
    /// Construct along the diagonal, then mesh.
    pub fn diagonal() -> Self {
        Gbbp {
            layout: Layout::Diagonal,
        }
    }

    /// Construct along every axis-parallel grid line.
    pub fn boundary() -> Self {
        Gbbp {
            layout: Layout::Boundary,
        }
    }

    // NOTE: the interval handlers below leave the stack untouched when they return an error, so
    // that the same point can be retried.

    fn seed_diagonal(model: &mut Model) {
        let params = model.shared_params();
        let start = params.start_vector();
        let end = params.end_vector();
        let stack = model.intervals_mut();
        if params.len() > 1 {
            stack.push_top(Interval::boundary_complete());
        }
        stack.push_top(Interval::empty(start.clone(), end.clone()));
        if params.any_nonzero_end() {
            stack.push_top(Interval::point(end));
        }
        for (j, d) in params.defs().iter().enumerate() {
            if d.nonzero_end {
                stack.push_top(Interval::point(start.with(j, d.end)).on_plane(j));
            }
        }
    }

    fn seed_boundary(model: &mut Model) {
        let params = model.shared_params();
        let mut zeros = Vec::new();
        for (j, d) in params.defs().iter().enumerate() {
            // every grid position of the other parameters, with this one at its start
            let mut base = Some(params.start_vector());
            while let Some(p) = base {
                let line_end = p.with(j, d.end);
                model
                    .intervals_mut()
                    .push_top(Interval::empty(p.clone(), line_end.clone()).on_plane(j));
                if d.nonzero_end {
                    model.intervals_mut().push_top(Interval::point(line_end).on_plane(j));
                } else {
                    zeros.push(line_end);
                }
                base = next_off_axis(&params, &p, j);
            }
        }
        for p in zeros {
            if !model.repo().contains(&p) {
                model.insert(Benchmark::zero(p));
            }
        }
    }

    /// Project an interval parallel to each axis through every point measured so far.
    fn mesh(model: &mut Model) {
        let params = model.shared_params();
        let through: Vec<ParamVector> = model
            .repo()
            .averages()
            .filter(|b| b.flops > 0.0)
            .map(|b| b.params)
            .collect();
        debug!(points = through.len(), "meshing through measured points");

        let mut zeros = Vec::new();
        for p in &through {
            for (j, d) in params.defs().iter().enumerate() {
                let line_start = p.with(j, d.start);
                let line_end = p.with(j, d.end);
                push_divisible(
                    model,
                    Interval::empty(line_start, line_end.clone()).on_plane(j),
                    &params,
                );
                if d.nonzero_end {
                    model.intervals_mut().push_top(Interval::point(line_end).on_plane(j));
                } else {
                    zeros.push(line_end);
                }
            }
        }
        // zero points only go in once all projections are laid down
        for p in zeros {
            if !model.repo().contains(&p) {
                model.insert(Benchmark::zero(p));
            }
        }
    }

    fn start_climb(model: &mut Model, h: Handle, params: &ParamDefSet) {
        let divisible = match model.intervals_mut().get_mut(h) {
            Some(i) => {
                i.kind = IntervalKind::Climb;
                i.climb_step = 0;
                i.is_divisible(params)
            }
            None => return,
        };
        if !divisible {
            trace!("climb has nowhere to go, discarding");
            model.intervals_mut().remove(h);
        }
    }

    fn climb(
        model: &mut Model,
        h: Handle,
        at: &ParamVector,
        cut: &Cut<'_>,
        params: &ParamDefSet,
    ) -> Result<(), ConstructionError> {
        let interval = match model.intervals().get(h) {
            Some(i) => i.clone(),
            None => return Ok(()),
        };
        if interval.climb_step >= 2 {
            let here = average(model, at)?;
            let back1 = params.step_between(&interval.start, &interval.end, interval.climb_step)?;
            let back2 = params.step_between(&interval.start, &interval.end, interval.climb_step - 1)?;
            let back1 = average(model, &back1)?;
            let back2 = average(model, &back2)?;
            if cut.greater_or_equal(&back1, &here) && cut.greater_or_equal(&back2, &back1) {
                // throughput has stopped rising; bisect the rest
                model.intervals_mut().remove(h);
                let mut next = Interval::bisect(at.clone(), interval.end);
                next.plane = interval.plane;
                debug!(interval = %next, "climb peaked");
                push_divisible(model, next, params);
                return Ok(());
            }
        }

        let divisible = match model.intervals_mut().get_mut(h) {
            Some(i) => {
                i.climb_step += 1;
                i.is_divisible(params)
            }
            None => return Ok(()),
        };
        if !divisible {
            trace!("climb reached the end of its interval");
            model.intervals_mut().remove(h);
        }
        Ok(())
    }

    fn bisect(
        model: &mut Model,
        h: Handle,
        at: &ParamVector,
        cut: &Cut<'_>,
        params: &ParamDefSet,
    ) -> Result<(), ConstructionError> {
        let interval = match model.intervals().get(h) {
            Some(i) => i.clone(),
            None => return Ok(()),
        };
        let here = average(model, at)?;
        let left = average(model, &params.align(&interval.start))?;
        let right = average(model, &params.align(&interval.end))?;
        let mid = midpoint(&interval.start, &interval.end);
        let (start, end) = (interval.start, interval.end);

        let next = match (cut.intersects(&left, &here), cut.intersects(&right, &here)) {
            (true, true) => vec![],
            (true, false) => vec![Interval::bisect(mid, end)],
            (false, true) => vec![Interval::bisect(start, mid)],
            (false, false) => {
                let old = model.old_approximation(at)?;
                if cut.intersects(&old, &here) {
                    vec![Interval::inflect(start, mid.clone()), Interval::inflect(mid, end)]
                } else {
                    vec![Interval::bisect(start, mid.clone()), Interval::bisect(mid, end)]
                }
            }
        };

        model.intervals_mut().remove(h);
        for mut i in next {
            i.plane = interval.plane;
            push_divisible(model, i, params);
        }
        Ok(())
    }

    fn inflect(
        model: &mut Model,
        h: Handle,
        at: &ParamVector,
        cut: &Cut<'_>,
        params: &ParamDefSet,
    ) -> Result<(), ConstructionError> {
        let interval = match model.intervals().get(h) {
            Some(i) => i.clone(),
            None => return Ok(()),
        };
        let here = average(model, at)?;
        let old = model.old_approximation(at)?;
        model.intervals_mut().remove(h);
        if cut.intersects(&old, &here) {
            return Ok(());
        }
        let mid = midpoint(&interval.start, &interval.end);
        for mut i in vec![
            Interval::bisect(interval.start, mid.clone()),
            Interval::bisect(mid, interval.end),
        ] {
            i.plane = interval.plane;
            push_divisible(model, i, params);
        }
        Ok(())
    }
}

impl Construction for Gbbp {
    fn seed(&mut self, model: &mut Model) -> Result<(), ConstructionError> {
        match self.layout {
            Layout::Diagonal => Gbbp::seed_diagonal(model),
            Layout::Boundary => Gbbp::seed_boundary(model),
        }
        debug!(intervals = model.intervals().len(), layout = ?self.layout, "seeded construction");
        model.finish_if_exhausted();
        Ok(())
    }

    fn select(&mut self, model: &mut Model) -> Result<Option<ParamVector>, ConstructionError> {
        let params = model.shared_params();
        loop {
            let (h, interval) = match model.intervals().top() {
                Some((h, i)) => (h, i.clone()),
                None => {
                    model.mark_complete();
                    return Ok(None);
                }
            };
            match interval.kind {
                IntervalKind::Complete => return Ok(None),
                IntervalKind::BoundaryComplete => {
                    model.intervals_mut().remove(h);
                    if params.len() > 1 {
                        Gbbp::mesh(model);
                    }
                }
                IntervalKind::Null => {
                    warn!("discarding blank construction interval");
                    model.intervals_mut().remove(h);
                }
                _ => return Ok(interval.probe(&params)?),
            }
        }
    }

    fn advance(&mut self, model: &mut Model, at: &ParamVector, cut: &Cut<'_>) -> Result<(), ConstructionError> {
        let params = model.shared_params();

        // every unprobed interval starting here climbs from now on, but only the first other
        // interval waiting on this point consumes it. That one is handled first.
        let mut waiting = Vec::new();
        for (h, i) in model.intervals().iter() {
            if let Ok(Some(ref p)) = i.probe(&params) {
                if p == at {
                    waiting.push((h, i.kind));
                    if i.kind != IntervalKind::Empty {
                        break;
                    }
                }
            }
        }
        if waiting.is_empty() {
            return Err(ConstructionError::Unmatched { params: at.clone() });
        }

        for (h, kind) in waiting.into_iter().rev() {
            trace!(?kind, point = %at, "processing interval");
            match kind {
                IntervalKind::Empty => Gbbp::start_climb(model, h, &params),
                IntervalKind::Climb => Gbbp::climb(model, h, at, cut, &params)?,
                IntervalKind::Bisect => Gbbp::bisect(model, h, at, cut, &params)?,
                IntervalKind::Inflect => Gbbp::inflect(model, h, at, cut, &params)?,
                IntervalKind::Point => {
                    model.intervals_mut().remove(h);
                }
                _ => {}
            }
        }
        model.finish_if_exhausted();
        Ok(())
    }
}

fn average(model: &Model, at: &ParamVector) -> Result<Benchmark, ConstructionError> {
    model
        .average(at)
        .ok_or_else(|| ConstructionError::MissingBenchmark { params: at.clone() })
}

/// Queue `interval` on top if it can still be split at the parameters' granularity.
pub(crate) fn push_divisible(model: &mut Model, interval: Interval, params: &ParamDefSet) -> bool {
    if interval.is_divisible(params) {
        model.intervals_mut().push_top(interval);
        true
    } else {
        trace!(%interval, "interval not divisible, discarding");
        false
    }
}

/// The next grid position of every parameter but `fixed`, which stays where it is.
fn next_off_axis(params: &ParamDefSet, p: &ParamVector, fixed: usize) -> Option<ParamVector> {
    let mut p = p.clone();
    for i in (0..params.len()).rev() {
        if i == fixed {
            continue;
        }
        let d = &params.defs()[i];
        if let Some(v) = d.next_grid(p[i]) {
            p = p.with(i, v);
            for (k, dk) in params.defs().iter().enumerate().skip(i + 1) {
                if k != fixed {
                    p = p.with(k, dk.start);
                }
            }
            return Some(p);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadHistory;
    use crate::param::ParamDef;
    use crate::tolerance::FixedBand;

    fn pv(v: &[i64]) -> ParamVector {
        ParamVector::new(v.to_vec())
    }

    fn one_param(end: i64) -> ParamDefSet {
        ParamDefSet::new(vec![ParamDef::new("n", 0, end)]).unwrap()
    }

    fn stack(model: &Model) -> Vec<String> {
        model.intervals().iter().map(|(_, i)| i.to_string()).collect()
    }

    /// Run construction to completion against `f`, returning the number of benchmarks taken.
    fn build(g: &mut Gbbp, model: &mut Model, mut f: impl FnMut(&ParamVector) -> f64) -> usize {
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        if model.intervals().is_empty() {
            g.seed(model).unwrap();
        }
        let mut runs = 0;
        while let Some(p) = g.select(model).unwrap() {
            runs += 1;
            assert!(runs < 10_000, "construction does not terminate");
            let flops = f(&p);
            model.insert(Benchmark::estimate(p.clone(), flops));
            g.advance(model, &p, &cut).unwrap();
        }
        runs
    }

    #[test]
    fn unimodal_terminates() {
        let mut model = Model::new(one_param(100));
        let mut g = Gbbp::diagonal();
        let runs = build(&mut g, &mut model, |p| {
            let x = p[0] as f64;
            if x <= 40.0 {
                100.0 + 5.0 * x
            } else {
                300.0 - 4.0 * (x - 40.0)
            }
        });
        assert!(model.is_complete());
        assert!(model.intervals().is_complete());
        assert_eq!(model.intervals().len(), 1);
        assert!(runs < 100, "took {} runs", runs);
        assert!(g.select(&mut model).unwrap().is_none());
    }

    #[test]
    fn climb_then_bisect() {
        let params = one_param(10);
        let mut model = Model::new(params);
        model.intervals_mut().push_top(Interval::climb(pv(&[0]), pv(&[10])));
        let mut g = Gbbp::diagonal();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        for (x, flops) in vec![(1, 10.0), (2, 9.0), (3, 8.0)] {
            assert_eq!(g.select(&mut model).unwrap(), Some(pv(&[x])));
            model.insert(Benchmark::estimate(pv(&[x]), flops));
            g.advance(&mut model, &pv(&[x]), &cut).unwrap();
        }
        assert_eq!(stack(&model), vec!["Bisect(3)..(10)"]);
    }

    #[test]
    fn bisect_agreeing_ends_finalizes() {
        // both ends measured at the same throughput
        let mut model = Model::restore(
            one_param(10),
            crate::store::ModelRecord {
                params: one_param(10).defs().to_vec(),
                completion: 2,
                complete: false,
                benchmarks: vec![
                    Benchmark::estimate(pv(&[0]), 10.0),
                    Benchmark::estimate(pv(&[10]), 10.0),
                ],
                intervals: vec![Interval::bisect(pv(&[0]), pv(&[10]))],
            },
        );
        let mut g = Gbbp::diagonal();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        assert_eq!(g.select(&mut model).unwrap(), Some(pv(&[5])));
        model.insert(Benchmark::estimate(pv(&[5]), 10.0));
        g.advance(&mut model, &pv(&[5]), &cut).unwrap();
        assert!(model.intervals().is_complete());
        assert!(model.is_complete());
    }

    #[test]
    fn bisect_keeps_disagreeing_half() {
        let mut model = Model::restore(
            one_param(16),
            crate::store::ModelRecord {
                params: one_param(16).defs().to_vec(),
                completion: 2,
                complete: false,
                benchmarks: vec![
                    Benchmark::estimate(pv(&[0]), 100.0),
                    Benchmark::estimate(pv(&[16]), 0.0),
                ],
                intervals: vec![Interval::bisect(pv(&[0]), pv(&[16]))],
            },
        );
        let mut g = Gbbp::diagonal();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        model.insert(Benchmark::estimate(pv(&[8]), 100.0));
        g.advance(&mut model, &pv(&[8]), &cut).unwrap();
        assert_eq!(stack(&model), vec!["Bisect(8)..(16)"]);
    }

    #[test]
    fn bisect_neither_side_splits() {
        let record = |mid_flops: f64| {
            let mut model = Model::restore(
                one_param(16),
                crate::store::ModelRecord {
                    params: one_param(16).defs().to_vec(),
                    completion: 2,
                    complete: false,
                    benchmarks: vec![
                        Benchmark::estimate(pv(&[0]), 100.0),
                        Benchmark::estimate(pv(&[16]), 0.0),
                    ],
                    intervals: vec![Interval::bisect(pv(&[0]), pv(&[16]))],
                },
            );
            let history = LoadHistory::new(1);
            let band = FixedBand::default();
            let cut = Cut::new(&band, &history);
            model.insert(Benchmark::estimate(pv(&[8]), mid_flops));
            Gbbp::diagonal().advance(&mut model, &pv(&[8]), &cut).unwrap();
            stack(&model)
        };
        // the straight line through the ends predicts 50 at the midpoint
        assert_eq!(record(50.0), vec!["Inflect(8)..(16)", "Inflect(0)..(8)"]);
        assert_eq!(record(20.0), vec!["Bisect(8)..(16)", "Bisect(0)..(8)"]);
    }

    #[test]
    fn failed_advance_leaves_stack_alone() {
        // an unprobed interval and a bisection both wait on 5, but the bisection's start was
        // never measured
        let mut model = Model::restore(
            one_param(10),
            crate::store::ModelRecord {
                params: one_param(10).defs().to_vec(),
                completion: 2,
                complete: false,
                benchmarks: vec![
                    Benchmark::estimate(pv(&[5]), 10.0),
                    Benchmark::estimate(pv(&[10]), 10.0),
                ],
                intervals: vec![
                    Interval::empty(pv(&[5]), pv(&[10])),
                    Interval::bisect(pv(&[0]), pv(&[10])),
                ],
            },
        );
        let before = stack(&model);
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        match Gbbp::diagonal().advance(&mut model, &pv(&[5]), &cut) {
            Err(ConstructionError::MissingBenchmark { params }) => assert_eq!(params, pv(&[0])),
            r => panic!("unexpected {:?}", r),
        }
        assert_eq!(stack(&model), before);
    }

    #[test]
    fn inflect_demotes_to_bisect() {
        let mut model = Model::restore(
            one_param(16),
            crate::store::ModelRecord {
                params: one_param(16).defs().to_vec(),
                completion: 2,
                complete: false,
                benchmarks: vec![
                    Benchmark::estimate(pv(&[0]), 100.0),
                    Benchmark::estimate(pv(&[16]), 0.0),
                ],
                intervals: vec![Interval::inflect(pv(&[0]), pv(&[16]))],
            },
        );
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        model.insert(Benchmark::estimate(pv(&[8]), 90.0));
        Gbbp::diagonal().advance(&mut model, &pv(&[8]), &cut).unwrap();
        assert_eq!(stack(&model), vec!["Bisect(8)..(16)", "Bisect(0)..(8)"]);
    }

    #[test]
    fn unmatched_insert_is_an_error() {
        let mut model = Model::new(one_param(10));
        let mut g = Gbbp::diagonal();
        g.seed(&mut model).unwrap();
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        model.insert(Benchmark::estimate(pv(&[7]), 1.0));
        match g.advance(&mut model, &pv(&[7]), &cut) {
            Err(ConstructionError::Unmatched { params }) => assert_eq!(params, pv(&[7])),
            r => panic!("unexpected {:?}", r),
        }
        // the sample is kept and the stack is untouched
        assert!(model.repo().contains(&pv(&[7])));
        assert_eq!(stack(&model), vec!["Empty(0)..(10)"]);
    }

    #[test]
    fn empties_sharing_a_start_all_climb() {
        let mut model = Model::new(one_param(10));
        model.intervals_mut().push_top(Interval::empty(pv(&[0]), pv(&[10])));
        model.intervals_mut().push_top(Interval::empty(pv(&[0]), pv(&[5])));
        let history = LoadHistory::new(1);
        let band = FixedBand::default();
        let cut = Cut::new(&band, &history);
        model.insert(Benchmark::estimate(pv(&[0]), 1.0));
        Gbbp::diagonal().advance(&mut model, &pv(&[0]), &cut).unwrap();
        assert_eq!(stack(&model), vec!["Climb(0)..(5)@0", "Climb(0)..(10)@0"]);
    }

    #[test]
    fn diagonal_seed_2d() {
        let params = ParamDefSet::new(vec![
            ParamDef::new("m", 0, 8).nonzero_end(),
            ParamDef::new("n", 0, 8).order(1),
        ])
        .unwrap();
        let mut model = Model::new(params);
        Gbbp::diagonal().seed(&mut model).unwrap();
        assert_eq!(
            stack(&model),
            vec!["Point(8, 0)", "Point(8, 8)", "Empty(0, 0)..(8, 8)", "BoundaryComplete"]
        );
    }

    #[test]
    fn diagonal_meshes_2d() {
        let params = ParamDefSet::new(vec![
            ParamDef::new("m", 0, 32).stride(4),
            ParamDef::new("n", 0, 32).stride(4).order(1),
        ])
        .unwrap();
        let mut model = Model::new(params);
        let mut g = Gbbp::diagonal();
        let mut meshed = false;
        build(&mut g, &mut model, |p| {
            if p[0] != p[1] {
                meshed = true;
            }
            1000.0 - (p[0] * p[1]) as f64
        });
        assert!(meshed, "no off-diagonal probes");
        assert!(model.intervals().is_complete());
        // every measured diagonal point got both axis-parallel end points
        for b in model.repo().averages().filter(|b| b.flops > 0.0 && b.params[0] == b.params[1]) {
            assert!(model.repo().contains(&b.params.with(0, 32)));
            assert!(model.repo().contains(&b.params.with(1, 32)));
        }
    }

    #[test]
    fn boundary_layout_covers_grid_lines() {
        let params = ParamDefSet::new(vec![
            ParamDef::new("m", 0, 8).stride(4),
            ParamDef::new("n", 0, 8).stride(4).nonzero_end().order(1),
        ])
        .unwrap();
        let mut model = Model::new(params);
        Gbbp::boundary().seed(&mut model).unwrap();
        let s = stack(&model);
        // lines along n at m = 0, 4 with a point at the measured end
        assert!(s.contains(&"Empty(0, 0)..(0, 8)".to_string()));
        assert!(s.contains(&"Point(4, 8)".to_string()));
        // lines along m at n = 0, 4, 8, ending in zero throughput
        assert!(s.contains(&"Empty(0, 8)..(8, 8)".to_string()));
        assert!(model.repo().contains(&pv(&[8, 4])));
        assert!(!s.iter().any(|i| i.starts_with("BoundaryComplete")));
        assert_eq!(s.len(), 2 + 2 + 3);

        let mut g = Gbbp::boundary();
        build(&mut g, &mut model, |p| 100.0 + p[1] as f64);
        assert!(model.intervals().is_complete());
    }
}
