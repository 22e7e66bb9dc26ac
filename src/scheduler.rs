use std::cmp::Reverse;

use tracing::trace;

use crate::routine::Routine;
use crate::system::SystemProbe;

/// The scheduler's verdict for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Every model is complete.
    AllComplete,
    /// Benchmark the routine at this index next.
    Selected(usize),
    /// Some models are incomplete, but none of their routines may run right now.
    NoneEligible,
}

impl Schedule {
    /// Numeric status: 0, 1 and 2 respectively.
    pub fn code(&self) -> u8 {
        match self {
            Schedule::AllComplete => 0,
            Schedule::Selected(_) => 1,
            Schedule::NoneEligible => 2,
        }
    }
}

/// Pick the routine to benchmark next.
///
/// Every routine's `executable` flag is refreshed from its condition. Among executable routines
/// with incomplete models, the highest priority wins, and ties go to the routine with the fewest
/// benchmarks so far, then to the one listed first.
pub fn schedule(routines: &mut [Routine], probe: &dyn SystemProbe) -> Schedule {
    for r in routines.iter_mut() {
        r.executable = r.condition.holds(probe);
    }
    if routines.iter().all(Routine::is_complete) {
        return Schedule::AllComplete;
    }
    let pick = routines
        .iter()
        .enumerate()
        .filter(|(_, r)| r.executable && !r.is_complete())
        .min_by_key(|(_, r)| (Reverse(r.priority), r.completion()));
    match pick {
        Some((i, r)) => {
            trace!(routine = %r.name, priority = r.priority, completion = r.completion(), "scheduled");
            Schedule::Selected(i)
        }
        None => Schedule::NoneEligible,
    }
}

#[cfg(test)]
use crate::model::Model;
#[cfg(test)]
use crate::param::{ParamDef, ParamDefSet};
#[cfg(test)]
use crate::routine::{Condition, ConstructionMethod};
#[cfg(test)]
use crate::system::FixedProbe;

#[cfg(test)]
fn routine(name: &str, priority: i32, condition: Condition) -> Routine {
    let model = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 16)]).unwrap());
    Routine::new(name, "/bin/true", model, ConstructionMethod::Gbbp)
        .unwrap()
        .priority(priority)
        .condition(condition)
}

#[cfg(test)]
fn busy() -> FixedProbe {
    FixedProbe {
        load: [1.0, 1.0, 1.0],
        users: Some(1),
    }
}

#[test]
fn empty_is_complete() {
    assert_eq!(schedule(&mut [], &busy()), Schedule::AllComplete);
    assert_eq!(Schedule::AllComplete.code(), 0);
}

#[test]
fn highest_priority_wins() {
    let mut rs = vec![
        routine("low", 1, Condition::Now),
        routine("high", 5, Condition::Now),
        routine("mid", 3, Condition::Now),
    ];
    let s = schedule(&mut rs, &busy());
    assert_eq!(s, Schedule::Selected(1));
    assert_eq!(s.code(), 1);
}

#[test]
fn ties_go_to_least_complete() {
    let mut rs = vec![routine("a", 2, Condition::Now), routine("b", 2, Condition::Now)];
    assert_eq!(schedule(&mut rs, &busy()), Schedule::Selected(0));

    let model = Model::new(ParamDefSet::new(vec![ParamDef::new("n", 0, 16).nonzero_end()]).unwrap());
    // no boundary zeros, so this one has fewer benchmarks
    rs.push(
        Routine::new("c", "/bin/true", model, ConstructionMethod::Gbbp)
            .unwrap()
            .priority(2),
    );
    assert_eq!(schedule(&mut rs, &busy()), Schedule::Selected(2));
}

#[test]
fn ineligible_routines_are_skipped() {
    let mut rs = vec![routine("idle", 9, Condition::Idle), routine("now", 0, Condition::Now)];
    assert_eq!(schedule(&mut rs, &busy()), Schedule::Selected(1));
    assert!(!rs[0].executable);
    assert!(rs[1].executable);

    let mut rs = vec![routine("idle", 9, Condition::Idle), routine("nousers", 0, Condition::NoUsers)];
    let s = schedule(&mut rs, &busy());
    assert_eq!(s, Schedule::NoneEligible);
    assert_eq!(s.code(), 2);
}

#[test]
fn complete_routines_are_skipped() {
    let mut rs = vec![routine("done", 9, Condition::Now).max_completion(1), routine("todo", 0, Condition::Now)];
    assert!(rs[0].is_complete());
    assert_eq!(schedule(&mut rs, &busy()), Schedule::Selected(1));

    rs[1] = routine("todo", 0, Condition::Now).max_completion(1);
    assert_eq!(schedule(&mut rs, &busy()), Schedule::AllComplete);
}
