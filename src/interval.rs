use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParamError;
use crate::param::{midpoint, ParamDefSet, ParamVector};

/// The state of a construction interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    /// Nothing measured yet; the first probe is at the start.
    Empty,
    /// Walking away from the start one step at a time, looking for where throughput falls off.
    Climb,
    /// Halving the segment until its ends agree with the middle.
    Bisect,
    /// One extra refinement pass after the model already agreed with a midpoint.
    Inflect,
    /// A single forced probe.
    Point,
    /// Axis or diagonal construction is done; time to mesh.
    BoundaryComplete,
    /// Nothing left to do.
    Complete,
    /// A blank interval.
    #[default]
    Null,
}

impl IntervalKind {
    /// True for the kinds that span a segment.
    pub fn is_segment(self) -> bool {
        matches!(
            self,
            IntervalKind::Empty | IntervalKind::Climb | IntervalKind::Bisect | IntervalKind::Inflect
        )
    }
}

/// A piece of the parameter space with a construction state attached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Interval {
    /// Current state.
    pub kind: IntervalKind,
    /// The axis the interval runs parallel to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plane: Option<usize>,
    /// Where the interval starts. For a point, the point itself.
    #[serde(default)]
    pub start: ParamVector,
    /// Where the interval ends. For a point, the point itself.
    #[serde(default)]
    pub end: ParamVector,
    /// Number of steps climbed so far.
    #[serde(default)]
    pub climb_step: i64,
}

impl Interval {
    fn segment(kind: IntervalKind, start: ParamVector, end: ParamVector) -> Self {
        Interval {
            kind,
            plane: None,
            start,
            end,
            climb_step: 0,
        }
    }

    /// A fresh interval that has not been probed.
    pub fn empty(start: ParamVector, end: ParamVector) -> Self {
        Self::segment(IntervalKind::Empty, start, end)
    }

    /// A climbing interval at step zero.
    pub fn climb(start: ParamVector, end: ParamVector) -> Self {
        Self::segment(IntervalKind::Climb, start, end)
    }

    /// A bisection interval.
    pub fn bisect(start: ParamVector, end: ParamVector) -> Self {
        Self::segment(IntervalKind::Bisect, start, end)
    }

    /// An inflection interval.
    pub fn inflect(start: ParamVector, end: ParamVector) -> Self {
        Self::segment(IntervalKind::Inflect, start, end)
    }

    /// A forced probe at `at`.
    pub fn point(at: ParamVector) -> Self {
        Self::segment(IntervalKind::Point, at.clone(), at)
    }

    /// The marker that ends boundary construction.
    pub fn boundary_complete() -> Self {
        Interval {
            kind: IntervalKind::BoundaryComplete,
            ..Default::default()
        }
    }

    /// The terminal marker.
    pub fn complete() -> Self {
        Interval {
            kind: IntervalKind::Complete,
            ..Default::default()
        }
    }

    /// Record the axis this interval runs along.
    pub fn on_plane(mut self, plane: usize) -> Self {
        self.plane = Some(plane);
        self
    }

    /// The point this interval wants benchmarked next, if any.
    pub fn probe(&self, params: &ParamDefSet) -> Result<Option<ParamVector>, ParamError> {
        Ok(match self.kind {
            IntervalKind::Empty | IntervalKind::Point => Some(params.align(&self.start)),
            IntervalKind::Climb => Some(params.step_between(&self.start, &self.end, self.climb_step + 1)?),
            IntervalKind::Bisect | IntervalKind::Inflect => {
                Some(params.align(&midpoint(&self.start, &self.end)))
            }
            IntervalKind::BoundaryComplete | IntervalKind::Complete | IntervalKind::Null => None,
        })
    }

    /// True if this interval's next probe is a point it does not already end on.
    ///
    /// Intervals that fail this are too small for the parameter strides and are never queued.
    pub fn is_divisible(&self, params: &ParamDefSet) -> bool {
        match self.kind {
            IntervalKind::Empty => true,
            IntervalKind::Climb | IntervalKind::Bisect | IntervalKind::Inflect => match self.probe(params) {
                Ok(Some(p)) => p != params.align(&self.start) && p != params.align(&self.end),
                _ => false,
            },
            _ => false,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IntervalKind::Point => write!(f, "{:?}{}", self.kind, self.start),
            k if k.is_segment() => write!(f, "{:?}{}..{}", k, self.start, self.end),
            k => write!(f, "{:?}", k),
        }?;
        if self.kind == IntervalKind::Climb {
            write!(f, "@{}", self.climb_step)?;
        }
        Ok(())
    }
}

/// A stable reference to an interval on an [`IntervalStack`].
///
/// A handle goes stale when its interval is removed; stale handles resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    interval: Option<Interval>,
    generation: u64,
    above: Option<usize>,
    below: Option<usize>,
}

/// A stack of construction intervals that can also be pushed from the bottom and have any
/// member removed.
///
/// Intervals live in an arena; removing one is O(1) and never disturbs the handles of the rest.
#[derive(Debug, Clone, Default)]
pub struct IntervalStack {
    slots: Vec<Slot>,
    free: Vec<usize>,
    top: Option<usize>,
    bottom: Option<usize>,
    len: usize,
}

impl IntervalStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of intervals on the stack.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the stack holds no intervals.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if the stack is exactly the terminal marker.
    pub fn is_complete(&self) -> bool {
        self.len == 1 && self.top().map_or(false, |(_, i)| i.kind == IntervalKind::Complete)
    }

    fn alloc(&mut self, interval: Interval) -> usize {
        self.len += 1;
        match self.free.pop() {
            Some(i) => {
                let slot = &mut self.slots[i];
                slot.generation += 1;
                slot.interval = Some(interval);
                slot.above = None;
                slot.below = None;
                i
            }
            None => {
                self.slots.push(Slot {
                    interval: Some(interval),
                    generation: 0,
                    above: None,
                    below: None,
                });
                self.slots.len() - 1
            }
        }
    }

    fn handle(&self, index: usize) -> Handle {
        Handle {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn resolve(&self, h: Handle) -> Option<usize> {
        let slot = self.slots.get(h.index)?;
        if slot.generation == h.generation && slot.interval.is_some() {
            Some(h.index)
        } else {
            None
        }
    }

    /// Push onto the top.
    pub fn push_top(&mut self, interval: Interval) -> Handle {
        let i = self.alloc(interval);
        self.slots[i].below = self.top;
        match self.top {
            Some(t) => self.slots[t].above = Some(i),
            None => self.bottom = Some(i),
        }
        self.top = Some(i);
        self.handle(i)
    }

    /// Push underneath everything else.
    pub fn push_bottom(&mut self, interval: Interval) -> Handle {
        let i = self.alloc(interval);
        self.slots[i].above = self.bottom;
        match self.bottom {
            Some(b) => self.slots[b].below = Some(i),
            None => self.top = Some(i),
        }
        self.bottom = Some(i);
        self.handle(i)
    }

    /// The interval on top.
    pub fn top(&self) -> Option<(Handle, &Interval)> {
        let t = self.top?;
        Some((self.handle(t), self.slots[t].interval.as_ref()?))
    }

    /// Remove the top interval.
    pub fn pop_top(&mut self) -> Option<Interval> {
        let t = self.top?;
        let h = self.handle(t);
        self.remove(h)
    }

    /// Remove the interval behind `h`, wherever it is.
    pub fn remove(&mut self, h: Handle) -> Option<Interval> {
        let i = self.resolve(h)?;
        let (above, below) = (self.slots[i].above, self.slots[i].below);
        match above {
            Some(a) => self.slots[a].below = below,
            None => self.top = below,
        }
        match below {
            Some(b) => self.slots[b].above = above,
            None => self.bottom = above,
        }
        self.free.push(i);
        self.len -= 1;
        let slot = &mut self.slots[i];
        slot.above = None;
        slot.below = None;
        slot.interval.take()
    }

    /// Look up the interval behind `h`.
    pub fn get(&self, h: Handle) -> Option<&Interval> {
        self.slots[self.resolve(h)?].interval.as_ref()
    }

    /// Look up the interval behind `h` for modification.
    pub fn get_mut(&mut self, h: Handle) -> Option<&mut Interval> {
        let i = self.resolve(h)?;
        self.slots[i].interval.as_mut()
    }

    /// Drop every interval.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Walk the intervals from the top down.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: self,
            next: self.top,
        }
    }
}

/// Iterator over an [`IntervalStack`], from the top down.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    stack: &'a IntervalStack,
    next: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (Handle, &'a Interval);
    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next?;
        let slot = &self.stack.slots[i];
        self.next = slot.below;
        Some((self.stack.handle(i), slot.interval.as_ref()?))
    }
}

impl From<Vec<Interval>> for IntervalStack {
    /// Build a stack from intervals listed top first.
    fn from(intervals: Vec<Interval>) -> Self {
        let mut stack = IntervalStack::new();
        for interval in intervals {
            stack.push_bottom(interval);
        }
        stack
    }
}

impl From<&IntervalStack> for Vec<Interval> {
    fn from(stack: &IntervalStack) -> Self {
        stack.iter().map(|(_, i)| i.clone()).collect()
    }
}

#[cfg(test)]
fn pv(v: i64) -> ParamVector {
    ParamVector::new(vec![v])
}

#[cfg(test)]
fn starts(s: &IntervalStack) -> Vec<i64> {
    s.iter().map(|(_, i)| i.start[0]).collect()
}

#[test]
fn push_both_ends() {
    let mut s = IntervalStack::new();
    s.push_top(Interval::point(pv(1)));
    s.push_top(Interval::point(pv(2)));
    s.push_bottom(Interval::point(pv(0)));
    assert_eq!(starts(&s), vec![2, 1, 0]);
    assert_eq!(s.pop_top().unwrap().start, pv(2));
    assert_eq!(starts(&s), vec![1, 0]);
    assert_eq!(s.len(), 2);
}

#[test]
fn remove_middle() {
    let mut s = IntervalStack::new();
    let a = s.push_top(Interval::point(pv(1)));
    let b = s.push_top(Interval::point(pv(2)));
    let c = s.push_top(Interval::point(pv(3)));
    assert_eq!(s.remove(b).unwrap().start, pv(2));
    assert_eq!(starts(&s), vec![3, 1]);
    // stale handles resolve to nothing
    assert!(s.remove(b).is_none());
    assert!(s.get(b).is_none());
    assert_eq!(s.get(a).unwrap().start, pv(1));
    s.remove(c);
    s.remove(a);
    assert!(s.is_empty());
    assert!(s.top().is_none());
    assert!(s.pop_top().is_none());
}

#[test]
fn reused_slots_get_new_handles() {
    let mut s = IntervalStack::new();
    let a = s.push_top(Interval::point(pv(1)));
    s.remove(a);
    let b = s.push_bottom(Interval::point(pv(2)));
    assert_ne!(a, b);
    assert!(s.get(a).is_none());
    assert_eq!(s.get(b).unwrap().start, pv(2));
    assert_eq!(starts(&s), vec![2]);
}

#[test]
fn modify_in_place() {
    let mut s = IntervalStack::new();
    let h = s.push_top(Interval::empty(pv(0), pv(10)));
    s.get_mut(h).unwrap().kind = IntervalKind::Climb;
    assert_eq!(s.top().unwrap().1.kind, IntervalKind::Climb);
}

#[test]
fn complete_marker() {
    let mut s = IntervalStack::new();
    assert!(!s.is_complete());
    s.push_top(Interval::complete());
    assert!(s.is_complete());
    s.push_top(Interval::point(pv(0)));
    assert!(!s.is_complete());
    s.clear();
    assert!(s.is_empty());
}

#[test]
fn vec_conversion_keeps_order() {
    let mut s = IntervalStack::new();
    s.push_top(Interval::bisect(pv(0), pv(10)));
    s.push_top(Interval::point(pv(5)));
    let v: Vec<Interval> = (&s).into();
    let back = IntervalStack::from(v);
    assert_eq!(starts(&back), vec![5, 0]);
    assert_eq!(back.top().unwrap().1.kind, IntervalKind::Point);
}

#[test]
fn probes() {
    let params = ParamDefSet::new(vec![crate::param::ParamDef::new("n", 0, 100).stride(4)]).unwrap();
    assert_eq!(Interval::empty(pv(0), pv(100)).probe(&params).unwrap(), Some(pv(0)));
    let mut c = Interval::climb(pv(0), pv(100));
    assert_eq!(c.probe(&params).unwrap(), Some(pv(4)));
    c.climb_step = 2;
    assert_eq!(c.probe(&params).unwrap(), Some(pv(12)));
    assert_eq!(Interval::bisect(pv(0), pv(10)).probe(&params).unwrap(), Some(pv(4)));
    assert_eq!(Interval::point(pv(7)).probe(&params).unwrap(), Some(pv(8)));
    assert_eq!(Interval::complete().probe(&params).unwrap(), None);
    c.climb_step = 30;
    assert!(c.probe(&params).is_err());
}

#[test]
fn divisibility() {
    let params = ParamDefSet::new(vec![crate::param::ParamDef::new("n", 0, 100).stride(4)]).unwrap();
    assert!(Interval::empty(pv(0), pv(0)).is_divisible(&params));
    assert!(Interval::bisect(pv(0), pv(16)).is_divisible(&params));
    // the midpoint of 0..4 is 2, which aligns to 4
    assert!(!Interval::bisect(pv(0), pv(4)).is_divisible(&params));
    assert!(Interval::bisect(pv(0), pv(8)).is_divisible(&params));
    let mut c = Interval::climb(pv(0), pv(12));
    c.climb_step = 1;
    assert!(c.is_divisible(&params));
    c.climb_step = 2;
    assert!(!c.is_divisible(&params));
    c.climb_step = 3;
    assert!(!c.is_divisible(&params));
    assert!(!Interval::point(pv(4)).is_divisible(&params));
}

#[test]
fn display() {
    let mut c = Interval::climb(pv(0), pv(10));
    c.climb_step = 2;
    assert_eq!(c.to_string(), "Climb(0)..(10)@2");
    assert_eq!(Interval::point(pv(3)).to_string(), "Point(3)");
    assert_eq!(Interval::complete().to_string(), "Complete");
}
