//! Build piecewise performance models of computational routines, one benchmark at a time.
//!
//! A routine such as a matrix multiply runs at different speeds for different problem sizes.
//! Measuring every size is far too slow, and measuring a fixed handful of sizes misses the
//! interesting parts, such as cache cliffs and warm-up ramps. This crate instead grows a model
//! adaptively. It keeps a stack of construction intervals over the routine's parameter space, asks
//! the stack which point to benchmark next, and feeds each measured point back so that the
//! intervals can refine themselves. Regions where the speed is flat are settled after a few
//! samples, while regions where it changes keep getting split until the grid gives out.
//!
//! The default strategy, [`Gbbp`] (the Geometric Bisection Building Procedure), first climbs
//! from the start of each axis until the speed stops rising, then bisects what is left. Three
//! simpler strategies, [`Naive`], [`NaiveBisect`], and [`Random`], are also provided for
//! comparison. All of them implement [`Construction`].
//!
//! Whether two speeds are "the same" is decided by a [`Tolerance`], which may take recent
//! system load into account through a [`LoadHistory`].
//!
//! The `pmmd` binary drives all of this: it schedules the routines named in its configuration,
//! runs their benchmark executables through an [`Executor`], and persists the resulting models.
//!
//! # Examples
//!
//! ```rust
//! use pmm::{Benchmark, Construction, Cut, FixedBand, Gbbp, LoadHistory, Model, ParamDef, ParamDefSet};
//!
//! // One parameter, n, from 0 up to (but not including) 64.
//! let params = ParamDefSet::new(vec![ParamDef::new("n", 0, 64)]).unwrap();
//! let mut model = Model::new(params);
//! let mut gbbp = Gbbp::diagonal();
//! gbbp.seed(&mut model).unwrap();
//!
//! let history = LoadHistory::new(1);
//! let band = FixedBand::default();
//! let cut = Cut::new(&band, &history);
//!
//! // Our "routine" speeds up until n = 16, and slows down after that.
//! let speed = |n: i64| {
//!     if n <= 16 {
//!         10.0 * n as f64 + 10.0
//!     } else {
//!         170.0 - 2.0 * (n - 16) as f64
//!     }
//! };
//!
//! let mut runs = 0;
//! while let Some(p) = gbbp.select(&mut model).unwrap() {
//!     model.insert(Benchmark::estimate(p.clone(), speed(p[0])));
//!     gbbp.advance(&mut model, &p, &cut).unwrap();
//!     runs += 1;
//! }
//!
//! // The model is done, without having measured every n.
//! assert!(model.is_complete());
//! assert!(runs < 64);
//! ```
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

use std::fmt;

mod benchmark;
mod cancel;
pub mod config;
mod daemon;
mod error;
mod executor;
mod gbbp;
mod interval;
mod load;
mod model;
mod naive;
mod naive_bisect;
mod param;
mod random;
mod repository;
mod routine;
mod scheduler;
mod store;
mod system;
mod tolerance;

pub use crate::benchmark::Benchmark;
pub use crate::cancel::CancelToken;
pub use crate::daemon::Daemon;
pub use crate::error::{ConfigError, ConstructionError, Error, ExecError, ParamError, Result, StoreError};
pub use crate::executor::{describe_exit, parse_output, Executor};
pub use crate::gbbp::{Gbbp, Layout};
pub use crate::interval::{Handle, Interval, IntervalKind, IntervalStack};
pub use crate::load::{LoadHistory, LoadMonitor, LoadSample};
pub use crate::model::{Interpolator, InverseDistance, Model, NoInterpolation, WritePolicy};
pub use crate::naive::Naive;
pub use crate::naive_bisect::NaiveBisect;
pub use crate::param::{
    midpoint, params_cmp, params_within, Axis, ConstraintEvaluator, ParamConstraint, ParamDef, ParamDefSet,
    ParamVector, ProductFormula,
};
pub use crate::random::Random;
pub use crate::repository::{BenchmarkRepository, Direction};
pub use crate::routine::{Condition, ConstructionMethod, Routine, SampleThresholds};
pub use crate::scheduler::{schedule, Schedule};
pub use crate::store::{JsonStore, LoadStore, ModelRecord, ModelStore};
pub use crate::system::{Host, SystemProbe};
pub use crate::tolerance::{Cut, FixedBand, Tolerance};

/// A strategy for choosing which points of a parameter space to benchmark.
///
/// A strategy keeps all of its progress in the [`Model`]'s interval stack, so that construction
/// can be saved and resumed later, possibly by a different process.
///
/// The protocol is:
///
///  1. call [`seed`](Construction::seed) once on a model that has no intervals yet;
///  2. call [`select`](Construction::select) to get the next point to measure, or `None` once
///     the model is complete;
///  3. measure it, [`Model::insert`] the result, and call [`advance`](Construction::advance)
///     with the same point.
///
/// Steps 2 and 3 may repeat for the same point until the caller has enough samples there;
/// `advance` is only expected once those samples are in.
pub trait Construction: fmt::Debug + Send {
    /// Push the initial construction intervals onto an empty model.
    fn seed(&mut self, model: &mut Model) -> Result<(), ConstructionError>;

    /// The next point to benchmark, if construction is not yet complete.
    fn select(&mut self, model: &mut Model) -> Result<Option<ParamVector>, ConstructionError>;

    /// Refine the intervals now that the samples at `at` are in the model.
    ///
    /// `cut` decides whether two samples are comparable. If no interval is waiting on `at`, this
    /// returns [`ConstructionError::Unmatched`] and leaves the intervals alone.
    fn advance(&mut self, model: &mut Model, at: &ParamVector, cut: &Cut<'_>) -> Result<(), ConstructionError>;
}
