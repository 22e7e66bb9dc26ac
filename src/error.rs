//! Error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::param::ParamVector;

/// Errors from walking or validating the parameter space.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// A step along a segment landed outside of it.
    #[error("step {step} lies outside the segment")]
    OutOfRange {
        /// The step index that was requested.
        step: i64,
    },
    /// A parameter vector had the wrong number of components.
    #[error("expected {expected} parameters, found {found}")]
    LengthMismatch {
        /// Number of parameters in the definition set.
        expected: usize,
        /// Number of components in the offending vector.
        found: usize,
    },
    /// A parameter definition is unusable.
    #[error("parameter `{name}`: {reason}")]
    Invalid {
        /// Name of the parameter.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors raised while selecting or consuming a benchmark point.
///
/// These never discard a benchmark: by the time one is returned from an insertion, the sample is
/// already stored in the repository and the interval stack is left as it was.
#[derive(Debug, Error)]
pub enum ConstructionError {
    /// No construction interval was waiting on the inserted point.
    #[error("no construction interval probes {params}")]
    Unmatched {
        /// The inserted point.
        params: ParamVector,
    },
    /// An interval endpoint that should have been measured has no samples.
    #[error("no benchmark at {params}")]
    MissingBenchmark {
        /// The unmeasured point.
        params: ParamVector,
    },
    /// The model could not produce an estimate for a point.
    #[error("cannot interpolate a {n_p}-parameter model")]
    Interpolation {
        /// Dimensionality of the model.
        n_p: usize,
    },
    /// The construction method does not support this many parameters.
    #[error("{method} construction does not support {n_p} parameters")]
    Unsupported {
        /// Name of the construction method.
        method: &'static str,
        /// Dimensionality of the model.
        n_p: usize,
    },
    /// A step through the parameter space failed.
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Errors from running a benchmark binary.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The benchmark could not be started.
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        /// Path of the benchmark executable.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Reading the benchmark's output failed.
    #[error("failed to read benchmark output: {0}")]
    Read(#[source] io::Error),
    /// The benchmark exited unsuccessfully.
    #[error("benchmark exited with {}", crate::executor::describe_exit(*code))]
    NonZeroExit {
        /// Exit code, or `None` if the process was killed by a signal.
        code: Option<i32>,
        /// Everything the benchmark wrote to stdout and stderr.
        output: String,
    },
    /// The benchmark succeeded but printed something unexpected.
    #[error("malformed benchmark output ({reason})")]
    MalformedOutput {
        /// What was wrong.
        reason: String,
        /// Everything the benchmark wrote to stdout and stderr.
        output: String,
    },
    /// The run was cancelled and the child killed.
    #[error("benchmark cancelled")]
    Cancelled,
}

impl ExecError {
    /// True if this is a graceful-shutdown status rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }

    /// What the benchmark printed before it failed, if it got that far.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::NonZeroExit { output, .. } | ExecError::MalformedOutput { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Errors from reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("{}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The file did not hold what we expected.
    #[error("{}: {source}", path.display())]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A model file's completion counter disagrees with its benchmarks.
    #[error("{}: completion is {completion} but {found} benchmarks were stored", path.display())]
    Inconsistent {
        /// File involved.
        path: PathBuf,
        /// Stored completion counter.
        completion: u64,
        /// Number of benchmarks actually present.
        found: usize,
    },
    /// A saved model was built over different parameters than the ones configured.
    #[error("{}: saved model does not match the configured parameters: {reason}", path.display())]
    Mismatch {
        /// File involved.
        path: PathBuf,
        /// What differs.
        reason: String,
    },
}

/// Errors in the daemon configuration. These are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("{}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The configuration file could not be parsed.
    #[error("{}: {source}", path.display())]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A routine is misconfigured.
    #[error("routine `{routine}`: {reason}")]
    Invalid {
        /// Name of the routine.
        routine: String,
        /// What is wrong with it.
        reason: String,
    },
    /// A parameter definition is misconfigured.
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Any error this crate produces.
#[derive(Debug, Error)]
pub enum Error {
    /// See [`ParamError`].
    #[error(transparent)]
    Param(#[from] ParamError),
    /// See [`ConstructionError`].
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    /// See [`ExecError`].
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// See [`StoreError`].
    #[error(transparent)]
    Store(#[from] StoreError),
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A worker thread could not be started.
    #[error("failed to start {name} thread: {source}")]
    Thread {
        /// Which thread.
        name: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
