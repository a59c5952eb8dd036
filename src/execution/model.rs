//! Execution protocol: step vectors, the operator trait, and the context
//!
//! Data flow is strictly pull-based. A consumer calls [`VectorOperator::next`]
//! on the root operator, which recursively drives its children. Each call
//! returns a batch of [`StepVector`]s, one per evaluation step, in strictly
//! increasing timestamp order; `None` terminates the stream. Operators expose
//! their output series once up front via [`VectorOperator::series`] before
//! sample processing begins; downstream operators refer to series solely by
//! ordinal.
//!
//! Step vectors handed out by `next` are on loan from the producing
//! operator's [`VectorPool`](crate::execution::VectorPool) and must be
//! returned once consumed.

use crate::error::{EngineError, Result};
use crate::execution::VectorPool;
use crate::types::Labels;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Number of steps evaluated per `next` call across the whole pipeline.
pub const STEPS_BATCH: usize = 10;

/// The values for a single evaluation timestamp across the emitting
/// operator's series set.
///
/// Invariants:
/// - `sample_ids.len() == samples.len()`
/// - `sample_ids` are ordinals into the operator's `series()` output and are
///   unique within one step vector
/// - a series with no value at `t` is simply absent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepVector {
    /// Evaluation timestamp, milliseconds
    pub t: i64,
    /// Series ordinals, parallel to `samples`
    pub sample_ids: Vec<u64>,
    /// Sample values, parallel to `sample_ids`
    pub samples: Vec<f64>,
}

impl StepVector {
    /// Append one sample.
    #[inline]
    pub fn push(&mut self, sample_id: u64, sample: f64) {
        self.sample_ids.push(sample_id);
        self.samples.push(sample);
    }

    /// Number of samples present at this step.
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no series has a value at this step.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A batch of step vectors as returned by one `next` call.
pub type StepBatch = Vec<StepVector>;

/// Common interface for all execution operators.
///
/// Operators form a tree owned by the root; each is a closed struct driven
/// single-threaded by its parent (aggregation workers being the one internal
/// exception, see [`worker`](crate::execution::worker)).
pub trait VectorOperator: Send {
    /// The operator's fixed output series, in ordinal order.
    ///
    /// Memoised: repeated calls return the same value, and calling `next`
    /// first must not change the answer.
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>>;

    /// Pull the next batch of step vectors.
    ///
    /// Returns `Ok(None)` when the stream has terminated. Batch contents are
    /// on loan from this operator's pool.
    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>>;

    /// The pool owning the buffers this operator emits.
    fn pool(&self) -> Arc<VectorPool>;

    /// One-line description plus child operators, for explain output.
    fn explain(&self) -> (String, Vec<&dyn VectorOperator>);
}

impl std::fmt::Debug for dyn VectorOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.explain().0)
    }
}

/// Shared per-query execution state: cancellation and an optional deadline.
///
/// Every operator polls [`ExecutionContext::check`] when entering `next`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    /// Fresh context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a wall-clock deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A handle that cancels this context from any thread.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            flag: Arc::clone(&self.cancelled),
        }
    }

    /// Mark the context cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Error out if the query was cancelled or timed out.
    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(EngineError::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::Canceled);
            }
        }
        Ok(())
    }
}

/// Thread-safe, idempotent cancellation handle detached from the context.
#[derive(Debug, Clone)]
pub struct Canceller {
    flag: Arc<AtomicBool>,
}

impl Canceller {
    /// Cancel the associated context.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}
