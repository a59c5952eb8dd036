//! Vectorized aggregation table
//!
//! Used only for `by ()` aggregations with no grouping labels: every input
//! sample belongs to the single output group, so the step folds over the
//! whole samples slice at once and yields a one-series output.

use crate::error::{EngineError, Result};
use crate::execution::model::StepVector;
use crate::execution::numeric::{KahanSum, WelfordState};
use crate::execution::worker::StepWorker;
use crate::execution::VectorPool;
use crate::logical::AggregateOp;
use std::sync::Arc;

type VectorAccumulator = fn(&[f64]) -> f64;

/// Per-slot single-group table.
pub struct VectorTable {
    timestamp: i64,
    value: f64,
    has_value: bool,
    accumulator: VectorAccumulator,
    input_pool: Arc<VectorPool>,
    output_pool: Arc<VectorPool>,
}

impl VectorTable {
    /// Build a table for `op`, failing for kinds without a vectorized
    /// accumulator so the caller can fall back to the scalar strategy.
    pub fn new(
        op: AggregateOp,
        input_pool: Arc<VectorPool>,
        output_pool: Arc<VectorPool>,
    ) -> Result<Self> {
        Ok(Self {
            timestamp: 0,
            value: 0.0,
            has_value: false,
            accumulator: vector_accumulator(op)?,
            input_pool,
            output_pool,
        })
    }
}

/// Whether `op` has a vectorized accumulator.
pub fn is_vectorizable(op: AggregateOp) -> bool {
    vector_accumulator(op).is_ok()
}

fn vector_accumulator(op: AggregateOp) -> Result<VectorAccumulator> {
    let f: VectorAccumulator = match op {
        AggregateOp::Sum => |samples| {
            let mut sum = KahanSum::new();
            for &s in samples {
                sum.add(s);
            }
            sum.sum()
        },
        AggregateOp::Min => |samples| samples.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateOp::Max => |samples| samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateOp::Avg => |samples| {
            let mut sum = KahanSum::new();
            for &s in samples {
                sum.add(s);
            }
            sum.sum() / samples.len() as f64
        },
        AggregateOp::Count => |samples| samples.len() as f64,
        AggregateOp::Group => |_| 1.0,
        AggregateOp::Stddev => |samples| welford(samples).stddev_population(),
        AggregateOp::Stdvar => |samples| welford(samples).variance_population(),
        other => {
            return Err(EngineError::NotSupportedExpr(format!(
                "no vectorized accumulator for {other}"
            )))
        }
    };
    Ok(f)
}

fn welford(samples: &[f64]) -> WelfordState {
    let mut state = WelfordState::new();
    for &s in samples {
        state.add(s);
    }
    state
}

impl StepWorker for VectorTable {
    fn process(&mut self, vector: StepVector, _param: f64) -> StepVector {
        self.timestamp = vector.t;
        if vector.is_empty() {
            self.has_value = false;
        } else {
            self.has_value = true;
            self.value = (self.accumulator)(&vector.samples);
        }
        self.input_pool.put_step_vector(vector);

        let mut out = self.output_pool.get_step_vector(self.timestamp);
        if self.has_value {
            out.push(0, self.value);
        }
        out
    }
}
