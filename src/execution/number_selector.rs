//! Literal number operator
//!
//! Streams a single label-less series whose value at every step is the
//! literal. This backs scalar literals and the scalar side of binary
//! operations.

use crate::error::Result;
use crate::execution::model::{
    ExecutionContext, StepBatch, VectorOperator, STEPS_BATCH,
};
use crate::execution::VectorPool;
use crate::types::Labels;
use std::sync::Arc;

/// Single-series scalar stream.
pub struct NumberSelectorOperator {
    pool: Arc<VectorPool>,
    val: f64,
    maxt: i64,
    step: i64,
    current_step: i64,
}

impl NumberSelectorOperator {
    /// Stream `val` over `[mint, maxt]` at `step`.
    pub fn new(val: f64, mint: i64, maxt: i64, step: i64) -> Self {
        Self {
            pool: Arc::new(VectorPool::with_step_size(1)),
            val,
            maxt,
            step: step.max(1),
            current_step: mint,
        }
    }
}

impl VectorOperator for NumberSelectorOperator {
    fn series(&mut self, _ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        Ok(Arc::new(vec![Labels::empty()]))
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        if self.current_step > self.maxt {
            return Ok(None);
        }
        let mut batch = self.pool.get_vector_batch();
        for _ in 0..STEPS_BATCH {
            if self.current_step > self.maxt {
                break;
            }
            let mut vector = self.pool.get_step_vector(self.current_step);
            vector.push(0, self.val);
            batch.push(vector);
            self.current_step += self.step;
        }
        Ok(Some(batch))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (format!("[numberLiteral] {}", self.val), vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_value_over_range() {
        let mut op = NumberSelectorOperator::new(2.5, 0, 60_000, 30_000);
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch.len(), 3);
        for (i, v) in batch.iter().enumerate() {
            assert_eq!(v.t, i as i64 * 30_000);
            assert_eq!(v.samples, vec![2.5]);
            assert_eq!(v.sample_ids, vec![0]);
        }
        op.pool().put_vectors(batch);
        assert!(op.next(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_long_range_batches() {
        // 25 steps come back as batches of 10, 10, 5.
        let mut op = NumberSelectorOperator::new(1.0, 0, 24_000, 1000);
        let ctx = ExecutionContext::new();
        let sizes: Vec<usize> = std::iter::from_fn(|| {
            op.next(&ctx).unwrap().map(|b| {
                let n = b.len();
                op.pool().put_vectors(b);
                n
            })
        })
        .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }
}
