//! Shard-merging operator
//!
//! Joins the step streams of several selector shards back into one stream.
//! Children evaluate the same step grid, so batches line up index-wise; the
//! merge appends each child's samples per step in shard order, which keeps
//! sample ids (global selector ordinals) sorted and unique. Pulls are
//! sequential; only aggregations use internal parallelism.

use crate::error::{EngineError, Result};
use crate::execution::model::{ExecutionContext, StepBatch, VectorOperator};
use crate::execution::VectorPool;
use crate::types::Labels;
use std::sync::Arc;

/// Merges the output of shard-scoped child operators.
pub struct CoalesceOperator {
    pool: Arc<VectorPool>,
    children: Vec<Box<dyn VectorOperator>>,
    series: Option<Arc<Vec<Labels>>>,
}

impl CoalesceOperator {
    /// Merge `children`, whose series sets partition one selector in order.
    pub fn new(children: Vec<Box<dyn VectorOperator>>) -> Self {
        Self {
            pool: Arc::new(VectorPool::new()),
            children,
            series: None,
        }
    }
}

impl VectorOperator for CoalesceOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        if let Some(series) = &self.series {
            return Ok(Arc::clone(series));
        }
        let mut all = Vec::new();
        for child in &mut self.children {
            all.extend(child.series(ctx)?.iter().cloned());
        }
        self.pool.set_step_size(all.len());
        let all = Arc::new(all);
        self.series = Some(Arc::clone(&all));
        Ok(all)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;

        let mut out: Option<StepBatch> = None;
        for child in &mut self.children {
            let Some(batch) = child.next(ctx)? else {
                continue;
            };
            let merged = out.get_or_insert_with(|| {
                let mut fresh = self.pool.get_vector_batch();
                for v in &batch {
                    fresh.push(self.pool.get_step_vector(v.t));
                }
                fresh
            });
            if merged.len() != batch.len() {
                return Err(EngineError::ContractViolation(
                    "coalesced shards returned misaligned batches".into(),
                ));
            }
            for (slot, vector) in merged.iter_mut().zip(&batch) {
                if slot.t != vector.t {
                    return Err(EngineError::ContractViolation(
                        "coalesced shards returned misaligned steps".into(),
                    ));
                }
                slot.sample_ids.extend_from_slice(&vector.sample_ids);
                slot.samples.extend_from_slice(&vector.samples);
            }
            let pool = child.pool();
            pool.put_vectors(batch);
        }
        Ok(out)
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            "[coalesce]".to_string(),
            self.children.iter().map(|c| &**c as &dyn VectorOperator).collect(),
        )
    }
}
