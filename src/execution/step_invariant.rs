//! Cache-and-replay operator for step-independent subexpressions
//!
//! The planner evaluates a step-invariant subtree over the single-step range
//! `[mint, mint]`, so the child emits exactly one step vector. That vector is
//! copied once and replayed under every step timestamp of the outer query.
//! Range selectors and subqueries opt out of caching (their output carries
//! per-step distinct timestamps) and pass through unchanged.

use crate::error::{EngineError, Result};
use crate::execution::model::{
    ExecutionContext, StepBatch, StepVector, VectorOperator, STEPS_BATCH,
};
use crate::execution::VectorPool;
use crate::types::Labels;
use std::sync::Arc;

enum Cache {
    Pending,
    Empty,
    Cached(StepVector),
}

/// Replays one cached step vector across the query's step grid.
pub struct StepInvariantOperator {
    pool: Arc<VectorPool>,
    next: Box<dyn VectorOperator>,
    cache_result: bool,

    series: Option<Arc<Vec<Labels>>>,
    cache: Cache,

    maxt: i64,
    step: i64,
    current_step: i64,
}

impl StepInvariantOperator {
    /// Wrap `next`, replaying its single step over `[mint, maxt]`.
    ///
    /// `cache_result` is false for matrix/subquery subtrees, which become a
    /// pass-through.
    pub fn new(
        next: Box<dyn VectorOperator>,
        mint: i64,
        maxt: i64,
        step: i64,
        cache_result: bool,
    ) -> Self {
        Self {
            pool: Arc::new(VectorPool::new()),
            next,
            cache_result,
            series: None,
            cache: Cache::Pending,
            maxt,
            step: step.max(1),
            current_step: mint,
        }
    }

    fn cache_input_vector(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if !matches!(self.cache, Cache::Pending) {
            return Ok(());
        }
        let Some(input) = self.next.next(ctx)? else {
            self.cache = Cache::Empty;
            return Ok(());
        };
        if input.is_empty() || input[0].is_empty() {
            let pool = self.next.pool();
            pool.put_vectors(input);
            self.cache = Cache::Empty;
            return Ok(());
        }
        if input.len() != 1 {
            let pool = self.next.pool();
            pool.put_vectors(input);
            return Err(EngineError::ContractViolation(
                "unexpected number of samples from a step-invariant child".into(),
            ));
        }

        // Keep a private copy; the timestamp is irrelevant since replays are
        // stamped with the current step.
        let mut cached = self.pool.get_step_vector(0);
        cached.sample_ids.extend_from_slice(&input[0].sample_ids);
        cached.samples.extend_from_slice(&input[0].samples);
        self.cache = Cache::Cached(cached);
        let pool = self.next.pool();
        pool.put_vectors(input);
        Ok(())
    }
}

impl VectorOperator for StepInvariantOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        if let Some(series) = &self.series {
            return Ok(Arc::clone(series));
        }
        let series = self.next.series(ctx)?;
        self.pool.set_step_size(series.len());
        self.series = Some(Arc::clone(&series));
        Ok(series)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        if self.current_step > self.maxt {
            return Ok(None);
        }
        ctx.check()?;

        if !self.cache_result {
            return self.next.next(ctx);
        }

        self.cache_input_vector(ctx)?;
        let cached = match &self.cache {
            Cache::Cached(v) => v,
            Cache::Empty => return Ok(None),
            Cache::Pending => unreachable!("cache filled above"),
        };

        let mut result = self.pool.get_vector_batch();
        for _ in 0..STEPS_BATCH {
            if self.current_step > self.maxt {
                break;
            }
            let mut out = self.pool.get_step_vector(self.current_step);
            out.sample_ids.extend_from_slice(&cached.sample_ids);
            out.samples.extend_from_slice(&cached.samples);
            result.push(out);
            self.current_step += self.step;
        }
        Ok(Some(result))
    }

    fn pool(&self) -> Arc<VectorPool> {
        if self.cache_result {
            Arc::clone(&self.pool)
        } else {
            // Pass-through batches stay on loan from the child's pool.
            self.next.pool()
        }
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        ("[stepInvariant]".to_string(), vec![&*self.next])
    }
}
