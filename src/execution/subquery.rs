//! Subquery operator
//!
//! Evaluates an inner plan on its own step grid and serves range-function
//! reads over the buffered results. The planner builds the inner operator
//! over the epoch-aligned inner-step grid covering every outer step's window
//! `(t - offset - range, t - offset]`; this operator drains it once into
//! per-series sample buffers and then evaluates the fused range function per
//! outer step, like the matrix selector does for plain range selectors.

use crate::error::Result;
use crate::execution::function::RangeFunc;
use crate::execution::model::{
    ExecutionContext, StepBatch, VectorOperator, STEPS_BATCH,
};
use crate::execution::VectorPool;
use crate::types::Labels;
use std::sync::Arc;

/// Range function over an inner query's step stream.
pub struct SubqueryOperator {
    pool: Arc<VectorPool>,
    inner: Box<dyn VectorOperator>,
    func: RangeFunc,

    series: Option<Arc<Vec<Labels>>>,
    buffered: Option<Vec<Vec<(i64, f64)>>>,

    maxt: i64,
    step: i64,
    current_step: i64,
    offset: i64,
    range: i64,
}

impl SubqueryOperator {
    /// Build the operator for the outer grid `[mint, maxt]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inner: Box<dyn VectorOperator>,
        func: RangeFunc,
        mint: i64,
        maxt: i64,
        step: i64,
        offset: i64,
        range: i64,
    ) -> Self {
        Self {
            pool: Arc::new(VectorPool::new()),
            inner,
            func,
            series: None,
            buffered: None,
            maxt,
            step: step.max(1),
            current_step: mint,
            offset,
            range,
        }
    }

    fn init_series(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.series.is_some() {
            return Ok(());
        }
        let inner_series = self.inner.series(ctx)?;
        let series: Vec<Labels> = inner_series
            .iter()
            .map(|l| {
                if self.func.keeps_metric_name() {
                    l.clone()
                } else {
                    l.without_metric_name()
                }
            })
            .collect();
        self.pool.set_step_size(series.len());
        self.series = Some(Arc::new(series));
        Ok(())
    }

    // Drain the inner operator into per-series sample streams.
    fn buffer_inner(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.buffered.is_some() {
            return Ok(());
        }
        self.init_series(ctx)?;
        let num_series = self.series.as_ref().map(|s| s.len()).unwrap_or(0);
        let mut buffered = vec![Vec::new(); num_series];
        while let Some(batch) = self.inner.next(ctx)? {
            for vector in &batch {
                for (&id, &sample) in vector.sample_ids.iter().zip(&vector.samples) {
                    buffered[id as usize].push((vector.t, sample));
                }
            }
            let pool = self.inner.pool();
            pool.put_vectors(batch);
        }
        self.buffered = Some(buffered);
        Ok(())
    }
}

impl VectorOperator for SubqueryOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        self.init_series(ctx)?;
        Ok(Arc::clone(self.series.as_ref().expect("initialised")))
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        if self.current_step > self.maxt {
            return Ok(None);
        }
        self.buffer_inner(ctx)?;
        let buffered = self.buffered.as_ref().expect("buffered above");

        let mut batch = self.pool.get_vector_batch();
        for _ in 0..STEPS_BATCH {
            if self.current_step > self.maxt {
                break;
            }
            let end = self.current_step - self.offset;
            let start = end - self.range;
            let mut vector = self.pool.get_step_vector(self.current_step);
            for (id, samples) in buffered.iter().enumerate() {
                let lo = samples.partition_point(|&(t, _)| t <= start);
                let hi = samples.partition_point(|&(t, _)| t <= end);
                if lo < hi {
                    if let Some(v) = self.func.apply(&samples[lo..hi], start, end) {
                        vector.push(id as u64, v);
                    }
                }
            }
            batch.push(vector);
            self.current_step += self.step;
        }
        Ok(Some(batch))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            format!("[subquery] {}[{}ms]", self.func.name(), self.range),
            vec![&*self.inner],
        )
    }
}
