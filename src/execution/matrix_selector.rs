//! Range-vector selector fused with its range function
//!
//! Matrices never flow between operators: a call like `rate(m[1m])` plans as
//! one operator that reads each series' window `(t - range, t]` per step and
//! applies the range function immediately, emitting plain step vectors. The
//! per-series window is maintained incrementally while steps advance, so each
//! sample is decoded once.

use crate::error::Result;
use crate::execution::function::RangeFunc;
use crate::execution::model::{
    ExecutionContext, StepBatch, VectorOperator, STEPS_BATCH,
};
use crate::execution::selector::SeriesSelector;
use crate::execution::VectorPool;
use crate::storage::SampleIterator;
use crate::types::Labels;
use std::collections::VecDeque;
use std::sync::Arc;

/// Pull-based range selector applying `func` per series per step.
pub struct MatrixSelectorOperator {
    pool: Arc<VectorPool>,
    selector: Arc<dyn SeriesSelector>,
    func: RangeFunc,

    scanners: Vec<MatrixScanner>,
    series: Option<Arc<Vec<Labels>>>,

    mint: i64,
    maxt: i64,
    step: i64,
    current_step: i64,
    offset: i64,
    range: i64,
}

struct MatrixScanner {
    signature: u64,
    iterator: Box<dyn SampleIterator>,
    pending: Option<(i64, f64)>,
    window: VecDeque<(i64, f64)>,
    buffer: Vec<(i64, f64)>,
}

impl MatrixSelectorOperator {
    /// Build a range selector over `[mint, maxt]` with the given window.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        selector: Arc<dyn SeriesSelector>,
        func: RangeFunc,
        mint: i64,
        maxt: i64,
        step: i64,
        offset: i64,
        range: i64,
    ) -> Self {
        Self {
            pool: Arc::new(VectorPool::new()),
            selector,
            func,
            scanners: Vec::new(),
            series: None,
            mint,
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
        let loaded = self.selector.series(ctx, 0, 1)?;
        let mut labels = Vec::with_capacity(loaded.len());
        let mut scanners = Vec::with_capacity(loaded.len());
        for s in loaded {
            let series_labels = s.series.labels();
            labels.push(if self.func.keeps_metric_name() {
                series_labels
            } else {
                series_labels.without_metric_name()
            });
            let mut iterator = s.series.iterator();
            let pending = iterator.next().then(|| iterator.at());
            scanners.push(MatrixScanner {
                signature: s.signature,
                iterator,
                pending,
                window: VecDeque::new(),
                buffer: Vec::new(),
            });
        }
        self.pool.set_step_size(scanners.len());
        self.scanners = scanners;
        self.series = Some(Arc::new(labels));
        Ok(())
    }
}

impl MatrixScanner {
    // Advance the window to `(start, end]` and evaluate the function over it.
    fn evaluate(&mut self, func: RangeFunc, start: i64, end: i64) -> Option<f64> {
        while let Some(&(t, _)) = self.window.front() {
            if t > start {
                break;
            }
            self.window.pop_front();
        }
        while let Some((t, v)) = self.pending {
            if t > end {
                break;
            }
            if t > start {
                self.window.push_back((t, v));
            }
            self.pending = self.iterator.next().then(|| self.iterator.at());
        }
        self.buffer.clear();
        self.buffer.extend(self.window.iter().copied());
        func.apply(&self.buffer, start, end)
    }
}

impl VectorOperator for MatrixSelectorOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        self.init_series(ctx)?;
        Ok(Arc::clone(self.series.as_ref().expect("series initialised")))
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        if self.current_step > self.maxt {
            return Ok(None);
        }
        self.init_series(ctx)?;

        let mut batch = self.pool.get_vector_batch();
        for _ in 0..STEPS_BATCH {
            if self.current_step > self.maxt {
                break;
            }
            let mut vector = self.pool.get_step_vector(self.current_step);
            let end = self.current_step - self.offset;
            let start = end - self.range;
            let func = self.func;
            for scanner in &mut self.scanners {
                if let Some(v) = scanner.evaluate(func, start, end) {
                    vector.push(scanner.signature, v);
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
            format!(
                "[matrixSelector] {}({}[{}ms])",
                self.func.name(),
                self.selector.explain(),
                self.range
            ),
            vec![],
        )
    }
}
