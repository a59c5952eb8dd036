//! Instant-vector selector operator
//!
//! For every evaluation step `t` the selector emits, per series in its shard,
//! the newest sample with timestamp `<= t - offset` that is no older than the
//! lookback delta. Series without such a sample are absent from that step.
//! Steps are emitted in batches of up to `STEPS_BATCH`.
//!
//! One operator reads one shard of its [`SeriesSelector`]; the planner fans
//! shards out under a coalesce operator, so sample ids here are the global
//! selector ordinals.

use crate::error::Result;
use crate::execution::model::{
    ExecutionContext, StepBatch, VectorOperator, STEPS_BATCH,
};
use crate::execution::selector::{SeriesSelector, SignedSeries};
use crate::execution::VectorPool;
use crate::storage::SampleIterator;
use crate::types::Labels;
use std::sync::Arc;

/// Pull-based instant selector over one shard.
pub struct VectorSelectorOperator {
    pool: Arc<VectorPool>,
    selector: Arc<dyn SeriesSelector>,
    shard: usize,
    num_shards: usize,

    scanners: Vec<SeriesScanner>,
    series: Option<Arc<Vec<Labels>>>,

    mint: i64,
    maxt: i64,
    step: i64,
    current_step: i64,
    offset: i64,
    lookback: i64,
}

struct SeriesScanner {
    signature: u64,
    iterator: Box<dyn SampleIterator>,
    // Next unconsumed sample, if any.
    pending: Option<(i64, f64)>,
    // Newest sample at or before the last probed timestamp.
    latest: Option<(i64, f64)>,
}

impl VectorSelectorOperator {
    /// Build a selector for the given shard of `selector`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        selector: Arc<dyn SeriesSelector>,
        mint: i64,
        maxt: i64,
        step: i64,
        offset: i64,
        lookback: i64,
        shard: usize,
        num_shards: usize,
    ) -> Self {
        Self {
            pool: Arc::new(VectorPool::new()),
            selector,
            shard,
            num_shards,
            scanners: Vec::new(),
            series: None,
            mint,
            maxt,
            // A zero step means an instant query; treat it as one so the
            // range arithmetic below stays well-formed.
            step: step.max(1),
            current_step: mint,
            offset,
            lookback,
        }
    }

    fn init_series(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.series.is_some() {
            return Ok(());
        }
        let shard: Vec<SignedSeries> = self
            .selector
            .series(ctx, self.shard, self.num_shards)?;
        let mut labels = Vec::with_capacity(shard.len());
        let mut scanners = Vec::with_capacity(shard.len());
        for s in shard {
            labels.push(s.series.labels());
            let mut iterator = s.series.iterator();
            let pending = iterator.next().then(|| iterator.at());
            scanners.push(SeriesScanner {
                signature: s.signature,
                iterator,
                pending,
                latest: None,
            });
        }
        self.pool.set_step_size(scanners.len());
        self.scanners = scanners;
        self.series = Some(Arc::new(labels));
        Ok(())
    }
}

impl SeriesScanner {
    // The sample visible at timestamp `ts` given the lookback window.
    fn select_point(&mut self, ts: i64, lookback: i64) -> Option<(i64, f64)> {
        while let Some((t, v)) = self.pending {
            if t > ts {
                break;
            }
            self.latest = Some((t, v));
            self.pending = self.iterator.next().then(|| self.iterator.at());
        }
        match self.latest {
            Some((t, v)) if ts - t <= lookback => Some((t, v)),
            _ => None,
        }
    }
}

impl VectorOperator for VectorSelectorOperator {
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
            let ts = self.current_step - self.offset;
            for scanner in &mut self.scanners {
                if let Some((_, v)) = scanner.select_point(ts, self.lookback) {
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
                "[vectorSelector] shard {}/{} of {}",
                self.shard,
                self.num_shards,
                self.selector.explain()
            ),
            vec![],
        )
    }
}
