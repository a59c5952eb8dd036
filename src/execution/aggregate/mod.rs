//! Hash-aggregation operator
//!
//! Groups input series by a retained label subset and folds each group per
//! step. Three table strategies exist, chosen at initialisation:
//!
//! - **vectorized** ([`vector_table`]): `by ()` with no grouping labels
//!   collapses everything into one group, folded over the raw samples slice;
//! - **scalar** ([`scalar_table`]): the general case with one accumulator per
//!   group, fed through a precomputed input-to-output ordinal mapping;
//! - **k-selection** ([`k_table`]): `topk`/`bottomk`, which select original
//!   input series instead of folding.
//!
//! Each step-batch slot owns an independent table living on a long-lived
//! worker thread; `next` dispatches step `i` of the input batch to worker `i`
//! and reassembles outputs in input order.

pub mod accumulator;
pub mod k_table;
pub mod scalar_table;
pub mod vector_table;

use crate::error::{EngineError, Result};
use crate::execution::model::{
    ExecutionContext, StepBatch, VectorOperator, STEPS_BATCH,
};
use crate::execution::worker::{StepWorker, WorkerGroup};
use crate::execution::VectorPool;
use crate::logical::AggregateOp;
use crate::types::Labels;
use self::k_table::KTable;
use self::scalar_table::ScalarTable;
use self::vector_table::{is_vectorizable, VectorTable};
use std::collections::HashMap;
use std::sync::Arc;

/// Grouping aggregation over a step stream.
pub struct HashAggregateOperator {
    pool: Arc<VectorPool>,
    next: Box<dyn VectorOperator>,
    param: Option<Box<dyn VectorOperator>>,

    op: AggregateOp,
    grouping: Vec<String>,
    without: bool,

    series: Option<Arc<Vec<Labels>>>,
    workers: Option<WorkerGroup>,
}

impl std::fmt::Debug for HashAggregateOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashAggregateOperator")
            .field("op", &self.op)
            .field("grouping", &self.grouping)
            .field("without", &self.without)
            .finish_non_exhaustive()
    }
}

impl HashAggregateOperator {
    /// Build the operator; fails with a fallback-eligible error when the
    /// aggregation kind has no table strategy.
    pub fn new(
        next: Box<dyn VectorOperator>,
        param: Option<Box<dyn VectorOperator>>,
        op: AggregateOp,
        grouping: Vec<String>,
        without: bool,
    ) -> Result<Self> {
        // Validate the kind up front so unsupported queries fail at plan
        // construction, where fallback is still possible.
        match op {
            AggregateOp::Topk | AggregateOp::Bottomk => {}
            _ => {
                accumulator::Accumulator::new(op)?;
            }
        }
        Ok(Self {
            pool: Arc::new(VectorPool::new()),
            next,
            param,
            op,
            grouping,
            without,
            series: None,
            workers: None,
        })
    }

    fn initialize(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.series.is_some() {
            return Ok(());
        }
        let input_pool = self.next.pool();
        let (series, tables) = match self.op {
            AggregateOp::Topk | AggregateOp::Bottomk => self.initialize_k_tables(ctx, input_pool)?,
            _ if !self.without && self.grouping.is_empty() && is_vectorizable(self.op) => {
                self.initialize_vectorized_tables(input_pool)?
            }
            _ => self.initialize_scalar_tables(ctx, input_pool)?,
        };
        self.pool.set_step_size(series.len());
        self.series = Some(Arc::new(series));
        self.workers = Some(WorkerGroup::start(tables));
        Ok(())
    }

    fn initialize_vectorized_tables(
        &mut self,
        input_pool: Arc<VectorPool>,
    ) -> Result<(Vec<Labels>, Vec<Box<dyn StepWorker>>)> {
        let mut tables: Vec<Box<dyn StepWorker>> = Vec::with_capacity(STEPS_BATCH);
        for _ in 0..STEPS_BATCH {
            tables.push(Box::new(VectorTable::new(
                self.op,
                Arc::clone(&input_pool),
                Arc::clone(&self.pool),
            )?));
        }
        Ok((vec![Labels::empty()], tables))
    }

    fn initialize_scalar_tables(
        &mut self,
        ctx: &ExecutionContext,
        input_pool: Arc<VectorPool>,
    ) -> Result<(Vec<Labels>, Vec<Box<dyn StepWorker>>)> {
        let (input_to_output, outputs) = self.group_inputs(ctx)?;
        let mapping = Arc::new(input_to_output);
        let mut tables: Vec<Box<dyn StepWorker>> = Vec::with_capacity(STEPS_BATCH);
        for _ in 0..STEPS_BATCH {
            tables.push(Box::new(ScalarTable::new(
                self.op,
                Arc::clone(&mapping),
                outputs.len(),
                Arc::clone(&input_pool),
                Arc::clone(&self.pool),
            )?));
        }
        Ok((outputs, tables))
    }

    fn initialize_k_tables(
        &mut self,
        ctx: &ExecutionContext,
        input_pool: Arc<VectorPool>,
    ) -> Result<(Vec<Labels>, Vec<Box<dyn StepWorker>>)> {
        let (input_to_group, groups) = self.group_inputs(ctx)?;
        // topk/bottomk emit original input series, so the output universe is
        // the child's series set.
        let series: Vec<Labels> = self.next.series(ctx)?.iter().cloned().collect();
        let k = self.eval_k_param(ctx)?;
        let mapping = Arc::new(input_to_group);
        let mut tables: Vec<Box<dyn StepWorker>> = Vec::with_capacity(STEPS_BATCH);
        for _ in 0..STEPS_BATCH {
            tables.push(Box::new(KTable::new(
                self.op,
                k,
                Arc::clone(&mapping),
                groups.len(),
                Arc::clone(&input_pool),
                Arc::clone(&self.pool),
            )?));
        }
        Ok((series, tables))
    }

    // Map input ordinals to output group ordinals by hashing the retained
    // label subset.
    fn group_inputs(&mut self, ctx: &ExecutionContext) -> Result<(Vec<u64>, Vec<Labels>)> {
        let child_series = self.next.series(ctx)?;
        let mut input_to_output = Vec::with_capacity(child_series.len());
        let mut output_ids: HashMap<u64, u64> = HashMap::new();
        let mut outputs: Vec<Labels> = Vec::new();
        for labels in child_series.iter() {
            let (hash, retained) = labels.signature_for_grouping(!self.without, &self.grouping);
            let id = *output_ids.entry(hash).or_insert_with(|| {
                outputs.push(retained);
                (outputs.len() - 1) as u64
            });
            input_to_output.push(id);
        }
        Ok((input_to_output, outputs))
    }

    // topk/bottomk take their group size from the param subexpression,
    // evaluated once.
    fn eval_k_param(&mut self, ctx: &ExecutionContext) -> Result<usize> {
        let param = self.param.as_mut().ok_or_else(|| {
            EngineError::NotSupportedExpr(format!("{} without a parameter", self.op))
        })?;
        let Some(batch) = param.next(ctx)? else {
            return Ok(0);
        };
        let k = batch
            .first()
            .and_then(|v| v.samples.first().copied())
            .unwrap_or(0.0);
        param.pool().put_vectors(batch);
        if !k.is_finite() || k <= 0.0 {
            return Ok(0);
        }
        Ok(k as usize)
    }

    // The per-step parameter values aligned with the input batch.
    fn step_params(&mut self, ctx: &ExecutionContext, steps: usize) -> Result<Vec<f64>> {
        if self.op != AggregateOp::Quantile {
            return Ok(vec![f64::NAN; steps]);
        }
        let Some(param) = self.param.as_mut() else {
            return Ok(vec![f64::NAN; steps]);
        };
        let mut params = vec![f64::NAN; steps];
        if let Some(batch) = param.next(ctx)? {
            for (slot, vector) in params.iter_mut().zip(&batch) {
                if let Some(&v) = vector.samples.first() {
                    *slot = v;
                }
            }
            param.pool().put_vectors(batch);
        }
        Ok(params)
    }
}

impl VectorOperator for HashAggregateOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        self.initialize(ctx)?;
        Ok(Arc::clone(self.series.as_ref().expect("initialised")))
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        let Some(mut input) = self.next.next(ctx)? else {
            return Ok(None);
        };
        self.initialize(ctx)?;

        let steps = input.len();
        let params = self.step_params(ctx, steps)?;
        let workers = self.workers.as_ref().expect("initialised");
        for (i, vector) in input.drain(..).enumerate() {
            workers.send(i, vector, params[i])?;
        }
        let mut result = self.pool.get_vector_batch();
        for i in 0..steps {
            result.push(workers.output(i)?);
        }
        let child_pool = self.next.pool();
        child_pool.put_vectors(input);
        Ok(Some(result))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        let clause = if self.without { "without" } else { "by" };
        (
            format!(
                "[aggregate] {} {} ({})",
                self.op,
                clause,
                self.grouping.join(", ")
            ),
            vec![&*self.next],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::number_selector::NumberSelectorOperator;
    use crate::execution::selector::SelectorPool;
    use crate::execution::vector_selector::VectorSelectorOperator;
    use crate::storage::{MemStorage, SelectHints};
    use promql_parser::label::{MatchOp, Matcher};

    fn input_over(
        storage: MemStorage,
        mint: i64,
        maxt: i64,
        step: i64,
    ) -> Box<dyn VectorOperator> {
        let pool = SelectorPool::new(Arc::new(storage));
        let selector = pool.selector(
            mint,
            maxt,
            &[Matcher::new(MatchOp::Equal, "__name__", "m")],
            &SelectHints::default(),
        );
        Box::new(VectorSelectorOperator::new(
            selector, mint, maxt, step, 0, 300_000, 0, 1,
        ))
    }

    fn ten_series() -> MemStorage {
        let mut storage = MemStorage::new();
        for i in 0..10 {
            storage.add_series(
                Labels::from_pairs([
                    ("__name__".to_string(), "m".to_string()),
                    ("i".to_string(), i.to_string()),
                ]),
                vec![(0, i as f64)],
            );
        }
        storage
    }

    #[test]
    fn test_sum_collapses_to_single_series() {
        let mut op = HashAggregateOperator::new(
            input_over(ten_series(), 0, 0, 0),
            None,
            AggregateOp::Sum,
            vec![],
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let series = op.series(&ctx).unwrap();
        assert_eq!(series.len(), 1);
        assert!(series[0].is_empty());
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![45.0]);
        op.pool().put_vectors(batch);
        assert!(op.next(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_sum_by_label() {
        let mut storage = MemStorage::new();
        for (pod, container, value) in [
            ("a", "c0", 1.0),
            ("a", "c1", 2.0),
            ("b", "c0", 10.0),
            ("b", "c1", 20.0),
        ] {
            storage.add_series(
                Labels::from_pairs([
                    ("__name__", "m"),
                    ("pod", pod),
                    ("container", container),
                ]),
                vec![(0, value)],
            );
        }
        let mut op = HashAggregateOperator::new(
            input_over(storage, 0, 0, 0),
            None,
            AggregateOp::Sum,
            vec!["pod".to_string()],
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let series = op.series(&ctx).unwrap();
        assert_eq!(series.len(), 2);
        let batch = op.next(&ctx).unwrap().unwrap();
        let mut by_pod: Vec<(String, f64)> = batch[0]
            .sample_ids
            .iter()
            .zip(&batch[0].samples)
            .map(|(&id, &v)| (series[id as usize].get("pod").unwrap().to_string(), v))
            .collect();
        by_pod.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(by_pod, vec![("a".to_string(), 3.0), ("b".to_string(), 30.0)]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_without_drops_metric_name() {
        let mut op = HashAggregateOperator::new(
            input_over(ten_series(), 0, 0, 0),
            None,
            AggregateOp::Max,
            vec!["i".to_string()],
            true,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let series = op.series(&ctx).unwrap();
        // Dropping `i` and `__name__` leaves one empty group.
        assert_eq!(series.len(), 1);
        assert!(series[0].is_empty());
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![9.0]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_topk_emits_original_series() {
        let param = Box::new(NumberSelectorOperator::new(3.0, 0, 0, 0));
        let mut op = HashAggregateOperator::new(
            input_over(ten_series(), 0, 0, 0),
            Some(param),
            AggregateOp::Topk,
            vec![],
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let series = op.series(&ctx).unwrap();
        assert_eq!(series.len(), 10);
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].sample_ids, vec![7, 8, 9]);
        assert_eq!(batch[0].samples, vec![7.0, 8.0, 9.0]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_quantile_param_per_step() {
        let param = Box::new(NumberSelectorOperator::new(0.5, 0, 0, 0));
        let mut op = HashAggregateOperator::new(
            input_over(ten_series(), 0, 0, 0),
            Some(param),
            AggregateOp::Quantile,
            vec![],
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![4.5]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_count_values_rejected_at_construction() {
        // The builder rejects count_values before reaching this constructor;
        // the constructor still refuses the kind on its own.
        let err = HashAggregateOperator::new(
            input_over(ten_series(), 0, 0, 0),
            None,
            AggregateOp::CountValues,
            vec![],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NotSupportedExpr(_)));
        assert!(err.is_fallback_eligible());
    }
}
