//! Scalar-side binary operator
//!
//! Evaluates expressions where at least one operand is a scalar. The scalar
//! side is lazily evaluated exactly once (its stream is step-invariant by
//! construction) and then applied elementwise while the vector side streams
//! through. With scalars on both sides the operator degenerates to a
//! single-series scalar stream.
//!
//! Comparison semantics: between a vector and a scalar, matches filter unless
//! the `bool` modifier is present; between two scalars the result is always
//! 0/1.

use super::{arith, compare};
use crate::error::{EngineError, Result};
use crate::execution::model::{ExecutionContext, StepBatch, VectorOperator};
use crate::execution::VectorPool;
use crate::logical::BinaryOp;
use crate::types::Labels;
use std::sync::Arc;

/// Which operand position the scalar occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarSide {
    /// Scalar on the left, vector on the right
    Left,
    /// Vector on the left, scalar on the right
    Right,
    /// Both operands are scalars
    Both,
}

/// Elementwise operation between a vector stream and one cached scalar.
pub struct ScalarBinaryOperator {
    pool: Arc<VectorPool>,
    next: Box<dyn VectorOperator>,
    scalar_operator: Box<dyn VectorOperator>,
    scalar: Option<f64>,

    op: BinaryOp,
    side: ScalarSide,
    return_bool: bool,
    series: Option<Arc<Vec<Labels>>>,
}

impl ScalarBinaryOperator {
    /// Build the operator. `next` is the vector side (or the left scalar
    /// stream when both sides are scalar); `scalar_operator` is the scalar
    /// side.
    pub fn new(
        next: Box<dyn VectorOperator>,
        scalar_operator: Box<dyn VectorOperator>,
        op: BinaryOp,
        side: ScalarSide,
        return_bool: bool,
    ) -> Result<Self> {
        if op.is_set_operator() {
            return Err(EngineError::NotSupportedExpr(format!(
                "set operator {op} with scalar operands"
            )));
        }
        Ok(Self {
            pool: Arc::new(VectorPool::new()),
            next,
            scalar_operator,
            scalar: None,
            op,
            side,
            return_bool,
            series: None,
        })
    }

    // The scalar side never changes during execution; evaluate it on first
    // use and hold the value.
    fn scalar(&mut self, ctx: &ExecutionContext) -> Result<f64> {
        if let Some(v) = self.scalar {
            return Ok(v);
        }
        let value = match self.scalar_operator.next(ctx)? {
            Some(batch) => {
                let v = batch
                    .first()
                    .and_then(|step| step.samples.first().copied())
                    .unwrap_or(f64::NAN);
                self.scalar_operator.pool().put_vectors(batch);
                v
            }
            None => f64::NAN,
        };
        self.scalar = Some(value);
        Ok(value)
    }
}

impl VectorOperator for ScalarBinaryOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        if let Some(series) = &self.series {
            return Ok(Arc::clone(series));
        }
        // The operation rewrites sample values, so `__name__` no longer
        // describes them.
        let series: Vec<Labels> = self
            .next
            .series(ctx)?
            .iter()
            .map(|l| l.without_metric_name())
            .collect();
        self.pool.set_step_size(series.len());
        let series = Arc::new(series);
        self.series = Some(Arc::clone(&series));
        Ok(series)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        let Some(input) = self.next.next(ctx)? else {
            return Ok(None);
        };
        let scalar = self.scalar(ctx)?;

        let mut out = self.pool.get_vector_batch();
        for vector in &input {
            let mut step = self.pool.get_step_vector(vector.t);
            for (&id, &sample) in vector.sample_ids.iter().zip(&vector.samples) {
                let (lhs, rhs) = match self.side {
                    ScalarSide::Left => (scalar, sample),
                    ScalarSide::Right | ScalarSide::Both => (sample, scalar),
                };
                if self.op.is_comparison() {
                    let truth = compare(self.op, lhs, rhs);
                    if self.return_bool || self.side == ScalarSide::Both {
                        step.push(id, truth as u8 as f64);
                    } else if truth {
                        step.push(id, sample);
                    }
                } else {
                    step.push(id, arith(self.op, lhs, rhs));
                }
            }
            out.push(step);
        }
        let pool = self.next.pool();
        pool.put_vectors(input);
        Ok(Some(out))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            format!("[scalarBinary] {} (scalar side: {:?})", self.op, self.side),
            vec![&*self.next, &*self.scalar_operator],
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

    fn vector_input(values: &[f64]) -> Box<dyn VectorOperator> {
        let mut storage = MemStorage::new();
        for (i, &v) in values.iter().enumerate() {
            storage.add_series(
                Labels::from_pairs([
                    ("__name__".to_string(), "m".to_string()),
                    ("i".to_string(), i.to_string()),
                ]),
                vec![(0, v)],
            );
        }
        let pool = SelectorPool::new(Arc::new(storage));
        let selector = pool.selector(
            0,
            0,
            &[Matcher::new(MatchOp::Equal, "__name__", "m")],
            &SelectHints::default(),
        );
        Box::new(VectorSelectorOperator::new(
            selector, 0, 0, 0, 0, 300_000, 0, 1,
        ))
    }

    fn number(v: f64) -> Box<dyn VectorOperator> {
        Box::new(NumberSelectorOperator::new(v, 0, 0, 0))
    }

    #[test]
    fn test_vector_divided_by_scalar() {
        let mut op = ScalarBinaryOperator::new(
            vector_input(&[10.0, 20.0]),
            number(2.0),
            BinaryOp::Div,
            ScalarSide::Right,
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![5.0, 10.0]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_scalar_minus_vector() {
        let mut op = ScalarBinaryOperator::new(
            vector_input(&[3.0]),
            number(10.0),
            BinaryOp::Sub,
            ScalarSide::Left,
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![7.0]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_metric_name_dropped() {
        let mut op = ScalarBinaryOperator::new(
            vector_input(&[1.0]),
            number(2.0),
            BinaryOp::Mul,
            ScalarSide::Right,
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let series = op.series(&ctx).unwrap();
        assert_eq!(series[0].get("__name__"), None);
        assert_eq!(series[0].get("i"), Some("0"));
    }

    #[test]
    fn test_comparison_filters_without_bool() {
        let mut op = ScalarBinaryOperator::new(
            vector_input(&[1.0, 5.0, 9.0]),
            number(4.0),
            BinaryOp::Gtr,
            ScalarSide::Right,
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].sample_ids, vec![1, 2]);
        assert_eq!(batch[0].samples, vec![5.0, 9.0]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_comparison_with_bool_yields_zero_one() {
        let mut op = ScalarBinaryOperator::new(
            vector_input(&[1.0, 5.0]),
            number(4.0),
            BinaryOp::Gtr,
            ScalarSide::Right,
            true,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![0.0, 1.0]);
        op.pool().put_vectors(batch);
    }

    #[test]
    fn test_scalar_scalar_comparison_never_filters() {
        let mut op = ScalarBinaryOperator::new(
            number(2.0),
            number(4.0),
            BinaryOp::Gtr,
            ScalarSide::Both,
            false,
        )
        .unwrap();
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![0.0]);
        op.pool().put_vectors(batch);
    }
}
