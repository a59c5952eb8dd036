//! Execution plan builder
//!
//! Translates a logical expression into the operator tree that evaluates it.
//! Selector reads go through a query-scoped [`SelectorPool`] so identical
//! reads are issued once; instant selectors fan out over shards merged by a
//! coalesce operator; range functions fuse with their matrix or subquery
//! argument. Expressions the engine cannot plan surface `NotSupportedExpr`
//! or `NotImplemented`, both eligible for fallback in the engine facade.

use crate::error::{EngineError, Result};
use crate::execution::aggregate::HashAggregateOperator;
use crate::execution::binary::scalar::{ScalarBinaryOperator, ScalarSide};
use crate::execution::binary::vector::VectorBinaryOperator;
use crate::execution::coalesce::CoalesceOperator;
use crate::execution::function::{FunctionOperator, RangeFunc, ScalarFunctionOperator};
use crate::execution::matrix_selector::MatrixSelectorOperator;
use crate::execution::model::VectorOperator;
use crate::execution::number_selector::NumberSelectorOperator;
use crate::execution::selector::SelectorPool;
use crate::execution::step_invariant::StepInvariantOperator;
use crate::execution::subquery::SubqueryOperator;
use crate::execution::vector_selector::VectorSelectorOperator;
use crate::logical::{
    Aggregate, AggregateOp, Binary, BinaryOp, Call, LogicalExpr, LogicalPlan, MatrixSelector,
    Subquery, ValueType, VectorSelector,
};
use crate::storage::{Queryable, SelectHints};
use std::sync::Arc;

/// Evaluation window and engine tunables threaded through the build.
#[derive(Debug, Clone)]
pub struct Options {
    /// First evaluation timestamp, milliseconds
    pub start: i64,
    /// Last evaluation timestamp, milliseconds
    pub end: i64,
    /// Step between evaluations; 0 for instant queries
    pub step: i64,
    /// Maximum sample age for instant lookups, milliseconds
    pub lookback_delta: i64,
    /// Inner step for subqueries without an explicit one, milliseconds
    pub default_subquery_step: i64,
}

impl Options {
    fn single_step(&self) -> Options {
        Options {
            end: self.start,
            ..self.clone()
        }
    }
}

/// Build the operator tree for a logical plan.
pub fn build(
    plan: &LogicalPlan,
    queryable: Arc<dyn Queryable>,
    opts: &Options,
) -> Result<Box<dyn VectorOperator>> {
    let selector_pool = SelectorPool::new(queryable);
    new_operator(plan.expr(), &selector_pool, opts, &SelectHints::default())
}

fn new_operator(
    expr: &LogicalExpr,
    selectors: &SelectorPool,
    opts: &Options,
    hints: &SelectHints,
) -> Result<Box<dyn VectorOperator>> {
    match expr {
        LogicalExpr::NumberLiteral(val) => Ok(Box::new(NumberSelectorOperator::new(
            *val, opts.start, opts.end, opts.step,
        ))),
        LogicalExpr::StringLiteral(_) => Err(EngineError::NotImplemented(
            "string literal expressions".into(),
        )),
        LogicalExpr::VectorSelector(vs) => new_vector_selector(vs, selectors, opts, hints),
        LogicalExpr::MatrixSelector(_) => Err(EngineError::NotImplemented(
            "matrix selector outside a function call".into(),
        )),
        LogicalExpr::Aggregate(agg) => new_aggregate(agg, selectors, opts),
        LogicalExpr::Call(call) => new_call(call, selectors, opts, hints),
        LogicalExpr::Binary(binary) => new_binary(binary, selectors, opts),
        LogicalExpr::Unary(inner) => new_unary(inner, selectors, opts, hints),
        LogicalExpr::Paren(inner) => new_operator(inner, selectors, opts, hints),
        LogicalExpr::Subquery(_) => Err(EngineError::NotImplemented(
            "subquery outside a function call".into(),
        )),
        LogicalExpr::StepInvariant(inner) => new_step_invariant(inner, selectors, opts, hints),
    }
}

fn new_vector_selector(
    vs: &VectorSelector,
    selectors: &SelectorPool,
    opts: &Options,
    hints: &SelectHints,
) -> Result<Box<dyn VectorOperator>> {
    let mint = opts.start - opts.lookback_delta - vs.offset_ms;
    let maxt = opts.end - vs.offset_ms;
    let hints = SelectHints {
        start: mint,
        end: maxt,
        step: opts.step,
        ..hints.clone()
    };
    let selector = if vs.filters.is_empty() {
        selectors.selector(mint, maxt, &vs.matchers, &hints)
    } else {
        selectors.filtered_selector(mint, maxt, &vs.matchers, &vs.filters, &hints)
    };

    let num_shards = selector_shards();
    let mut shards: Vec<Box<dyn VectorOperator>> = Vec::with_capacity(num_shards);
    for shard in 0..num_shards {
        shards.push(Box::new(VectorSelectorOperator::new(
            Arc::clone(&selector),
            opts.start,
            opts.end,
            opts.step,
            vs.offset_ms,
            opts.lookback_delta,
            shard,
            num_shards,
        )));
    }
    if shards.len() == 1 {
        Ok(shards.pop().expect("one shard"))
    } else {
        Ok(Box::new(CoalesceOperator::new(shards)))
    }
}

fn selector_shards() -> usize {
    (num_cpus::get() / 2).clamp(1, 8)
}

fn new_aggregate(
    agg: &Aggregate,
    selectors: &SelectorPool,
    opts: &Options,
) -> Result<Box<dyn VectorOperator>> {
    // count_values has no table strategy; reject the kind itself before
    // attempting to build an operator for its string parameter.
    if agg.op == AggregateOp::CountValues {
        return Err(EngineError::NotSupportedExpr(format!(
            "unknown aggregation function {}",
            agg.op
        )));
    }
    let hints = SelectHints {
        func: agg.op.to_string(),
        grouping: agg.grouping.clone(),
        by: !agg.without,
        ..SelectHints::default()
    };
    let next = new_operator(&agg.expr, selectors, opts, &hints)?;
    let param = match &agg.param {
        Some(param) => {
            if needs_scalar_param(agg.op) && param.value_type() != ValueType::Scalar {
                return Err(EngineError::NotSupportedExpr(format!(
                    "{} parameter must be a scalar",
                    agg.op
                )));
            }
            Some(new_operator(param, selectors, opts, &SelectHints::default())?)
        }
        None if needs_scalar_param(agg.op) => {
            return Err(EngineError::NotSupportedExpr(format!(
                "{} requires a parameter",
                agg.op
            )))
        }
        None => None,
    };
    Ok(Box::new(HashAggregateOperator::new(
        next,
        param,
        agg.op,
        agg.grouping.clone(),
        agg.without,
    )?))
}

fn needs_scalar_param(op: AggregateOp) -> bool {
    matches!(
        op,
        AggregateOp::Topk | AggregateOp::Bottomk | AggregateOp::Quantile
    )
}

fn new_call(
    call: &Call,
    selectors: &SelectorPool,
    opts: &Options,
    hints: &SelectHints,
) -> Result<Box<dyn VectorOperator>> {
    // Range functions fuse with their matrix or subquery argument.
    if let Some(func) = RangeFunc::from_name(&call.func) {
        if call.args.len() != 1 {
            return Err(EngineError::NotSupportedExpr(format!(
                "{} expects exactly one range argument",
                call.func
            )));
        }
        return match unwrap_parens(&call.args[0]) {
            LogicalExpr::MatrixSelector(ms) => {
                new_matrix_selector(ms, func, selectors, opts, hints)
            }
            LogicalExpr::Subquery(sq) => new_subquery(sq, func, selectors, opts),
            _ => Err(EngineError::NotSupportedExpr(format!(
                "{} over a non-range argument",
                call.func
            ))),
        };
    }

    match call.func.as_str() {
        "vector" => match call.args.first() {
            Some(arg) if arg.value_type() == ValueType::Scalar => {
                new_operator(arg, selectors, opts, &SelectHints::default())
            }
            _ => Err(EngineError::NotSupportedExpr(
                "vector() expects a scalar argument".into(),
            )),
        },
        "scalar" => match call.args.first() {
            Some(arg) if arg.value_type() == ValueType::Vector => {
                let inner = new_operator(arg, selectors, opts, &SelectHints::default())?;
                Ok(Box::new(ScalarFunctionOperator::new(inner)))
            }
            _ => Err(EngineError::NotSupportedExpr(
                "scalar() expects a vector argument".into(),
            )),
        },
        name => {
            let Some(arg) = call.args.first() else {
                return Err(EngineError::NotSupportedExpr(format!(
                    "function {name} without arguments"
                )));
            };
            let inner = new_operator(arg, selectors, opts, &SelectHints::default())?;
            Ok(Box::new(FunctionOperator::new(name, inner)?))
        }
    }
}

fn unwrap_parens(expr: &LogicalExpr) -> &LogicalExpr {
    match expr {
        LogicalExpr::Paren(inner) => unwrap_parens(inner),
        other => other,
    }
}

fn new_matrix_selector(
    ms: &MatrixSelector,
    func: RangeFunc,
    selectors: &SelectorPool,
    opts: &Options,
    hints: &SelectHints,
) -> Result<Box<dyn VectorOperator>> {
    let mint = opts.start - ms.vs.offset_ms - ms.range_ms;
    let maxt = opts.end - ms.vs.offset_ms;
    let hints = SelectHints {
        start: mint,
        end: maxt,
        step: opts.step,
        func: func.name().to_string(),
        range: ms.range_ms,
        // Grouping push-down survives from an enclosing aggregation.
        grouping: hints.grouping.clone(),
        by: hints.by,
    };
    let selector = if ms.vs.filters.is_empty() {
        selectors.selector(mint, maxt, &ms.vs.matchers, &hints)
    } else {
        selectors.filtered_selector(mint, maxt, &ms.vs.matchers, &ms.vs.filters, &hints)
    };
    Ok(Box::new(MatrixSelectorOperator::new(
        selector,
        func,
        opts.start,
        opts.end,
        opts.step,
        ms.vs.offset_ms,
        ms.range_ms,
    )))
}

fn new_subquery(
    sq: &Subquery,
    func: RangeFunc,
    selectors: &SelectorPool,
    opts: &Options,
) -> Result<Box<dyn VectorOperator>> {
    let inner_step = sq.step_ms.unwrap_or(opts.default_subquery_step).max(1);
    // The inner grid is epoch-aligned to the inner step and covers every
    // outer window.
    let window_start = opts.start - sq.offset_ms - sq.range_ms;
    let mut inner_start = inner_step * (window_start / inner_step);
    if inner_start < window_start {
        inner_start += inner_step;
    }
    let inner_opts = Options {
        start: inner_start,
        end: opts.end - sq.offset_ms,
        step: inner_step,
        ..opts.clone()
    };
    let inner = new_operator(&sq.expr, selectors, &inner_opts, &SelectHints::default())?;
    Ok(Box::new(SubqueryOperator::new(
        inner,
        func,
        opts.start,
        opts.end,
        opts.step,
        sq.offset_ms,
        sq.range_ms,
    )))
}

fn new_binary(
    binary: &Binary,
    selectors: &SelectorPool,
    opts: &Options,
) -> Result<Box<dyn VectorOperator>> {
    let lhs_type = binary.lhs.value_type();
    let rhs_type = binary.rhs.value_type();
    let hints = SelectHints::default();

    if lhs_type == ValueType::Scalar && rhs_type == ValueType::Scalar {
        let next = new_operator(&binary.lhs, selectors, opts, &hints)?;
        let scalar = new_operator(&binary.rhs, selectors, opts, &hints)?;
        return Ok(Box::new(ScalarBinaryOperator::new(
            next,
            scalar,
            binary.op,
            ScalarSide::Both,
            binary.return_bool,
        )?));
    }
    if lhs_type == ValueType::Scalar {
        let next = new_operator(&binary.rhs, selectors, opts, &hints)?;
        let scalar = new_operator(&binary.lhs, selectors, opts, &hints)?;
        return Ok(Box::new(ScalarBinaryOperator::new(
            next,
            scalar,
            binary.op,
            ScalarSide::Left,
            binary.return_bool,
        )?));
    }
    if rhs_type == ValueType::Scalar {
        let next = new_operator(&binary.lhs, selectors, opts, &hints)?;
        let scalar = new_operator(&binary.rhs, selectors, opts, &hints)?;
        return Ok(Box::new(ScalarBinaryOperator::new(
            next,
            scalar,
            binary.op,
            ScalarSide::Right,
            binary.return_bool,
        )?));
    }

    let lhs = new_operator(&binary.lhs, selectors, opts, &hints)?;
    let rhs = new_operator(&binary.rhs, selectors, opts, &hints)?;
    Ok(Box::new(VectorBinaryOperator::new(
        lhs,
        rhs,
        binary.op,
        binary.return_bool,
        binary.matching.clone(),
    )?))
}

fn new_unary(
    inner: &LogicalExpr,
    selectors: &SelectorPool,
    opts: &Options,
    hints: &SelectHints,
) -> Result<Box<dyn VectorOperator>> {
    // Unary minus folds into a scalar-left `0 - x`.
    let next = new_operator(inner, selectors, opts, hints)?;
    let zero = Box::new(NumberSelectorOperator::new(
        0.0, opts.start, opts.end, opts.step,
    ));
    let side = if inner.value_type() == ValueType::Scalar {
        ScalarSide::Both
    } else {
        ScalarSide::Left
    };
    match side {
        ScalarSide::Both => Ok(Box::new(ScalarBinaryOperator::new(
            zero,
            next,
            BinaryOp::Sub,
            ScalarSide::Both,
            false,
        )?)),
        _ => Ok(Box::new(ScalarBinaryOperator::new(
            next,
            zero,
            BinaryOp::Sub,
            ScalarSide::Left,
            false,
        )?)),
    }
}

fn new_step_invariant(
    inner: &LogicalExpr,
    selectors: &SelectorPool,
    opts: &Options,
    hints: &SelectHints,
) -> Result<Box<dyn VectorOperator>> {
    // Range selectors and subqueries already vary with evaluation time, so
    // caching is disabled and the operator passes through.
    let cache_result = !matches!(
        unwrap_parens(inner),
        LogicalExpr::MatrixSelector(_) | LogicalExpr::Subquery(_)
    );
    let child_opts = if cache_result {
        opts.single_step()
    } else {
        opts.clone()
    };
    let child = new_operator(inner, selectors, &child_opts, hints)?;
    Ok(Box::new(StepInvariantOperator::new(
        child,
        opts.start,
        opts.end,
        opts.step,
        cache_result,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::model::ExecutionContext;
    use crate::logical::{default_optimizers, LogicalPlan};
    use crate::storage::MemStorage;
    use crate::types::Labels;
    use promql_parser::parser;

    fn build_query(query: &str, storage: MemStorage, opts: &Options) -> Box<dyn VectorOperator> {
        let expr = parser::parse(query).unwrap();
        let mut plan = LogicalPlan::new(expr, opts.start, opts.end).unwrap();
        plan.optimize(&default_optimizers());
        build(&plan, Arc::new(storage), opts).unwrap()
    }

    fn range_opts(start: i64, end: i64, step: i64) -> Options {
        Options {
            start,
            end,
            step,
            lookback_delta: 300_000,
            default_subquery_step: 60_000,
        }
    }

    fn storage_with_m() -> MemStorage {
        let mut storage = MemStorage::new();
        storage.add_series(
            Labels::from_pairs([("__name__", "m")]),
            vec![(0, 1.0), (30_000, 2.0), (60_000, 3.0)],
        );
        storage
    }

    #[test]
    fn test_selector_plan_executes() {
        let mut op = build_query("m", storage_with_m(), &range_opts(0, 60_000, 30_000));
        let ctx = ExecutionContext::new();
        assert_eq!(op.series(&ctx).unwrap().len(), 1);
        let mut values = Vec::new();
        while let Some(batch) = op.next(&ctx).unwrap() {
            for v in &batch {
                values.extend(v.samples.iter().copied());
            }
            op.pool().put_vectors(batch);
        }
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_string_literal_not_implemented() {
        let expr = parser::parse(r#""hello""#).unwrap();
        let plan = LogicalPlan::new(expr, 0, 0).unwrap();
        let err = build(
            &plan,
            Arc::new(MemStorage::new()),
            &range_opts(0, 0, 0),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NotImplemented(_)));
    }

    #[test]
    fn test_unsupported_aggregation_rejected() {
        let expr = parser::parse(r#"count_values("v", m)"#).unwrap();
        let plan = LogicalPlan::new(expr, 0, 0).unwrap();
        let err = build(
            &plan,
            Arc::new(storage_with_m()),
            &range_opts(0, 0, 0),
        )
        .unwrap_err();
        // The kind itself is unsupported; its string parameter must not turn
        // this into a not-implemented error.
        assert!(matches!(err, EngineError::NotSupportedExpr(_)));
        assert!(err.is_fallback_eligible());
    }

    #[test]
    fn test_standalone_matrix_selector_not_implemented() {
        let expr = parser::parse("m[1m]").unwrap();
        let plan = LogicalPlan::new(expr, 0, 0).unwrap();
        let err = build(
            &plan,
            Arc::new(storage_with_m()),
            &range_opts(0, 0, 0),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NotImplemented(_)));
    }

    #[test]
    fn test_unary_minus_on_vector() {
        let mut op = build_query("-m", storage_with_m(), &range_opts(0, 0, 0));
        let ctx = ExecutionContext::new();
        let batch = op.next(&ctx).unwrap().unwrap();
        assert_eq!(batch[0].samples, vec![-1.0]);
        op.pool().put_vectors(batch);
    }
}
