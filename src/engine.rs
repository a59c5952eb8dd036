//! Engine facade
//!
//! Entry point tying the pieces together: parse the query string, build and
//! optimize the logical plan, translate it into an operator tree, then drive
//! the tree to completion on `exec` and shape the collected step vectors into
//! a scalar, vector or matrix result.
//!
//! Construction failures with [`EngineError::is_fallback_eligible`] errors
//! are counted under `promql_engine_queries_total{fallback="true"}` (unless
//! fallback is disabled) and returned to the caller, which owns the actual
//! hand-off to a reference engine.

use crate::error::{EngineError, Result};
use crate::execution::model::Canceller;
use crate::execution::{self, ExecutionContext, Options, VectorOperator};
use crate::logical::{default_optimizers, LogicalPlan, ValueType};
use crate::metrics::EngineMetrics;
use crate::storage::Queryable;
use crate::types::{Labels, Point, QueryValue, SeriesResult, VectorSample};
use parking_lot::Mutex;
use promql_parser::parser;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Engine configuration.
pub struct EngineOpts {
    /// Maximum age of a sample for instant lookups (default: 5 minutes)
    pub lookback_delta: Duration,
    /// Inner step for subqueries without an explicit one (default: 1 minute)
    pub default_evaluation_interval: Duration,
    /// Skip the default logical-plan optimizers
    pub disable_optimizers: bool,
    /// Surface unsupported-expression errors instead of marking them for
    /// fallback to a reference engine
    pub disable_fallback: bool,
    /// Sink receiving a human-readable operator-tree explain per query
    pub debug_writer: Option<Box<dyn Write + Send>>,
    /// Metrics registry to expose `promql_engine_queries_total`
    pub reg: Option<prometheus::Registry>,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            lookback_delta: Duration::from_secs(5 * 60),
            default_evaluation_interval: Duration::from_secs(60),
            disable_optimizers: false,
            disable_fallback: false,
            debug_writer: None,
            reg: None,
        }
    }
}

/// Whether a query evaluates one instant or a range of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Instant,
    Range,
}

/// Query engine handing out executable [`Query`] values.
pub struct Engine {
    lookback_delta: i64,
    default_evaluation_interval: i64,
    disable_optimizers: bool,
    disable_fallback: bool,
    debug_writer: Option<Mutex<Box<dyn Write + Send>>>,
    metrics: EngineMetrics,
}

impl Engine {
    /// Create an engine from options.
    pub fn new(opts: EngineOpts) -> Self {
        let mut lookback_delta = opts.lookback_delta.as_millis() as i64;
        if lookback_delta == 0 {
            lookback_delta = 5 * 60 * 1000;
            debug!(
                value_ms = lookback_delta,
                "lookback delta is zero, setting to default value"
            );
        }
        Self {
            lookback_delta,
            default_evaluation_interval: (opts.default_evaluation_interval.as_millis() as i64)
                .max(1),
            disable_optimizers: opts.disable_optimizers,
            disable_fallback: opts.disable_fallback,
            debug_writer: opts.debug_writer.map(Mutex::new),
            metrics: EngineMetrics::new(opts.reg.as_ref()),
        }
    }

    /// Build a query evaluated at the single timestamp `ts` (milliseconds).
    pub fn new_instant_query(
        &self,
        queryable: Arc<dyn Queryable>,
        qs: &str,
        ts: i64,
    ) -> Result<Query> {
        self.new_query(queryable, qs, ts, ts, 0, QueryKind::Instant)
    }

    /// Build a query evaluated over `[start, end]` at `step` (milliseconds).
    ///
    /// Range queries only accept expressions of scalar or vector type.
    pub fn new_range_query(
        &self,
        queryable: Arc<dyn Queryable>,
        qs: &str,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Query> {
        self.new_query(queryable, qs, start, end, step, QueryKind::Range)
    }

    fn new_query(
        &self,
        queryable: Arc<dyn Queryable>,
        qs: &str,
        start: i64,
        end: i64,
        step: i64,
        kind: QueryKind,
    ) -> Result<Query> {
        let result = self.build_query(queryable, qs, start, end, step, kind);
        match &result {
            Err(err) if !self.disable_fallback && err.is_fallback_eligible() => {
                self.metrics.observe_query(true);
            }
            _ => self.metrics.observe_query(false),
        }
        result
    }

    fn build_query(
        &self,
        queryable: Arc<dyn Queryable>,
        qs: &str,
        start: i64,
        end: i64,
        step: i64,
        kind: QueryKind,
    ) -> Result<Query> {
        let expr = parser::parse(qs).map_err(EngineError::Parse)?;

        let mut plan = LogicalPlan::new(expr, start, end)?;
        let value_type = plan.expr().value_type();
        if kind == QueryKind::Range
            && value_type != ValueType::Vector
            && value_type != ValueType::Scalar
        {
            return Err(EngineError::InvalidType {
                actual: value_type.to_string(),
                query_kind: "range",
                expected: "scalar or instant vector",
            });
        }
        if !self.disable_optimizers {
            plan.optimize(&default_optimizers());
        }

        let opts = Options {
            start,
            end,
            step,
            lookback_delta: self.lookback_delta,
            default_subquery_step: self.default_evaluation_interval,
        };
        let operator = execution::build(&plan, queryable, &opts)?;
        debug!(query = qs, ?kind, "created execution plan");

        let query = Query {
            operator,
            optimizations: plan.optimizations().to_vec(),
            value_type,
            kind,
            ts: end,
            ctx: ExecutionContext::new(),
        };
        if let Some(writer) = &self.debug_writer {
            let _ = writeln!(writer.lock(), "{}", query.explain());
        }
        Ok(query)
    }
}

/// An executable query bound to one operator tree.
pub struct Query {
    operator: Box<dyn VectorOperator>,
    optimizations: Vec<String>,
    value_type: ValueType,
    kind: QueryKind,
    ts: i64,
    ctx: ExecutionContext,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("optimizations", &self.optimizations)
            .field("value_type", &self.value_type)
            .field("kind", &self.kind)
            .field("ts", &self.ts)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Drive the operator tree to completion and shape the result.
    ///
    /// Runtime panics below this boundary are captured, logged, and turned
    /// into a generic runtime error; the query context is cancelled on every
    /// exit path.
    pub fn exec(&mut self) -> Result<QueryValue> {
        let result = catch_unwind(AssertUnwindSafe(|| self.exec_inner()));
        self.ctx.cancel();
        match result {
            Ok(r) => r,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(err = %msg, "runtime panic in engine");
                Err(EngineError::Runtime(msg))
            }
        }
    }

    /// A thread-safe handle that aborts the running query.
    pub fn cancel_handle(&self) -> Canceller {
        self.ctx.canceller()
    }

    /// Abort the query; `exec` returns a cancellation error within one
    /// `next` cycle.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Release resources held by the query. Idempotent.
    pub fn close(&mut self) {
        self.ctx.cancel();
    }

    /// Human-readable explanation of the execution plan.
    pub fn explain(&self) -> String {
        let mut out = String::from("EXPLAIN:\n");
        if !self.optimizations.is_empty() {
            out.push_str("Optimizations applied:\n");
            for entry in &self.optimizations {
                out.push_str(entry);
                out.push('\n');
            }
        }
        out.push_str("Final execution plan:\n");
        explain_tree(&mut out, self.operator.as_ref(), "", "");
        out
    }

    fn exec_inner(&mut self) -> Result<QueryValue> {
        let ctx = self.ctx.clone();
        let result_series = self.operator.series(&ctx)?;

        let mut metrics: Vec<Labels> = result_series.iter().cloned().collect();
        let mut points: Vec<Vec<Point>> = vec![Vec::new(); metrics.len()];

        loop {
            ctx.check()?;
            let Some(batch) = self.operator.next(&ctx)? else {
                break;
            };

            // A series table can be legitimately empty while samples flow,
            // e.g. scalar(m): size the result off the samples then.
            if metrics.is_empty() && batch.iter().any(|v| !v.is_empty()) {
                let width = batch.iter().map(|v| v.len()).max().unwrap_or(0);
                metrics = vec![Labels::empty(); width];
                points = vec![Vec::new(); width];
                for vector in &batch {
                    for (slot, &sample) in vector.samples.iter().enumerate() {
                        points[slot].push(Point {
                            t: vector.t,
                            v: sample,
                        });
                    }
                }
                let pool = self.operator.pool();
                pool.put_vectors(batch);
                continue;
            }

            for vector in &batch {
                for (&id, &sample) in vector.sample_ids.iter().zip(&vector.samples) {
                    points[id as usize].push(Point {
                        t: vector.t,
                        v: sample,
                    });
                }
            }
            let pool = self.operator.pool();
            pool.put_vectors(batch);
        }

        if self.kind == QueryKind::Range {
            let mut matrix: Vec<SeriesResult> = metrics
                .into_iter()
                .zip(points)
                .filter(|(_, pts)| !pts.is_empty())
                .map(|(metric, points)| SeriesResult { metric, points })
                .collect();
            matrix.sort_by(|a, b| a.metric.cmp(&b.metric));
            return Ok(QueryValue::Matrix(matrix));
        }

        match self.value_type {
            ValueType::Matrix => Ok(QueryValue::Matrix(
                metrics
                    .into_iter()
                    .zip(points)
                    .filter(|(_, pts)| !pts.is_empty())
                    .map(|(metric, points)| SeriesResult { metric, points })
                    .collect(),
            )),
            ValueType::Vector => {
                let mut vector = Vec::new();
                for (metric, pts) in metrics.into_iter().zip(points) {
                    let Some(first) = pts.first() else { continue };
                    // Force the sample to the evaluation timestamp; that is
                    // when the evaluation ran.
                    vector.push(VectorSample {
                        metric,
                        point: Point {
                            t: self.ts,
                            v: first.v,
                        },
                    });
                }
                Ok(QueryValue::Vector(vector))
            }
            ValueType::Scalar => {
                let v = points
                    .first()
                    .and_then(|pts| pts.first())
                    .map(|p| p.v)
                    .unwrap_or(f64::NAN);
                Ok(QueryValue::Scalar(Point { t: self.ts, v }))
            }
            ValueType::String => Err(EngineError::NotImplemented(
                "string results at the top level".into(),
            )),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn explain_tree(out: &mut String, op: &dyn VectorOperator, indent: &str, indent_next: &str) {
    let (me, children) = op.explain();
    out.push_str(indent);
    out.push_str(&me);
    if children.is_empty() {
        out.push('\n');
        return;
    }
    out.push_str(":\n");
    for (i, child) in children.iter().enumerate() {
        if i == children.len() - 1 {
            explain_tree(
                out,
                *child,
                &format!("{indent_next}└──"),
                &format!("{indent_next}   "),
            );
        } else {
            explain_tree(
                out,
                *child,
                &format!("{indent_next}├──"),
                &format!("{indent_next}│  "),
            );
        }
    }
}
