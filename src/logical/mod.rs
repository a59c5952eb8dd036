//! Logical query plan
//!
//! Wraps a parsed PromQL expression in the engine's own expression tree and
//! performs the two rewrites the physical plan relies on:
//!
//! 1. `@`-modifier elimination: a selector pinned to timestamp `ts` gets its
//!    effective offset set to `original_offset + (eval_time - ts)`, so the
//!    physical plan only ever sees plain offsets.
//! 2. Step-invariant recognition: subtrees whose value does not depend on the
//!    evaluation timestamp (literals, `@`-pinned selectors, and any node all
//!    of whose children are invariant) are wrapped in a marker node that the
//!    execution builder turns into a cache-and-replay operator.
//!
//! Optimizer passes run over the converted tree; see [`optimizer`].

pub mod optimizer;

pub use optimizer::{default_optimizers, MergeSelects, Optimizer, OptimizerLog, SortMatchers};

use crate::error::{EngineError, Result};
use promql_parser::label::Matcher;
use promql_parser::parser::token::{self, TokenType};
use promql_parser::parser::{self, AtModifier, Offset};
use std::fmt;
use std::time::{Duration, UNIX_EPOCH};

/// Static result type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// A single float per step
    Scalar,
    /// An instant vector
    Vector,
    /// A range vector
    Matrix,
    /// A string constant
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Scalar => write!(f, "scalar"),
            ValueType::Vector => write!(f, "vector"),
            ValueType::Matrix => write!(f, "matrix"),
            ValueType::String => write!(f, "string"),
        }
    }
}

/// Expression tree consumed by the execution builder.
#[derive(Debug, Clone)]
pub enum LogicalExpr {
    /// Numeric constant
    NumberLiteral(f64),
    /// String constant
    StringLiteral(String),
    /// Instant selector
    VectorSelector(VectorSelector),
    /// Range selector
    MatrixSelector(MatrixSelector),
    /// Grouping aggregation
    Aggregate(Aggregate),
    /// Function call
    Call(Call),
    /// Arithmetic, comparison or set operation
    Binary(Binary),
    /// Unary minus
    Unary(Box<LogicalExpr>),
    /// Parenthesized subexpression
    Paren(Box<LogicalExpr>),
    /// Inner query evaluated on its own step grid
    Subquery(Subquery),
    /// Marker for a subtree whose value does not depend on the step
    StepInvariant(Box<LogicalExpr>),
}

/// Instant selector with `@` already folded into the offset.
#[derive(Debug, Clone)]
pub struct VectorSelector {
    /// Metric name, if the query spelled one
    pub name: Option<String>,
    /// Matchers sent to storage
    pub matchers: Vec<Matcher>,
    /// Extra matchers applied in memory after a merged storage read
    pub filters: Vec<Matcher>,
    /// Effective offset in milliseconds
    pub offset_ms: i64,
}

/// Range selector.
#[derive(Debug, Clone)]
pub struct MatrixSelector {
    /// Underlying instant selector
    pub vs: VectorSelector,
    /// Window length in milliseconds
    pub range_ms: i64,
}

/// Aggregation kinds understood by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AggregateOp {
    Sum,
    Min,
    Max,
    Avg,
    Group,
    Stddev,
    Stdvar,
    Count,
    CountValues,
    Quantile,
    Topk,
    Bottomk,
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Avg => "avg",
            AggregateOp::Group => "group",
            AggregateOp::Stddev => "stddev",
            AggregateOp::Stdvar => "stdvar",
            AggregateOp::Count => "count",
            AggregateOp::CountValues => "count_values",
            AggregateOp::Quantile => "quantile",
            AggregateOp::Topk => "topk",
            AggregateOp::Bottomk => "bottomk",
        };
        write!(f, "{s}")
    }
}

/// Grouping aggregation.
#[derive(Debug, Clone)]
pub struct Aggregate {
    /// Aggregation kind
    pub op: AggregateOp,
    /// Aggregated subexpression
    pub expr: Box<LogicalExpr>,
    /// Parameter for `quantile`/`topk`/`bottomk`
    pub param: Option<Box<LogicalExpr>>,
    /// Grouping label names, sorted
    pub grouping: Vec<String>,
    /// Whether `grouping` is a `without` clause
    pub without: bool,
}

/// Function call.
#[derive(Debug, Clone)]
pub struct Call {
    /// Function name
    pub func: String,
    /// Arguments in call order
    pub args: Vec<LogicalExpr>,
}

/// Binary operators understood by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Atan2,
    Eq,
    Neq,
    Gtr,
    Lss,
    Gte,
    Lte,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    /// Whether this operator compares rather than computes.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Neq
                | BinaryOp::Gtr
                | BinaryOp::Lss
                | BinaryOp::Gte
                | BinaryOp::Lte
        )
    }

    /// Whether this is a set operator (`and`/`or`/`unless`).
    pub fn is_set_operator(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Gtr => ">",
            BinaryOp::Lss => "<",
            BinaryOp::Gte => ">=",
            BinaryOp::Lte => "<=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Unless => "unless",
        };
        write!(f, "{s}")
    }
}

/// How many series on each side may participate in one match group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCardinality {
    /// Exactly one series on each side
    OneToOne,
    /// Many left series match one right series (`group_left`)
    ManyToOne,
    /// One left series matches many right series (`group_right`)
    OneToMany,
}

/// Vector matching behavior of a binary operation.
#[derive(Debug, Clone)]
pub struct VectorMatching {
    /// Cardinality modifier
    pub card: MatchCardinality,
    /// `on` (true) restricts the signature to `labels`; `ignoring` (false)
    /// excludes them
    pub on: bool,
    /// Labels forming (or excluded from) the match signature
    pub labels: Vec<String>,
    /// Labels copied from the "one" side (`group_left(...)` include list)
    pub include: Vec<String>,
}

impl Default for VectorMatching {
    fn default() -> Self {
        Self {
            card: MatchCardinality::OneToOne,
            on: false,
            labels: Vec::new(),
            include: Vec::new(),
        }
    }
}

/// Binary operation node.
#[derive(Debug, Clone)]
pub struct Binary {
    /// Operator
    pub op: BinaryOp,
    /// Left operand
    pub lhs: Box<LogicalExpr>,
    /// Right operand
    pub rhs: Box<LogicalExpr>,
    /// Comparison emits 0/1 instead of filtering
    pub return_bool: bool,
    /// Matching behavior when both sides are vectors
    pub matching: Option<VectorMatching>,
}

/// Subquery node.
#[derive(Debug, Clone)]
pub struct Subquery {
    /// Inner expression
    pub expr: Box<LogicalExpr>,
    /// Window length in milliseconds
    pub range_ms: i64,
    /// Inner resolution step; engine default when absent
    pub step_ms: Option<i64>,
    /// Effective offset in milliseconds
    pub offset_ms: i64,
}

impl LogicalExpr {
    /// Static result type of this expression.
    pub fn value_type(&self) -> ValueType {
        match self {
            LogicalExpr::NumberLiteral(_) => ValueType::Scalar,
            LogicalExpr::StringLiteral(_) => ValueType::String,
            LogicalExpr::VectorSelector(_) => ValueType::Vector,
            LogicalExpr::MatrixSelector(_) => ValueType::Matrix,
            LogicalExpr::Aggregate(_) => ValueType::Vector,
            LogicalExpr::Call(call) => call_return_type(&call.func),
            LogicalExpr::Binary(b) => {
                if b.lhs.value_type() == ValueType::Scalar
                    && b.rhs.value_type() == ValueType::Scalar
                {
                    ValueType::Scalar
                } else {
                    ValueType::Vector
                }
            }
            LogicalExpr::Unary(inner)
            | LogicalExpr::Paren(inner)
            | LogicalExpr::StepInvariant(inner) => inner.value_type(),
            LogicalExpr::Subquery(_) => ValueType::Matrix,
        }
    }
}

fn call_return_type(func: &str) -> ValueType {
    match func {
        "scalar" | "time" | "pi" => ValueType::Scalar,
        _ => ValueType::Vector,
    }
}

/// A converted, rewritten, optionally optimized expression tree.
#[derive(Debug)]
pub struct LogicalPlan {
    expr: LogicalExpr,
    optimizations: Vec<String>,
}

impl LogicalPlan {
    /// Convert a parsed expression for evaluation over `[mint_ms, maxt_ms]`.
    ///
    /// Performs the `@`-offset rewrite and step-invariant wrapping described
    /// in the module docs. Fails with a fallback-eligible error on constructs
    /// the engine does not plan (`or` matchers, extension nodes).
    pub fn new(expr: parser::Expr, mint_ms: i64, maxt_ms: i64) -> Result<Self> {
        let rewriter = Rewriter { mint_ms, maxt_ms };
        let (expr, invariant) = rewriter.convert(expr)?;
        let expr = if invariant {
            wrap_invariant(expr)
        } else {
            expr
        };
        Ok(Self {
            expr,
            optimizations: Vec::new(),
        })
    }

    /// Run the given optimizer passes in order, recording their decisions.
    pub fn optimize(&mut self, optimizers: &[Box<dyn Optimizer>]) {
        let mut log = OptimizerLog::default();
        let expr = std::mem::replace(&mut self.expr, LogicalExpr::NumberLiteral(0.0));
        self.expr = optimizers
            .iter()
            .fold(expr, |expr, o| o.optimize(expr, &mut log));
        self.optimizations = log.into_entries();
    }

    /// The plan's expression tree.
    pub fn expr(&self) -> &LogicalExpr {
        &self.expr
    }

    /// Human-readable record of applied optimizations.
    pub fn optimizations(&self) -> &[String] {
        &self.optimizations
    }
}

// Wrap a step-invariant subtree, hoisting out redundant parentheses.
fn wrap_invariant(expr: LogicalExpr) -> LogicalExpr {
    match expr {
        LogicalExpr::Paren(inner) => wrap_invariant(*inner),
        LogicalExpr::StepInvariant(_) => expr,
        other => LogicalExpr::StepInvariant(Box::new(other)),
    }
}

struct Rewriter {
    mint_ms: i64,
    maxt_ms: i64,
}

impl Rewriter {
    /// Convert one parser node; the flag reports whether the subtree is
    /// step-invariant. Invariant children of variant parents get wrapped here.
    fn convert(&self, expr: parser::Expr) -> Result<(LogicalExpr, bool)> {
        match expr {
            parser::Expr::NumberLiteral(lit) => Ok((LogicalExpr::NumberLiteral(lit.val), true)),
            parser::Expr::StringLiteral(lit) => Ok((LogicalExpr::StringLiteral(lit.val), true)),
            parser::Expr::VectorSelector(vs) => {
                let pinned = vs.at.is_some();
                Ok((LogicalExpr::VectorSelector(self.convert_selector(vs)?), pinned))
            }
            parser::Expr::MatrixSelector(ms) => {
                let pinned = ms.vs.at.is_some();
                let range_ms = duration_ms(ms.range);
                Ok((
                    LogicalExpr::MatrixSelector(MatrixSelector {
                        vs: self.convert_selector(ms.vs)?,
                        range_ms,
                    }),
                    pinned,
                ))
            }
            parser::Expr::Aggregate(agg) => self.convert_aggregate(agg),
            parser::Expr::Call(call) => self.convert_call(call),
            parser::Expr::Binary(b) => self.convert_binary(b),
            parser::Expr::Unary(u) => {
                let (inner, invariant) = self.convert(*u.expr)?;
                Ok((LogicalExpr::Unary(Box::new(inner)), invariant))
            }
            parser::Expr::Paren(p) => {
                let (inner, invariant) = self.convert(*p.expr)?;
                Ok((LogicalExpr::Paren(Box::new(inner)), invariant))
            }
            parser::Expr::Subquery(sq) => {
                let pinned = sq.at.is_some();
                let offset_ms = self.effective_offset(sq.offset.as_ref(), sq.at.as_ref())?;
                let (inner, inner_invariant) = self.convert(*sq.expr)?;
                let inner = if inner_invariant && !pinned {
                    wrap_invariant(inner)
                } else {
                    inner
                };
                Ok((
                    LogicalExpr::Subquery(Subquery {
                        expr: Box::new(inner),
                        range_ms: duration_ms(sq.range),
                        step_ms: sq.step.map(duration_ms),
                        offset_ms,
                    }),
                    pinned,
                ))
            }
            parser::Expr::Extension(_) => Err(EngineError::NotSupportedExpr(
                "extension expression nodes".into(),
            )),
        }
    }

    fn convert_selector(&self, vs: parser::VectorSelector) -> Result<VectorSelector> {
        if !vs.matchers.or_matchers.is_empty() {
            return Err(EngineError::NotSupportedExpr(
                "selectors with 'or' matcher groups".into(),
            ));
        }
        let offset_ms = self.effective_offset(vs.offset.as_ref(), vs.at.as_ref())?;
        let mut matchers = vs.matchers.matchers;
        // The spelled metric name participates in matching like any label.
        if let Some(name) = &vs.name {
            if !matchers.iter().any(|m| m.name == crate::types::METRIC_NAME) {
                matchers.push(Matcher::new(
                    promql_parser::label::MatchOp::Equal,
                    crate::types::METRIC_NAME,
                    name,
                ));
            }
        }
        Ok(VectorSelector {
            name: vs.name,
            matchers,
            filters: Vec::new(),
            offset_ms,
        })
    }

    // @-modifier rewrite: effective offset = original + (eval_time - ts).
    fn effective_offset(
        &self,
        offset: Option<&Offset>,
        at: Option<&AtModifier>,
    ) -> Result<i64> {
        let original = match offset {
            Some(Offset::Pos(d)) => duration_ms(*d),
            Some(Offset::Neg(d)) => -duration_ms(*d),
            None => 0,
        };
        let ts = match at {
            None => return Ok(original),
            Some(AtModifier::At(t)) => system_time_ms(*t),
            Some(AtModifier::Start) => self.mint_ms,
            Some(AtModifier::End) => self.maxt_ms,
        };
        Ok(original + (self.mint_ms - ts))
    }

    fn convert_aggregate(&self, agg: parser::AggregateExpr) -> Result<(LogicalExpr, bool)> {
        let op = aggregate_op(agg.op)?;
        let (mut grouping, without) = match agg.modifier {
            Some(parser::LabelModifier::Include(list)) => (list.labels, false),
            Some(parser::LabelModifier::Exclude(list)) => (list.labels, true),
            None => (Vec::new(), false),
        };
        // Grouping labels are sorted so metric hashing is order-independent.
        grouping.sort();

        let (inner, inner_invariant) = self.convert(*agg.expr)?;
        let (param, param_invariant) = match agg.param {
            Some(p) => {
                let (converted, invariant) = self.convert(*p)?;
                (Some(converted), invariant)
            }
            None => (None, true),
        };
        let invariant = inner_invariant && param_invariant;

        let inner = if !invariant && inner_invariant {
            wrap_invariant(inner)
        } else {
            inner
        };
        let param = param.map(|p| {
            if !invariant && param_invariant {
                wrap_invariant(p)
            } else {
                p
            }
        });

        Ok((
            LogicalExpr::Aggregate(Aggregate {
                op,
                expr: Box::new(inner),
                param: param.map(Box::new),
                grouping,
                without,
            }),
            invariant,
        ))
    }

    fn convert_call(&self, call: parser::Call) -> Result<(LogicalExpr, bool)> {
        let func: String = call.func.name.to_string();
        // Functions whose value depends on the evaluation time even with
        // constant arguments.
        let variant_func = func == "time";

        let mut args = Vec::with_capacity(call.args.args.len());
        let mut flags = Vec::with_capacity(call.args.args.len());
        for arg in call.args.args {
            let (converted, invariant) = self.convert(*arg)?;
            args.push(converted);
            flags.push(invariant);
        }
        let invariant = !variant_func && flags.iter().all(|&f| f);
        if !invariant {
            for (arg, flag) in args.iter_mut().zip(flags) {
                if flag {
                    let taken = std::mem::replace(arg, LogicalExpr::NumberLiteral(0.0));
                    *arg = wrap_invariant(taken);
                }
            }
        }
        Ok((LogicalExpr::Call(Call { func, args }), invariant))
    }

    fn convert_binary(&self, b: parser::BinaryExpr) -> Result<(LogicalExpr, bool)> {
        let op = binary_op(b.op)?;
        let return_bool = b.return_bool();
        let matching = b.modifier.as_ref().map(|m| {
            let card = match &m.card {
                parser::VectorMatchCardinality::OneToOne => MatchCardinality::OneToOne,
                parser::VectorMatchCardinality::ManyToOne(_) => MatchCardinality::ManyToOne,
                parser::VectorMatchCardinality::OneToMany(_) => MatchCardinality::OneToMany,
                parser::VectorMatchCardinality::ManyToMany => MatchCardinality::OneToOne,
            };
            let include = match &m.card {
                parser::VectorMatchCardinality::ManyToOne(labels)
                | parser::VectorMatchCardinality::OneToMany(labels) => labels.labels.clone(),
                _ => Vec::new(),
            };
            let (on, labels) = match &m.matching {
                Some(parser::LabelModifier::Include(list)) => (true, list.labels.clone()),
                Some(parser::LabelModifier::Exclude(list)) => (false, list.labels.clone()),
                None => (false, Vec::new()),
            };
            VectorMatching {
                card,
                on,
                labels,
                include,
            }
        });

        let (lhs, lhs_invariant) = self.convert(*b.lhs)?;
        let (rhs, rhs_invariant) = self.convert(*b.rhs)?;
        let invariant = lhs_invariant && rhs_invariant;
        let (lhs, rhs) = if invariant {
            (lhs, rhs)
        } else {
            (
                if lhs_invariant { wrap_invariant(lhs) } else { lhs },
                if rhs_invariant { wrap_invariant(rhs) } else { rhs },
            )
        };

        Ok((
            LogicalExpr::Binary(Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                return_bool,
                matching,
            }),
            invariant,
        ))
    }
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis() as i64
}

fn system_time_ms(t: std::time::SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn aggregate_op(op: TokenType) -> Result<AggregateOp> {
    let kind = match op.id() {
        token::T_SUM => AggregateOp::Sum,
        token::T_MIN => AggregateOp::Min,
        token::T_MAX => AggregateOp::Max,
        token::T_AVG => AggregateOp::Avg,
        token::T_GROUP => AggregateOp::Group,
        token::T_STDDEV => AggregateOp::Stddev,
        token::T_STDVAR => AggregateOp::Stdvar,
        token::T_COUNT => AggregateOp::Count,
        token::T_COUNT_VALUES => AggregateOp::CountValues,
        token::T_QUANTILE => AggregateOp::Quantile,
        token::T_TOPK => AggregateOp::Topk,
        token::T_BOTTOMK => AggregateOp::Bottomk,
        _ => {
            return Err(EngineError::NotSupportedExpr(format!(
                "unknown aggregation operator {op:?}"
            )))
        }
    };
    Ok(kind)
}

fn binary_op(op: TokenType) -> Result<BinaryOp> {
    let kind = match op.id() {
        token::T_ADD => BinaryOp::Add,
        token::T_SUB => BinaryOp::Sub,
        token::T_MUL => BinaryOp::Mul,
        token::T_DIV => BinaryOp::Div,
        token::T_MOD => BinaryOp::Mod,
        token::T_POW => BinaryOp::Pow,
        token::T_ATAN2 => BinaryOp::Atan2,
        token::T_EQLC => BinaryOp::Eq,
        token::T_NEQ => BinaryOp::Neq,
        token::T_GTR => BinaryOp::Gtr,
        token::T_LSS => BinaryOp::Lss,
        token::T_GTE => BinaryOp::Gte,
        token::T_LTE => BinaryOp::Lte,
        token::T_LAND => BinaryOp::And,
        token::T_LOR => BinaryOp::Or,
        token::T_LUNLESS => BinaryOp::Unless,
        _ => {
            return Err(EngineError::NotSupportedExpr(format!(
                "unknown binary operator {op:?}"
            )))
        }
    };
    Ok(kind)
}
