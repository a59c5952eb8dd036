//! Logical plan optimizer passes
//!
//! Two passes run by default, in order, both idempotent:
//!
//! - [`SortMatchers`] canonicalizes matcher order inside every selector so
//!   equivalent selectors hash identically in the selector pool.
//! - [`MergeSelects`] finds selectors whose matcher set extends another
//!   selector's set and rewrites them as an in-memory filter over the broader
//!   read, collapsing e.g. `sum(a{}) / sum(a{x="y"})` into one storage read.

use super::{LogicalExpr, VectorSelector};
use promql_parser::label::{MatchOp, Matcher};
use std::collections::HashSet;

/// Record of decisions made by optimizer passes, for explain output.
#[derive(Debug, Default)]
pub struct OptimizerLog {
    entries: Vec<String>,
}

impl OptimizerLog {
    /// Append one human-readable entry.
    pub fn add(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    pub(crate) fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

/// A rewrite pass over the logical expression tree.
pub trait Optimizer {
    /// Apply the pass, recording decisions in `log`.
    fn optimize(&self, expr: LogicalExpr, log: &mut OptimizerLog) -> LogicalExpr;
}

/// The default pass list.
pub fn default_optimizers() -> Vec<Box<dyn Optimizer>> {
    vec![Box::new(SortMatchers), Box::new(MergeSelects)]
}

// ---------------------------------------------------------------------------
// SortMatchers
// ---------------------------------------------------------------------------

/// Sorts each selector's matchers by `(name, op, value)`.
pub struct SortMatchers;

impl Optimizer for SortMatchers {
    fn optimize(&self, mut expr: LogicalExpr, _log: &mut OptimizerLog) -> LogicalExpr {
        visit_selectors_mut(&mut expr, &mut |vs| {
            vs.matchers.sort_by(compare_matchers);
            vs.filters.sort_by(compare_matchers);
        });
        expr
    }
}

fn matcher_op_rank(op: &MatchOp) -> u8 {
    match op {
        MatchOp::Equal => 0,
        MatchOp::NotEqual => 1,
        MatchOp::Re(_) => 2,
        MatchOp::NotRe(_) => 3,
    }
}

fn compare_matchers(a: &Matcher, b: &Matcher) -> std::cmp::Ordering {
    a.name
        .cmp(&b.name)
        .then(matcher_op_rank(&a.op).cmp(&matcher_op_rank(&b.op)))
        .then(a.value.cmp(&b.value))
}

fn matcher_key(m: &Matcher) -> (String, u8, String) {
    (m.name.clone(), matcher_op_rank(&m.op), m.value.clone())
}

// ---------------------------------------------------------------------------
// MergeSelects
// ---------------------------------------------------------------------------

/// Rewrites narrower selectors as filtered references to broader ones.
///
/// A selector whose matcher set strictly contains another selector's set is
/// replaced by the broader matcher set plus the difference as in-memory
/// filters, so both share a single cached storage read.
pub struct MergeSelects;

impl Optimizer for MergeSelects {
    fn optimize(&self, mut expr: LogicalExpr, log: &mut OptimizerLog) -> LogicalExpr {
        // Collect the matcher sets of all unfiltered selectors.
        let mut sets: Vec<Vec<(String, u8, String)>> = Vec::new();
        visit_selectors_mut(&mut expr, &mut |vs| {
            if vs.filters.is_empty() {
                let mut key: Vec<_> = vs.matchers.iter().map(matcher_key).collect();
                key.sort();
                if !sets.contains(&key) {
                    sets.push(key);
                }
            }
        });

        visit_selectors_mut(&mut expr, &mut |vs| {
            if !vs.filters.is_empty() {
                return;
            }
            let mut own: Vec<_> = vs.matchers.iter().map(matcher_key).collect();
            own.sort();

            // The broadest strict subset wins: fewest matchers, most sharing.
            let base = sets
                .iter()
                .filter(|s| s.len() < own.len() && is_subset(s, &own))
                .min_by_key(|s| s.len());
            let Some(base) = base else { return };

            let base_set: HashSet<_> = base.iter().cloned().collect();
            let mut kept = Vec::new();
            let mut filters = Vec::new();
            for m in vs.matchers.drain(..) {
                if base_set.contains(&matcher_key(&m)) {
                    kept.push(m);
                } else {
                    filters.push(m);
                }
            }
            log.add(format!(
                "MergeSelects: reading {} matchers, filtering {} in memory",
                kept.len(),
                filters.len()
            ));
            vs.matchers = kept;
            vs.filters = filters;
        });
        expr
    }
}

fn is_subset(smaller: &[(String, u8, String)], larger: &[(String, u8, String)]) -> bool {
    let larger: HashSet<_> = larger.iter().collect();
    smaller.iter().all(|k| larger.contains(k))
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

fn visit_selectors_mut(expr: &mut LogicalExpr, f: &mut impl FnMut(&mut VectorSelector)) {
    match expr {
        LogicalExpr::VectorSelector(vs) => f(vs),
        LogicalExpr::MatrixSelector(ms) => f(&mut ms.vs),
        LogicalExpr::Aggregate(agg) => {
            visit_selectors_mut(&mut agg.expr, f);
            if let Some(param) = agg.param.as_mut() {
                visit_selectors_mut(param, f);
            }
        }
        LogicalExpr::Call(call) => {
            for arg in &mut call.args {
                visit_selectors_mut(arg, f);
            }
        }
        LogicalExpr::Binary(b) => {
            visit_selectors_mut(&mut b.lhs, f);
            visit_selectors_mut(&mut b.rhs, f);
        }
        LogicalExpr::Unary(inner)
        | LogicalExpr::Paren(inner)
        | LogicalExpr::StepInvariant(inner) => visit_selectors_mut(inner, f),
        LogicalExpr::Subquery(sq) => visit_selectors_mut(&mut sq.expr, f),
        LogicalExpr::NumberLiteral(_) | LogicalExpr::StringLiteral(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::LogicalPlan;
    use promql_parser::parser;

    fn optimized(query: &str) -> LogicalPlan {
        let expr = parser::parse(query).unwrap();
        let mut plan = LogicalPlan::new(expr, 0, 60_000).unwrap();
        plan.optimize(&default_optimizers());
        plan
    }

    fn selectors(expr: &LogicalExpr) -> Vec<VectorSelector> {
        let mut out = Vec::new();
        let mut cloned = expr.clone();
        visit_selectors_mut(&mut cloned, &mut |vs| out.push(vs.clone()));
        out
    }

    #[test]
    fn test_sort_matchers_canonicalizes_order() {
        let a = optimized(r#"m{x="1", a="2"}"#);
        let b = optimized(r#"m{a="2", x="1"}"#);
        let sa = selectors(a.expr());
        let sb = selectors(b.expr());
        let keys_a: Vec<_> = sa[0].matchers.iter().map(matcher_key).collect();
        let keys_b: Vec<_> = sb[0].matchers.iter().map(matcher_key).collect();
        assert_eq!(keys_a, keys_b);
    }

    #[test]
    fn test_sort_matchers_is_idempotent() {
        let once = optimized(r#"m{x="1", a="2"}"#);
        let mut twice = once;
        twice.optimize(&default_optimizers());
        let s = selectors(twice.expr());
        let keys: Vec<_> = s[0].matchers.iter().map(matcher_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_merge_selects_rewrites_superset() {
        let plan = optimized(r#"sum(a{job="x"}) / sum(a{job="x", handler="y"})"#);
        let sels = selectors(plan.expr());
        assert_eq!(sels.len(), 2);
        let filtered: Vec<_> = sels.iter().filter(|s| !s.filters.is_empty()).collect();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].filters.len(), 1);
        assert_eq!(filtered[0].filters[0].name, "handler");
        // The storage read now matches the broader selector.
        assert_eq!(filtered[0].matchers.len(), 2);
    }

    #[test]
    fn test_merge_selects_leaves_unrelated_selectors() {
        let plan = optimized(r#"a{job="x"} + b{job="x"}"#);
        let sels = selectors(plan.expr());
        assert!(sels.iter().all(|s| s.filters.is_empty()));
    }
}
