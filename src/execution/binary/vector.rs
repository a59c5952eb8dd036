//! Vector-to-vector binary operator
//!
//! Joins two vector streams step by step on their matching signature (all
//! labels except `__name__`, narrowed by `on`/`ignoring`). Group modifiers
//! decide which side may contribute several series per match group; without
//! one, a duplicated signature on either side surfaces a duplicate-match
//! error for that step. Output series derive from the "many" side, with
//! `include` labels copied over from the matched "one" side partner.

use super::{arith, compare};
use crate::error::{EngineError, Result};
use crate::execution::model::{ExecutionContext, StepBatch, StepVector, VectorOperator};
use crate::execution::VectorPool;
use crate::logical::{BinaryOp, MatchCardinality, VectorMatching};
use crate::types::Labels;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Label-matched join of two vector streams.
pub struct VectorBinaryOperator {
    pool: Arc<VectorPool>,
    lhs: Box<dyn VectorOperator>,
    rhs: Box<dyn VectorOperator>,

    op: BinaryOp,
    return_bool: bool,
    matching: VectorMatching,
    signature_names: Vec<String>,

    series: Option<Arc<Vec<Labels>>>,
    // Join tables computed at series time.
    many_sigs: Vec<u64>,
    one_sigs: Vec<u64>,
    // Step scratch: signature -> (one-side value, one-side series ordinal).
    one_values: HashMap<u64, (f64, usize)>,
    matched: HashSet<u64>,
}

impl VectorBinaryOperator {
    /// Build the join operator.
    pub fn new(
        lhs: Box<dyn VectorOperator>,
        rhs: Box<dyn VectorOperator>,
        op: BinaryOp,
        return_bool: bool,
        matching: Option<VectorMatching>,
    ) -> Result<Self> {
        if op.is_set_operator() {
            return Err(EngineError::NotSupportedExpr(format!(
                "set operator {op} between vectors"
            )));
        }
        let matching = matching.unwrap_or_default();
        let mut signature_names = matching.labels.clone();
        signature_names.sort();
        Ok(Self {
            pool: Arc::new(VectorPool::new()),
            lhs,
            rhs,
            op,
            return_bool,
            matching,
            signature_names,
            series: None,
            many_sigs: Vec::new(),
            one_sigs: Vec::new(),
            one_values: HashMap::new(),
            matched: HashSet::new(),
        })
    }

    // The side allowed to carry several series per match group. Defaults to
    // the left; `group_right` flips it.
    fn many_is_lhs(&self) -> bool {
        self.matching.card != MatchCardinality::OneToMany
    }

    fn signature(&self, labels: &Labels) -> u64 {
        let (sig, _) = labels.signature_for_grouping(self.matching.on, &self.signature_names);
        sig
    }

    fn drop_metric_name(&self) -> bool {
        !self.op.is_comparison() || self.return_bool
    }

    fn init_series(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.series.is_some() {
            return Ok(());
        }
        let lhs_series = self.lhs.series(ctx)?;
        let rhs_series = self.rhs.series(ctx)?;
        let (many_series, one_series) = if self.many_is_lhs() {
            (&lhs_series, &rhs_series)
        } else {
            (&rhs_series, &lhs_series)
        };

        self.many_sigs = many_series.iter().map(|l| self.signature(l)).collect();
        self.one_sigs = one_series.iter().map(|l| self.signature(l)).collect();

        // Resolve each many-side series' partner up front so include labels
        // can be copied into the output identity.
        let mut one_by_sig: HashMap<u64, usize> = HashMap::new();
        for (i, sig) in self.one_sigs.iter().enumerate() {
            one_by_sig.entry(*sig).or_insert(i);
        }

        let mut output = Vec::with_capacity(many_series.len());
        for (i, labels) in many_series.iter().enumerate() {
            let partner = one_by_sig
                .get(&self.many_sigs[i])
                .map(|&idx| &one_series[idx]);
            output.push(self.output_labels(labels, partner));
        }
        self.pool.set_step_size(output.len());
        self.series = Some(Arc::new(output));
        Ok(())
    }

    fn output_labels(&self, many: &Labels, partner: Option<&Labels>) -> Labels {
        let mut pairs: Vec<(String, String)> = many
            .iter()
            .filter(|l| {
                if self.drop_metric_name() && l.name == crate::types::METRIC_NAME {
                    return false;
                }
                if self.matching.card == MatchCardinality::OneToOne {
                    let listed = self.matching.labels.iter().any(|n| *n == l.name);
                    if self.matching.on {
                        listed
                    } else {
                        !listed
                    }
                } else {
                    true
                }
            })
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect();
        for name in &self.matching.include {
            pairs.retain(|(n, _)| n != name);
            if let Some(v) = partner.and_then(|p| p.get(name)) {
                pairs.push((name.clone(), v.to_string()));
            }
        }
        Labels::from_pairs(pairs)
    }

    fn join_step(
        &mut self,
        many: &StepVector,
        one: &StepVector,
        many_is_lhs: bool,
    ) -> Result<StepVector> {
        self.one_values.clear();
        self.matched.clear();
        let one_side = if many_is_lhs { "right" } else { "left" };

        for (&id, &sample) in one.sample_ids.iter().zip(&one.samples) {
            let sig = self.one_sigs[id as usize];
            if self.one_values.insert(sig, (sample, id as usize)).is_some() {
                return Err(EngineError::DuplicateMatch(format!(
                    "on the {one_side} hand-side of the operation"
                )));
            }
        }

        let mut out = self.pool.get_step_vector(many.t);
        for (&id, &sample) in many.sample_ids.iter().zip(&many.samples) {
            let sig = self.many_sigs[id as usize];
            let Some(&(one_sample, _)) = self.one_values.get(&sig) else {
                continue;
            };
            if self.matching.card == MatchCardinality::OneToOne && !self.matched.insert(sig) {
                return Err(EngineError::DuplicateMatch(
                    "many-to-one matching must be explicit (group_left/group_right)".into(),
                ));
            }
            let (vl, vr) = if many_is_lhs {
                (sample, one_sample)
            } else {
                (one_sample, sample)
            };
            if self.op.is_comparison() {
                let truth = compare(self.op, vl, vr);
                if self.return_bool {
                    out.push(id, truth as u8 as f64);
                } else if truth {
                    out.push(id, vl);
                }
            } else {
                out.push(id, arith(self.op, vl, vr));
            }
        }
        Ok(out)
    }
}

impl VectorOperator for VectorBinaryOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        self.init_series(ctx)?;
        Ok(Arc::clone(self.series.as_ref().expect("initialised")))
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        let lhs_batch = self.lhs.next(ctx)?;
        let rhs_batch = self.rhs.next(ctx)?;
        let (lhs_batch, rhs_batch) = match (lhs_batch, rhs_batch) {
            (Some(l), Some(r)) => (l, r),
            (Some(l), None) => {
                let pool = self.lhs.pool();
                pool.put_vectors(l);
                return Ok(None);
            }
            (None, Some(r)) => {
                let pool = self.rhs.pool();
                pool.put_vectors(r);
                return Ok(None);
            }
            (None, None) => return Ok(None),
        };
        self.init_series(ctx)?;
        if lhs_batch.len() != rhs_batch.len() {
            return Err(EngineError::ContractViolation(
                "binary operands returned misaligned batches".into(),
            ));
        }

        let many_is_lhs = self.many_is_lhs();
        let mut out = self.pool.get_vector_batch();
        for (l, r) in lhs_batch.iter().zip(&rhs_batch) {
            if l.t != r.t {
                return Err(EngineError::ContractViolation(
                    "binary operands returned misaligned steps".into(),
                ));
            }
            let (many, one) = if many_is_lhs { (l, r) } else { (r, l) };
            let step = self.join_step(many, one, many_is_lhs)?;
            out.push(step);
        }
        let lhs_pool = self.lhs.pool();
        lhs_pool.put_vectors(lhs_batch);
        let rhs_pool = self.rhs.pool();
        rhs_pool.put_vectors(rhs_batch);
        Ok(Some(out))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (
            format!("[vectorBinary] {}", self.op),
            vec![&*self.lhs, &*self.rhs],
        )
    }
}
