//! Selection table for `topk` / `bottomk`
//!
//! Unlike the folding aggregations, `topk`/`bottomk` select up to `k` of the
//! original input series per group and emit them unchanged, so the output
//! series universe equals the input one and sample ids pass through.

use crate::error::Result;
use crate::execution::model::StepVector;
use crate::execution::worker::StepWorker;
use crate::execution::VectorPool;
use crate::logical::AggregateOp;
use std::sync::Arc;

/// Per-slot k-selection table.
pub struct KTable {
    k: usize,
    bottom: bool,
    timestamp: i64,
    input_to_group: Arc<Vec<u64>>,
    // One candidate list per group; cleared each step.
    groups: Vec<Vec<(u64, f64)>>,
    input_pool: Arc<VectorPool>,
    output_pool: Arc<VectorPool>,
}

impl KTable {
    /// Build a table selecting `k` entries per group.
    pub fn new(
        op: AggregateOp,
        k: usize,
        input_to_group: Arc<Vec<u64>>,
        num_groups: usize,
        input_pool: Arc<VectorPool>,
        output_pool: Arc<VectorPool>,
    ) -> Result<Self> {
        debug_assert!(matches!(op, AggregateOp::Topk | AggregateOp::Bottomk));
        Ok(Self {
            k,
            bottom: op == AggregateOp::Bottomk,
            timestamp: 0,
            input_to_group,
            groups: vec![Vec::new(); num_groups],
            input_pool,
            output_pool,
        })
    }
}

impl StepWorker for KTable {
    fn process(&mut self, vector: StepVector, _param: f64) -> StepVector {
        self.timestamp = vector.t;
        for group in &mut self.groups {
            group.clear();
        }
        for (&id, &sample) in vector.sample_ids.iter().zip(&vector.samples) {
            let group = self.input_to_group[id as usize] as usize;
            self.groups[group].push((id, sample));
        }
        self.input_pool.put_step_vector(vector);

        let mut out = self.output_pool.get_step_vector(self.timestamp);
        if self.k == 0 {
            return out;
        }
        let mut selected: Vec<(u64, f64)> = Vec::new();
        for group in &mut self.groups {
            if self.bottom {
                group.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            } else {
                group.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            }
            selected.extend(group.iter().take(self.k));
        }
        // Sample ids must come out in ordinal order regardless of rank.
        selected.sort_by_key(|&(id, _)| id);
        for (id, sample) in selected {
            out.push(id, sample);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(samples: &[f64]) -> StepVector {
        StepVector {
            t: 0,
            sample_ids: (0..samples.len() as u64).collect(),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_topk_selects_largest_with_input_ids() {
        let mut table = KTable::new(
            AggregateOp::Topk,
            2,
            Arc::new(vec![0, 0, 0, 0]),
            1,
            Arc::new(VectorPool::new()),
            Arc::new(VectorPool::new()),
        )
        .unwrap();
        let out = table.process(step(&[5.0, 9.0, 1.0, 7.0]), f64::NAN);
        assert_eq!(out.sample_ids, vec![1, 3]);
        assert_eq!(out.samples, vec![9.0, 7.0]);
    }

    #[test]
    fn test_bottomk_selects_smallest() {
        let mut table = KTable::new(
            AggregateOp::Bottomk,
            1,
            Arc::new(vec![0, 0, 0]),
            1,
            Arc::new(VectorPool::new()),
            Arc::new(VectorPool::new()),
        )
        .unwrap();
        let out = table.process(step(&[5.0, 2.0, 8.0]), f64::NAN);
        assert_eq!(out.sample_ids, vec![1]);
        assert_eq!(out.samples, vec![2.0]);
    }

    #[test]
    fn test_per_group_selection() {
        // Two groups: inputs {0,1} and {2,3}; k=1 picks the max of each.
        let mut table = KTable::new(
            AggregateOp::Topk,
            1,
            Arc::new(vec![0, 0, 1, 1]),
            2,
            Arc::new(VectorPool::new()),
            Arc::new(VectorPool::new()),
        )
        .unwrap();
        let out = table.process(step(&[1.0, 4.0, 9.0, 3.0]), f64::NAN);
        assert_eq!(out.sample_ids, vec![1, 2]);
        assert_eq!(out.samples, vec![4.0, 9.0]);
    }

    #[test]
    fn test_k_zero_yields_empty_steps() {
        let mut table = KTable::new(
            AggregateOp::Topk,
            0,
            Arc::new(vec![0]),
            1,
            Arc::new(VectorPool::new()),
            Arc::new(VectorPool::new()),
        )
        .unwrap();
        let out = table.process(step(&[1.0]), f64::NAN);
        assert!(out.is_empty());
    }
}
