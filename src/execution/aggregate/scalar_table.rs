//! Hash-grouping aggregation table
//!
//! The general aggregation strategy: input series are mapped to output
//! groups ahead of time (`input_to_output`), and each step folds samples into
//! one accumulator per group. One table exists per step-batch slot so the
//! batch's steps aggregate in parallel on independent state.

use super::accumulator::Accumulator;
use crate::error::Result;
use crate::execution::model::StepVector;
use crate::execution::worker::StepWorker;
use crate::execution::VectorPool;
use crate::logical::AggregateOp;
use std::sync::Arc;

/// Per-slot grouping table.
pub struct ScalarTable {
    timestamp: i64,
    input_to_output: Arc<Vec<u64>>,
    accumulators: Vec<Accumulator>,
    // Pools are shared with the owning operator; the input pool returns the
    // child's step vectors once folded, the output pool sources results.
    input_pool: Arc<VectorPool>,
    output_pool: Arc<VectorPool>,
}

impl ScalarTable {
    /// Build a table with one accumulator per output group.
    pub fn new(
        op: AggregateOp,
        input_to_output: Arc<Vec<u64>>,
        num_outputs: usize,
        input_pool: Arc<VectorPool>,
        output_pool: Arc<VectorPool>,
    ) -> Result<Self> {
        let template = Accumulator::new(op)?;
        Ok(Self {
            timestamp: 0,
            input_to_output,
            accumulators: vec![template; num_outputs],
            input_pool,
            output_pool,
        })
    }

    fn aggregate(&mut self, vector: &StepVector, param: f64) {
        self.timestamp = vector.t;
        for acc in &mut self.accumulators {
            acc.reset(param);
        }
        for (&id, &sample) in vector.sample_ids.iter().zip(&vector.samples) {
            let output = self.input_to_output[id as usize];
            self.accumulators[output as usize].add(sample);
        }
    }

    fn to_vector(&self) -> StepVector {
        let mut out = self.output_pool.get_step_vector(self.timestamp);
        for (i, acc) in self.accumulators.iter().enumerate() {
            let (value, defined) = acc.value();
            if defined {
                out.push(i as u64, value);
            }
        }
        out
    }
}

impl StepWorker for ScalarTable {
    fn process(&mut self, vector: StepVector, param: f64) -> StepVector {
        self.aggregate(&vector, param);
        self.input_pool.put_step_vector(vector);
        self.to_vector()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(op: AggregateOp, mapping: Vec<u64>, outputs: usize) -> ScalarTable {
        ScalarTable::new(
            op,
            Arc::new(mapping),
            outputs,
            Arc::new(VectorPool::new()),
            Arc::new(VectorPool::new()),
        )
        .unwrap()
    }

    fn step(t: i64, samples: &[f64]) -> StepVector {
        StepVector {
            t,
            sample_ids: (0..samples.len() as u64).collect(),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_groups_fold_independently() {
        // Inputs 0,1 -> group 0; inputs 2,3 -> group 1.
        let mut t = table(AggregateOp::Sum, vec![0, 0, 1, 1], 2);
        let out = t.process(step(1000, &[1.0, 2.0, 10.0, 20.0]), f64::NAN);
        assert_eq!(out.t, 1000);
        assert_eq!(out.sample_ids, vec![0, 1]);
        assert_eq!(out.samples, vec![3.0, 30.0]);
    }

    #[test]
    fn test_empty_groups_omitted() {
        let mut t = table(AggregateOp::Min, vec![0, 1], 2);
        // Only input 1 has a sample this step.
        let vector = StepVector {
            t: 0,
            sample_ids: vec![1],
            samples: vec![4.0],
        };
        let out = t.process(vector, f64::NAN);
        assert_eq!(out.sample_ids, vec![1]);
        assert_eq!(out.samples, vec![4.0]);
    }

    #[test]
    fn test_state_resets_between_steps() {
        let mut t = table(AggregateOp::Count, vec![0, 0], 1);
        let first = t.process(step(0, &[1.0, 1.0]), f64::NAN);
        assert_eq!(first.samples, vec![2.0]);
        let second = t.process(step(30_000, &[1.0, 1.0]), f64::NAN);
        assert_eq!(second.samples, vec![2.0]);
    }

    #[test]
    fn test_quantile_uses_step_param() {
        let mut t = table(AggregateOp::Quantile, vec![0, 0, 0, 0], 1);
        let out = t.process(step(0, &[1.0, 2.0, 3.0, 4.0]), 0.0);
        assert_eq!(out.samples, vec![1.0]);
        let out = t.process(step(30_000, &[1.0, 2.0, 3.0, 4.0]), 1.0);
        assert_eq!(out.samples, vec![4.0]);
    }

    #[test]
    fn test_input_vector_returned_to_pool() {
        let input_pool = Arc::new(VectorPool::new());
        let mut t = ScalarTable::new(
            AggregateOp::Sum,
            Arc::new(vec![0]),
            1,
            Arc::clone(&input_pool),
            Arc::new(VectorPool::new()),
        )
        .unwrap();
        let v = input_pool.get_step_vector(0);
        t.process(v, f64::NAN);
        assert_eq!(input_pool.outstanding(), 0);
    }
}
