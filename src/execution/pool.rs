//! Reusable buffers for step vectors and batches
//!
//! Each operator owns one [`VectorPool`]; consumers return borrowed step
//! vectors and batches to the producer's pool once processed, which bounds
//! per-step allocation over the query lifetime. Free lists keep capacity but
//! are truncated to length zero, and are capped so a cardinality spike does
//! not pin memory for the rest of the query.

use crate::execution::model::{StepBatch, StepVector, STEPS_BATCH};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

// Free-list soft caps: buffers returned beyond these are dropped.
const MAX_POOLED_VECTORS: usize = 4 * STEPS_BATCH;
const MAX_POOLED_BATCHES: usize = 4;

/// Pool of step vectors and batch vectors for a single operator.
#[derive(Debug, Default)]
pub struct VectorPool {
    vectors: Mutex<Vec<StepVector>>,
    batches: Mutex<Vec<StepBatch>>,
    step_size: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl VectorPool {
    /// New pool with a zero series-count hint.
    pub fn new() -> Self {
        Self::default()
    }

    /// New pool hinted with the operator's output series count.
    pub fn with_step_size(step_size: usize) -> Self {
        let pool = Self::default();
        pool.set_step_size(step_size);
        pool
    }

    /// Set the per-vector capacity hint. Called by operators once they know
    /// their output cardinality (e.g. aggregations after grouping).
    pub fn set_step_size(&self, n: usize) {
        self.step_size.store(n, Ordering::Relaxed);
    }

    /// A step vector initialised with timestamp `t` and empty sample slices.
    pub fn get_step_vector(&self, t: i64) -> StepVector {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let mut v = self.vectors.lock().pop().unwrap_or_else(|| {
            let cap = self.step_size.load(Ordering::Relaxed);
            StepVector {
                t: 0,
                sample_ids: Vec::with_capacity(cap),
                samples: Vec::with_capacity(cap),
            }
        });
        v.t = t;
        v
    }

    /// An empty batch with room for one full step batch.
    pub fn get_vector_batch(&self) -> StepBatch {
        self.batches
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(STEPS_BATCH))
    }

    /// Return a borrowed step vector. The buffer must not be read afterwards.
    pub fn put_step_vector(&self, mut v: StepVector) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        v.sample_ids.clear();
        v.samples.clear();
        let mut vectors = self.vectors.lock();
        if vectors.len() < MAX_POOLED_VECTORS {
            vectors.push(v);
        }
    }

    /// Return a borrowed batch, releasing any step vectors left inside it.
    pub fn put_vectors(&self, mut batch: StepBatch) {
        for v in batch.drain(..) {
            self.put_step_vector(v);
        }
        let mut batches = self.batches.lock();
        if batches.len() < MAX_POOLED_BATCHES {
            batches.push(batch);
        }
    }

    /// Step vectors currently on loan (gets minus puts). Used by tests to
    /// verify pool discipline at the end of a query.
    pub fn outstanding(&self) -> isize {
        self.gets.load(Ordering::Relaxed) as isize - self.puts.load(Ordering::Relaxed) as isize
    }
}
