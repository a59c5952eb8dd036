//! Long-lived worker pool for per-step parallel aggregation
//!
//! A [`WorkerGroup`] owns one OS thread per step-batch slot. Each worker has
//! a capacity-1 request channel and a capacity-1 response channel; the owning
//! operator's `next` is the single producer and single consumer for every
//! worker, so a send/receive pair forms a rendezvous. Dropping the group
//! closes the request channels; workers drain and exit, and threads are
//! joined.

use crate::error::{EngineError, Result};
use crate::execution::model::StepVector;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;

/// Work unit state owned by one worker thread.
pub trait StepWorker: Send {
    /// Process one step vector and produce the output step vector.
    ///
    /// `param` carries the step's aggregation parameter when the operator
    /// has one (e.g. the quantile); NaN otherwise.
    fn process(&mut self, vector: StepVector, param: f64) -> StepVector;
}

struct WorkerHandle {
    request: Option<SyncSender<(StepVector, f64)>>,
    response: Receiver<StepVector>,
    thread: Option<JoinHandle<()>>,
}

/// Fixed pool of long-lived step workers.
pub struct WorkerGroup {
    workers: Vec<WorkerHandle>,
}

impl WorkerGroup {
    /// Spawn one worker thread per task; each thread takes ownership of its
    /// task state for the lifetime of the group.
    pub fn start(tasks: Vec<Box<dyn StepWorker>>) -> Self {
        let workers = tasks
            .into_iter()
            .enumerate()
            .map(|(id, mut task)| {
                let (req_tx, req_rx) = sync_channel::<(StepVector, f64)>(1);
                let (resp_tx, resp_rx) = sync_channel::<StepVector>(1);
                let thread = std::thread::Builder::new()
                    .name(format!("step-worker-{id}"))
                    .spawn(move || {
                        while let Ok((vector, param)) = req_rx.recv() {
                            let out = task.process(vector, param);
                            if resp_tx.send(out).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("spawning step worker thread");
                WorkerHandle {
                    request: Some(req_tx),
                    response: resp_rx,
                    thread: Some(thread),
                }
            })
            .collect();
        Self { workers }
    }

    /// Number of workers in the group.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the group holds no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Hand a step vector to worker `i`. Does not block: the request channel
    /// holds exactly the one in-flight item per worker.
    pub fn send(&self, i: usize, vector: StepVector, param: f64) -> Result<()> {
        let sender = self.workers[i]
            .request
            .as_ref()
            .ok_or_else(|| EngineError::Runtime("worker group already shut down".into()))?;
        sender
            .send((vector, param))
            .map_err(|_| EngineError::Runtime("aggregation worker terminated".into()))
    }

    /// Block until worker `i` finishes its in-flight step.
    pub fn output(&self, i: usize) -> Result<StepVector> {
        self.workers[i]
            .response
            .recv()
            .map_err(|_| EngineError::Runtime("aggregation worker terminated".into()))
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        for w in &mut self.workers {
            // Closing the request channel lets the worker loop exit.
            w.request.take();
        }
        for w in &mut self.workers {
            if let Some(thread) = w.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl StepWorker for Doubler {
        fn process(&mut self, mut vector: StepVector, _param: f64) -> StepVector {
            for s in vector.samples.iter_mut() {
                *s *= 2.0;
            }
            vector
        }
    }

    fn vector(t: i64, samples: &[f64]) -> StepVector {
        StepVector {
            t,
            sample_ids: (0..samples.len() as u64).collect(),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_send_output_roundtrip() {
        let group = WorkerGroup::start(vec![Box::new(Doubler), Box::new(Doubler)]);
        group.send(0, vector(0, &[1.0, 2.0]), f64::NAN).unwrap();
        group.send(1, vector(30_000, &[3.0]), f64::NAN).unwrap();
        let a = group.output(0).unwrap();
        let b = group.output(1).unwrap();
        assert_eq!(a.samples, vec![2.0, 4.0]);
        assert_eq!(b.samples, vec![6.0]);
    }

    #[test]
    fn test_workers_survive_many_rounds() {
        let group = WorkerGroup::start(vec![Box::new(Doubler)]);
        for round in 0..100 {
            group.send(0, vector(round, &[1.0]), f64::NAN).unwrap();
            assert_eq!(group.output(0).unwrap().samples, vec![2.0]);
        }
    }

    #[test]
    fn test_drop_joins_threads() {
        let group = WorkerGroup::start(vec![Box::new(Doubler), Box::new(Doubler)]);
        drop(group);
        // Nothing to assert beyond not hanging.
    }
}
