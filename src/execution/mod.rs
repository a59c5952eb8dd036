//! Vectorized execution pipeline
//!
//! This module provides the streaming operators the engine composes into a
//! query plan:
//! - Selector operators reading from storage (instant, range, literal)
//! - Aggregations with per-step parallel workers
//! - Scalar and vector binary operations
//! - Step-invariant caching and subquery evaluation
//!
//! # Architecture
//!
//! The pipeline follows a pull-based volcano model over step batches:
//!
//! ```text
//! ┌──────────────────┐
//! │   Engine facade  │  ← collects step vectors, shapes the result
//! └────────┬─────────┘
//!          │ next()
//! ┌────────▼─────────┐
//! │  HashAggregate   │  ← per-step parallel workers
//! └────────┬─────────┘
//!          │ next()
//! ┌────────▼─────────┐
//! │     Coalesce     │  ← merges selector shards
//! └────────┬─────────┘
//!          │ next()
//! ┌────────▼─────────┐
//! │  VectorSelector  │  ← decodes samples per evaluation step
//! └──────────────────┘
//! ```
//!
//! Every operator owns a [`VectorPool`]; batches move downstream on loan and
//! are returned to their producer once consumed.

pub mod aggregate;
pub mod binary;
pub mod builder;
pub mod coalesce;
pub mod function;
pub mod matrix_selector;
pub mod model;
pub mod number_selector;
pub mod numeric;
pub mod pool;
pub mod selector;
pub mod step_invariant;
pub mod subquery;
pub mod vector_selector;
pub mod worker;

pub use builder::{build, Options};
pub use model::{ExecutionContext, StepBatch, StepVector, VectorOperator, STEPS_BATCH};
pub use pool::VectorPool;
pub use selector::{SelectorPool, SeriesSelector, SignedSeries};
