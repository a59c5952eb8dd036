//! promql-stream - Vectorized, pull-based PromQL execution engine
//!
//! This library evaluates PromQL range and instant queries against any
//! storage exposing the [`storage::Queryable`] trait family:
//! - Streaming, pull-based operator pipeline over per-step vector batches
//! - Deduplicated, sharded storage reads shared across the plan
//! - Per-step parallel aggregation workers
//! - Step-invariant subexpression caching
//! - Pooled step-vector buffers keeping the hot path allocation-light
//!
//! # Example
//!
//! ```rust
//! use promql_stream::engine::{Engine, EngineOpts};
//! use promql_stream::storage::MemStorage;
//! use promql_stream::types::{Labels, QueryValue};
//! use std::sync::Arc;
//!
//! let mut storage = MemStorage::new();
//! storage.add_series(
//!     Labels::from_pairs([("__name__", "requests"), ("job", "api")]),
//!     vec![(0, 1.0), (30_000, 2.0)],
//! );
//!
//! let engine = Engine::new(EngineOpts::default());
//! let mut query = engine
//!     .new_instant_query(Arc::new(storage), "sum(requests)", 30_000)
//!     .unwrap();
//! let QueryValue::Vector(result) = query.exec().unwrap() else {
//!     panic!("expected a vector result");
//! };
//! assert_eq!(result[0].point.v, 2.0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod execution;
pub mod logical;
pub mod metrics;
pub mod types;

pub mod storage;

// Re-export main types
pub use engine::{Engine, EngineOpts, Query};
pub use error::{EngineError, Result, StorageError};
pub use types::{Labels, Point, QueryValue, SeriesResult, VectorSample};
