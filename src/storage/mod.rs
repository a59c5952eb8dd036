//! Storage access contract
//!
//! The engine reads time series through a minimal trait surface modeled on
//! the classic `Queryable → Querier → SeriesSet → Series → iterator` chain.
//! Implementations decide how samples are stored; the engine only requires:
//!
//! - series enumeration filtered by label matchers over a time range,
//! - per-series forward iteration with seek,
//! - strictly increasing timestamps within a series.
//!
//! [`SelectHints`] lets the engine describe the read (step, calling function,
//! grouping) so a store can push work down; results must stay correct when
//! the hints are ignored.

pub mod memory;

pub use memory::MemStorage;

use crate::error::{Result, StorageError};
use crate::types::Labels;
use promql_parser::label::Matcher;
use std::sync::Arc;

/// Hints describing the read issued by the planner.
///
/// `func`, `grouping` and `by` are advisory push-down information; `range`
/// is the selector's window in milliseconds (zero for instant selectors).
#[derive(Debug, Clone, Default)]
pub struct SelectHints {
    /// Start of the read, milliseconds
    pub start: i64,
    /// End of the read, milliseconds
    pub end: i64,
    /// Query resolution step, milliseconds
    pub step: i64,
    /// Name of the surrounding call, e.g. `rate`, if any
    pub func: String,
    /// Aggregation grouping labels, if the read feeds an aggregation
    pub grouping: Vec<String>,
    /// Whether `grouping` is `by` (true) or `without` (false)
    pub by: bool,
    /// Range-selector window, milliseconds
    pub range: i64,
}

/// A handle that can open queriers over arbitrary time ranges.
pub trait Queryable: Send + Sync {
    /// Open a querier for the half-open sample range `[mint, maxt]`.
    fn querier(&self, mint: i64, maxt: i64) -> Result<Box<dyn Querier>>;
}

/// A bounded read session against the store.
pub trait Querier {
    /// Enumerate series matching all `matchers`.
    ///
    /// When `sorted` is set the series come back ordered by label set.
    fn select(
        &self,
        sorted: bool,
        hints: &SelectHints,
        matchers: &[Matcher],
    ) -> Result<Box<dyn SeriesSet>>;
}

/// Cursor over the series returned by one `select`.
pub trait SeriesSet {
    /// Advance to the next series; false when exhausted.
    fn next(&mut self) -> bool;
    /// The series at the current position. Only valid after `next() == true`.
    fn at(&self) -> Arc<dyn Series>;
    /// Deferred enumeration error, checked after exhaustion.
    fn err(&self) -> Option<StorageError>;
}

/// A single labeled sample stream.
pub trait Series: Send + Sync {
    /// The identity of this series.
    fn labels(&self) -> Labels;
    /// A fresh iterator positioned before the first sample.
    fn iterator(&self) -> Box<dyn SampleIterator>;
}

/// Forward iterator over `(timestamp_ms, value)` samples.
pub trait SampleIterator: Send {
    /// Position at the first sample with timestamp `>= t`; false when none.
    fn seek(&mut self, t: i64) -> bool;
    /// The sample at the current position.
    fn at(&self) -> (i64, f64);
    /// Advance one sample; false when exhausted.
    fn next(&mut self) -> bool;
    /// Deferred read error, checked after exhaustion.
    fn err(&self) -> Option<StorageError>;
}
