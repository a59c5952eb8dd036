//! Error types for the engine
//!
//! A single [`EngineError`] covers the whole query lifecycle: parsing,
//! planning, execution and storage access. Plan-time errors additionally
//! carry a fallback-eligibility signal so an embedding layer can route the
//! query to a reference engine instead (see [`EngineError::is_fallback_eligible`]).

use thiserror::Error;

/// Main error type for query construction and execution
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed query string; the parser message is surfaced verbatim
    #[error("parse error: {0}")]
    Parse(String),

    /// Unsupported result type for the query kind
    #[error("invalid expression type {actual:?} for {query_kind} query, must be {expected}")]
    InvalidType {
        /// Static type of the parsed expression
        actual: String,
        /// "range" or "instant"
        query_kind: &'static str,
        /// Human-readable list of accepted types
        expected: &'static str,
    },

    /// Valid expression the engine cannot plan (e.g. unknown aggregation).
    /// Eligible for fallback to a reference engine.
    #[error("not supported: {0}")]
    NotSupportedExpr(String),

    /// Recognised expression the engine explicitly does not implement yet.
    /// Eligible for fallback to a reference engine.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Propagated from the storage layer; not recovered
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Programmer error caught at the `exec` boundary
    #[error("unexpected error: {0}")]
    Runtime(String),

    /// The query context was cancelled
    #[error("query was canceled")]
    Canceled,

    /// An operator observed input violating the execution protocol
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Vector matching found conflicting series pairs at a step
    #[error("found duplicate series for the match group {0}")]
    DuplicateMatch(String),
}

impl EngineError {
    /// Whether a reference engine may be asked to take over this query.
    ///
    /// Only plan-construction failures qualify; mid-execution errors never do.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            EngineError::NotSupportedExpr(_) | EngineError::NotImplemented(_)
        )
    }
}

/// Errors surfaced by `Queryable`/`Querier`/`SeriesSet` implementations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Opening a querier for the requested time range failed
    #[error("querier error: {0}")]
    Querier(String),

    /// Enumerating or reading series failed
    #[error("series set error: {0}")]
    SeriesSet(String),

    /// Reading samples from a series iterator failed
    #[error("iterator error: {0}")]
    Iterator(String),
}

/// Result type alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;
