//! Core data types shared across the engine
//!
//! This module defines the fundamental data structures used across the system:
//!
//! # Key Types
//!
//! - **`Label` / `Labels`**: an ordered, de-duplicated label set identifying a series
//! - **`Point`**: a single `(timestamp_ms, value)` evaluation result
//! - **`VectorSample`**: one labeled point of an instant-vector result
//! - **`SeriesResult`**: one labeled point stream of a matrix result
//! - **`QueryValue`**: the shaped result of a query (scalar, vector or matrix)
//!
//! # Example
//!
//! ```rust
//! use promql_stream::types::Labels;
//!
//! let labels = Labels::from_pairs([("__name__", "up"), ("job", "api")]);
//! assert_eq!(labels.get("job"), Some("api"));
//! assert_eq!(labels.to_string(), r#"up{job="api"}"#);
//! ```

use fxhash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

/// The reserved label holding the metric name.
pub const METRIC_NAME: &str = "__name__";

/// A single `name=value` label pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Label value
    pub value: String,
}

impl Label {
    /// Create a label pair
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered, de-duplicated label set.
///
/// Labels are kept sorted by name; a later value for a duplicate name wins.
/// Equality, ordering and [`Labels::signature`] are defined over the sorted
/// sequence, which makes the signature a stable series identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// The empty label set.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a label set from raw pairs, sorting and de-duplicating by name.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = pairs
            .into_iter()
            .map(|(n, v)| Label::new(n, v))
            .collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|later, earlier| {
            if later.name == earlier.name {
                // Keep the later entry's value.
                earlier.value = std::mem::take(&mut later.value);
                true
            } else {
                false
            }
        });
        Self(labels)
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Look up a label value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// The metric name (`__name__` label), if present.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    /// A copy of this set without the `__name__` label.
    pub fn without_metric_name(&self) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| l.name != METRIC_NAME)
                .cloned()
                .collect(),
        )
    }

    /// Stable hash over the full ordered pair sequence.
    pub fn signature(&self) -> u64 {
        let mut h = FxHasher::default();
        for l in &self.0 {
            write_label(&mut h, l);
        }
        h.finish()
    }

    /// Hash and materialize the label subset retained by an aggregation.
    ///
    /// With `keep == true` only names in `names` survive; otherwise names in
    /// `names` are dropped, along with `__name__`. `names` must be sorted.
    pub fn signature_for_grouping(&self, keep: bool, names: &[String]) -> (u64, Labels) {
        let mut h = FxHasher::default();
        let mut retained = Vec::new();
        for l in &self.0 {
            let listed = names.binary_search_by(|n| n.as_str().cmp(&l.name)).is_ok();
            let retain = if keep {
                listed
            } else {
                !listed && l.name != METRIC_NAME
            };
            if retain {
                write_label(&mut h, l);
                retained.push(l.clone());
            }
        }
        (h.finish(), Labels(retained))
    }
}

fn write_label(h: &mut FxHasher, l: &Label) {
    h.write(l.name.as_bytes());
    h.write_u8(0xff);
    h.write(l.value.as_bytes());
    h.write_u8(0xff);
}

impl PartialOrd for Labels {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Labels {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.metric_name() {
            write!(f, "{}", name)?;
        }
        write!(f, "{{")?;
        let mut first = true;
        for l in self.0.iter().filter(|l| l.name != METRIC_NAME) {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", l.name, l.value)?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// One evaluated point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Timestamp in milliseconds since the Unix epoch
    pub t: i64,
    /// Sample value
    pub v: f64,
}

/// One sample of an instant-vector result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSample {
    /// Series identity
    pub metric: Labels,
    /// The sample at the evaluation timestamp
    pub point: Point,
}

/// One series of a matrix result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResult {
    /// Series identity
    pub metric: Labels,
    /// Points in strictly increasing timestamp order
    pub points: Vec<Point>,
}

/// The shaped value of a finished query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryValue {
    /// A single number with the evaluation timestamp
    Scalar(Point),
    /// One point per series at the evaluation timestamp
    Vector(Vec<VectorSample>),
    /// A point stream per series over the query range
    Matrix(Vec<SeriesResult>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduped() {
        let labels = Labels::from_pairs([("b", "2"), ("a", "1"), ("b", "3")]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("a"), Some("1"));
        assert_eq!(labels.get("b"), Some("3"));
    }

    #[test]
    fn test_signature_is_order_independent() {
        let a = Labels::from_pairs([("x", "1"), ("y", "2")]);
        let b = Labels::from_pairs([("y", "2"), ("x", "1")]);
        assert_eq!(a.signature(), b.signature());
        let c = Labels::from_pairs([("x", "1"), ("y", "3")]);
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_grouping_by_keeps_listed_names() {
        let labels = Labels::from_pairs([("__name__", "m"), ("pod", "p0"), ("container", "c0")]);
        let names = vec!["pod".to_string()];
        let (_, retained) = labels.signature_for_grouping(true, &names);
        assert_eq!(retained, Labels::from_pairs([("pod", "p0")]));
    }

    #[test]
    fn test_grouping_without_drops_listed_and_name() {
        let labels = Labels::from_pairs([("__name__", "m"), ("pod", "p0"), ("container", "c0")]);
        let names = vec!["container".to_string()];
        let (_, retained) = labels.signature_for_grouping(false, &names);
        assert_eq!(retained, Labels::from_pairs([("pod", "p0")]));
    }

    #[test]
    fn test_display_notation() {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", "api"), ("az", "eu")]);
        assert_eq!(labels.to_string(), r#"up{az="eu", job="api"}"#);
    }
}
