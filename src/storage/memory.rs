//! In-memory storage backend
//!
//! A lightweight [`Queryable`] backed by plain vectors, intended for:
//! - **Unit testing** operators without a real TSDB
//! - **Integration testing** full queries end to end
//! - **Benchmarking** the execution pipeline in isolation
//!
//! All data lives in memory and is cloned per series handle; matcher
//! evaluation happens in process on the stored label sets.
//!
//! # Example
//!
//! ```rust
//! use promql_stream::storage::MemStorage;
//! use promql_stream::types::Labels;
//!
//! let mut storage = MemStorage::new();
//! storage.add_series(
//!     Labels::from_pairs([("__name__", "up"), ("job", "api")]),
//!     vec![(0, 1.0), (30_000, 1.0)],
//! );
//! ```

use super::{Querier, Queryable, SampleIterator, Series, SeriesSet, SelectHints};
use crate::error::{Result, StorageError};
use crate::types::Labels;
use promql_parser::label::Matcher;
use std::sync::Arc;

/// In-memory `Queryable` for tests and benchmarks.
#[derive(Debug, Default)]
pub struct MemStorage {
    series: Vec<MemSeries>,
}

/// One stored series: a label set plus its samples.
#[derive(Debug, Clone)]
pub struct MemSeries {
    labels: Labels,
    samples: Vec<(i64, f64)>,
}

impl MemStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a series with pre-sorted `(timestamp_ms, value)` samples.
    pub fn add_series(&mut self, labels: Labels, samples: Vec<(i64, f64)>) {
        debug_assert!(samples.windows(2).all(|w| w[0].0 < w[1].0));
        self.series.push(MemSeries { labels, samples });
    }

    /// Number of stored series.
    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

impl Queryable for MemStorage {
    fn querier(&self, mint: i64, maxt: i64) -> Result<Box<dyn Querier>> {
        Ok(Box::new(MemQuerier {
            series: self.series.clone(),
            mint,
            maxt,
        }))
    }
}

struct MemQuerier {
    series: Vec<MemSeries>,
    mint: i64,
    maxt: i64,
}

impl Querier for MemQuerier {
    fn select(
        &self,
        sorted: bool,
        _hints: &SelectHints,
        matchers: &[Matcher],
    ) -> Result<Box<dyn SeriesSet>> {
        let mut matched: Vec<Arc<dyn Series>> = self
            .series
            .iter()
            .filter(|s| matches_all(&s.labels, matchers))
            .filter(|s| {
                // Skip series with no samples overlapping the queried range.
                s.samples
                    .iter()
                    .any(|&(t, _)| t >= self.mint && t <= self.maxt)
            })
            .map(|s| Arc::new(s.clone()) as Arc<dyn Series>)
            .collect();
        if sorted {
            matched.sort_by_key(|s| s.labels());
        }
        Ok(Box::new(MemSeriesSet {
            series: matched,
            pos: 0,
        }))
    }
}

fn matches_all(labels: &Labels, matchers: &[Matcher]) -> bool {
    matchers
        .iter()
        .all(|m| m.is_match(labels.get(&m.name).unwrap_or("")))
}

struct MemSeriesSet {
    series: Vec<Arc<dyn Series>>,
    pos: usize,
}

impl SeriesSet for MemSeriesSet {
    fn next(&mut self) -> bool {
        if self.pos < self.series.len() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at(&self) -> Arc<dyn Series> {
        Arc::clone(&self.series[self.pos - 1])
    }

    fn err(&self) -> Option<StorageError> {
        None
    }
}

impl Series for MemSeries {
    fn labels(&self) -> Labels {
        self.labels.clone()
    }

    fn iterator(&self) -> Box<dyn SampleIterator> {
        Box::new(MemIterator {
            samples: self.samples.clone(),
            pos: None,
        })
    }
}

struct MemIterator {
    samples: Vec<(i64, f64)>,
    // None before the first advance; Some(i) is the current sample index.
    pos: Option<usize>,
}

impl SampleIterator for MemIterator {
    fn seek(&mut self, t: i64) -> bool {
        let start = match self.pos {
            Some(i) => i,
            None => 0,
        };
        for i in start..self.samples.len() {
            if self.samples[i].0 >= t {
                self.pos = Some(i);
                return true;
            }
        }
        self.pos = Some(self.samples.len());
        false
    }

    fn at(&self) -> (i64, f64) {
        let i = self.pos.expect("at() before first advance");
        self.samples[i]
    }

    fn next(&mut self) -> bool {
        let next = match self.pos {
            Some(i) => i + 1,
            None => 0,
        };
        self.pos = Some(next);
        next < self.samples.len()
    }

    fn err(&self) -> Option<StorageError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promql_parser::label::{MatchOp, Matcher};

    fn store() -> MemStorage {
        let mut s = MemStorage::new();
        s.add_series(
            Labels::from_pairs([("__name__", "m"), ("i", "0")]),
            vec![(0, 0.0), (30_000, 1.0)],
        );
        s.add_series(
            Labels::from_pairs([("__name__", "m"), ("i", "1")]),
            vec![(0, 1.0)],
        );
        s.add_series(
            Labels::from_pairs([("__name__", "other")]),
            vec![(0, 9.0)],
        );
        s
    }

    fn select_all(storage: &MemStorage, matchers: &[Matcher]) -> Vec<Labels> {
        let querier = storage.querier(0, 60_000).unwrap();
        let mut set = querier
            .select(false, &SelectHints::default(), matchers)
            .unwrap();
        let mut out = Vec::new();
        while set.next() {
            out.push(set.at().labels());
        }
        out
    }

    #[test]
    fn test_select_by_name() {
        let storage = store();
        let m = Matcher::new(MatchOp::Equal, "__name__", "m");
        let got = select_all(&storage, &[m]);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_select_with_label_matcher() {
        let storage = store();
        let matchers = vec![
            Matcher::new(MatchOp::Equal, "__name__", "m"),
            Matcher::new(MatchOp::Equal, "i", "1"),
        ];
        let got = select_all(&storage, &matchers);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("i"), Some("1"));
    }

    #[test]
    fn test_iterator_seek_and_next() {
        let storage = store();
        let m = Matcher::new(MatchOp::Equal, "i", "0");
        let querier = storage.querier(0, 60_000).unwrap();
        let mut set = querier
            .select(false, &SelectHints::default(), &[m])
            .unwrap();
        assert!(set.next());
        let mut it = set.at().iterator();
        assert!(it.seek(1));
        assert_eq!(it.at(), (30_000, 1.0));
        assert!(!it.next());
    }

    #[test]
    fn test_series_outside_range_skipped() {
        let storage = store();
        let querier = storage.querier(100_000, 200_000).unwrap();
        let m = Matcher::new(MatchOp::Equal, "__name__", "m");
        let mut set = querier
            .select(false, &SelectHints::default(), &[m])
            .unwrap();
        assert!(!set.next());
    }
}
