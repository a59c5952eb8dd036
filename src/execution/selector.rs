//! Deduplicated, sharded series enumeration from storage
//!
//! The [`SelectorPool`] caches storage reads for the lifetime of one query,
//! keyed by a stable hash of the matcher set, time bounds and select hints.
//! Operators produced from different parts of the plan that issue an
//! identical read (the `MergeSelects` optimizer arranges for this) end up
//! sharing a single [`SeriesSelector`], which loads matching series exactly
//! once and hands out disjoint shard views afterwards.
//!
//! Signatures are the ordinals of series within the loaded set; sharding
//! slices the set without renumbering.

use crate::error::Result;
use crate::execution::model::ExecutionContext;
use crate::storage::{Queryable, SelectHints, Series};
use fxhash::FxHasher;
use parking_lot::Mutex;
use promql_parser::label::{MatchOp, Matcher};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

/// A series paired with its ordinal within the selector's output.
#[derive(Clone)]
pub struct SignedSeries {
    /// The underlying storage series
    pub series: Arc<dyn Series>,
    /// Ordinal within the selector's loaded set
    pub signature: u64,
}

/// Shared, lazily-loaded series enumeration.
pub trait SeriesSelector: Send + Sync {
    /// The shard `[shard*n/num_shards, (shard+1)*n/num_shards)` of the loaded
    /// series. The first caller pays for the storage read.
    fn series(
        &self,
        ctx: &ExecutionContext,
        shard: usize,
        num_shards: usize,
    ) -> Result<Vec<SignedSeries>>;

    /// One-line description for explain output.
    fn explain(&self) -> String;
}

/// Query-scoped cache of storage reads.
pub struct SelectorPool {
    queryable: Arc<dyn Queryable>,
    selectors: Mutex<HashMap<u64, Arc<StorageSeriesSelector>>>,
}

impl SelectorPool {
    /// New pool reading from `queryable`.
    pub fn new(queryable: Arc<dyn Queryable>) -> Self {
        Self {
            queryable,
            selectors: Mutex::new(HashMap::new()),
        }
    }

    /// The cached selector for this read, creating it on first use.
    pub fn selector(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
        hints: &SelectHints,
    ) -> Arc<dyn SeriesSelector> {
        self.storage_selector(mint, maxt, matchers, hints)
    }

    /// A selector applying `filters` in memory on top of the cached read.
    pub fn filtered_selector(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
        filters: &[Matcher],
        hints: &SelectHints,
    ) -> Arc<dyn SeriesSelector> {
        let base = self.storage_selector(mint, maxt, matchers, hints);
        Arc::new(FilteredSelector {
            base,
            filters: filters.to_vec(),
            loaded: Mutex::new(None),
        })
    }

    fn storage_selector(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
        hints: &SelectHints,
    ) -> Arc<StorageSeriesSelector> {
        let key = hash_matchers(matchers, mint, maxt, hints);
        let mut selectors = self.selectors.lock();
        Arc::clone(selectors.entry(key).or_insert_with(|| {
            Arc::new(StorageSeriesSelector {
                queryable: Arc::clone(&self.queryable),
                mint,
                maxt,
                matchers: matchers.to_vec(),
                hints: hints.clone(),
                loaded: Mutex::new(None),
            })
        }))
    }

    /// Number of distinct cached reads; exposed for tests.
    pub fn len(&self) -> usize {
        self.selectors.lock().len()
    }

    /// Whether no read has been issued yet.
    pub fn is_empty(&self) -> bool {
        self.selectors.lock().is_empty()
    }
}

fn matcher_op_rank(op: &MatchOp) -> u8 {
    match op {
        MatchOp::Equal => 0,
        MatchOp::NotEqual => 1,
        MatchOp::Re(_) => 2,
        MatchOp::NotRe(_) => 3,
    }
}

fn hash_matchers(matchers: &[Matcher], mint: i64, maxt: i64, hints: &SelectHints) -> u64 {
    let mut h = FxHasher::default();
    for m in matchers {
        h.write(m.name.as_bytes());
        h.write_u8(0xff);
        h.write_u8(matcher_op_rank(&m.op));
        h.write(m.value.as_bytes());
        h.write_u8(0xff);
    }
    h.write_i64(mint);
    h.write_i64(maxt);
    h.write_i64(hints.step);
    h.write(hints.func.as_bytes());
    h.write_u8(0xff);
    let mut grouping = hints.grouping.clone();
    grouping.sort();
    for g in &grouping {
        h.write(g.as_bytes());
        h.write_u8(0xff);
    }
    h.write_u8(hints.by as u8);
    h.finish()
}

/// Selector backed by one storage read.
pub struct StorageSeriesSelector {
    queryable: Arc<dyn Queryable>,
    mint: i64,
    maxt: i64,
    matchers: Vec<Matcher>,
    hints: SelectHints,
    loaded: Mutex<Option<Arc<Vec<SignedSeries>>>>,
}

impl StorageSeriesSelector {
    fn load(&self, _ctx: &ExecutionContext) -> Result<Arc<Vec<SignedSeries>>> {
        let mut loaded = self.loaded.lock();
        if let Some(series) = loaded.as_ref() {
            return Ok(Arc::clone(series));
        }
        let querier = self.queryable.querier(self.mint, self.maxt)?;
        let mut set = querier.select(false, &self.hints, &self.matchers)?;
        let mut series = Vec::new();
        while set.next() {
            let signature = series.len() as u64;
            series.push(SignedSeries {
                series: set.at(),
                signature,
            });
        }
        if let Some(err) = set.err() {
            return Err(err.into());
        }
        let series = Arc::new(series);
        *loaded = Some(Arc::clone(&series));
        Ok(series)
    }
}

impl SeriesSelector for StorageSeriesSelector {
    fn series(
        &self,
        ctx: &ExecutionContext,
        shard: usize,
        num_shards: usize,
    ) -> Result<Vec<SignedSeries>> {
        let series = self.load(ctx)?;
        Ok(series_shard(&series, shard, num_shards).to_vec())
    }

    fn explain(&self) -> String {
        format!(
            "[seriesSelector] {:?} @{}..{}",
            self.matchers
                .iter()
                .map(|m| format!("{}{}", m.name, m.value))
                .collect::<Vec<_>>(),
            self.mint,
            self.maxt
        )
    }
}

fn series_shard(series: &[SignedSeries], shard: usize, num_shards: usize) -> &[SignedSeries] {
    let start = shard * series.len() / num_shards;
    let end = (((shard + 1) * series.len()) / num_shards).min(series.len());
    &series[start..end]
}

/// Post-filter over a shared selector, applying extra matchers in memory.
///
/// The filtered view is a new series universe, so signatures are renumbered
/// over the surviving series.
pub struct FilteredSelector {
    base: Arc<StorageSeriesSelector>,
    filters: Vec<Matcher>,
    loaded: Mutex<Option<Arc<Vec<SignedSeries>>>>,
}

impl FilteredSelector {
    fn load(&self, ctx: &ExecutionContext) -> Result<Arc<Vec<SignedSeries>>> {
        let mut loaded = self.loaded.lock();
        if let Some(series) = loaded.as_ref() {
            return Ok(Arc::clone(series));
        }
        let base = self.base.load(ctx)?;
        let mut series = Vec::new();
        for s in base.iter() {
            let labels = s.series.labels();
            let matches = self
                .filters
                .iter()
                .all(|m| m.is_match(labels.get(&m.name).unwrap_or("")));
            if matches {
                let signature = series.len() as u64;
                series.push(SignedSeries {
                    series: Arc::clone(&s.series),
                    signature,
                });
            }
        }
        let series = Arc::new(series);
        *loaded = Some(Arc::clone(&series));
        Ok(series)
    }
}

impl SeriesSelector for FilteredSelector {
    fn series(
        &self,
        ctx: &ExecutionContext,
        shard: usize,
        num_shards: usize,
    ) -> Result<Vec<SignedSeries>> {
        let series = self.load(ctx)?;
        Ok(series_shard(&series, shard, num_shards).to_vec())
    }

    fn explain(&self) -> String {
        format!("[filteredSelector] {} filters over {}", self.filters.len(), self.base.explain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use crate::types::Labels;

    fn storage() -> Arc<MemStorage> {
        let mut s = MemStorage::new();
        for i in 0..10 {
            s.add_series(
                Labels::from_pairs([
                    ("__name__".to_string(), "m".to_string()),
                    ("i".to_string(), i.to_string()),
                ]),
                vec![(0, i as f64)],
            );
        }
        Arc::new(s)
    }

    fn name_matcher() -> Matcher {
        Matcher::new(MatchOp::Equal, "__name__", "m")
    }

    #[test]
    fn test_equivalent_reads_share_a_selector() {
        let pool = SelectorPool::new(storage());
        let hints = SelectHints::default();
        let a = pool.selector(0, 1000, &[name_matcher()], &hints);
        let b = pool.selector(0, 1000, &[name_matcher()], &hints);
        assert_eq!(pool.len(), 1);
        // Both handles resolve the same loaded set.
        let ctx = ExecutionContext::new();
        assert_eq!(
            a.series(&ctx, 0, 1).unwrap().len(),
            b.series(&ctx, 0, 1).unwrap().len()
        );
    }

    #[test]
    fn test_different_bounds_get_distinct_selectors() {
        let pool = SelectorPool::new(storage());
        let hints = SelectHints::default();
        pool.selector(0, 1000, &[name_matcher()], &hints);
        pool.selector(0, 2000, &[name_matcher()], &hints);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_sharding_preserves_signatures() {
        let pool = SelectorPool::new(storage());
        let selector = pool.selector(0, 1000, &[name_matcher()], &SelectHints::default());
        let ctx = ExecutionContext::new();

        let full = selector.series(&ctx, 0, 1).unwrap();
        assert_eq!(full.len(), 10);
        let first = selector.series(&ctx, 0, 2).unwrap();
        let second = selector.series(&ctx, 1, 2).unwrap();
        assert_eq!(first.len() + second.len(), 10);
        // Ordinals carry over unchanged from the full set.
        assert_eq!(first[0].signature, 0);
        assert_eq!(second[0].signature, first.len() as u64);
    }

    #[test]
    fn test_filtered_selector_renumbers() {
        let pool = SelectorPool::new(storage());
        let filters = vec![Matcher::new(MatchOp::Equal, "i", "7")];
        let selector =
            pool.filtered_selector(0, 1000, &[name_matcher()], &filters, &SelectHints::default());
        let ctx = ExecutionContext::new();
        let series = selector.series(&ctx, 0, 1).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].signature, 0);
        assert_eq!(series[0].series.labels().get("i"), Some("7"));
        // The underlying read is shared with the unfiltered selector.
        assert_eq!(pool.len(), 1);
    }
}
