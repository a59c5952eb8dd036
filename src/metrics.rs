//! Engine metrics
//!
//! The engine exposes one counter, `promql_engine_queries_total`, labeled by
//! whether the query had to be handed to a fallback engine. The registry is
//! injected through the engine options; without one the counter still counts
//! but is not exported anywhere.

use prometheus::{CounterVec, Opts, Registry};

/// Counters owned by one engine instance.
#[derive(Clone)]
pub struct EngineMetrics {
    queries: CounterVec,
}

impl EngineMetrics {
    /// Create the metric set, registering with `reg` when provided.
    pub fn new(reg: Option<&Registry>) -> Self {
        let queries = CounterVec::new(
            Opts::new("promql_engine_queries_total", "Number of PromQL queries."),
            &["fallback"],
        )
        .expect("valid metric definition");
        if let Some(reg) = reg {
            // Double registration of the same engine metrics is harmless for
            // the engine itself; keep the first registration.
            let _ = reg.register(Box::new(queries.clone()));
        }
        Self { queries }
    }

    /// Count one query; `fallback` marks queries handed to a reference engine.
    pub fn observe_query(&self, fallback: bool) {
        let label = if fallback { "true" } else { "false" };
        self.queries.with_label_values(&[label]).inc();
    }

    /// Current value of the counter for the given label, used by tests.
    pub fn query_count(&self, fallback: bool) -> f64 {
        let label = if fallback { "true" } else { "false" };
        self.queries.with_label_values(&[label]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_fallback_label() {
        let metrics = EngineMetrics::new(None);
        metrics.observe_query(false);
        metrics.observe_query(false);
        metrics.observe_query(true);
        assert_eq!(metrics.query_count(false), 2.0);
        assert_eq!(metrics.query_count(true), 1.0);
    }

    #[test]
    fn test_registers_with_injected_registry() {
        let registry = Registry::new();
        let metrics = EngineMetrics::new(Some(&registry));
        metrics.observe_query(false);
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "promql_engine_queries_total"));
    }
}
