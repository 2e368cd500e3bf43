use std::collections::{BTreeSet, HashMap};

use abacus_core::{ComputedValue, ValueId};
use abacus_graph::TaskGraph;
use abacus_jobs::ValueCache;
use tracing::debug;

use crate::view::CalculationConfiguration;

/// Source of market-data values, queryable by a set of requirements.
///
/// Implementations typically wrap a live data feed or a stored snapshot;
/// values absent from the returned map are recorded in the computation
/// caches as missing data.
pub trait MarketDataProvider: Send + Sync {
    fn snapshot(&self, requirements: &BTreeSet<ValueId>) -> HashMap<ValueId, serde_json::Value>;
}

/// Per-configuration market-data override, applied while populating a
/// cycle's caches (e.g. a parallel shift of all quotes for a stressed
/// configuration).
pub trait MarketDataShift: Send + Sync {
    fn apply(&self, id: &ValueId, value: serde_json::Value) -> serde_json::Value;
}

/// Fixed in-memory market data.
#[derive(Debug, Default)]
pub struct StaticMarketData {
    values: HashMap<ValueId, serde_json::Value>,
}

impl StaticMarketData {
    pub fn new(values: HashMap<ValueId, serde_json::Value>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, id: ValueId, value: serde_json::Value) {
        self.values.insert(id, value);
    }
}

impl MarketDataProvider for StaticMarketData {
    fn snapshot(&self, requirements: &BTreeSet<ValueId>) -> HashMap<ValueId, serde_json::Value> {
        requirements
            .iter()
            .filter_map(|id| self.values.get(id).map(|v| (id.clone(), v.clone())))
            .collect()
    }
}

/// Populate one configuration's cache with the market data its graph
/// requires: the provider snapshot is taken over the graph's external
/// inputs, the configuration's shift (if any) is applied per value, and
/// absent values are recorded as the missing-data sentinel.
pub(crate) fn populate_market_data(
    provider: &dyn MarketDataProvider,
    config: &CalculationConfiguration,
    graph: &TaskGraph,
    cache: &dyn ValueCache,
) {
    let requirements = graph.external_inputs();
    let snapshot = provider.snapshot(&requirements);
    for requirement in requirements {
        match snapshot.get(&requirement) {
            Some(value) => {
                let value = match &config.shift {
                    Some(shift) => shift.apply(&requirement, value.clone()),
                    None => value.clone(),
                };
                cache.put(requirement, ComputedValue::Value(value));
            }
            None => {
                debug!(value = %requirement, "market data missing, recording sentinel");
                cache.put(requirement, ComputedValue::MissingData);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_applies_shift_and_records_missing() {
        use abacus_core::{ComputeTarget, TargetKind};
        use abacus_jobs::InMemoryValueCache;

        struct Bump;
        impl MarketDataShift for Bump {
            fn apply(&self, _id: &ValueId, value: serde_json::Value) -> serde_json::Value {
                serde_json::json!(value.as_f64().unwrap_or(0.0) + 1.0)
            }
        }

        let mut builder = TaskGraph::builder("g");
        builder
            .add_task(
                "f",
                ComputeTarget::new("X", TargetKind::Primitive),
                vec![],
                [ValueId::new("X", "Quote"), ValueId::new("Y", "Quote")].into(),
                [ValueId::new("X", "Out")].into(),
                Default::default(),
            )
            .unwrap();
        let graph = builder.build();

        let mut data = StaticMarketData::default();
        data.set(ValueId::new("X", "Quote"), serde_json::json!(10.0));

        let config = CalculationConfiguration::new("Shifted")
            .with_shift(std::sync::Arc::new(Bump));
        let cache = InMemoryValueCache::new();
        populate_market_data(&data, &config, &graph, &cache);

        assert_eq!(
            cache.get(&ValueId::new("X", "Quote")),
            Some(ComputedValue::Value(serde_json::json!(11.0)))
        );
        assert_eq!(
            cache.get(&ValueId::new("Y", "Quote")),
            Some(ComputedValue::MissingData)
        );
    }

    #[test]
    fn snapshot_filters_to_requirements() {
        let mut data = StaticMarketData::default();
        data.set(ValueId::new("USD", "Quote"), serde_json::json!(1.0));
        data.set(ValueId::new("EUR", "Quote"), serde_json::json!(1.1));

        let requirements: BTreeSet<ValueId> =
            [ValueId::new("USD", "Quote"), ValueId::new("JPY", "Quote")].into();
        let snapshot = data.snapshot(&requirements);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get(&ValueId::new("USD", "Quote")),
            Some(&serde_json::json!(1.0))
        );
    }
}
