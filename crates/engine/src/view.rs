use std::sync::Arc;
use std::time::Duration;

use crate::input::MarketDataShift;

/// Which computed values a configuration publishes into the result
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultModel {
    /// Only the task graph's terminal outputs.
    TerminalOnly,
    /// Every value any task produces.
    All,
}

/// One named way of calculating the view — e.g. a base configuration and a
/// stressed configuration sharing the same task graph shape.
#[derive(Clone)]
pub struct CalculationConfiguration {
    pub name: String,
    /// Optional market-data override applied while populating this
    /// configuration's cache.
    pub shift: Option<Arc<dyn MarketDataShift>>,
    pub result_model: ResultModel,
}

impl CalculationConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shift: None,
            result_model: ResultModel::TerminalOnly,
        }
    }

    pub fn with_shift(mut self, shift: Arc<dyn MarketDataShift>) -> Self {
        self.shift = Some(shift);
        self
    }

    pub fn with_result_model(mut self, model: ResultModel) -> Self {
        self.result_model = model;
        self
    }
}

impl std::fmt::Debug for CalculationConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationConfiguration")
            .field("name", &self.name)
            .field("shifted", &self.shift.is_some())
            .field("result_model", &self.result_model)
            .finish()
    }
}

/// Definition of a computed view: its calculation configurations and the
/// recalculation timing constraints the scheduler honors.
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub configurations: Vec<CalculationConfiguration>,
    /// Earliest a delta recomputation may run after the previous cycle.
    pub min_delta_period: Duration,
    /// Latest a delta recomputation must run after the previous cycle.
    pub max_delta_period: Duration,
    /// Earliest a full recomputation may run after the previous full cycle.
    pub min_full_period: Duration,
    /// Latest a full recomputation must run after the previous full cycle.
    pub max_full_period: Duration,
    /// Force a full cycle after this many deltas in a row.
    pub max_successive_deltas: usize,
    /// Recompute continuously, ignoring the delta eligibility window.
    pub run_as_fast_as_possible: bool,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, configurations: Vec<CalculationConfiguration>) -> Self {
        Self {
            name: name.into(),
            configurations,
            min_delta_period: Duration::from_secs(1),
            max_delta_period: Duration::from_secs(30),
            min_full_period: Duration::from_secs(60),
            max_full_period: Duration::from_secs(600),
            max_successive_deltas: 100,
            run_as_fast_as_possible: false,
        }
    }

    pub fn configuration(&self, name: &str) -> Option<&CalculationConfiguration> {
        self.configurations.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let view = ViewDefinition::new(
            "risk",
            vec![
                CalculationConfiguration::new("Default"),
                CalculationConfiguration::new("Stressed"),
            ],
        );
        assert_eq!(view.configuration("Stressed").unwrap().name, "Stressed");
        assert!(view.configuration("Missing").is_none());
    }

    #[test]
    fn default_result_model_is_terminal() {
        let config = CalculationConfiguration::new("Default");
        assert_eq!(config.result_model, ResultModel::TerminalOnly);
    }
}
