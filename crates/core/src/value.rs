use serde::{Deserialize, Serialize};

/// Identifier of a single computed output: a named value on a target entity.
///
/// Value identifiers are the currency of the whole engine — task inputs and
/// outputs, cache keys, cache-partition hints, and result snapshots are all
/// expressed in terms of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId {
    /// Id of the target entity the value belongs to.
    pub target: String,
    /// Name of the value (e.g. "PresentValue", "Delta").
    pub name: String,
}

impl ValueId {
    pub fn new(target: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.target)
    }
}

/// A value held in a computation cache or result snapshot.
///
/// The engine never interprets value payloads; they are opaque JSON carried
/// from market data and calculation workers through to results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComputedValue {
    /// A successfully produced value.
    Value(serde_json::Value),
    /// Sentinel recorded when a required market-data input was absent.
    MissingData,
    /// Marker left behind by a failed task invocation.
    Failed,
}

impl ComputedValue {
    /// The payload, if this is an actual value.
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            ComputedValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this entry represents an absent or failed computation.
    pub fn is_missing(&self) -> bool {
        !matches!(self, ComputedValue::Value(_))
    }
}
