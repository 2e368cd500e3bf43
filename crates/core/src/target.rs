use serde::{Deserialize, Serialize};

/// Kind of entity a task computes against, ordered by dependency level.
///
/// The lattice is strict: a portfolio node may only depend on positions and
/// securities, a position only on its single security, a security on
/// primitives and other securities, and a primitive on other primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    Primitive,
    Security,
    Position,
    PortfolioNode,
}

impl TargetKind {
    /// Whether a task against this kind may consume the output of a task
    /// against `other`.
    pub fn may_depend_on(&self, other: TargetKind) -> bool {
        match self {
            TargetKind::Primitive => matches!(other, TargetKind::Primitive),
            TargetKind::Security => {
                matches!(other, TargetKind::Primitive | TargetKind::Security)
            }
            TargetKind::Position => {
                matches!(other, TargetKind::Security | TargetKind::Primitive)
            }
            TargetKind::PortfolioNode => matches!(
                other,
                TargetKind::Position | TargetKind::Security | TargetKind::Primitive
            ),
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Primitive => write!(f, "Primitive"),
            TargetKind::Security => write!(f, "Security"),
            TargetKind::Position => write!(f, "Position"),
            TargetKind::PortfolioNode => write!(f, "PortfolioNode"),
        }
    }
}

/// The entity a task computes against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputeTarget {
    /// Unique identifier of the entity (e.g. a security or position id).
    pub id: String,
    pub kind: TargetKind,
}

impl ComputeTarget {
    pub fn new(id: impl Into<String>, kind: TargetKind) -> Self {
        Self { id: id.into(), kind }
    }
}

impl std::fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.id)
    }
}
