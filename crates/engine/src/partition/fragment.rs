use std::collections::BTreeSet;

use abacus_graph::TaskId;

/// Identifier of a fragment within one partitioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(pub u32);

impl std::fmt::Display for FragmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Carries tasks and is dispatched as one batch job.
    Standard,
    /// The synthetic sink collecting the graph's final fragments; never
    /// merged into and never dispatched.
    Root,
}

/// A mutable grouping of tasks destined for one batch job.
///
/// Fragments live in a [`FragmentArena`] and refer to each other by id, so
/// the input/output relation is a pair of id sets rather than owning
/// pointers.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub kind: FragmentKind,
    /// Tasks in execution order.
    pub tasks: Vec<TaskId>,
    /// Fragments whose output this fragment consumes.
    pub inputs: BTreeSet<FragmentId>,
    /// Fragments consuming this fragment's output.
    pub outputs: BTreeSet<FragmentId>,
    /// Fragments chained to execute immediately after this one, without a
    /// separate dispatch round trip.
    pub tail: Vec<FragmentId>,
    /// Execution coloring assigned by the tail-coloring pass.
    pub execution_id: Option<u32>,
    /// Accumulated invocation cost of all tasks.
    pub cost: f64,
}

impl Fragment {
    pub fn items(&self) -> usize {
        self.tasks.len()
    }
}

/// Arena of fragments addressed by integer id.
///
/// Merging takes the absorbed fragment out of the arena, leaving a hole;
/// live fragments are those still present.
#[derive(Debug, Default)]
pub struct FragmentArena {
    fragments: Vec<Option<Fragment>>,
    base: u32,
}

impl FragmentArena {
    /// Create an arena whose first fragment will get id `base`.
    pub fn new(base: u32) -> Self {
        Self {
            fragments: Vec::new(),
            base,
        }
    }

    pub fn insert(&mut self, kind: FragmentKind, tasks: Vec<TaskId>, cost: f64) -> FragmentId {
        let id = FragmentId(self.base + self.fragments.len() as u32);
        self.fragments.push(Some(Fragment {
            id,
            kind,
            tasks,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            tail: Vec::new(),
            execution_id: None,
            cost,
        }));
        id
    }

    fn slot(&self, id: FragmentId) -> usize {
        (id.0 - self.base) as usize
    }

    pub fn get(&self, id: FragmentId) -> &Fragment {
        self.fragments[self.slot(id)]
            .as_ref()
            .expect("fragment was merged away")
    }

    pub fn get_mut(&mut self, id: FragmentId) -> &mut Fragment {
        let slot = self.slot(id);
        self.fragments[slot]
            .as_mut()
            .expect("fragment was merged away")
    }

    pub fn take(&mut self, id: FragmentId) -> Fragment {
        let slot = self.slot(id);
        self.fragments[slot].take().expect("fragment was merged away")
    }

    pub fn contains(&self, id: FragmentId) -> bool {
        self.fragments
            .get(self.slot(id))
            .map(Option::is_some)
            .unwrap_or(false)
    }

    /// Ids of all live fragments, in id order.
    pub fn live_ids(&self) -> Vec<FragmentId> {
        self.fragments
            .iter()
            .filter_map(|f| f.as_ref().map(|f| f.id))
            .collect()
    }

    /// Ids of live standard (non-root) fragments, in id order.
    pub fn standard_ids(&self) -> Vec<FragmentId> {
        self.fragments
            .iter()
            .filter_map(|f| f.as_ref())
            .filter(|f| f.kind == FragmentKind::Standard)
            .map(|f| f.id)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.fragments.iter().filter(|f| f.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_take() {
        let mut arena = FragmentArena::new(10);
        let a = arena.insert(FragmentKind::Standard, vec![TaskId(0)], 1.0);
        let b = arena.insert(FragmentKind::Standard, vec![TaskId(1)], 2.0);

        assert_eq!(a, FragmentId(10));
        assert_eq!(b, FragmentId(11));
        assert_eq!(arena.live_count(), 2);
        assert_eq!(arena.get(a).items(), 1);

        let taken = arena.take(a);
        assert_eq!(taken.cost, 1.0);
        assert!(!arena.contains(a));
        assert_eq!(arena.live_ids(), vec![b]);
    }

    #[test]
    fn standard_ids_exclude_root() {
        let mut arena = FragmentArena::new(0);
        let a = arena.insert(FragmentKind::Standard, vec![TaskId(0)], 1.0);
        let root = arena.insert(FragmentKind::Root, vec![], 0.0);

        assert_eq!(arena.standard_ids(), vec![a]);
        assert_eq!(arena.live_ids(), vec![a, root]);
    }
}
