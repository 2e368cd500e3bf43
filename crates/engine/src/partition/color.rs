//! Tail coloring: grouping fragments into execution chains.
//!
//! Every fragment is assigned an execution id ("color"). A fragment that
//! inherits its input's color is chained as a tail — shipped inside the same
//! batch job as its head, saving a dispatch round trip — provided the
//! color's concurrently-executing fragment count stays under the configured
//! ceiling.
//!
//! Start times are estimated once, after all merging, from the merged
//! fragment costs. The estimates are not re-validated against the final
//! chain shapes; on pathological cost distributions this can assign
//! suboptimal colors, which is the inherited behavior of this algorithm.

use std::collections::{HashMap, VecDeque};

use super::fragment::{FragmentArena, FragmentId, FragmentKind};

/// Estimated start time of every standard fragment: the latest of its
/// inputs' start + cost, zero for fragments with no inputs.
fn estimate_start_times(arena: &FragmentArena) -> HashMap<FragmentId, f64> {
    let ids = arena.standard_ids();
    let mut start: HashMap<FragmentId, f64> = HashMap::new();
    let mut pending: HashMap<FragmentId, usize> = ids
        .iter()
        .map(|&id| (id, arena.get(id).inputs.len()))
        .collect();
    let mut queue: VecDeque<FragmentId> = ids
        .iter()
        .copied()
        .filter(|id| pending[id] == 0)
        .collect();

    while let Some(id) = queue.pop_front() {
        let f = arena.get(id);
        let s = f
            .inputs
            .iter()
            .map(|&i| start[&i] + arena.get(i).cost)
            .fold(0.0, f64::max);
        start.insert(id, s);
        for &consumer in &f.outputs {
            if arena.get(consumer).kind == FragmentKind::Root {
                continue;
            }
            let remaining = pending.get_mut(&consumer).unwrap();
            *remaining -= 1;
            if *remaining == 0 {
                queue.push_back(consumer);
            }
        }
    }
    start
}

/// Assign execution ids and tail chains.
pub(super) fn color_fragments(arena: &mut FragmentArena, max_concurrency: usize) {
    let start = estimate_start_times(arena);

    let mut order = arena.standard_ids();
    order.sort_by(|a, b| {
        start[a]
            .partial_cmp(&start[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });

    let mut next_color = 0u32;
    // Per color: the (start, finish) interval of every fragment assigned so
    // far, used to count concurrent execution at a candidate start time.
    let mut intervals: HashMap<u32, Vec<(f64, f64)>> = HashMap::new();

    for id in order {
        let s = start[&id];
        let fragment = arena.get(id);
        let cost = fragment.cost;
        let inputs: Vec<FragmentId> = fragment.inputs.iter().copied().collect();

        let inherited = if inputs.is_empty() {
            None
        } else {
            let first = arena.get(inputs[0]).execution_id.unwrap();
            let all_same = inputs
                .iter()
                .all(|&i| arena.get(i).execution_id == Some(first));
            if all_same {
                let running = intervals[&first]
                    .iter()
                    .filter(|(begin, finish)| *begin <= s && s < *finish)
                    .count();
                (running < max_concurrency).then_some(first)
            } else {
                None
            }
        };

        let color = match inherited {
            Some(color) => {
                // Chain as a tail of the last-finishing input.
                let head = inputs
                    .iter()
                    .copied()
                    .max_by(|a, b| {
                        let fa = start[a] + arena.get(*a).cost;
                        let fb = start[b] + arena.get(*b).cost;
                        fa.partial_cmp(&fb)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.cmp(b))
                    })
                    .unwrap();
                arena.get_mut(head).tail.push(id);
                color
            }
            None => {
                let color = next_color;
                next_color += 1;
                color
            }
        };

        arena.get_mut(id).execution_id = Some(color);
        intervals.entry(color).or_default().push((s, s + cost));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abacus_graph::TaskId;

    fn link(arena: &mut FragmentArena, from: FragmentId, to: FragmentId) {
        arena.get_mut(from).outputs.insert(to);
        arena.get_mut(to).inputs.insert(from);
    }

    fn chain(n: usize) -> (FragmentArena, Vec<FragmentId>) {
        let mut arena = FragmentArena::new(0);
        let ids: Vec<FragmentId> = (0..n)
            .map(|i| arena.insert(FragmentKind::Standard, vec![TaskId(i as u32)], 1.0))
            .collect();
        for pair in ids.windows(2) {
            link(&mut arena, pair[0], pair[1]);
        }
        (arena, ids)
    }

    #[test]
    fn linear_chain_single_color() {
        let (mut arena, ids) = chain(4);
        color_fragments(&mut arena, 1);

        let colors: Vec<u32> = ids
            .iter()
            .map(|&id| arena.get(id).execution_id.unwrap())
            .collect();
        assert_eq!(colors, vec![0, 0, 0, 0]);
        // Each fragment chains the next as its tail.
        assert_eq!(arena.get(ids[0]).tail, vec![ids[1]]);
        assert_eq!(arena.get(ids[1]).tail, vec![ids[2]]);
        assert_eq!(arena.get(ids[2]).tail, vec![ids[3]]);
        assert!(arena.get(ids[3]).tail.is_empty());
    }

    #[test]
    fn independent_leaves_get_distinct_colors() {
        let mut arena = FragmentArena::new(0);
        let a = arena.insert(FragmentKind::Standard, vec![TaskId(0)], 1.0);
        let b = arena.insert(FragmentKind::Standard, vec![TaskId(1)], 1.0);
        color_fragments(&mut arena, 4);

        assert_ne!(
            arena.get(a).execution_id.unwrap(),
            arena.get(b).execution_id.unwrap()
        );
    }

    #[test]
    fn diamond_join_starts_new_color() {
        let mut arena = FragmentArena::new(0);
        let a = arena.insert(FragmentKind::Standard, vec![TaskId(0)], 1.0);
        let b = arena.insert(FragmentKind::Standard, vec![TaskId(1)], 1.0);
        let join = arena.insert(FragmentKind::Standard, vec![TaskId(2)], 1.0);
        link(&mut arena, a, join);
        link(&mut arena, b, join);
        color_fragments(&mut arena, 4);

        // Inputs carry different colors, so the join cannot inherit.
        let join_color = arena.get(join).execution_id.unwrap();
        assert_ne!(join_color, arena.get(a).execution_id.unwrap());
        assert_ne!(join_color, arena.get(b).execution_id.unwrap());
        assert!(arena.get(a).tail.is_empty());
        assert!(arena.get(b).tail.is_empty());
    }

    #[test]
    fn fan_out_respects_concurrency_ceiling() {
        let mut arena = FragmentArena::new(0);
        let head = arena.insert(FragmentKind::Standard, vec![TaskId(0)], 1.0);
        let children: Vec<FragmentId> = (1..4)
            .map(|i| arena.insert(FragmentKind::Standard, vec![TaskId(i)], 1.0))
            .collect();
        for &child in &children {
            link(&mut arena, head, child);
        }
        color_fragments(&mut arena, 2);

        let head_color = arena.get(head).execution_id.unwrap();
        let inherited: Vec<FragmentId> = children
            .iter()
            .copied()
            .filter(|&c| arena.get(c).execution_id == Some(head_color))
            .collect();
        // Two children fit under the ceiling; the third starts a new color.
        assert_eq!(inherited.len(), 2);
        assert_eq!(arena.get(head).tail, inherited);
    }

    #[test]
    fn start_times_accumulate_cost() {
        let (arena, ids) = chain(3);
        let start = estimate_start_times(&arena);
        assert_eq!(start[&ids[0]], 0.0);
        assert_eq!(start[&ids[1]], 1.0);
        assert_eq!(start[&ids[2]], 2.0);
    }
}
