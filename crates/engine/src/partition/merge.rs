//! Fragment merging passes.
//!
//! Two merges run after seeding, in order: the shared-input merge combines
//! small fragments that would run concurrently with identical predecessors,
//! and the single-dependency merge folds a fragment into its only consumer.
//! Neither merge ever pushes a fragment past the configured item or cost
//! caps.

use super::fragment::{FragmentArena, FragmentId, FragmentKind};
use super::PartitionConfig;

fn under_min(arena: &FragmentArena, id: FragmentId, config: &PartitionConfig) -> bool {
    let f = arena.get(id);
    f.items() < config.min_job_items || f.cost < config.min_job_cost
}

fn fits_max(
    arena: &FragmentArena,
    a: FragmentId,
    b: FragmentId,
    config: &PartitionConfig,
) -> bool {
    let (a, b) = (arena.get(a), arena.get(b));
    a.items() + b.items() <= config.max_job_items && a.cost + b.cost <= config.max_job_cost
}

/// Absorb `gone` into `keep` for fragments with identical input sets,
/// appending `gone`'s tasks after `keep`'s.
fn append(arena: &mut FragmentArena, keep: FragmentId, gone: FragmentId) {
    let absorbed = arena.take(gone);
    for &producer in &absorbed.inputs {
        let p = arena.get_mut(producer);
        p.outputs.remove(&gone);
        p.outputs.insert(keep);
    }
    for &consumer in &absorbed.outputs {
        let c = arena.get_mut(consumer);
        c.inputs.remove(&gone);
        c.inputs.insert(keep);
    }
    let k = arena.get_mut(keep);
    k.tasks.extend(absorbed.tasks);
    k.cost += absorbed.cost;
    k.inputs.extend(absorbed.inputs);
    k.outputs.extend(absorbed.outputs);
}

/// Absorb `gone` into its single consumer, prepending `gone`'s tasks so
/// they still execute first within the merged job.
fn prepend(arena: &mut FragmentArena, gone: FragmentId, consumer: FragmentId) {
    let absorbed = arena.take(gone);
    for &producer in &absorbed.inputs {
        let p = arena.get_mut(producer);
        p.outputs.remove(&gone);
        p.outputs.insert(consumer);
    }
    let c = arena.get_mut(consumer);
    c.inputs.remove(&gone);
    c.inputs.extend(absorbed.inputs);
    let mut tasks = absorbed.tasks;
    tasks.extend(std::mem::take(&mut c.tasks));
    c.tasks = tasks;
    c.cost += absorbed.cost;
}

/// Merge pairs of under-minimum fragments that share an identical
/// input-fragment set.
///
/// The pass is re-run until no merge occurs twice in a row, so that a
/// candidate swap (keeping the cheaper fragment as the accumulator without
/// merging) does not count as the pass having converged.
pub(super) fn shared_input_merge(arena: &mut FragmentArena, config: &PartitionConfig) {
    let mut barren_passes = 0;
    while barren_passes < 2 {
        if shared_input_pass(arena, config) {
            barren_passes = 0;
        } else {
            barren_passes += 1;
        }
    }
}

fn shared_input_pass(arena: &mut FragmentArena, config: &PartitionConfig) -> bool {
    use std::collections::HashMap;

    let mut groups: HashMap<Vec<FragmentId>, Vec<FragmentId>> = HashMap::new();
    for id in arena.standard_ids() {
        let key: Vec<FragmentId> = arena.get(id).inputs.iter().copied().collect();
        groups.entry(key).or_default().push(id);
    }

    let mut merged_any = false;
    for group in groups.into_values() {
        if group.len() < 2 {
            continue;
        }
        let mut candidate = group[0];
        for &other in &group[1..] {
            // A full candidate can never accept more work; swap to the
            // newcomer and keep scanning.
            if !under_min(arena, candidate, config) {
                candidate = other;
                continue;
            }
            if !under_min(arena, other, config) {
                continue;
            }
            if fits_max(arena, candidate, other, config) {
                // The cheaper accumulator absorbs the other, minimizing skew.
                let (keep, gone) = if arena.get(candidate).cost <= arena.get(other).cost {
                    (candidate, other)
                } else {
                    (other, candidate)
                };
                append(arena, keep, gone);
                candidate = keep;
                merged_any = true;
            } else if arena.get(other).cost < arena.get(candidate).cost {
                candidate = other;
            }
        }
    }
    merged_any
}

/// Fold every fragment with exactly one consumer into that consumer,
/// unless the consumer is the synthetic root or the merge would break a
/// cap. Repeats until a fixpoint, since each fold can expose new
/// single-consumer fragments.
pub(super) fn single_dependency_merge(arena: &mut FragmentArena, config: &PartitionConfig) {
    loop {
        let mut merged = false;
        for id in arena.standard_ids() {
            if !arena.contains(id) {
                continue;
            }
            let f = arena.get(id);
            if f.outputs.len() != 1 {
                continue;
            }
            let consumer = *f.outputs.iter().next().unwrap();
            if arena.get(consumer).kind == FragmentKind::Root {
                continue;
            }
            if fits_max(arena, id, consumer, config) {
                prepend(arena, id, consumer);
                merged = true;
            }
        }
        if !merged {
            break;
        }
    }
}
