// Licensed under the MIT and Apache-2.0 licenses.

//! Quorum assembly over a voting tree.
//!
//! A quorum is gathered greedily: the children of every virtual node are
//! shuffled, then stably sorted by the edge priority of the operation, then
//! edges whose subtrees contain prioritized processes are moved to the front.
//! A post-order walk collects votes child by child until each node's
//! threshold is met. A node that cannot meet its threshold contributes
//! nothing, and an empty result from the root means no quorum exists under
//! the given blacklist.

use crate::process::{dedup_by_id, ProcessRef};
use crate::tree::{NodeKind, Operation, VotingNode};
use rand::seq::SliceRandom;
use rand::Rng;

/// Assembles a quorum for `op`. Processes in `ignore` are blacklisted;
/// processes in `prioritize` are preferred wherever the tree allows a
/// choice. Returns the empty vector when no quorum can be formed.
pub fn build(
    root: &VotingNode,
    op: Operation,
    ignore: &[ProcessRef],
    prioritize: &[ProcessRef],
    rng: &mut impl Rng,
) -> Vec<ProcessRef> {
    let mut tree = root.clone();
    sort_tree(&mut tree, op, rng);
    priority_search(&mut tree, prioritize);
    let quorum = match gather(&tree, op, ignore) {
        Some((_vote, members)) => members,
        None => Vec::new(),
    };
    dedup_by_id(quorum)
}

// Shuffle before the stable sort so ties between equal priorities are broken
// at random. Edges keep their default priority unless the structure set one.
fn sort_tree(node: &mut VotingNode, op: Operation, rng: &mut impl Rng) {
    node.children.shuffle(rng);
    node.children.sort_by_key(|e| e.priority(op));
    for edge in &mut node.children {
        sort_tree(&mut edge.target, op, rng);
    }
}

// Moves every edge whose subtree holds a prioritized process to the front of
// its siblings, bubbling the preference up to the root. Returns whether this
// subtree holds one.
fn priority_search(node: &mut VotingNode, prioritize: &[ProcessRef]) -> bool {
    match &node.kind {
        NodeKind::Physical(p) => prioritize.iter().any(|q| q.id == p.id),
        NodeKind::Virtual => {
            let mut matched = Vec::new();
            let mut rest = Vec::new();
            for mut edge in std::mem::take(&mut node.children) {
                if priority_search(&mut edge.target, prioritize) {
                    matched.push(edge);
                } else {
                    rest.push(edge);
                }
            }
            let any = !matched.is_empty();
            matched.extend(rest);
            node.children = matched;
            any
        }
    }
}

// Post-order gather. `Some((vote, members))` when the subtree can supply its
// threshold, `None` when it cannot.
fn gather(
    node: &VotingNode,
    op: Operation,
    ignore: &[ProcessRef],
) -> Option<(u32, Vec<ProcessRef>)> {
    match &node.kind {
        NodeKind::Physical(p) => {
            if ignore.iter().any(|q| q.id == p.id) {
                None
            } else {
                Some((node.vote, vec![p.clone()]))
            }
        }
        NodeKind::Virtual => {
            let required = node.threshold(op);
            let mut have = 0;
            let mut members = Vec::new();
            for edge in &node.children {
                if have >= required {
                    break;
                }
                if let Some((vote, sub)) = gather(&edge.target, op, ignore) {
                    have += vote;
                    members.extend(sub);
                }
            }
            if have < required {
                None
            } else {
                Some((node.vote, members))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{grid, majority, read_one_write_all};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn procs(n: u64) -> Vec<ProcessRef> {
        (1..=n)
            .map(|i| ProcessRef::new(i, "127.0.0.1", 9000 + i as u16))
            .collect()
    }

    fn ids(q: &[ProcessRef]) -> BTreeSet<u64> {
        q.iter().map(|p| p.id).collect()
    }

    #[test]
    fn majority_quorum_sizes() {
        let ps = procs(5);
        let tree = majority(&ps);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let w = build(&tree, Operation::Write, &[], &[], &mut rng);
            let r = build(&tree, Operation::Read, &[], &[], &mut rng);
            assert_eq!(w.len(), 3);
            assert_eq!(r.len(), 3);
        }
    }

    #[test]
    fn read_and_write_quorums_intersect() {
        // Every read quorum has to see the newest write, whatever the
        // structure and whatever the shuffle did.
        let mut rng = StdRng::seed_from_u64(7);
        for n in 1..=12 {
            let ps = procs(n);
            for tree in [majority(&ps), grid(&ps), read_one_write_all(&ps)] {
                for _ in 0..40 {
                    let w = build(&tree, Operation::Write, &[], &[], &mut rng);
                    let r = build(&tree, Operation::Read, &[], &[], &mut rng);
                    assert!(!w.is_empty());
                    assert!(!r.is_empty());
                    assert!(
                        !ids(&w).is_disjoint(&ids(&r)),
                        "disjoint quorums at n = {}",
                        n
                    );
                }
            }
        }
    }

    #[test]
    fn two_write_quorums_intersect() {
        let mut rng = StdRng::seed_from_u64(23);
        for n in 1..=12 {
            let ps = procs(n);
            for tree in [majority(&ps), grid(&ps)] {
                for _ in 0..40 {
                    let a = build(&tree, Operation::Write, &[], &[], &mut rng);
                    let b = build(&tree, Operation::Write, &[], &[], &mut rng);
                    assert!(!ids(&a).is_disjoint(&ids(&b)), "n = {}", n);
                }
            }
        }
    }

    #[test]
    fn ignore_list_is_honored() {
        let ps = procs(5);
        let tree = majority(&ps);
        let mut rng = StdRng::seed_from_u64(3);
        let banned = [ps[0].clone(), ps[1].clone()];
        for _ in 0..50 {
            let q = build(&tree, Operation::Write, &banned, &[], &mut rng);
            assert_eq!(q.len(), 3);
            assert!(!q.iter().any(|p| p.id == 1 || p.id == 2));
        }
    }

    #[test]
    fn too_many_ignored_means_no_quorum() {
        let ps = procs(5);
        let tree = majority(&ps);
        let mut rng = StdRng::seed_from_u64(3);
        let banned = [ps[0].clone(), ps[1].clone(), ps[2].clone()];
        let q = build(&tree, Operation::Write, &banned, &[], &mut rng);
        assert!(q.is_empty());
    }

    #[test]
    fn prioritized_processes_are_chosen_when_possible() {
        let ps = procs(9);
        let mut rng = StdRng::seed_from_u64(5);
        for tree in [majority(&ps), grid(&ps)] {
            let wanted = [ps[4].clone()];
            for _ in 0..50 {
                let q = build(&tree, Operation::Read, &[], &wanted, &mut rng);
                assert!(q.iter().any(|p| p.id == 5));
            }
        }
    }

    #[test]
    fn fused_tree_write_quorum_covers_both_generations() {
        let mut rng = StdRng::seed_from_u64(17);
        let old_ps = procs(5);
        let new_ps = procs(3);
        let fused = crate::tree::fusion(majority(&old_ps), &majority(&new_ps));
        for _ in 0..50 {
            let q = build(&fused, Operation::Write, &[], &[], &mut rng);
            assert!(!q.is_empty());
            // Majority of five and majority of three at once.
            let in_old = q.iter().filter(|p| p.id <= 5).count();
            let in_new = q.iter().filter(|p| p.id <= 3).count();
            assert!(in_old >= 3);
            assert!(in_new >= 2);
        }
    }
}
