// Licensed under the MIT and Apache-2.0 licenses.

use crate::process::ProcessRef;
use serde::{Deserialize, Serialize};

/// Which side of the quorum system an operation sits on. Read and write
/// quorums are carved from the same tree but use different thresholds and
/// different edge priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Default edge priority. Lower sorts first; untouched edges all sit at the
/// ceiling so shuffling decides between them.
pub const DEFAULT_PRIORITY: u64 = u64::MAX;

/// An edge from a virtual node down to one of its children, weighted per
/// operation so a structure can steer reads and writes toward different
/// subtrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub target: VotingNode,
    pub read_priority: u64,
    pub write_priority: u64,
}

impl Edge {
    pub fn new(target: VotingNode) -> Self {
        Edge {
            target,
            read_priority: DEFAULT_PRIORITY,
            write_priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_priorities(target: VotingNode, read: u64, write: u64) -> Self {
        Edge {
            target,
            read_priority: read,
            write_priority: write,
        }
    }

    pub fn priority(&self, op: Operation) -> u64 {
        match op {
            Operation::Read => self.read_priority,
            Operation::Write => self.write_priority,
        }
    }
}

/// Whether a node stands for an actual process or only groups its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Virtual,
    Physical(ProcessRef),
}

/// One node of a voting tree. Physical nodes are leaves carrying a process;
/// virtual nodes carry thresholds that say how many child votes each kind of
/// quorum has to collect beneath them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingNode {
    pub id: u32,
    pub vote: u32,
    pub kind: NodeKind,
    pub read_threshold: u32,
    pub write_threshold: u32,
    pub children: Vec<Edge>,
}

impl VotingNode {
    pub fn physical(id: u32, vote: u32, process: ProcessRef) -> Self {
        VotingNode {
            id,
            vote,
            kind: NodeKind::Physical(process),
            read_threshold: 0,
            write_threshold: 0,
            children: Vec::new(),
        }
    }

    pub fn virtual_node(id: u32, vote: u32, read_threshold: u32, write_threshold: u32) -> Self {
        VotingNode {
            id,
            vote,
            kind: NodeKind::Virtual,
            read_threshold,
            write_threshold,
            children: Vec::new(),
        }
    }

    pub fn threshold(&self, op: Operation) -> u32 {
        match op {
            Operation::Read => self.read_threshold,
            Operation::Write => self.write_threshold,
        }
    }

    /// True iff some physical leaf below (or at) this node carries one of the
    /// given processes.
    pub fn contains_any(&self, processes: &[ProcessRef]) -> bool {
        match &self.kind {
            NodeKind::Physical(p) => processes.iter().any(|q| q.id == p.id),
            NodeKind::Virtual => self
                .children
                .iter()
                .any(|e| e.target.contains_any(processes)),
        }
    }

    /// All processes named by physical leaves, in tree order, duplicates
    /// removed.
    pub fn processes(&self) -> Vec<ProcessRef> {
        let mut out = Vec::new();
        self.collect_processes(&mut out);
        crate::process::dedup_by_id(out)
    }

    fn collect_processes(&self, out: &mut Vec<ProcessRef>) {
        match &self.kind {
            NodeKind::Physical(p) => out.push(p.clone()),
            NodeKind::Virtual => {
                for e in &self.children {
                    e.target.collect_processes(out);
                }
            }
        }
    }
}

/// Glues the tree of the outgoing epoch under a fresh root together with the
/// tree of the incoming one. A write quorum of the fused tree needs a write
/// quorum of both generations, which is exactly what an epoch change has to
/// lock. Only the write side is ever exercised, but the read threshold is set
/// to demand both generations too.
pub fn fusion(mut old: VotingNode, new: &VotingNode) -> VotingNode {
    // Generated trees number their roots identically, so the two roots
    // would collide under the shared parent. Keep ids distinct without renumbering
    // whole subtrees; duplicate ids deeper down never matter because the
    // gather walks each subtree independently.
    if old.id == new.id {
        old.id = if new.id == 0 { 1 } else { 0 };
    }
    let mut fused = VotingNode::virtual_node(3, 1, 2, 2);
    fused.children.push(Edge::new(old));
    fused.children.push(Edge::new(new.clone()));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: u64) -> ProcessRef {
        ProcessRef::new(id, "127.0.0.1", 9000 + id as u16)
    }

    fn flat(ids: &[u64]) -> VotingNode {
        let mut root = VotingNode::virtual_node(0, 1, 1, ids.len() as u32);
        for (i, id) in ids.iter().enumerate() {
            root.children
                .push(Edge::new(VotingNode::physical(i as u32 + 1, 1, p(*id))));
        }
        root
    }

    #[test]
    fn contains_any_walks_leaves() {
        let t = flat(&[1, 2, 3]);
        assert!(t.contains_any(&[p(2)]));
        assert!(!t.contains_any(&[p(9)]));
        assert!(t.contains_any(&[p(9), p(3)]));
    }

    #[test]
    fn fusion_demands_both_generations() {
        let old = flat(&[1, 2, 3]);
        let new = flat(&[1, 2]);
        let fused = fusion(old, &new);
        assert_eq!(fused.children.len(), 2);
        assert_eq!(fused.write_threshold, 2);
        assert_ne!(fused.children[0].target.id, fused.children[1].target.id);
        let procs = fused.processes();
        assert_eq!(procs.iter().map(|q| q.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
