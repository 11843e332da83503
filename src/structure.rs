// Licensed under the MIT and Apache-2.0 licenses.
//
// Generators for the stock voting structures. Shapes follow Storm 2012,
// "Specification and Analytical Evaluation of Heterogeneous Dynamic
// Quorum-Based Data Replication Schemes".

use crate::process::ProcessRef;
use crate::tree::{Edge, VotingNode};

/// A structure generator: processes in, voting tree out.
pub type StructureFn = fn(&[ProcessRef]) -> VotingNode;

/// Majority consensus voting. One virtual root over one leaf per process;
/// writes need more than half the votes, reads need at least half.
pub fn majority(processes: &[ProcessRef]) -> VotingNode {
    let n = processes.len() as u32;
    let write = (n + 2) / 2;
    let read = if n % 2 == 0 { n / 2 } else { write };
    flat_tree(processes, read, write)
}

/// Read one, write all. Cheapest possible reads at the price of writes that
/// need every process.
pub fn read_one_write_all(processes: &[ProcessRef]) -> VotingNode {
    flat_tree(processes, 1, processes.len() as u32)
}

fn flat_tree(processes: &[ProcessRef], read: u32, write: u32) -> VotingNode {
    let mut id = 1;
    let mut root = VotingNode::virtual_node(id, 1, read, write);
    for p in processes {
        id += 1;
        root.children
            .push(Edge::new(VotingNode::physical(id, 1, p.clone())));
    }
    root
}

/// The grid protocol, rows favored over columns. Processes are laid out
/// row-major on a rows x columns grid; a read quorum is either one complete
/// column or one process out of every column, a write quorum is both at once.
///
/// The tree encodes this as a root demanding two of its branches for writes
/// and one for reads, where the left branch covers any single complete column
/// and the right covers one process per column. Columns left short by the
/// layout keep the full-column threshold and so never satisfy the left
/// branch on their own.
pub fn grid(processes: &[ProcessRef]) -> VotingNode {
    let n = processes.len();
    let (rows, columns) = grid_dimensions(n);

    let mut id = 1;
    let mut root = VotingNode::virtual_node(id, 1, 1, 2);
    id += 1;

    let complete_column_cover = grid_branch(processes, rows, columns, 1, rows as u32, &mut id);
    root.children.push(Edge::new(complete_column_cover));

    let column_cover = grid_branch(processes, rows, columns, columns as u32, 1, &mut id);
    root.children.push(Edge::new(column_cover));

    root
}

fn grid_branch(
    processes: &[ProcessRef],
    rows: usize,
    columns: usize,
    branch_threshold: u32,
    column_threshold: u32,
    id: &mut u32,
) -> VotingNode {
    let mut branch = VotingNode::virtual_node(*id, 1, branch_threshold, branch_threshold);
    *id += 1;
    for column in 0..columns {
        let mut column_node =
            VotingNode::virtual_node(*id, 1, column_threshold, column_threshold);
        *id += 1;
        for row in 0..rows {
            let position = column + row * columns;
            if let Some(p) = processes.get(position) {
                column_node
                    .children
                    .push(Edge::new(VotingNode::physical(*id, 1, p.clone())));
                *id += 1;
            }
        }
        branch.children.push(Edge::new(column_node));
    }
    branch
}

fn grid_dimensions(n: usize) -> (usize, usize) {
    if n < 3 {
        return (n, 1);
    }
    let sqrt = (n as f64).sqrt();
    let rows = sqrt.ceil() as usize;
    let mut columns = sqrt.floor() as usize;
    if rows * columns < n {
        columns = rows;
    }
    (rows, columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Operation;

    fn procs(n: u64) -> Vec<ProcessRef> {
        (1..=n)
            .map(|i| ProcessRef::new(i, "127.0.0.1", 9000 + i as u16))
            .collect()
    }

    #[test]
    fn majority_thresholds() {
        for (n, read, write) in [(1, 1, 1), (2, 1, 2), (3, 2, 2), (4, 2, 3), (5, 3, 3)] {
            let t = majority(&procs(n));
            assert_eq!(t.threshold(Operation::Read), read, "n = {}", n);
            assert_eq!(t.threshold(Operation::Write), write, "n = {}", n);
            assert_eq!(t.children.len(), n as usize);
        }
    }

    #[test]
    fn rowa_thresholds() {
        let t = read_one_write_all(&procs(5));
        assert_eq!(t.threshold(Operation::Read), 1);
        assert_eq!(t.threshold(Operation::Write), 5);
    }

    #[test]
    fn grid_dimensions_cover_all_processes() {
        for n in 1..=30 {
            let (rows, columns) = grid_dimensions(n);
            assert!(rows * columns >= n, "n = {}", n);
            assert!(rows * columns < n + columns.max(1), "n = {}", n);
        }
    }

    #[test]
    fn grid_nine_is_three_by_three() {
        let t = grid(&procs(9));
        assert_eq!(t.threshold(Operation::Read), 1);
        assert_eq!(t.threshold(Operation::Write), 2);
        assert_eq!(t.children.len(), 2);
        let ccc = &t.children[0].target;
        let cc = &t.children[1].target;
        assert_eq!(ccc.threshold(Operation::Write), 1);
        assert_eq!(cc.threshold(Operation::Write), 3);
        for branch in [ccc, cc] {
            assert_eq!(branch.children.len(), 3);
            for column in &branch.children {
                assert_eq!(column.target.children.len(), 3);
            }
        }
        // First column takes positions 0, 3 and 6 of the row-major layout.
        let first_column = &ccc.children[0].target;
        let ids: Vec<u64> = first_column.processes().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 4, 7]);
        assert_eq!(t.processes().len(), 9);
    }

    #[test]
    fn grid_tolerates_ragged_last_columns() {
        let t = grid(&procs(7));
        assert_eq!(t.processes().len(), 7);
    }
}
