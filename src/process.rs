// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process identities are small integers chosen by the embedder. They have to
/// be unique across the whole replica group; there is no auto-id scheme.
pub type ProcessId = u64;

/// A network location a message can be sent to. The engine never opens
/// connections itself; it only names endpoints in its outputs and trusts the
/// transport to reach them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A lightweight handle for one process of the replica group: its id plus the
/// endpoint it listens on. Sets of these travel in messages, so keep them
/// small and serializable.
///
/// Two refs are the same process iff their ids match; address and port are
/// carried along but never consulted for equality or ordering. That is what
/// makes quorum deduplication and the busy set behave when a process shows up
/// under slightly different addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRef {
    pub id: ProcessId,
    pub address: String,
    pub port: u16,
}

impl ProcessRef {
    pub fn new(id: ProcessId, address: impl Into<String>, port: u16) -> Self {
        ProcessRef {
            id,
            address: address.into(),
            port,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.address.clone(),
            port: self.port,
        }
    }
}

impl PartialEq for ProcessRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProcessRef {}

impl PartialOrd for ProcessRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for ProcessRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]@{}:{}", self.id, self.address, self.port)
    }
}

/// Returns a duplicate-free copy of `processes`, keeping the first occurrence
/// of every id.
pub fn dedup_by_id(processes: Vec<ProcessRef>) -> Vec<ProcessRef> {
    use itertools::Itertools;
    processes.into_iter().unique_by(|p| p.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: ProcessId) -> ProcessRef {
        ProcessRef::new(id, "127.0.0.1", 9000 + id as u16)
    }

    #[test]
    fn refs_compare_by_id_only() {
        let a = ProcessRef::new(7, "10.0.0.1", 1);
        let b = ProcessRef::new(7, "10.0.0.2", 2);
        assert_eq!(a, b);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let l = vec![p(1), p(2), ProcessRef::new(1, "other", 1), p(3), p(2)];
        let d = dedup_by_id(l);
        assert_eq!(d.len(), 3);
        assert_eq!(d[0].address, "127.0.0.1");
        assert_eq!(
            d.iter().map(|q| q.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}
