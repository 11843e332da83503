// Licensed under the MIT and Apache-2.0 licenses.

use crate::process::ProcessRef;
use crate::structure::{self, StructureFn};
use std::time::Duration;

/// Tuning knobs for one engine. Everything has a workable default; most
/// embedders only ever touch `rng_seed` (for reproducible quorum selection in
/// tests) and maybe `structure_for`.
#[derive(Clone)]
pub struct Config {
    /// Coordinator-side wait for write votes before aborting and probing.
    pub vote_timeout: Duration,
    /// Coordinator-side wait for prepare acknowledgements. Firing rolls the
    /// prepare back and retries the write after a liveness probe.
    pub prepare_timeout: Duration,
    /// Coordinator-side wait for commit acknowledgements.
    pub wait_for_commit_timeout: Duration,
    /// Coordinator-side wait for read locks.
    pub read_lock_timeout: Duration,
    /// Coordinator-side wait for read replies.
    pub perform_read_timeout: Duration,
    /// Coordinator-side wait for epoch-change lock votes.
    pub epoch_lock_timeout: Duration,
    /// Recipient-side wait before self-committing a pre-committed epoch.
    pub epoch_precommit_timeout: Duration,
    /// Voter-side wait before rolling back a lock whose coordinator went
    /// silent.
    pub rollback_timeout: Duration,
    /// Joining-side wait for the registration round to finish.
    pub registration_timeout: Duration,
    /// Picks the voting structure generator for a given group size.
    pub structure_for: fn(usize) -> StructureFn,
    /// Seed for quorum shuffling. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let base = Duration::from_millis(150);
        Config {
            vote_timeout: base,
            prepare_timeout: base,
            wait_for_commit_timeout: base * 2,
            read_lock_timeout: base,
            perform_read_timeout: base,
            epoch_lock_timeout: base,
            epoch_precommit_timeout: base * 2,
            rollback_timeout: base * 5,
            registration_timeout: base * 5,
            structure_for: default_structure_for,
            rng_seed: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("vote_timeout", &self.vote_timeout)
            .field("rollback_timeout", &self.rollback_timeout)
            .field("rng_seed", &self.rng_seed)
            .finish_non_exhaustive()
    }
}

/// The stock generator table. Majority everywhere except the two group sizes
/// where a grid gives strictly cheaper quorums, then majority again past the
/// end of the table.
pub fn default_structure_for(n: usize) -> StructureFn {
    match n {
        9 | 16 => structure::grid,
        _ => structure::majority,
    }
}

impl Config {
    /// Builds the voting tree for `processes` using the configured table.
    pub fn build_structure(&self, processes: &[ProcessRef]) -> crate::tree::VotingNode {
        (self.structure_for)(processes.len())(processes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_picks_grid_only_for_nine_and_sixteen() {
        for n in 1..=20 {
            let f = default_structure_for(n);
            let expect_grid = n == 9 || n == 16;
            assert_eq!(
                f as usize == structure::grid as usize,
                expect_grid,
                "n = {}",
                n
            );
        }
    }
}
