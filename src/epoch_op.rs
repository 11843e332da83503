// Licensed under the MIT and Apache-2.0 licenses.

//! Coordinator side of an epoch change.
//!
//! An epoch change installs a new voting structure over a changed member
//! list. It locks a write quorum of the fused old-and-new structure, brings
//! the coordinator's replicas up to the newest versions seen in the quorum,
//! then pushes the new structure together with a per-member storage patch
//! and commits once every member acknowledged. Locking a fused write quorum
//! guarantees the change is visible to every quorum of both generations.

use crate::engine::{
    BaseOp, CoordinatorState, Engine, EpochChange, EpochSight, Timer,
};
use crate::message::Message;
use crate::process::{dedup_by_id, ProcessId, ProcessRef};
use crate::quorum;
use crate::store::Key;
use crate::tree::{self, Operation};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;

impl Engine {
    /// Starts an epoch change that drops `ignore` from the member list and
    /// adds whatever registrations are queued in the force-include list.
    pub(crate) fn change_epoch(&mut self, ignore: Vec<ProcessRef>) {
        let Some(root) = self.root.clone() else {
            return;
        };
        // kept for the retry after a reconciliation interrupts this change
        self.epoch_retry = Some(ignore.clone());

        let mut new_processes: Vec<ProcessRef> = self
            .all_processes
            .iter()
            .filter(|p| !ignore.iter().any(|q| q.id == p.id))
            .cloned()
            .collect();
        new_processes.extend(self.force_include.iter().cloned());
        let new_processes = dedup_by_id(new_processes);

        let new_root = self.config.build_structure(&new_processes);
        let fusion_root = tree::fusion(root, &new_root);

        for p in &ignore {
            self.busy.insert(p.clone());
        }
        let mut prioritize = vec![self.me.clone()];
        prioritize.extend(self.force_include.iter().cloned());
        let busy = self.busy_list();
        let quorum = quorum::build(
            &fusion_root,
            Operation::Write,
            &busy,
            &prioritize,
            &mut self.rng,
        );
        if quorum.is_empty() {
            warn!(
                "[{}] no fusion quorum for epoch change, {} busy",
                self.me.id,
                busy.len()
            );
            match self.base_op {
                BaseOp::Write { .. } | BaseOp::Read { .. } => self.run_base_operation(),
                BaseOp::Idle => {
                    // A registration drove this change; turn the newcomer away.
                    if let Some(new_process) = self.force_include.last().cloned() {
                        self.send(new_process.endpoint(), Message::NotAdded);
                    }
                    self.set_state(CoordinatorState::Idle);
                }
            }
            return;
        }

        // The quorum builder prefers the prioritized processes but does not
        // guarantee them a seat; the newcomers and the coordinator have to
        // hold locks for the change, so append them outright.
        let mut quorum = quorum;
        quorum.extend(prioritize);
        let quorum = dedup_by_id(quorum);

        info!(
            "[{}] epoch change from {}: fusion quorum {:?}, new members {:?}",
            self.me.id,
            self.epoch,
            quorum.iter().map(|p| p.id).collect::<Vec<_>>(),
            new_processes.iter().map(|p| p.id).collect::<Vec<_>>()
        );

        let sight = EpochSight::new(&self.me, self.epoch);
        self.set_state(CoordinatorState::WaitForAllLocks {
            change: EpochChange {
                quorum: quorum.clone(),
                new_root,
                new_processes,
            },
            locked: Vec::new(),
            denied: 0,
            key_versions: BTreeMap::new(),
            sight,
        });
        let after = self.config.epoch_lock_timeout;
        let gen = self.state_gen;
        self.start_timer(Timer::EpochLock { gen }, after);
        self.broadcast(&quorum, Message::VoteForEpochChange);
    }

    pub(crate) fn on_all_locked(
        &mut self,
        process: ProcessRef,
        epoch: u64,
        versions: BTreeMap<Key, i64>,
    ) {
        let CoordinatorState::WaitForAllLocks {
            change,
            locked,
            denied,
            key_versions,
            sight,
        } = &mut self.state
        else {
            return;
        };
        key_versions.insert(process.id, versions);
        locked.push(process.clone());
        sight.observe(&process, epoch);
        if locked.len() + *denied as usize == change.quorum.len() {
            self.epoch_locks_complete();
        }
    }

    pub(crate) fn on_nothing_locked(&mut self, process: ProcessRef, epoch: u64) {
        let CoordinatorState::WaitForAllLocks {
            change,
            locked,
            denied,
            sight,
            ..
        } = &mut self.state
        else {
            return;
        };
        *denied += 1;
        self.busy.insert(process.clone());
        sight.observe(&process, epoch);
        if locked.len() + *denied as usize == change.quorum.len() {
            self.epoch_locks_complete();
        }
    }

    fn epoch_locks_complete(&mut self) {
        let CoordinatorState::WaitForAllLocks {
            locked,
            denied,
            sight,
            ..
        } = self.state.clone()
        else {
            return;
        };
        if !sight.coordinator_is_current(self.epoch) {
            // A newer epoch exists; this change may be redundant there.
            // Catch up first, the update handler decides what to retry.
            self.broadcast(&locked, Message::AbortEpochUpdate);
            self.update_me_to(&sight.up_to_date.0.clone());
            return;
        }
        if denied > 0 {
            self.broadcast(&locked, Message::AbortEpochUpdate);
            match self.base_op {
                BaseOp::Write { .. } | BaseOp::Read { .. } => self.run_base_operation(),
                BaseOp::Idle => {
                    if let Some(new_process) = self.force_include.last().cloned() {
                        self.send(new_process.endpoint(), Message::NotAdded);
                    }
                    self.set_state(CoordinatorState::Idle);
                }
            }
            return;
        }
        self.update_own_replicas();
    }

    /// Determines the newest version of every key across the locked quorum
    /// and pulls the ones this coordinator is missing, so that the patches
    /// pushed with the pre-commit can all be cut from local storage.
    fn update_own_replicas(&mut self) {
        let CoordinatorState::WaitForAllLocks {
            change,
            key_versions,
            ..
        } = self.state.clone()
        else {
            return;
        };
        let key_version_max = compute_key_version_max(&key_versions);
        let outdated = outdated_keys_for(&key_versions, &key_version_max, self.me.id);
        let necessary = outdated.len();
        debug!(
            "[{}] epoch change: {} local replicas to refresh",
            self.me.id, necessary
        );

        self.set_state(CoordinatorState::WaitForUpdates {
            change: change.clone(),
            key_versions,
            key_version_max: key_version_max.clone(),
            updates: 0,
            necessary,
        });

        if necessary == 0 {
            self.pre_commit_updates();
            return;
        }
        for key in outdated {
            let owner_id = key_version_max[&key].1;
            if let Some(owner) = change.quorum.iter().find(|p| p.id == owner_id) {
                let to = owner.endpoint();
                self.send(to, Message::PlainRead(key));
            }
        }
    }

    pub(crate) fn on_plain_read_value(&mut self, key: Key, value: Value, version: i64) {
        let CoordinatorState::WaitForUpdates {
            updates, necessary, ..
        } = &mut self.state
        else {
            return;
        };
        // Only strictly newer versions were requested and the whole quorum
        // is locked, so writing directly is safe.
        self.store.write(&key, value, version);
        *updates += 1;
        if *updates == *necessary {
            self.pre_commit_updates();
        }
    }

    /// Pushes the new structure plus a tailored storage patch to every
    /// quorum member.
    fn pre_commit_updates(&mut self) {
        let CoordinatorState::WaitForUpdates {
            change,
            key_versions,
            key_version_max,
            ..
        } = self.state.clone()
        else {
            return;
        };
        debug!(
            "[{}] pre-committing epoch {} to {} members",
            self.me.id,
            self.epoch + 1,
            change.quorum.len()
        );
        self.set_state(CoordinatorState::PreCommitUpdates {
            change: change.clone(),
            acks: 0,
        });
        let after = self.config.prepare_timeout;
        let gen = self.state_gen;
        self.start_timer(Timer::EpochPreCommit { gen }, after);

        for member in &change.quorum {
            let wanted = if member.id == self.me.id {
                Vec::new()
            } else {
                outdated_keys_for(&key_versions, &key_version_max, member.id)
            };
            let storage_patch = self.store.multi_read(&wanted);
            let message = Message::PreCommitEpochData {
                epoch: self.epoch + 1,
                root: change.new_root.clone(),
                storage_patch,
                all_processes: change.new_processes.clone(),
            };
            self.send(member.endpoint(), message);
        }
    }

    pub(crate) fn on_epoch_change_ack(&mut self) {
        let CoordinatorState::PreCommitUpdates { change, acks } = &mut self.state else {
            return;
        };
        *acks += 1;
        if *acks == change.quorum.len() {
            self.finalize_epoch_change();
        }
    }

    fn finalize_epoch_change(&mut self) {
        let CoordinatorState::PreCommitUpdates { change, .. } = self.state.clone() else {
            return;
        };
        info!("[{}] committing epoch {}", self.me.id, self.epoch + 1);
        // The coordinator pre-committed to itself like everyone else;
        // install that before resuming so the retried operation runs against
        // the new structure.
        if let Some((pending, _token)) = self.pending_epoch.take() {
            self.commit_epoch(pending);
        }
        let others: Vec<ProcessRef> = change
            .quorum
            .iter()
            .filter(|p| p.id != self.me.id)
            .cloned()
            .collect();
        self.broadcast(&others, Message::CommitEpochChange);
        self.force_include.clear();
        self.epoch_retry = None;
        self.run_base_operation();
    }

    // ---- timeouts ----

    pub(crate) fn epoch_lock_timeout(&mut self, gen: u64) {
        if gen != self.state_gen {
            return;
        }
        let CoordinatorState::WaitForAllLocks { change, sight, .. } = self.state.clone() else {
            return;
        };
        debug!("[{}] epoch lock vote timed out", self.me.id);
        self.broadcast(&change.quorum, Message::AbortEpochUpdate);
        if sight.coordinator_is_current(self.epoch) {
            self.set_state(CoordinatorState::Idle);
            self.test_processes();
        } else {
            self.update_me_to(&sight.up_to_date.0.clone());
        }
    }

    pub(crate) fn epoch_pre_commit_timeout(&mut self, gen: u64) {
        if gen != self.state_gen {
            return;
        }
        let CoordinatorState::PreCommitUpdates { change, .. } = self.state.clone() else {
            return;
        };
        debug!("[{}] epoch pre-commit timed out", self.me.id);
        self.broadcast(&change.quorum, Message::AbortEpochUpdate);
        self.set_state(CoordinatorState::Idle);
        self.test_processes();
    }
}

/// The newest version of every key over all answers, with the id of a
/// process that holds it.
fn compute_key_version_max(
    key_versions: &BTreeMap<ProcessId, BTreeMap<Key, i64>>,
) -> BTreeMap<Key, (i64, ProcessId)> {
    let mut result: BTreeMap<Key, (i64, ProcessId)> = BTreeMap::new();
    for (id, versions) in key_versions {
        for (key, version) in versions {
            match result.get(key) {
                Some((best, _)) if best >= version => {}
                _ => {
                    result.insert(key.clone(), (*version, *id));
                }
            }
        }
    }
    result
}

/// Keys where `id` is missing the newest version.
fn outdated_keys_for(
    key_versions: &BTreeMap<ProcessId, BTreeMap<Key, i64>>,
    key_version_max: &BTreeMap<Key, (i64, ProcessId)>,
    id: ProcessId,
) -> Vec<Key> {
    let own = key_versions.get(&id);
    key_version_max
        .iter()
        .filter(|(key, (max, _))| match own.and_then(|m| m.get(*key)) {
            Some(have) => *max > *have,
            None => true,
        })
        .map(|(key, _)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(pairs: &[(&str, i64)]) -> BTreeMap<Key, i64> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn max_versions_track_their_owner() {
        let mut kv = BTreeMap::new();
        kv.insert(1, versions(&[("a", 3), ("b", 0)]));
        kv.insert(2, versions(&[("a", 5), ("c", 1)]));
        kv.insert(3, versions(&[("b", 2)]));
        let max = compute_key_version_max(&kv);
        assert_eq!(max["a"], (5, 2));
        assert_eq!(max["b"], (2, 3));
        assert_eq!(max["c"], (1, 2));
    }

    #[test]
    fn outdated_keys_include_missing_ones() {
        let mut kv = BTreeMap::new();
        kv.insert(1, versions(&[("a", 3), ("b", 2)]));
        kv.insert(2, versions(&[("a", 5)]));
        let max = compute_key_version_max(&kv);
        let outdated = outdated_keys_for(&kv, &max, 1);
        assert_eq!(outdated, vec!["a".to_string()]);
        let outdated = outdated_keys_for(&kv, &max, 2);
        assert_eq!(outdated, vec!["b".to_string()]);
        let outdated = outdated_keys_for(&kv, &max, 9);
        assert_eq!(outdated.len(), 2);
    }
}
