// Licensed under the MIT and Apache-2.0 licenses.

//! Voter side: how a process answers requests coordinated elsewhere.
//!
//! Every granted lock arms a rollback timer, so a coordinator that dies
//! mid-operation cannot wedge the key forever. Each lock carries a token;
//! abort messages and rollback timers only act when the token still matches,
//! which keeps a stale timer from releasing a lock granted to a later
//! operation.

use crate::engine::{Engine, PendingEpoch, Timer};
use crate::message::Message;
use crate::process::Endpoint;
use crate::store::{Key, VersionedValue};
use crate::tree::VotingNode;
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;

impl Engine {
    // ---- write voting ----

    pub(crate) fn on_vote_for_write(&mut self, reply_to: Endpoint, key: Key) {
        if self.store.can_write(&key) {
            let version = self.store.version(&key);
            self.store.lock_write(&key);
            let token = self.next_token();
            self.write_locks.insert(key.clone(), token);
            let me = self.me.clone();
            self.send(
                reply_to,
                Message::VoteYes {
                    key: key.clone(),
                    version,
                    process: me,
                    epoch: self.epoch,
                },
            );
            let after = self.config.rollback_timeout;
            self.start_timer(Timer::WriteRollback { key, token }, after);
        } else {
            let me = self.me.clone();
            self.send(
                reply_to,
                Message::VoteNo {
                    key,
                    process: me,
                    epoch: self.epoch,
                },
            );
        }
    }

    pub(crate) fn write_rollback(&mut self, key: &str, token: u64) {
        if self.write_locks.get(key) == Some(&token) {
            debug!("[{}] rolling back write lock on {:?}", self.me.id, key);
            self.write_locks.remove(key);
            self.store.unlock_write(key);
        }
    }

    pub(crate) fn on_abort_write(&mut self, key: Key) {
        if self.write_locks.remove(&key).is_some() {
            self.store.unlock_write(&key);
        }
    }

    pub(crate) fn on_prepare_commit(
        &mut self,
        reply_to: Endpoint,
        key: Key,
        value: Value,
        version: i64,
    ) {
        // Only meaningful while this process holds the vote lock.
        if self.write_locks.remove(&key).is_none() {
            return;
        }
        self.send(reply_to, Message::ProcessAck(key.clone()));
        let token = self.next_token();
        self.pending_commits
            .insert(key.clone(), (value, version, token));
        // From here on the value lands even without a commit message.
        let after = self.config.wait_for_commit_timeout;
        self.start_timer(Timer::PendingWriteCommit { key, token }, after);
    }

    pub(crate) fn pending_commit_fired(&mut self, key: &str, token: u64) {
        let matches = self
            .pending_commits
            .get(key)
            .map(|(_, _, t)| *t == token)
            .unwrap_or(false);
        if matches {
            debug!("[{}] self-committing {:?}", self.me.id, key);
            self.apply_pending_commit(key);
        }
    }

    pub(crate) fn on_commit(&mut self, reply_to: Endpoint, key: Key) {
        if self.pending_commits.contains_key(&key) {
            self.apply_pending_commit(&key);
            self.send(reply_to, Message::CommitAck(key));
        }
    }

    fn apply_pending_commit(&mut self, key: &str) {
        if let Some((value, version, _token)) = self.pending_commits.remove(key) {
            self.store.write(key, value, version);
            self.store.unlock_write(key);
        }
    }

    pub(crate) fn on_abort_commit(&mut self, key: Key) {
        self.store.unlock_write(&key);
        self.pending_commits.remove(&key);
    }

    // ---- read voting ----

    pub(crate) fn on_lock_for_read(&mut self, reply_to: Endpoint, key: Key) {
        if self.store.can_read(&key) {
            self.store.lock_read(&key);
            let token = self.next_token();
            self.read_locks.insert(key.clone(), token);
            let me = self.me.clone();
            self.send(
                reply_to,
                Message::ReadLocked {
                    key: key.clone(),
                    process: me,
                    epoch: self.epoch,
                },
            );
            let after = self.config.rollback_timeout;
            self.start_timer(Timer::ReadRollback { key, token }, after);
        } else {
            let me = self.me.clone();
            self.send(
                reply_to,
                Message::ReadNotLocked {
                    key,
                    process: me,
                    epoch: self.epoch,
                },
            );
        }
    }

    pub(crate) fn read_rollback(&mut self, key: &str, token: u64) {
        if self.read_locks.get(key) == Some(&token) {
            debug!("[{}] rolling back read lock on {:?}", self.me.id, key);
            self.read_locks.remove(key);
            self.store.unlock_read(key);
        }
    }

    pub(crate) fn on_abort_read(&mut self, key: Key) {
        if self.read_locks.remove(&key).is_some() {
            self.store.unlock_read(&key);
        }
    }

    pub(crate) fn on_read(&mut self, reply_to: Endpoint, key: Key) {
        if self.read_locks.remove(&key).is_none() {
            return;
        }
        let vv = self.store.read(&key);
        self.send(
            reply_to,
            Message::ReadValue {
                key: key.clone(),
                value: vv.value,
                version: vv.version,
            },
        );
        self.store.unlock_read(&key);
    }

    // ---- epoch change voting ----

    pub(crate) fn on_vote_for_epoch_change(&mut self, reply_to: Endpoint) {
        if !self.store.any_locked() {
            self.store.lock_all();
            let token = self.next_token();
            self.epoch_lock = Some(token);
            let me = self.me.clone();
            let key_versions = self.store.key_versions();
            self.send(
                reply_to,
                Message::AllLocked {
                    epoch: self.epoch,
                    key_versions,
                    process: me,
                },
            );
            let after = self.config.rollback_timeout;
            self.start_timer(Timer::EpochRollback { token }, after);
        } else {
            let me = self.me.clone();
            self.send(
                reply_to,
                Message::NothingLocked {
                    epoch: self.epoch,
                    process: me,
                },
            );
        }
    }

    pub(crate) fn epoch_rollback(&mut self, token: u64) {
        if self.epoch_lock == Some(token) {
            debug!("[{}] rolling back epoch lock", self.me.id);
            self.epoch_lock = None;
            self.store.unlock_all();
        }
    }

    pub(crate) fn on_abort_epoch_update(&mut self) {
        self.store.unlock_all();
        self.epoch_lock = None;
        self.pending_epoch = None;
    }

    pub(crate) fn on_plain_read(&mut self, reply_to: Endpoint, key: Key) {
        let vv = self.store.read(&key);
        self.send(
            reply_to,
            Message::PlainReadValue {
                key,
                value: vv.value,
                version: vv.version,
            },
        );
    }

    pub(crate) fn on_pre_commit_epoch_data(
        &mut self,
        reply_to: Endpoint,
        epoch: u64,
        root: VotingNode,
        storage_patch: BTreeMap<Key, VersionedValue>,
        all_processes: Vec<crate::process::ProcessRef>,
    ) {
        self.epoch_lock = None;
        self.send(reply_to, Message::EpochChangeAck);
        // The patch holds the newest versions, not tentative data, so it is
        // applied right away.
        self.store.patch(&storage_patch);
        let token = self.next_token();
        self.pending_epoch = Some((
            PendingEpoch {
                epoch,
                root,
                all_processes,
            },
            token,
        ));
        let after = self.config.epoch_precommit_timeout;
        self.start_timer(Timer::EpochPassiveCommit { token }, after);
    }

    pub(crate) fn epoch_passive_commit(&mut self, token: u64) {
        let matches = self
            .pending_epoch
            .as_ref()
            .map(|(_, t)| *t == token)
            .unwrap_or(false);
        if matches {
            debug!("[{}] passively committing pending epoch", self.me.id);
            let (pending, _) = self.pending_epoch.take().unwrap();
            self.commit_epoch(pending);
        }
    }

    pub(crate) fn on_commit_epoch_change(&mut self) {
        if let Some((pending, _token)) = self.pending_epoch.take() {
            self.commit_epoch(pending);
        }
    }

    /// Installs a pre-committed epoch and reopens the store.
    pub(crate) fn commit_epoch(&mut self, pending: PendingEpoch) {
        self.adopt_view(pending.epoch, pending.root, pending.all_processes);
        self.store.unlock_all();
        if self.registering {
            self.registering = false;
            self.events.push(crate::engine::Event::Registered);
        }
    }
}
