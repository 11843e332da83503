// Licensed under the MIT and Apache-2.0 licenses.

//! Coordinator side of the write protocol, a three-phase commit over a write
//! quorum: collect vote locks, prepare the new value, commit and wait for
//! the commit acknowledgements.
//!
//! Once every quorum member has acknowledged the prepare the write can no
//! longer abort: each member commits the value on its own after the
//! pending-commit timeout, so a coordinator that stops hearing commit
//! acknowledgements reports success and probes the group instead of rolling
//! back. Before that point a timeout rolls the prepare back, probes, and
//! retries the write.

use crate::engine::{BaseOp, CoordinatorState, Engine, EngineError, EpochSight, Event, Timer};
use crate::message::Message;
use crate::process::ProcessRef;
use crate::quorum;
use crate::tree::Operation;
use log::{debug, info};
use serde_json::Value;

impl Engine {
    /// Starts replicating `value` under `key`. The outcome arrives later as
    /// [`Event::WriteCompleted`] or [`Event::WriteFailed`].
    pub fn write(&mut self, key: impl Into<String>, value: Value) -> Result<(), EngineError> {
        if !self.is_idle() {
            return Err(EngineError::OperationInProgress);
        }
        let key = key.into();
        let attempt = match &self.base_op {
            BaseOp::Idle => 1,
            BaseOp::Write { attempt, .. } | BaseOp::Read { attempt, .. } => attempt + 1,
        };
        self.base_op = BaseOp::Write {
            key: key.clone(),
            value: value.clone(),
            attempt,
        };
        info!(
            "[{}] write of {:?} in epoch {}, attempt {}",
            self.me.id, key, self.epoch, attempt
        );
        self.start_write(key, value);
        Ok(())
    }

    pub(crate) fn start_write(&mut self, key: String, value: Value) {
        // Busy processes cannot be excluded here: a write quorum must
        // intersect every other quorum, so there is nothing to route around.
        let Some(root) = self.root.as_ref() else {
            self.reset_coordinator();
            self.events.push(Event::WriteFailed {
                key,
                error: EngineError::NoQuorum,
            });
            return;
        };
        let me = self.me.clone();
        let quorum = quorum::build(
            root,
            Operation::Write,
            &[],
            std::slice::from_ref(&me),
            &mut self.rng,
        );
        if quorum.is_empty() {
            self.reset_coordinator();
            self.events.push(Event::WriteFailed {
                key,
                error: EngineError::NoQuorum,
            });
            return;
        }
        debug!(
            "[{}] write quorum: {:?}",
            self.me.id,
            quorum.iter().map(|p| p.id).collect::<Vec<_>>()
        );
        let sight = EpochSight::new(&self.me, self.epoch);
        self.set_state(CoordinatorState::WaitForVotes {
            key: key.clone(),
            value,
            quorum: quorum.clone(),
            positive: Vec::new(),
            negative: 0,
            max_version: -1,
            sight,
        });
        let after = self.config.vote_timeout;
        let gen = self.state_gen;
        self.start_timer(Timer::VoteForWrite { gen }, after);
        self.broadcast(&quorum, Message::VoteForWrite(key));
    }

    pub(crate) fn on_vote_yes(
        &mut self,
        key: String,
        version: i64,
        process: ProcessRef,
        epoch: u64,
    ) {
        self.collect_write_vote(key, Some(version), process, epoch);
    }

    pub(crate) fn on_vote_no(&mut self, key: String, process: ProcessRef, epoch: u64) {
        self.collect_write_vote(key, None, process, epoch);
    }

    fn collect_write_vote(
        &mut self,
        key: String,
        version: Option<i64>,
        process: ProcessRef,
        epoch: u64,
    ) {
        let CoordinatorState::WaitForVotes {
            key: wanted,
            positive,
            negative,
            max_version,
            quorum,
            sight,
            ..
        } = &mut self.state
        else {
            return;
        };
        if *wanted != key {
            return;
        }
        match version {
            Some(version) => {
                *max_version = (*max_version).max(version);
                positive.push(process.clone());
            }
            None => {
                *negative += 1;
                self.busy.insert(process.clone());
            }
        }
        sight.observe(&process, epoch);

        if positive.len() + *negative as usize == quorum.len() {
            self.write_votes_complete();
        }
    }

    fn write_votes_complete(&mut self) {
        let CoordinatorState::WaitForVotes {
            key,
            value,
            quorum,
            positive,
            negative,
            max_version,
            sight,
        } = self.state.clone()
        else {
            return;
        };
        if !sight.coordinator_is_current(self.epoch) {
            // Somebody out there knows a newer structure; this write may be
            // using stale membership. Drop the locks and catch up first.
            self.broadcast(&quorum, Message::AbortWrite(key));
            self.update_me_to(&sight.up_to_date.0.clone());
            return;
        }
        self.push_epoch_to_outdated(&sight);
        if negative == 0 {
            self.prepare_commit(key, value, quorum, max_version);
        } else {
            // A refused lock means a competing quorum holds the key. By the
            // intersection property no retry can succeed right now.
            self.broadcast(&positive, Message::AbortWrite(key.clone()));
            let busy = self.busy_list();
            self.reset_coordinator();
            self.events.push(Event::WriteFailed {
                key,
                error: EngineError::Busy { busy },
            });
        }
    }

    fn prepare_commit(
        &mut self,
        key: String,
        value: Value,
        quorum: Vec<ProcessRef>,
        max_version: i64,
    ) {
        let version = max_version + 1;
        debug!("[{}] preparing commit of {:?} at version {}", self.me.id, key, version);
        self.set_state(CoordinatorState::WaitForAck {
            key: key.clone(),
            value: value.clone(),
            version,
            quorum: quorum.clone(),
            acks: 0,
        });
        let after = self.config.prepare_timeout;
        let gen = self.state_gen;
        self.start_timer(Timer::PrepareCommit { gen }, after);
        self.broadcast(
            &quorum,
            Message::PrepareCommit {
                key,
                value,
                version,
            },
        );
    }

    pub(crate) fn on_process_ack(&mut self, key: String) {
        let CoordinatorState::WaitForAck {
            key: wanted, acks, quorum, ..
        } = &mut self.state
        else {
            return;
        };
        if *wanted != key {
            return;
        }
        *acks += 1;
        if *acks == quorum.len() {
            self.commit_write();
        }
    }

    fn commit_write(&mut self) {
        let CoordinatorState::WaitForAck {
            key, value, quorum, ..
        } = self.state.clone()
        else {
            return;
        };
        debug!("[{}] committing {:?}", self.me.id, key);
        self.set_state(CoordinatorState::WaitForCommit {
            key: key.clone(),
            value,
            quorum: quorum.clone(),
            commit_acks: 0,
        });
        let after = self.config.wait_for_commit_timeout;
        let gen = self.state_gen;
        self.start_timer(Timer::WaitForCommit { gen }, after);
        self.broadcast(&quorum, Message::Commit(key));
    }

    pub(crate) fn on_commit_ack(&mut self, key: String) {
        let CoordinatorState::WaitForCommit {
            key: wanted,
            commit_acks,
            quorum,
            ..
        } = &mut self.state
        else {
            return;
        };
        if *wanted != key {
            return;
        }
        *commit_acks += 1;
        if *commit_acks == quorum.len() {
            self.finish_write();
        }
    }

    fn finish_write(&mut self) {
        let CoordinatorState::WaitForCommit { key, value, .. } = self.state.clone() else {
            return;
        };
        info!("[{}] write of {:?} completed", self.me.id, key);
        self.reset_coordinator();
        self.events.push(Event::WriteCompleted { key, value });
    }

    // ---- timeouts ----

    pub(crate) fn write_vote_timeout(&mut self, gen: u64) {
        if gen != self.state_gen {
            return;
        }
        let CoordinatorState::WaitForVotes { key, quorum, sight, .. } = self.state.clone() else {
            return;
        };
        debug!("[{}] write vote timed out for {:?}", self.me.id, key);
        self.broadcast(&quorum, Message::AbortWrite(key));
        if sight.coordinator_is_current(self.epoch) {
            self.set_state(CoordinatorState::Idle);
            self.test_processes();
        } else {
            self.update_me_to(&sight.up_to_date.0.clone());
        }
    }

    pub(crate) fn prepare_commit_timeout(&mut self, gen: u64) {
        if gen != self.state_gen {
            return;
        }
        let CoordinatorState::WaitForAck { key, quorum, .. } = self.state.clone() else {
            return;
        };
        debug!(
            "[{}] prepare acknowledgements timed out for {:?}",
            self.me.id, key
        );
        // Some member may never have received the value, so this commit is
        // not yet recoverable without the coordinator. Roll it back
        // everywhere and retry after the probe.
        self.broadcast(&quorum, Message::AbortCommit(key));
        self.set_state(CoordinatorState::Idle);
        self.test_processes();
    }

    pub(crate) fn wait_for_commit_timeout(&mut self, gen: u64) {
        if gen != self.state_gen {
            return;
        }
        let CoordinatorState::WaitForCommit { key, value, .. } = self.state.clone() else {
            return;
        };
        // Every member acknowledged the prepare and self-commits after its
        // pending-commit timeout; the write lands with or without the
        // commit acknowledgements.
        info!(
            "[{}] write of {:?} settled without full acknowledgement",
            self.me.id, key
        );
        self.reset_coordinator();
        self.events.push(Event::WriteCompleted { key, value });
        self.test_processes();
    }
}
