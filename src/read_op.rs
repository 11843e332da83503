// Licensed under the MIT and Apache-2.0 licenses.

//! Coordinator side of the read protocol: lock a read quorum, collect one
//! value per member and keep the one with the highest version.
//!
//! A refused lock does not fail the read. The refusing process is noted as
//! busy and the read immediately retries with a quorum built around the busy
//! set; only when the busy set grows so large that no quorum is left does
//! the read fail.

use crate::engine::{BaseOp, CoordinatorState, Engine, EngineError, EpochSight, Event, Timer};
use crate::message::Message;
use crate::process::ProcessRef;
use crate::quorum;
use crate::tree::Operation;
use log::{debug, info};
use serde_json::Value;

impl Engine {
    /// Starts a quorum read of `key`. The outcome arrives later as
    /// [`Event::ReadCompleted`] or [`Event::ReadFailed`].
    pub fn read(&mut self, key: impl Into<String>) -> Result<(), EngineError> {
        if !self.is_idle() {
            return Err(EngineError::OperationInProgress);
        }
        let key = key.into();
        let attempt = match &self.base_op {
            BaseOp::Idle => 1,
            BaseOp::Write { attempt, .. } | BaseOp::Read { attempt, .. } => attempt + 1,
        };
        self.base_op = BaseOp::Read {
            key: key.clone(),
            attempt,
        };
        info!(
            "[{}] read of {:?} in epoch {}, attempt {}",
            self.me.id, key, self.epoch, attempt
        );
        self.start_read(key);
        Ok(())
    }

    pub(crate) fn start_read(&mut self, key: String) {
        let busy = self.busy_list();
        let Some(root) = self.root.as_ref() else {
            self.fail_read(key, busy);
            return;
        };
        let me = self.me.clone();
        let quorum = quorum::build(
            root,
            Operation::Read,
            &busy,
            std::slice::from_ref(&me),
            &mut self.rng,
        );
        if quorum.is_empty() {
            self.fail_read(key, busy);
            return;
        }
        debug!(
            "[{}] read quorum: {:?}, ignoring {:?}",
            self.me.id,
            quorum.iter().map(|p| p.id).collect::<Vec<_>>(),
            busy.iter().map(|p| p.id).collect::<Vec<_>>()
        );
        let sight = EpochSight::new(&self.me, self.epoch);
        self.set_state(CoordinatorState::WaitForLocks {
            key: key.clone(),
            quorum: quorum.clone(),
            locked: Vec::new(),
            refused: 0,
            sight,
        });
        let after = self.config.read_lock_timeout;
        let gen = self.state_gen;
        self.start_timer(Timer::LockForRead { gen }, after);
        self.broadcast(&quorum, Message::LockForRead(key));
    }

    fn fail_read(&mut self, key: String, busy: Vec<ProcessRef>) {
        self.reset_coordinator();
        self.events.push(Event::ReadFailed {
            key,
            error: EngineError::Busy { busy },
        });
    }

    pub(crate) fn on_read_locked(&mut self, key: String, process: ProcessRef, epoch: u64) {
        self.collect_read_lock(key, true, process, epoch);
    }

    pub(crate) fn on_read_not_locked(&mut self, key: String, process: ProcessRef, epoch: u64) {
        self.collect_read_lock(key, false, process, epoch);
    }

    fn collect_read_lock(&mut self, key: String, granted: bool, process: ProcessRef, epoch: u64) {
        let CoordinatorState::WaitForLocks {
            key: wanted,
            quorum,
            locked,
            refused,
            sight,
        } = &mut self.state
        else {
            return;
        };
        if *wanted != key {
            return;
        }
        if granted {
            locked.push(process.clone());
        } else {
            *refused += 1;
            self.busy.insert(process.clone());
        }
        sight.observe(&process, epoch);

        if locked.len() + *refused as usize == quorum.len() {
            self.read_locks_complete();
        }
    }

    fn read_locks_complete(&mut self) {
        let CoordinatorState::WaitForLocks {
            key,
            quorum,
            locked,
            refused,
            sight,
        } = self.state.clone()
        else {
            return;
        };
        if !sight.coordinator_is_current(self.epoch) {
            self.broadcast(&quorum, Message::AbortRead(key));
            self.update_me_to(&sight.up_to_date.0.clone());
            return;
        }
        self.push_epoch_to_outdated(&sight);
        if refused == 0 {
            self.perform_read(key, quorum);
        } else {
            // Release what we got and retry around the busy processes.
            self.broadcast(&locked, Message::AbortRead(key));
            self.run_base_operation();
        }
    }

    fn perform_read(&mut self, key: String, quorum: Vec<ProcessRef>) {
        self.set_state(CoordinatorState::WaitForReads {
            key: key.clone(),
            quorum: quorum.clone(),
            received: 0,
            version: -1,
            value: Value::Null,
        });
        let after = self.config.perform_read_timeout;
        let gen = self.state_gen;
        self.start_timer(Timer::PerformRead { gen }, after);
        self.broadcast(&quorum, Message::Read(key));
    }

    pub(crate) fn on_read_value(&mut self, key: String, value: Value, version: i64) {
        let CoordinatorState::WaitForReads {
            key: wanted,
            quorum,
            received,
            version: best_version,
            value: best_value,
        } = &mut self.state
        else {
            return;
        };
        if *wanted != key {
            return;
        }
        *received += 1;
        if version > *best_version {
            *best_version = version;
            *best_value = value;
        }
        if *received == quorum.len() {
            self.finish_read();
        }
    }

    fn finish_read(&mut self) {
        let CoordinatorState::WaitForReads {
            key,
            version,
            value,
            ..
        } = self.state.clone()
        else {
            return;
        };
        info!("[{}] read of {:?} completed at version {}", self.me.id, key, version);
        self.reset_coordinator();
        self.events.push(Event::ReadCompleted {
            key,
            value,
            version,
        });
    }

    // ---- timeouts ----

    pub(crate) fn read_lock_timeout(&mut self, gen: u64) {
        if gen != self.state_gen {
            return;
        }
        let CoordinatorState::WaitForLocks { key, quorum, sight, .. } = self.state.clone() else {
            return;
        };
        debug!("[{}] read lock timed out for {:?}", self.me.id, key);
        self.broadcast(&quorum, Message::AbortRead(key));
        if sight.coordinator_is_current(self.epoch) {
            self.set_state(CoordinatorState::Idle);
            self.test_processes();
        } else {
            self.update_me_to(&sight.up_to_date.0.clone());
        }
    }

    pub(crate) fn perform_read_timeout(&mut self, gen: u64) {
        if gen != self.state_gen {
            return;
        }
        let CoordinatorState::WaitForReads { key, quorum, .. } = self.state.clone() else {
            return;
        };
        debug!("[{}] read timed out for {:?}", self.me.id, key);
        self.broadcast(&quorum, Message::AbortRead(key));
        self.set_state(CoordinatorState::Idle);
        self.test_processes();
    }
}
