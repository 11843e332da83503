// Licensed under the MIT and Apache-2.0 licenses.

//! The replication engine for one process.
//!
//! The engine is written sans-IO: it never touches sockets or clocks itself.
//! The embedder feeds it incoming envelopes via [`Engine::handle`], expired
//! timers via [`Engine::timer_fired`] and liveness probe results via
//! [`Engine::probe_result`], then drains the outputs (messages to send,
//! timers to arm, probes to run) and events (operation results, store
//! changes) after every call. Driving the same engine from a TCP loop or
//! from a deterministic test harness is the embedder's choice.
//!
//! Every engine is both a coordinator for the operations its owner starts
//! and a voter for operations coordinated elsewhere. The coordinator also
//! votes in its own quorums; it addresses itself over the transport like any
//! other member, so the transport has to loop self-addressed envelopes back.

use crate::config::Config;
use crate::message::{Envelope, EpochData, Message};
use crate::process::{dedup_by_id, Endpoint, ProcessId, ProcessRef};
use crate::store::{Key, Store, StoreEvent};
use crate::tree::VotingNode;
use im::OrdSet;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("cannot start because there is currently an operation in progress")]
    OperationInProgress,
    #[error("could not establish a quorum with the current voting structure")]
    NoQuorum,
    #[error("could not establish a quorum, {} process(es) busy", busy.len())]
    Busy { busy: Vec<ProcessRef> },
    #[error("the group could temporarily not integrate this process")]
    NotAdded,
    #[error("registration timed out")]
    RegistrationTimeout,
}

/// What the embedder has to do on the engine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Send { to: Endpoint, envelope: Envelope },
    StartTimer { timer: Timer, after: Duration },
    Probe { target: ProcessRef },
}

/// Results and notifications for the embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    WriteCompleted { key: Key, value: Value },
    WriteFailed { key: Key, error: EngineError },
    ReadCompleted { key: Key, value: Value, version: i64 },
    ReadFailed { key: Key, error: EngineError },
    Registered,
    RegistrationFailed { error: EngineError },
    EpochInstalled { epoch: u64, members: Vec<ProcessRef> },
    NewKey { key: Key, value: Value, version: i64 },
    KeyChanged { key: Key, value: Value, version: i64 },
}

/// Timers the embedder arms on request and reports back verbatim when they
/// expire. Coordinator timers carry the state generation they were armed in
/// and are ignored once the coordinator has moved on; voter timers carry a
/// token tied to the lock they would roll back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    VoteForWrite { gen: u64 },
    PrepareCommit { gen: u64 },
    WaitForCommit { gen: u64 },
    LockForRead { gen: u64 },
    PerformRead { gen: u64 },
    EpochLock { gen: u64 },
    EpochPreCommit { gen: u64 },
    Registration,
    WriteRollback { key: Key, token: u64 },
    ReadRollback { key: Key, token: u64 },
    PendingWriteCommit { key: Key, token: u64 },
    EpochRollback { token: u64 },
    EpochPassiveCommit { token: u64 },
}

/// Tracks the newest and the stale epochs seen among the answers of one
/// round of votes.
#[derive(Debug, Clone)]
pub(crate) struct EpochSight {
    pub(crate) up_to_date: (ProcessRef, u64),
    pub(crate) outdated: Vec<ProcessRef>,
}

impl EpochSight {
    pub(crate) fn new(me: &ProcessRef, epoch: u64) -> Self {
        EpochSight {
            up_to_date: (me.clone(), epoch),
            outdated: Vec::new(),
        }
    }

    pub(crate) fn observe(&mut self, process: &ProcessRef, epoch: u64) {
        if epoch > self.up_to_date.1 {
            self.up_to_date = (process.clone(), epoch);
        } else if epoch < self.up_to_date.1 {
            self.outdated.push(process.clone());
        }
    }

    /// True when nobody answered with a newer epoch than ours.
    pub(crate) fn coordinator_is_current(&self, own_epoch: u64) -> bool {
        self.up_to_date.1 == own_epoch
    }
}

/// An epoch change in flight: the fusion quorum that has to lock, plus the
/// structure and member list the change will install.
#[derive(Debug, Clone)]
pub(crate) struct EpochChange {
    pub(crate) quorum: Vec<ProcessRef>,
    pub(crate) new_root: VotingNode,
    pub(crate) new_processes: Vec<ProcessRef>,
}

#[derive(Debug, Clone)]
pub(crate) enum CoordinatorState {
    Idle,
    WaitForVotes {
        key: Key,
        value: Value,
        quorum: Vec<ProcessRef>,
        positive: Vec<ProcessRef>,
        negative: u32,
        max_version: i64,
        sight: EpochSight,
    },
    WaitForAck {
        key: Key,
        value: Value,
        version: i64,
        quorum: Vec<ProcessRef>,
        acks: usize,
    },
    WaitForCommit {
        key: Key,
        value: Value,
        quorum: Vec<ProcessRef>,
        commit_acks: usize,
    },
    WaitForLocks {
        key: Key,
        quorum: Vec<ProcessRef>,
        locked: Vec<ProcessRef>,
        refused: u32,
        sight: EpochSight,
    },
    WaitForReads {
        key: Key,
        quorum: Vec<ProcessRef>,
        received: usize,
        version: i64,
        value: Value,
    },
    WaitForAllLocks {
        change: EpochChange,
        locked: Vec<ProcessRef>,
        denied: u32,
        key_versions: BTreeMap<ProcessId, BTreeMap<Key, i64>>,
        sight: EpochSight,
    },
    WaitForUpdates {
        change: EpochChange,
        key_versions: BTreeMap<ProcessId, BTreeMap<Key, i64>>,
        key_version_max: BTreeMap<Key, (i64, ProcessId)>,
        updates: usize,
        necessary: usize,
    },
    PreCommitUpdates {
        change: EpochChange,
        acks: usize,
    },
}

/// The operation the engine retries after an interruption, with the number
/// of attempts made so far.
#[derive(Debug, Clone)]
pub(crate) enum BaseOp {
    Idle,
    Write { key: Key, value: Value, attempt: u32 },
    Read { key: Key, attempt: u32 },
}

/// A new epoch received via pre-commit, held until the commit message or the
/// passive commit timer installs it.
#[derive(Debug, Clone)]
pub(crate) struct PendingEpoch {
    pub(crate) epoch: u64,
    pub(crate) root: VotingNode,
    pub(crate) all_processes: Vec<ProcessRef>,
}

/// One round of liveness probes over the whole member list.
#[derive(Debug, Clone)]
pub(crate) struct ProbeRound {
    pub(crate) awaiting: OrdSet<ProcessRef>,
    pub(crate) offline: Vec<ProcessRef>,
}

pub struct Engine {
    pub(crate) me: ProcessRef,
    pub(crate) config: Config,
    pub(crate) rng: StdRng,

    pub(crate) epoch: u64,
    pub(crate) root: Option<VotingNode>,
    pub(crate) all_processes: Vec<ProcessRef>,

    pub(crate) state: CoordinatorState,
    pub(crate) state_gen: u64,
    pub(crate) base_op: BaseOp,
    pub(crate) epoch_retry: Option<Vec<ProcessRef>>,
    pub(crate) busy: OrdSet<ProcessRef>,
    pub(crate) force_include: Vec<ProcessRef>,
    pub(crate) pending_register: Vec<ProcessRef>,
    pub(crate) registering: bool,
    pub(crate) deferred_epoch: Option<EpochData>,
    pub(crate) probe: Option<ProbeRound>,

    pub(crate) store: Store,

    // voter side bookkeeping, keyed by rollback tokens
    pub(crate) token_counter: u64,
    pub(crate) write_locks: BTreeMap<Key, u64>,
    pub(crate) pending_commits: BTreeMap<Key, (Value, i64, u64)>,
    pub(crate) read_locks: BTreeMap<Key, u64>,
    pub(crate) epoch_lock: Option<u64>,
    pub(crate) pending_epoch: Option<(PendingEpoch, u64)>,

    pub(crate) outputs: Vec<Output>,
    pub(crate) events: Vec<Event>,
}

impl Engine {
    /// Bootstraps a fresh one-process group. Other processes enter it by
    /// registering.
    pub fn new(me: ProcessRef, config: Config) -> Self {
        let root = config.build_structure(std::slice::from_ref(&me));
        let mut engine = Engine::bare(me.clone(), config);
        engine.root = Some(root);
        engine.all_processes = vec![me];
        engine
    }

    /// Starts a process that joins an existing group through `seed`. The
    /// engine emits the registration request and either a [`Event::Registered`]
    /// or a [`Event::RegistrationFailed`] later on.
    pub fn join(me: ProcessRef, seed: Endpoint, config: Config) -> Self {
        let mut engine = Engine::bare(me.clone(), config);
        engine.registering = true;
        engine.send(seed, Message::Register(me));
        let after = engine.config.registration_timeout;
        engine.start_timer(Timer::Registration, after);
        engine
    }

    fn bare(me: ProcessRef, config: Config) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Engine {
            me,
            config,
            rng,
            epoch: 0,
            root: None,
            all_processes: Vec::new(),
            state: CoordinatorState::Idle,
            state_gen: 0,
            base_op: BaseOp::Idle,
            epoch_retry: None,
            busy: OrdSet::new(),
            force_include: Vec::new(),
            pending_register: Vec::new(),
            registering: false,
            deferred_epoch: None,
            probe: None,
            store: Store::new(),
            token_counter: 0,
            write_locks: BTreeMap::new(),
            pending_commits: BTreeMap::new(),
            read_locks: BTreeMap::new(),
            epoch_lock: None,
            pending_epoch: None,
            outputs: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn me(&self) -> &ProcessRef {
        &self.me
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn members(&self) -> &[ProcessRef] {
        &self.all_processes
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, CoordinatorState::Idle)
    }

    pub fn drain_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Feeds one incoming envelope. `sender_address` is the peer address the
    /// envelope arrived from; together with the envelope's port it names the
    /// endpoint replies go to.
    pub fn handle(&mut self, sender_address: &str, envelope: Envelope) {
        let reply_to = Endpoint {
            address: sender_address.to_string(),
            port: envelope.port,
        };
        self.dispatch(reply_to, envelope.message);
        self.flush_store_events();
    }

    pub fn timer_fired(&mut self, timer: Timer) {
        match timer {
            Timer::VoteForWrite { gen } => self.write_vote_timeout(gen),
            Timer::PrepareCommit { gen } => self.prepare_commit_timeout(gen),
            Timer::WaitForCommit { gen } => self.wait_for_commit_timeout(gen),
            Timer::LockForRead { gen } => self.read_lock_timeout(gen),
            Timer::PerformRead { gen } => self.perform_read_timeout(gen),
            Timer::EpochLock { gen } => self.epoch_lock_timeout(gen),
            Timer::EpochPreCommit { gen } => self.epoch_pre_commit_timeout(gen),
            Timer::Registration => self.registration_timeout(),
            Timer::WriteRollback { key, token } => self.write_rollback(&key, token),
            Timer::ReadRollback { key, token } => self.read_rollback(&key, token),
            Timer::PendingWriteCommit { key, token } => self.pending_commit_fired(&key, token),
            Timer::EpochRollback { token } => self.epoch_rollback(token),
            Timer::EpochPassiveCommit { token } => self.epoch_passive_commit(token),
        }
        self.flush_store_events();
    }

    /// Reports the outcome of a probe previously requested via
    /// [`Output::Probe`].
    pub fn probe_result(&mut self, target: ProcessRef, online: bool) {
        let Some(round) = self.probe.as_mut() else {
            return;
        };
        if round.awaiting.remove(&target).is_none() {
            return;
        }
        if online {
            debug!("[{}] probe: process {} is online", self.me.id, target.id);
        } else {
            debug!("[{}] probe: process {} is offline", self.me.id, target.id);
            round.offline.push(target);
        }
        if round.awaiting.is_empty() {
            let round = self.probe.take().unwrap();
            if round.offline.is_empty() {
                self.run_base_operation();
            } else {
                self.change_epoch(round.offline);
            }
        }
        self.flush_store_events();
    }

    fn dispatch(&mut self, reply_to: Endpoint, message: Message) {
        match message {
            // registration
            Message::Register(process) => self.on_register(process),
            Message::NotAdded => self.on_not_added(),

            // epoch reconciliation
            Message::UpdateMe => self.on_update_me(reply_to),
            Message::UpdatedEpochData(data) => self.on_updated_epoch_data(data),
            Message::ANewerEpoch(data) => self.on_a_newer_epoch(data),

            // epoch change, coordinator side
            Message::AllLocked {
                epoch,
                key_versions,
                process,
            } => self.on_all_locked(process, epoch, key_versions),
            Message::NothingLocked { epoch, process } => self.on_nothing_locked(process, epoch),
            Message::PlainReadValue {
                key,
                value,
                version,
            } => self.on_plain_read_value(key, value, version),
            Message::EpochChangeAck => self.on_epoch_change_ack(),

            // epoch change, voter side
            Message::VoteForEpochChange => self.on_vote_for_epoch_change(reply_to),
            Message::AbortEpochUpdate => self.on_abort_epoch_update(),
            Message::PlainRead(key) => self.on_plain_read(reply_to, key),
            Message::PreCommitEpochData {
                epoch,
                root,
                storage_patch,
                all_processes,
            } => self.on_pre_commit_epoch_data(reply_to, epoch, root, storage_patch, all_processes),
            Message::CommitEpochChange => self.on_commit_epoch_change(),

            // write, coordinator side
            Message::VoteYes {
                key,
                version,
                process,
                epoch,
            } => self.on_vote_yes(key, version, process, epoch),
            Message::VoteNo {
                key,
                process,
                epoch,
            } => self.on_vote_no(key, process, epoch),
            Message::ProcessAck(key) => self.on_process_ack(key),
            Message::CommitAck(key) => self.on_commit_ack(key),

            // write, voter side
            Message::VoteForWrite(key) => self.on_vote_for_write(reply_to, key),
            Message::AbortWrite(key) => self.on_abort_write(key),
            Message::PrepareCommit {
                key,
                value,
                version,
            } => self.on_prepare_commit(reply_to, key, value, version),
            Message::AbortCommit(key) => self.on_abort_commit(key),
            Message::Commit(key) => self.on_commit(reply_to, key),

            // read, coordinator side
            Message::ReadLocked {
                key,
                process,
                epoch,
            } => self.on_read_locked(key, process, epoch),
            Message::ReadNotLocked {
                key,
                process,
                epoch,
            } => self.on_read_not_locked(key, process, epoch),
            Message::ReadValue {
                key,
                value,
                version,
            } => self.on_read_value(key, value, version),

            // read, voter side
            Message::LockForRead(key) => self.on_lock_for_read(reply_to, key),
            Message::AbortRead(key) => self.on_abort_read(key),
            Message::Read(key) => self.on_read(reply_to, key),
        }
    }

    // ---- registration and reconciliation ----

    fn on_register(&mut self, process: ProcessRef) {
        if self.is_idle() {
            info!("[{}] integrating process {}", self.me.id, process.id);
            self.force_include.push(process);
            self.change_epoch(Vec::new());
        } else {
            // picked up again once the running operation settles
            debug!(
                "[{}] busy, queueing registration of process {}",
                self.me.id, process.id
            );
            self.pending_register.push(process);
        }
    }

    fn on_not_added(&mut self) {
        if self.registering {
            self.registering = false;
            self.events.push(Event::RegistrationFailed {
                error: EngineError::NotAdded,
            });
        }
    }

    fn registration_timeout(&mut self) {
        if self.registering {
            self.registering = false;
            self.events.push(Event::RegistrationFailed {
                error: EngineError::RegistrationTimeout,
            });
        }
    }

    fn on_update_me(&mut self, reply_to: Endpoint) {
        if let Some(root) = self.root.clone() {
            let data = EpochData {
                epoch: self.epoch,
                root,
                all_processes: self.all_processes.clone(),
            };
            self.send(reply_to, Message::UpdatedEpochData(data));
        }
    }

    fn on_updated_epoch_data(&mut self, data: EpochData) {
        info!(
            "[{}] caught up to epoch {} with {} members",
            self.me.id,
            data.epoch,
            data.all_processes.len()
        );
        self.busy = OrdSet::new();
        self.adopt_view(data.epoch, data.root, data.all_processes);
        self.set_state(CoordinatorState::Idle);
        match self.base_op {
            BaseOp::Idle => {
                if let Some(ignore) = self.epoch_retry.take() {
                    self.change_epoch(ignore);
                }
            }
            _ => self.run_base_operation(),
        }
    }

    fn on_a_newer_epoch(&mut self, data: EpochData) {
        if data.epoch <= self.epoch {
            return;
        }
        if self.is_idle() {
            info!("[{}] updated to epoch {}", self.me.id, data.epoch);
            self.adopt_view(data.epoch, data.root, data.all_processes);
        } else {
            // applied once the coordinator drops back to idle
            let newer = match &self.deferred_epoch {
                Some(held) => data.epoch > held.epoch,
                None => true,
            };
            if newer {
                self.deferred_epoch = Some(data);
            }
        }
    }

    /// Installs structure, epoch and member list without touching the store.
    pub(crate) fn adopt_view(
        &mut self,
        epoch: u64,
        root: VotingNode,
        all_processes: Vec<ProcessRef>,
    ) {
        self.epoch = epoch;
        self.root = Some(root);
        self.all_processes = all_processes;
        self.events.push(Event::EpochInstalled {
            epoch,
            members: self.all_processes.clone(),
        });
    }

    // ---- liveness probing ----

    /// Pings every other member. When everyone answers, the interrupted base
    /// operation is resumed; otherwise an epoch change excludes the silent
    /// processes.
    pub(crate) fn test_processes(&mut self) {
        let others: Vec<ProcessRef> = self
            .all_processes
            .iter()
            .filter(|p| p.id != self.me.id)
            .cloned()
            .collect();
        if others.is_empty() {
            self.run_base_operation();
            return;
        }
        debug!("[{}] testing {} processes", self.me.id, others.len());
        self.probe = Some(ProbeRound {
            awaiting: others.iter().cloned().collect(),
            offline: Vec::new(),
        });
        for target in others {
            self.outputs.push(Output::Probe { target });
        }
    }

    /// Re-runs the interrupted read or write, counting the attempt.
    pub(crate) fn run_base_operation(&mut self) {
        self.set_state(CoordinatorState::Idle);
        match self.base_op.clone() {
            BaseOp::Write { key, value, attempt } => {
                debug!("[{}] beginning write attempt {}", self.me.id, attempt + 1);
                self.start_write(key, value);
            }
            BaseOp::Read { key, attempt } => {
                debug!("[{}] beginning read attempt {}", self.me.id, attempt + 1);
                self.start_read(key);
            }
            BaseOp::Idle => {}
        }
    }

    // ---- shared plumbing ----

    pub(crate) fn set_state(&mut self, state: CoordinatorState) {
        self.state_gen += 1;
        self.state = state;
    }

    /// Drops back to idle between operations. Epoch data and registrations
    /// that arrived mid-operation are applied here.
    pub(crate) fn reset_coordinator(&mut self) {
        self.set_state(CoordinatorState::Idle);
        self.busy = OrdSet::new();
        self.base_op = BaseOp::Idle;
        self.epoch_retry = None;
        if let Some(data) = self.deferred_epoch.take() {
            self.on_a_newer_epoch(data);
        }
        if !self.pending_register.is_empty() {
            let queued = std::mem::take(&mut self.pending_register);
            self.force_include.extend(queued);
            self.force_include = dedup_by_id(std::mem::take(&mut self.force_include));
            self.change_epoch(Vec::new());
        }
    }

    pub(crate) fn next_token(&mut self) -> u64 {
        self.token_counter += 1;
        self.token_counter
    }

    pub(crate) fn send(&mut self, to: Endpoint, message: Message) {
        self.outputs.push(Output::Send {
            to,
            envelope: Envelope {
                message,
                port: self.me.port,
            },
        });
    }

    pub(crate) fn broadcast(&mut self, recipients: &[ProcessRef], message: Message) {
        for p in recipients {
            self.send(p.endpoint(), message.clone());
        }
    }

    pub(crate) fn start_timer(&mut self, timer: Timer, after: Duration) {
        self.outputs.push(Output::StartTimer { timer, after });
    }

    /// Asks the stalest answerers of a finished vote round to catch up.
    pub(crate) fn push_epoch_to_outdated(&mut self, sight: &EpochSight) {
        if sight.outdated.is_empty() {
            return;
        }
        let Some(root) = self.root.clone() else {
            return;
        };
        let data = EpochData {
            epoch: self.epoch,
            root,
            all_processes: self.all_processes.clone(),
        };
        let outdated = sight.outdated.clone();
        self.broadcast(&outdated, Message::ANewerEpoch(data));
    }

    /// Asks the process with the newest epoch for its view. The answer
    /// resumes the base operation.
    pub(crate) fn update_me_to(&mut self, up_to_date: &ProcessRef) {
        self.set_state(CoordinatorState::Idle);
        self.send(up_to_date.endpoint(), Message::UpdateMe);
    }

    pub(crate) fn busy_list(&self) -> Vec<ProcessRef> {
        self.busy.iter().cloned().collect()
    }

    fn flush_store_events(&mut self) {
        for ev in self.store.take_events() {
            self.events.push(match ev {
                StoreEvent::NewKey {
                    key,
                    value,
                    version,
                } => Event::NewKey {
                    key,
                    value,
                    version,
                },
                StoreEvent::Changed {
                    key,
                    value,
                    version,
                } => Event::KeyChanged {
                    key,
                    value,
                    version,
                },
            });
        }
    }

    /// Local snapshot of a key's version, mostly for tests and diagnostics.
    pub fn local_version(&self, key: &str) -> i64 {
        self.store.version(key)
    }
}
