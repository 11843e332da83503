// Licensed under the MIT and Apache-2.0 licenses.

use crate::*;
use log::debug;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// A deterministic in-memory network. Messages are queued FIFO, probes are
// answered from the alive set, and timers only fire once all queues have
// drained, which models a network that is fast relative to every timeout.
struct Net {
    engines: BTreeMap<ProcessId, Engine>,
    alive: BTreeSet<ProcessId>,
    endpoints: BTreeMap<(String, u16), ProcessId>,
    messages: VecDeque<(ProcessId, String, Envelope)>,
    probes: VecDeque<(ProcessId, ProcessRef)>,
    timers: Vec<(u64, u64, ProcessId, Timer)>,
    clock: u64,
    seq: u64,
    events: BTreeMap<ProcessId, Vec<Event>>,
}

fn address_of(id: ProcessId) -> String {
    format!("10.0.0.{}", id)
}

fn process_ref(id: ProcessId) -> ProcessRef {
    ProcessRef::new(id, address_of(id), 8000 + id as u16)
}

fn config_for(id: ProcessId) -> Config {
    Config {
        rng_seed: Some(42 + id),
        ..Config::default()
    }
}

impl Net {
    fn new() -> Self {
        Net {
            engines: BTreeMap::new(),
            alive: BTreeSet::new(),
            endpoints: BTreeMap::new(),
            messages: VecDeque::new(),
            probes: VecDeque::new(),
            timers: Vec::new(),
            clock: 0,
            seq: 0,
            events: BTreeMap::new(),
        }
    }

    fn bootstrap(&mut self, id: ProcessId) {
        let engine = Engine::new(process_ref(id), config_for(id));
        self.add(id, engine);
    }

    fn join(&mut self, id: ProcessId, seed: ProcessId) {
        let engine = Engine::join(
            process_ref(id),
            process_ref(seed).endpoint(),
            config_for(id),
        );
        self.add(id, engine);
    }

    fn add(&mut self, id: ProcessId, engine: Engine) {
        let me = process_ref(id);
        self.endpoints.insert((me.address.clone(), me.port), id);
        self.engines.insert(id, engine);
        self.alive.insert(id);
        self.events.insert(id, Vec::new());
        self.collect(id);
    }

    fn kill(&mut self, id: ProcessId) {
        self.alive.remove(&id);
    }

    fn engine(&mut self, id: ProcessId) -> &mut Engine {
        self.engines.get_mut(&id).unwrap()
    }

    // Moves an engine's outputs into the network queues and stashes its
    // events.
    fn collect(&mut self, id: ProcessId) {
        let outputs = self.engines.get_mut(&id).unwrap().drain_outputs();
        for output in outputs {
            match output {
                Output::Send { to, envelope } => {
                    if let Some(target) = self.endpoints.get(&(to.address.clone(), to.port)) {
                        if self.alive.contains(target) {
                            self.messages.push_back((*target, address_of(id), envelope));
                        }
                    }
                }
                Output::StartTimer { timer, after } => {
                    self.seq += 1;
                    let fire_at = self.clock + after.as_millis() as u64;
                    self.timers.push((fire_at, self.seq, id, timer));
                }
                Output::Probe { target } => {
                    self.probes.push_back((id, target));
                }
            }
        }
        let events = self.engines.get_mut(&id).unwrap().drain_events();
        self.events.get_mut(&id).unwrap().extend(events);
    }

    fn step(&mut self) -> bool {
        if let Some((to, from, envelope)) = self.messages.pop_front() {
            if self.alive.contains(&to) {
                debug!("t={} deliver to [{}]: {:?}", self.clock, to, envelope.message);
                self.engines.get_mut(&to).unwrap().handle(&from, envelope);
                self.collect(to);
            }
            return true;
        }
        if let Some((prober, target)) = self.probes.pop_front() {
            if self.alive.contains(&prober) {
                let online = self.alive.contains(&target.id);
                self.engines
                    .get_mut(&prober)
                    .unwrap()
                    .probe_result(target, online);
                self.collect(prober);
            }
            return true;
        }
        // quiescent network, advance time to the next armed timer
        self.timers.retain(|(_, _, id, _)| self.alive.contains(id));
        if let Some(index) = (0..self.timers.len())
            .min_by_key(|&i| (self.timers[i].0, self.timers[i].1))
        {
            let (fire_at, _, id, timer) = self.timers.swap_remove(index);
            self.clock = self.clock.max(fire_at);
            debug!("t={} fire on [{}]: {:?}", self.clock, id, timer);
            self.engines.get_mut(&id).unwrap().timer_fired(timer);
            self.collect(id);
            return true;
        }
        false
    }

    fn run(&mut self) {
        // outputs queued by calling an engine's API directly
        let ids: Vec<ProcessId> = self.engines.keys().copied().collect();
        for id in ids {
            self.collect(id);
        }
        let mut steps = 0usize;
        while self.step() {
            steps += 1;
            assert!(steps < 200_000, "simulation did not settle");
        }
    }

    fn take_events(&mut self, id: ProcessId) -> Vec<Event> {
        std::mem::take(self.events.get_mut(&id).unwrap())
    }
}

fn group_of(n: ProcessId) -> Net {
    let mut net = Net::new();
    net.bootstrap(1);
    for id in 2..=n {
        net.join(id, 1);
        net.run();
        assert!(
            net.take_events(id).contains(&Event::Registered),
            "process {} failed to register",
            id
        );
    }
    net
}

#[test]
fn single_process_write_and_read() {
    pretty_env_logger::try_init().ok();
    let mut net = Net::new();
    net.bootstrap(1);
    net.engine(1).write("key1", json!(15)).unwrap();
    net.run();
    let events = net.take_events(1);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::WriteCompleted { key, .. } if key == "key1")));
    net.engine(1).read("key1").unwrap();
    net.run();
    let events = net.take_events(1);
    assert!(events.contains(&Event::ReadCompleted {
        key: "key1".to_string(),
        value: json!(15),
        version: 0,
    }));
}

#[test]
fn registration_grows_the_group() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(3);
    for id in 1..=3 {
        assert_eq!(net.engine(id).members().len(), 3, "process {}", id);
        assert_eq!(net.engine(id).epoch(), 2, "process {}", id);
    }
}

#[test]
fn write_on_one_process_reads_on_another() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(2);
    net.engine(1).write("key1", json!(15)).unwrap();
    net.run();
    assert!(net
        .take_events(1)
        .iter()
        .any(|e| matches!(e, Event::WriteCompleted { .. })));

    net.engine(2).read("key1").unwrap();
    net.run();
    let events = net.take_events(2);
    assert!(events.contains(&Event::ReadCompleted {
        key: "key1".to_string(),
        value: json!(15),
        version: 0,
    }));
}

#[test]
fn every_process_converges_after_a_round_of_operations() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(4);
    for id in 1..=4u64 {
        net.engine(id)
            .write(format!("key{}", id), json!(id))
            .unwrap();
        net.run();
        assert!(
            net.take_events(id)
                .iter()
                .any(|e| matches!(e, Event::WriteCompleted { .. })),
            "write on process {} did not complete",
            id
        );
    }
    // Reading every key from every process forces stragglers through the
    // reconciliation path before their reads finish.
    for reader in 1..=4u64 {
        for key_owner in 1..=4u64 {
            let key = format!("key{}", key_owner);
            net.engine(reader).read(key.clone()).unwrap();
            net.run();
            let events = net.take_events(reader);
            assert!(
                events.iter().any(|e| matches!(
                    e,
                    Event::ReadCompleted { key: k, value, .. }
                        if *k == key && *value == json!(key_owner)
                )),
                "process {} could not read {}",
                reader,
                key
            );
        }
    }
    let epoch = net.engine(1).epoch();
    for id in 1..=4 {
        assert_eq!(net.engine(id).members().len(), 4, "process {}", id);
        assert_eq!(net.engine(id).epoch(), epoch, "process {}", id);
    }
}

#[test]
fn overwrites_bump_the_version() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(3);
    for round in 0..3 {
        net.engine(1).write("counter", json!(round)).unwrap();
        net.run();
        net.take_events(1);
    }
    net.engine(2).read("counter").unwrap();
    net.run();
    let events = net.take_events(2);
    assert!(events.contains(&Event::ReadCompleted {
        key: "counter".to_string(),
        value: json!(2),
        version: 2,
    }));
}

#[test]
fn a_dead_process_is_voted_out_and_writes_continue() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(4);
    net.kill(4);

    // Each write either misses the dead process and completes right away or
    // runs into it, probes, and reconfigures. Keep writing until the
    // shrunken epoch is installed.
    let mut value = 0;
    while net.engine(1).members().len() > 3 {
        net.engine(1).write("key1", json!(value)).unwrap();
        net.run();
        assert!(
            net.take_events(1)
                .iter()
                .any(|e| matches!(e, Event::WriteCompleted { .. })),
            "write did not complete after losing a process"
        );
        value += 1;
        assert!(value < 50, "group never reconfigured");
    }
    assert!(!net
        .engine(1)
        .members()
        .iter()
        .any(|p| p.id == 4));

    net.engine(2).read("key1").unwrap();
    net.run();
    let events = net.take_events(2);
    assert!(
        events.iter().any(|e| matches!(
            e,
            Event::ReadCompleted { key, value: v, .. }
                if key == "key1" && *v == json!(value - 1)
        )),
        "read after reconfiguration failed"
    );
}

#[test]
fn a_lost_prepare_round_rolls_back_and_retries() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(4);

    net.engine(1).write("key1", json!(7)).unwrap();
    net.collect(1);
    // Deliver everything except the prepares to the other members, as if
    // the coordinator were cut off right after winning the vote.
    while let Some((to, from, envelope)) = net.messages.pop_front() {
        if to != 1 && matches!(envelope.message, Message::PrepareCommit { .. }) {
            continue;
        }
        net.engines.get_mut(&to).unwrap().handle(&from, envelope);
        net.collect(to);
    }
    assert!(
        !net.take_events(1)
            .iter()
            .any(|e| matches!(e, Event::WriteCompleted { .. })),
        "write must not complete while only the coordinator holds the value"
    );

    // The prepare timeout rolls the write back, the probe finds everyone
    // online and the retried write goes through.
    net.run();
    assert!(net
        .take_events(1)
        .iter()
        .any(|e| matches!(e, Event::WriteCompleted { .. })));

    net.engine(4).read("key1").unwrap();
    net.run();
    let events = net.take_events(4);
    assert!(events.contains(&Event::ReadCompleted {
        key: "key1".to_string(),
        value: json!(7),
        version: 0,
    }));
}

#[test]
fn conflicting_locks_fail_the_read_with_the_busy_set() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(4);

    // Park a foreign write lock on key1 at three of the four processes, as
    // if a coordinator outside the group were mid-write.
    for id in 1..=3u64 {
        let envelope = Envelope {
            message: Message::VoteForWrite("key1".to_string()),
            port: 9999,
        };
        net.engine(id).handle("10.0.0.99", envelope);
        // replies to the fake coordinator fall off the network
        net.collect(id);
    }

    let result = net.engine(4).read("key1");
    assert!(result.is_ok());
    net.collect(4);
    // Deliver messages only; firing timers would roll the foreign locks back.
    while let Some((to, from, envelope)) = net.messages.pop_front() {
        net.engines.get_mut(&to).unwrap().handle(&from, envelope);
        net.collect(to);
    }
    let events = net.take_events(4);
    let failure = events.iter().find_map(|e| match e {
        Event::ReadFailed {
            error: EngineError::Busy { busy },
            ..
        } => Some(busy.clone()),
        _ => None,
    });
    let busy = failure.expect("read should fail while the locks are held");
    let mut ids: Vec<_> = busy.iter().map(|p| p.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert!(!ids.is_empty());
    assert!(ids.iter().all(|id| (1..=3).contains(id)));

    // Once the rollback timers release the locks, the read goes through.
    net.run();
    net.take_events(4);
    net.engine(4).read("key1").unwrap();
    net.run();
    let events = net.take_events(4);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ReadCompleted { key, .. } if key == "key1")));
}

#[test]
fn registering_into_a_dead_seed_times_out() {
    pretty_env_logger::try_init().ok();
    let mut net = Net::new();
    net.bootstrap(1);
    net.kill(1);
    net.join(2, 1);
    net.run();
    let events = net.take_events(2);
    assert!(events.contains(&Event::RegistrationFailed {
        error: EngineError::RegistrationTimeout,
    }));
}

#[test]
fn new_keys_are_announced() {
    pretty_env_logger::try_init().ok();
    let mut net = group_of(2);
    net.engine(1).write("fresh", json!("v")).unwrap();
    net.run();
    let events = net.take_events(2);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::NewKey { key, .. } if key == "fresh")),
        "replica did not announce the new key"
    );
}
