// Licensed under the MIT and Apache-2.0 licenses.

//! Wire messages. Every message is a JSON object with an `action` field
//! naming the variant, a `data` field carrying the payload, and a `port`
//! field giving the sender's listening port (the peer address is known from
//! the connection).

use crate::process::ProcessRef;
use crate::store::{Key, VersionedValue};
use crate::tree::VotingNode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Voting structure, epoch number and member list of one installed epoch, as
/// shipped to processes that fell behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochData {
    pub epoch: u64,
    pub root: VotingNode,
    pub all_processes: Vec<ProcessRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    // registration
    Register(ProcessRef),
    NotAdded,

    // epoch reconciliation
    UpdateMe,
    UpdatedEpochData(EpochData),
    #[serde(rename = "aNewerEpoch")]
    ANewerEpoch(EpochData),

    // epoch change
    VoteForEpochChange,
    AllLocked {
        epoch: u64,
        key_versions: BTreeMap<Key, i64>,
        process: ProcessRef,
    },
    NothingLocked {
        epoch: u64,
        process: ProcessRef,
    },
    AbortEpochUpdate,
    PlainRead(Key),
    PlainReadValue {
        key: Key,
        value: Value,
        version: i64,
    },
    PreCommitEpochData {
        epoch: u64,
        root: VotingNode,
        storage_patch: BTreeMap<Key, VersionedValue>,
        all_processes: Vec<ProcessRef>,
    },
    #[serde(rename = "epochChangeACK")]
    EpochChangeAck,
    CommitEpochChange,

    // write
    VoteForWrite(Key),
    VoteYes {
        key: Key,
        version: i64,
        process: ProcessRef,
        epoch: u64,
    },
    VoteNo {
        key: Key,
        process: ProcessRef,
        epoch: u64,
    },
    AbortWrite(Key),
    PrepareCommit {
        key: Key,
        value: Value,
        version: i64,
    },
    AbortCommit(Key),
    #[serde(rename = "processACK")]
    ProcessAck(Key),
    Commit(Key),
    CommitAck(Key),

    // read
    LockForRead(Key),
    ReadLocked {
        key: Key,
        process: ProcessRef,
        epoch: u64,
    },
    ReadNotLocked {
        key: Key,
        process: ProcessRef,
        epoch: u64,
    },
    AbortRead(Key),
    Read(Key),
    ReadValue {
        key: Key,
        value: Value,
        version: i64,
    },
}

/// A message together with the sender's listening port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    pub port: u16,
}
