// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements a replicated key-value store whose consistency is
 * driven by dynamic quorum voting over weighted trees. Every key is
 * replicated to all members of a process group; writes run a three-phase
 * commit against a write quorum and reads collect the highest-versioned
 * value from a read quorum. The voting structure is a tree of weighted
 * nodes, so quorums can be much smaller than a majority of the group while
 * still guaranteeing that any two conflicting quorums intersect.
 *
 * Membership is reconfigured through epoch changes: the current and the
 * prospective voting structure are fused into one tree, a write quorum of
 * the fusion is locked, replicas are brought up to date and the new
 * structure is committed as the next epoch. Processes that fall behind an
 * epoch are detected by the epoch numbers piggybacked on votes and brought
 * back up to date before the operation that noticed them proceeds.
 *
 * The central type is [`Engine`], one per process, written sans-IO: it maps
 * incoming [`Envelope`]s, expired [`Timer`]s and probe results to outgoing
 * [`Output`]s and [`Event`]s, and leaves sockets and clocks to the
 * embedder.
 */

mod config;
mod engine;
mod epoch_op;
mod message;
mod process;
mod quorum;
mod read_op;
mod reactions;
mod store;
mod structure;
mod tree;
mod write_op;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use engine::{Engine, EngineError, Event, Output, Timer};
pub use message::{Envelope, EpochData, Message};
pub use process::{Endpoint, ProcessId, ProcessRef};
pub use store::{Key, VersionedValue};
pub use structure::{grid, majority, read_one_write_all, StructureFn};
pub use tree::{Edge, NodeKind, Operation, VotingNode};

pub use quorum::build as build_quorum;
