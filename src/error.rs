// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Error types for topology probing, snapshot queries, and commits.

use std::fmt;

use crate::types::{CpuId, NodeId, Pid};

/// Convenience alias used across the crate's public surface.
pub type Result<T> = std::result::Result<T, Error>;

/// Which kind of pinning a commit was attempting when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    Cpu,
    Node,
}

impl fmt::Display for PinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinKind::Cpu => write!(f, "cpu"),
            PinKind::Node => write!(f, "node"),
        }
    }
}

/// Errors surfaced by the snapshot engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A negative id was converted to an array index.
    #[error("index must be non-negative, got {0}")]
    IndexOutOfRange(i32),

    /// Lookup with a CPU id the topology does not contain.
    #[error("unknown CPU {0}")]
    UnknownCpu(CpuId),

    /// Lookup with a NUMA node id the topology does not contain.
    #[error("unknown NUMA node {0}")]
    UnknownNode(NodeId),

    /// Lookup with a PID the snapshot has not observed.
    #[error("unknown PID {0}")]
    UnknownPid(Pid),

    /// `migrate_to_node` targeted a node with no usable CPUs.
    #[error("node {0} has no usable CPUs")]
    EmptyNode(NodeId),

    /// A kernel probe failed while constructing the topology.
    #[error("failed to probe NUMA node {node}")]
    TopologyProbeFailed {
        node: NodeId,
        #[source]
        source: std::io::Error,
    },

    /// A pinning syscall failed during commit. Already-applied migrations
    /// are dropped from the pending set; the remaining tail is kept so the
    /// caller can retry `commit` or `rollback`.
    #[error("failed to pin PID {pid} to {kind} during commit")]
    CommitFailed {
        pid: Pid,
        kind: PinKind,
        #[source]
        source: std::io::Error,
    },

    /// `update` was called while migrations were staged. Commit or roll
    /// back first; refreshing would silently discard the staged view.
    #[error("snapshot has staged migrations; commit or rollback before updating")]
    DirtyUpdate,

    /// Failure in the process source or other plumbing.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
