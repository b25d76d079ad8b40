// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # numasnap
//!
//! A consistent, queryable, and mutable view of a Linux host's NUMA/CPU
//! topology together with its running tasks and their per-CPU utilization,
//! intended as the decision substrate for userspace schedulers and
//! process-migration controllers.
//!
//! A [`Snapshot`] couples the host [`Topology`] with a refreshable set of
//! per-task records scraped from `/proc`. Callers inspect where each task
//! runs and how loaded each CPU and node is, stage migrations against an
//! in-memory copy of the placement indices, and either commit the staged
//! moves to the kernel atomically or discard them:
//!
//!```no_run
//!     use numasnap::{CpuId, Snapshot};
//!
//!     let mut snap = Snapshot::new()?;
//!     for &node in snap.topology().allowed_nodes() {
//!         println!(
//!             "node {node}: {} tasks, {:.1}% use",
//!             snap.pids_in_node(node)?.len(),
//!             snap.node_use(node)?,
//!         );
//!     }
//!
//!     let pid = *snap.pids_in_cpu(CpuId(0))?.iter().next().unwrap();
//!     snap.migrate_to_cpu(pid, CpuId(3))?;
//!     snap.commit()?; // or snap.rollback();
//!     # Ok::<(), numasnap::Error>(())
//!```
//!
//! The kernel stays authoritative: committing a migration pins the task's
//! affinity but does not guarantee when it lands, and the next
//! [`Snapshot::update`] re-observes whatever the kernel actually did.
//! Scraping and pinning go through the [`ProcessSource`] capability, so the
//! staging and load logic can be exercised against an in-memory source.

pub mod error;
pub mod load;
pub mod process;
pub mod snapshot;
pub mod topology;
pub mod types;

pub use error::{Error, PinKind, Result};
pub use process::{ProcScanner, ProcessRecord, ProcessSource};
pub use snapshot::Snapshot;
pub use topology::Topology;
pub use types::{CpuId, NodeId, Pid};
