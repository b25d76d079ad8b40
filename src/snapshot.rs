// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Transactional snapshot of task placement.
//!
//! A `Snapshot` couples a [`Topology`] with a [`ProcessSource`] and keeps
//! two parallel index bundles over the observed tasks: a *clean* bundle
//! reflecting the system as last scraped, and a *staged* bundle reflecting
//! caller-proposed migrations. Queries read the staged view by default;
//! `original_*` variants read the clean view. Staged migrations are either
//! committed to the kernel in one pass or rolled back.
//!
//! ```text
//! update()   /proc scrape -> rebuild clean -> mirror into staged -> loads
//! migrate_*  mutate staged only, record the pending target
//! commit()   replay pending pins through the source, then update()
//! rollback() staged := clean, pending cleared
//! ```
//!
//! A snapshot is single-owner: one thread stages and commits. Suspension
//! points are `update` and `commit` (blocking `/proc` and affinity I/O);
//! everything else is in-memory.

use std::collections::{HashMap, HashSet};

use log::warn;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, PinKind, Result};
use crate::load;
use crate::process::{ProcScanner, ProcessSource};
use crate::topology::Topology;
use crate::types::{CpuId, NodeId, Pid};

/// One set of placement indices. The snapshot holds two: clean (as
/// observed) and staged (as proposed).
#[derive(Debug, Clone, Default, PartialEq)]
struct IndexBundle {
    /// CPU id -> tasks on that CPU.
    cpu_pids: Vec<HashSet<Pid>>,
    /// Node id -> tasks on that node.
    node_pids: Vec<HashSet<Pid>>,
    pid_cpu: HashMap<Pid, CpuId>,
    pid_node: HashMap<Pid, NodeId>,
    /// CPU id -> summed CPU use of its tasks.
    cpu_use: Vec<f32>,
    /// Node id -> summed CPU use of its tasks.
    node_use: Vec<f32>,
}

impl IndexBundle {
    fn sized(cpu_slots: usize, node_slots: usize) -> IndexBundle {
        IndexBundle {
            cpu_pids: vec![HashSet::new(); cpu_slots],
            node_pids: vec![HashSet::new(); node_slots],
            pid_cpu: HashMap::new(),
            pid_node: HashMap::new(),
            cpu_use: vec![0.0; cpu_slots],
            node_use: vec![0.0; node_slots],
        }
    }

    fn reset(&mut self) {
        for set in &mut self.cpu_pids {
            set.clear();
        }
        for set in &mut self.node_pids {
            set.clear();
        }
        self.pid_cpu.clear();
        self.pid_node.clear();
        self.cpu_use.fill(0.0);
        self.node_use.fill(0.0);
    }
}

/// Transactional view of the host's task placement. Generic over the
/// process source so the staging and load logic can run against an
/// in-memory fake.
pub struct Snapshot<S: ProcessSource = ProcScanner> {
    topology: Topology,
    source: S,

    clean: IndexBundle,
    staged: IndexBundle,

    /// Pending migration targets, keyed by PID. At most one of the two
    /// maps holds an entry per PID.
    pending_cpu: HashMap<Pid, CpuId>,
    pending_node: HashMap<Pid, NodeId>,

    /// Per-task load over the clean state, recomputed on every rebuild.
    pid_load: HashMap<Pid, f32>,

    dirty: bool,
    rng: SmallRng,
}

impl Snapshot<ProcScanner> {
    /// Probe the host topology, scrape `/proc`, and build the indices.
    pub fn new() -> Result<Snapshot<ProcScanner>> {
        let topology = Topology::new()?;
        let source = ProcScanner::new(&topology).map_err(Error::Other)?;
        Self::with_source(topology, source, SmallRng::from_entropy())
    }
}

impl<S: ProcessSource> Snapshot<S> {
    /// Build a snapshot over an explicit topology and source. The RNG
    /// drives CPU selection in [`migrate_to_node`](Self::migrate_to_node);
    /// seed it for reproducible runs.
    pub fn with_source(topology: Topology, source: S, rng: SmallRng) -> Result<Snapshot<S>> {
        let cpu_slots = topology.max_cpu().index()? + 1;
        let node_slots = topology.max_node().index()? + 1;

        let mut snapshot = Snapshot {
            topology,
            source,
            clean: IndexBundle::sized(cpu_slots, node_slots),
            staged: IndexBundle::sized(cpu_slots, node_slots),
            pending_cpu: HashMap::new(),
            pending_node: HashMap::new(),
            pid_load: HashMap::new(),
            dirty: false,
            rng,
        };
        snapshot.rebuild();
        Ok(snapshot)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The underlying process records.
    pub fn processes(&self) -> &S {
        &self.source
    }

    /// True while migrations are staged but not committed.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Recompute the clean indices from the source's records, mirror them
    /// into the staged bundle, and rerun the load estimator. Records placed
    /// outside the topology (tasks running beyond our affinity mask) are
    /// skipped. Pending maps are untouched; the callers establish the
    /// cleared state around this.
    fn rebuild(&mut self) {
        self.clean.reset();

        for record in self.source.iter() {
            let cpu = record.processor;
            let node = record.numa_node;
            let (Ok(cpu_idx), Ok(node_idx)) = (cpu.index(), node.index()) else {
                warn!("skipping task {} on invalid cpu {cpu}/node {node}", record.tid);
                continue;
            };
            if !self.topology.contains_cpu(cpu) || !self.topology.contains_node(node) {
                warn!(
                    "skipping task {} on cpu {cpu}/node {node} outside the topology",
                    record.tid
                );
                continue;
            }

            self.clean.cpu_pids[cpu_idx].insert(record.tid);
            self.clean.node_pids[node_idx].insert(record.tid);
            self.clean.pid_cpu.insert(record.tid, cpu);
            self.clean.pid_node.insert(record.tid, node);
            self.clean.cpu_use[cpu_idx] += record.cpu_use;
            self.clean.node_use[node_idx] += record.cpu_use;
        }

        self.staged = self.clean.clone();

        self.pid_load.clear();
        for &cpu in self.topology.allowed_cpus() {
            let Ok(cpu_idx) = cpu.index() else { continue };
            let usage: Vec<(Pid, f32)> = self.clean.cpu_pids[cpu_idx]
                .iter()
                .map(|&pid| (pid, self.source.cpu_use(pid)))
                .collect();
            self.pid_load.extend(load::task_loads(&usage));
        }

        self.dirty = false;
    }

    fn refresh(&mut self) -> Result<()> {
        self.source.update().map_err(Error::Other)?;
        self.rebuild();
        Ok(())
    }

    /// Re-observe the system. Fails with [`Error::DirtyUpdate`] while
    /// migrations are staged; commit or roll back first.
    pub fn update(&mut self) -> Result<()> {
        if self.dirty {
            return Err(Error::DirtyUpdate);
        }
        self.refresh()
    }

    /// Apply every pending migration to the kernel, then re-observe.
    ///
    /// CPU pinnings are applied before node pinnings, each group in
    /// ascending PID order. Applied entries leave the pending set
    /// immediately, so a failure ([`Error::CommitFailed`]) keeps only the
    /// unapplied tail staged: call `commit` again to retry it, or
    /// [`rollback`](Self::rollback) and [`update`](Self::update) to
    /// resynchronize. No-op on a clean snapshot.
    pub fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let mut cpu_pids: Vec<Pid> = self.pending_cpu.keys().copied().collect();
        cpu_pids.sort();
        for pid in cpu_pids {
            let cpu = self.pending_cpu[&pid];
            self.source
                .pin_to_cpu(pid, cpu)
                .map_err(|source| Error::CommitFailed {
                    pid,
                    kind: PinKind::Cpu,
                    source,
                })?;
            self.pending_cpu.remove(&pid);
        }

        let mut node_pids: Vec<Pid> = self.pending_node.keys().copied().collect();
        node_pids.sort();
        for pid in node_pids {
            let node = self.pending_node[&pid];
            self.source
                .pin_to_node(pid, node)
                .map_err(|source| Error::CommitFailed {
                    pid,
                    kind: PinKind::Node,
                    source,
                })?;
            self.pending_node.remove(&pid);
        }

        self.dirty = false;
        self.refresh()
    }

    /// Discard every staged migration and revert the staged view to the
    /// clean view.
    pub fn rollback(&mut self) {
        self.pending_cpu.clear();
        self.pending_node.clear();
        self.staged = self.clean.clone();
        self.dirty = false;
    }

    /// Stage moving a task to a specific CPU. Only the staged view changes
    /// until [`commit`](Self::commit).
    pub fn migrate_to_cpu(&mut self, pid: Pid, cpu: CpuId) -> Result<()> {
        if !self.staged.pid_cpu.contains_key(&pid) {
            return Err(Error::UnknownPid(pid));
        }
        let node = self.topology.node_from_cpu(cpu)?;

        self.stage_move(pid, cpu, node)?;
        self.pending_node.remove(&pid);
        self.pending_cpu.insert(pid, cpu);
        self.dirty = true;
        Ok(())
    }

    /// Stage moving a task to a node, letting the kernel pick the CPU on
    /// commit. The staged view places the task on a CPU sampled from the
    /// node so the indices stay concrete.
    pub fn migrate_to_node(&mut self, pid: Pid, node: NodeId) -> Result<()> {
        if !self.staged.pid_cpu.contains_key(&pid) {
            return Err(Error::UnknownPid(pid));
        }
        let cpus = self.topology.cpus_from_node(node)?;
        if cpus.is_empty() {
            return Err(Error::EmptyNode(node));
        }
        let cpu = cpus[self.rng.gen_range(0..cpus.len())];

        self.stage_move(pid, cpu, node)?;
        self.pending_cpu.remove(&pid);
        self.pending_node.insert(pid, node);
        self.dirty = true;
        Ok(())
    }

    /// Move a task between staged indices. Old placement is read from the
    /// staged bundle, so repeated migrations of the same task stay
    /// self-consistent.
    fn stage_move(&mut self, pid: Pid, cpu: CpuId, node: NodeId) -> Result<()> {
        let old_cpu = self.staged.pid_cpu[&pid];
        let old_node = self.staged.pid_node[&pid];

        let old_cpu_idx = old_cpu.index()?;
        let old_node_idx = old_node.index()?;
        let cpu_idx = cpu.index()?;
        let node_idx = node.index()?;

        self.staged.cpu_pids[old_cpu_idx].remove(&pid);
        self.staged.node_pids[old_node_idx].remove(&pid);
        self.staged.cpu_pids[cpu_idx].insert(pid);
        self.staged.node_pids[node_idx].insert(pid);

        self.staged.pid_cpu.insert(pid, cpu);
        self.staged.pid_node.insert(pid, node);

        let use_share = self.source.cpu_use(pid) / 100.0;
        self.staged.cpu_use[old_cpu_idx] -= use_share;
        self.staged.cpu_use[cpu_idx] += use_share;
        self.staged.node_use[old_node_idx] -= use_share;
        self.staged.node_use[node_idx] += use_share;

        Ok(())
    }

    /// Clear a task's affinity immediately. Takes effect in the kernel now
    /// and in the snapshot on the next [`update`](Self::update); nothing is
    /// staged.
    pub fn unpin(&mut self, pid: Pid) -> Result<()> {
        self.source
            .unpin(pid)
            .map_err(|e| Error::Other(e.into()))
    }

    /// Clear every known task's affinity. Like [`unpin`](Self::unpin),
    /// takes effect immediately.
    pub fn unpin_all(&mut self) -> Result<()> {
        self.source
            .unpin_all()
            .map_err(|e| Error::Other(e.into()))
    }

    /// CPU a task sits on in the staged view.
    pub fn processor(&self, pid: Pid) -> Result<CpuId> {
        self.staged
            .pid_cpu
            .get(&pid)
            .copied()
            .ok_or(Error::UnknownPid(pid))
    }

    /// CPU a task was last observed on.
    pub fn original_processor(&self, pid: Pid) -> Result<CpuId> {
        self.clean
            .pid_cpu
            .get(&pid)
            .copied()
            .ok_or(Error::UnknownPid(pid))
    }

    /// Node a task sits on in the staged view.
    pub fn numa_node(&self, pid: Pid) -> Result<NodeId> {
        self.staged
            .pid_node
            .get(&pid)
            .copied()
            .ok_or(Error::UnknownPid(pid))
    }

    /// Node a task was last observed on.
    pub fn original_numa_node(&self, pid: Pid) -> Result<NodeId> {
        self.clean
            .pid_node
            .get(&pid)
            .copied()
            .ok_or(Error::UnknownPid(pid))
    }

    /// Tasks on a CPU in the staged view. Iteration order is unspecified.
    pub fn pids_in_cpu(&self, cpu: CpuId) -> Result<&HashSet<Pid>> {
        self.check_cpu(cpu)?;
        Ok(&self.staged.cpu_pids[cpu.index()?])
    }

    /// Tasks on a node in the staged view.
    pub fn pids_in_node(&self, node: NodeId) -> Result<&HashSet<Pid>> {
        self.check_node(node)?;
        Ok(&self.staged.node_pids[node.index()?])
    }

    /// Tasks last observed on a CPU.
    pub fn original_pids_in_cpu(&self, cpu: CpuId) -> Result<&HashSet<Pid>> {
        self.check_cpu(cpu)?;
        Ok(&self.clean.cpu_pids[cpu.index()?])
    }

    /// Tasks last observed on a node.
    pub fn original_pids_in_node(&self, node: NodeId) -> Result<&HashSet<Pid>> {
        self.check_node(node)?;
        Ok(&self.clean.node_pids[node.index()?])
    }

    /// Summed CPU use percent of the tasks last observed on a CPU.
    pub fn cpu_use(&self, cpu: CpuId) -> Result<f32> {
        self.check_cpu(cpu)?;
        Ok(self.clean.cpu_use[cpu.index()?])
    }

    /// Summed CPU use percent of the tasks last observed on a node.
    pub fn node_use(&self, node: NodeId) -> Result<f32> {
        self.check_node(node)?;
        Ok(self.clean.node_use[node.index()?])
    }

    /// Estimated load of a task, in `[0, 1]`. Reflects observed state, not
    /// proposed state: loads are recomputed only when the snapshot is
    /// rebuilt from the kernel.
    pub fn load_of(&self, pid: Pid) -> Result<f32> {
        self.pid_load
            .get(&pid)
            .copied()
            .ok_or(Error::UnknownPid(pid))
    }

    /// Summed load of the tasks last observed on a CPU.
    pub fn load_of_cpu(&self, cpu: CpuId) -> Result<f32> {
        Ok(self
            .original_pids_in_cpu(cpu)?
            .iter()
            .filter_map(|pid| self.pid_load.get(pid))
            .sum())
    }

    /// Summed load of the tasks last observed on a node.
    pub fn load_of_node(&self, node: NodeId) -> Result<f32> {
        Ok(self
            .original_pids_in_node(node)?
            .iter()
            .filter_map(|pid| self.pid_load.get(pid))
            .sum())
    }

    /// Summed load of every observed task.
    pub fn load_system(&self) -> f32 {
        self.pid_load.values().sum()
    }

    fn check_cpu(&self, cpu: CpuId) -> Result<()> {
        if !self.topology.contains_cpu(cpu) {
            return Err(Error::UnknownCpu(cpu));
        }
        Ok(())
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if !self.topology.contains_node(node) {
            return Err(Error::UnknownNode(node));
        }
        Ok(())
    }
}
