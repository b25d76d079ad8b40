// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Process records, the `ProcessSource` capability, and the `/proc` scraper.
//!
//! The snapshot core never touches the kernel directly; it consumes a
//! `ProcessSource`, which owns the per-task records and performs the
//! affinity syscalls. `ProcScanner` is the production implementation over
//! procfs; tests substitute an in-memory source.

use std::collections::HashMap;
use std::io;

use anyhow::{Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd;
use procfs::process::all_processes;
use procfs::{CurrentSI, KernelStats};

use crate::topology::Topology;
use crate::types::{CpuId, NodeId, Pid};

/// One schedulable task, as last observed from the kernel. Threads get a
/// record of their own, keyed by TID.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    /// Owning process id (thread group id).
    pub pid: Pid,
    /// Task id; equals `pid` for the main thread.
    pub tid: Pid,
    /// CPU the task last ran on.
    pub processor: CpuId,
    /// Node backing `processor`.
    pub numa_node: NodeId,
    /// CPU use over the last refresh interval, percent of one CPU.
    pub cpu_use: f32,
    pub cmdline: String,
    /// Child PIDs and sibling TIDs, present only on main-thread records.
    pub children_and_tasks: Vec<Pid>,
}

/// Capability the snapshot consumes: a refreshable set of task records plus
/// the pinning side of the kernel interface.
pub trait ProcessSource {
    /// Re-scan all live tasks.
    fn update(&mut self) -> Result<()>;

    /// Borrow the current records; iteration order is unspecified.
    fn iter(&self) -> Box<dyn Iterator<Item = &ProcessRecord> + '_>;

    fn get(&self, pid: Pid) -> Option<&ProcessRecord>;

    /// CPU use percent of a task; 0 if the task is unknown.
    fn cpu_use(&self, pid: Pid) -> f32 {
        self.get(pid).map_or(0.0, |record| record.cpu_use)
    }

    /// Restrict a task to a single CPU.
    fn pin_to_cpu(&mut self, pid: Pid, cpu: CpuId) -> io::Result<()>;

    /// Restrict a task to the CPUs of one node; the kernel picks the CPU.
    fn pin_to_node(&mut self, pid: Pid, node: NodeId) -> io::Result<()>;

    /// Restore a task's affinity to the full allowed set.
    fn unpin(&mut self, pid: Pid) -> io::Result<()>;

    /// Unpin every known task.
    fn unpin_all(&mut self) -> io::Result<()>;
}

/// `/proc`-backed `ProcessSource`.
///
/// Each `update` walks every process and its tasks, computing per-task CPU
/// use from the utime+stime tick delta against the per-CPU share of the
/// system tick delta. Tasks seen for the first time report 0% until the
/// next refresh; vanished tasks are dropped.
pub struct ProcScanner {
    node_cpus: Vec<Vec<CpuId>>,
    cpu_nodes: Vec<NodeId>,
    allowed: CpuSet,

    records: HashMap<Pid, ProcessRecord>,
    prev_ticks: HashMap<Pid, u64>,
    prev_total: u64,
}

impl ProcScanner {
    /// Build a scanner against `topology` and perform the initial scrape.
    pub fn new(topology: &Topology) -> Result<ProcScanner> {
        let mut allowed = CpuSet::new();
        for cpu in topology.allowed_cpus() {
            let idx = cpu
                .index()
                .map_err(|e| anyhow::anyhow!("bad CPU id in topology: {e}"))?;
            allowed
                .set(idx)
                .with_context(|| format!("CPU {cpu} does not fit in a CpuSet"))?;
        }

        let mut node_cpus = vec![Vec::new(); topology.max_node().index().unwrap_or(0) + 1];
        for &node in topology.allowed_nodes() {
            if let (Ok(idx), Ok(cpus)) = (node.index(), topology.cpus_from_node(node)) {
                node_cpus[idx] = cpus.to_vec();
            }
        }
        let mut cpu_nodes = vec![NodeId(0); topology.max_cpu().index().unwrap_or(0) + 1];
        for &cpu in topology.allowed_cpus() {
            if let (Ok(idx), Ok(node)) = (cpu.index(), topology.node_from_cpu(cpu)) {
                cpu_nodes[idx] = node;
            }
        }

        let mut scanner = ProcScanner {
            node_cpus,
            cpu_nodes,
            allowed,
            records: HashMap::new(),
            prev_ticks: HashMap::new(),
            prev_total: 0,
        };
        scanner.update()?;
        Ok(scanner)
    }

    fn total_ticks() -> Result<(u64, usize)> {
        let stats = KernelStats::current().context("failed to read /proc/stat")?;
        let t = &stats.total;
        let total = t.user
            + t.nice
            + t.system
            + t.idle
            + t.iowait.unwrap_or(0)
            + t.irq.unwrap_or(0)
            + t.softirq.unwrap_or(0)
            + t.steal.unwrap_or(0);
        Ok((total, stats.cpu_time.len().max(1)))
    }
}

impl ProcessSource for ProcScanner {
    fn update(&mut self) -> Result<()> {
        let (total, nr_cpus) = Self::total_ticks()?;
        let wall_ticks = total.saturating_sub(self.prev_total) as f32 / nr_cpus as f32;

        let mut records = HashMap::new();
        let mut ticks_seen = HashMap::new();

        // Processes come and go during the walk; per-entry failures mean
        // the task exited and are skipped, not propagated.
        for proc in all_processes()
            .context("failed to enumerate /proc")?
            .flatten()
        {
            let pid = Pid(proc.pid);
            let cmdline = proc
                .cmdline()
                .map(|args| args.join(" "))
                .unwrap_or_default();
            let Ok(tasks) = proc.tasks() else { continue };

            let mut tids = Vec::new();
            let mut children = Vec::new();
            for task in tasks.flatten() {
                let Ok(stat) = task.stat() else { continue };
                let Some(processor) = stat.processor.filter(|&cpu| cpu >= 0) else {
                    continue;
                };
                let tid = Pid(task.tid);

                let ticks = stat.utime + stat.stime;
                let prev = self.prev_ticks.get(&tid).copied().unwrap_or(ticks);
                let cpu_use = if wall_ticks > 0.0 {
                    (ticks.saturating_sub(prev) as f32 / wall_ticks * 100.0).clamp(0.0, 100.0)
                } else {
                    0.0
                };
                ticks_seen.insert(tid, ticks);

                let cpu = CpuId(processor);
                let numa_node = self
                    .cpu_nodes
                    .get(processor as usize)
                    .copied()
                    .unwrap_or(NodeId(0));

                if task.tid == proc.pid {
                    children = task.children().unwrap_or_default();
                } else {
                    tids.push(tid);
                }

                records.insert(
                    tid,
                    ProcessRecord {
                        pid,
                        tid,
                        processor: cpu,
                        numa_node,
                        cpu_use,
                        cmdline: cmdline.clone(),
                        children_and_tasks: Vec::new(),
                    },
                );
            }

            if let Some(main) = records.get_mut(&pid) {
                main.children_and_tasks = tids;
                main.children_and_tasks
                    .extend(children.into_iter().map(|child| Pid(child as i32)));
            }
        }

        debug!("scraped {} tasks from /proc", records.len());
        self.records = records;
        self.prev_ticks = ticks_seen;
        self.prev_total = total;
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &ProcessRecord> + '_> {
        Box::new(self.records.values())
    }

    fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    fn pin_to_cpu(&mut self, pid: Pid, cpu: CpuId) -> io::Result<()> {
        let mut set = CpuSet::new();
        set.set(cpu.0.try_into().map_err(|_| invalid_cpu(cpu))?)
            .map_err(io::Error::from)?;
        sched_setaffinity(unistd::Pid::from_raw(pid.0), &set).map_err(io::Error::from)
    }

    fn pin_to_node(&mut self, pid: Pid, node: NodeId) -> io::Result<()> {
        let cpus = node
            .index()
            .ok()
            .and_then(|idx| self.node_cpus.get(idx))
            .filter(|cpus| !cpus.is_empty())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("node {node} has no usable CPUs"),
                )
            })?;
        let mut set = CpuSet::new();
        for cpu in cpus {
            set.set(cpu.0.try_into().map_err(|_| invalid_cpu(*cpu))?)
                .map_err(io::Error::from)?;
        }
        sched_setaffinity(unistd::Pid::from_raw(pid.0), &set).map_err(io::Error::from)
    }

    fn unpin(&mut self, pid: Pid) -> io::Result<()> {
        sched_setaffinity(unistd::Pid::from_raw(pid.0), &self.allowed).map_err(io::Error::from)
    }

    fn unpin_all(&mut self) -> io::Result<()> {
        for &pid in self.records.keys() {
            match sched_setaffinity(unistd::Pid::from_raw(pid.0), &self.allowed) {
                // Task exited between scrape and unpin.
                Err(Errno::ESRCH) => continue,
                Err(e) => return Err(e.into()),
                Ok(()) => {}
            }
        }
        Ok(())
    }
}

fn invalid_cpu(cpu: CpuId) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid CPU id {cpu}"))
}
