// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host NUMA/CPU topology.
//!
//! A `Topology` describes the CPUs and NUMA nodes the calling process is
//! permitted to use and the spatial relationships among them: which CPUs
//! belong to which node, which node backs each CPU, and for every node the
//! remaining nodes ranked by kernel-reported distance. It is built once from
//! sysfs and immutable afterwards; if the host topology changes (hotplug),
//! build a new one.
//!
//! On kernels without NUMA support (no `/sys/devices/system/node`), the
//! probe degrades to a synthetic single-node topology where node 0 owns
//! every allowed CPU.

use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use nix::sched::sched_getaffinity;
use nix::sched::CpuSet;
use nix::unistd;
use sscanf::sscanf;

use crate::error::{Error, Result};
use crate::types::{CpuId, NodeId};

const NODE_SYSFS_ROOT: &str = "/sys/devices/system/node";

/// Kernel convention for the distance of a node to itself.
const LOCAL_DISTANCE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    nodes: Vec<NodeId>,
    cpus: Vec<CpuId>,

    /// node id -> CPUs of that node, ascending. Slots for ids not in
    /// `nodes` stay empty.
    node_cpu_map: Vec<Vec<CpuId>>,
    /// CPU id -> owning node. Slots for ids not in `cpus` stay at node 0.
    cpu_node_map: Vec<NodeId>,

    /// node id -> all nodes ranked by distance: the node itself first, then
    /// ascending distance, ties broken by ascending node id.
    nodes_by_distance: Vec<Vec<NodeId>>,
    /// Pairwise distances, indexed by node id on both axes.
    distances: Vec<Vec<usize>>,

    max_cpu: CpuId,
    max_node: NodeId,
}

impl Topology {
    /// Probe the host.
    pub fn new() -> Result<Topology> {
        let cpus = affinity_cpus()?;
        if Path::new(NODE_SYSFS_ROOT).exists() {
            Self::detect_numa(cpus)
        } else {
            Self::detect_uma(cpus)
        }
    }

    /// Build a topology from an explicit layout instead of probing sysfs,
    /// for tests and simulations. `layout` maps each node to its CPUs;
    /// `distances` is a full square matrix in `layout` order, or `None` for
    /// a uniform local/remote matrix.
    pub fn synthetic(
        layout: Vec<(NodeId, Vec<CpuId>)>,
        distances: Option<Vec<Vec<usize>>>,
    ) -> Result<Topology> {
        let mut nodes: Vec<NodeId> = layout.iter().map(|(n, _)| *n).collect();
        nodes.sort();
        nodes.dedup();
        if nodes.len() != layout.len() {
            return Err(Error::Other(anyhow::anyhow!("duplicate node in layout")));
        }

        let dist = match distances {
            Some(matrix) => {
                if matrix.len() != layout.len() || matrix.iter().any(|row| row.len() != layout.len())
                {
                    return Err(Error::Other(anyhow::anyhow!(
                        "distance matrix must be {n}x{n}",
                        n = layout.len()
                    )));
                }
                matrix
            }
            None => (0..layout.len())
                .map(|i| {
                    (0..layout.len())
                        .map(|j| if i == j { LOCAL_DISTANCE } else { LOCAL_DISTANCE * 2 })
                        .collect()
                })
                .collect(),
        };

        // Normalize to ascending node order, permuting the distance matrix
        // rows and columns to match.
        let mut order: Vec<usize> = (0..layout.len()).collect();
        order.sort_by_key(|&i| layout[i].0);

        let mut node_cpus = Vec::with_capacity(layout.len());
        let mut distance_rows = Vec::with_capacity(layout.len());
        for &i in &order {
            let (node, cpus) = &layout[i];
            let mut cpus = cpus.clone();
            cpus.sort();
            cpus.dedup();
            if cpus.is_empty() {
                return Err(Error::EmptyNode(*node));
            }
            node_cpus.push((*node, cpus));
            distance_rows.push(order.iter().map(|&j| dist[i][j]).collect());
        }

        Self::assemble(node_cpus, distance_rows)
    }

    fn detect_numa(allowed: Vec<CpuId>) -> Result<Topology> {
        let mut node_ids = Vec::new();
        let pattern = format!("{NODE_SYSFS_ROOT}/node[0-9]*");
        for entry in glob::glob(&pattern)
            .map_err(|e| Error::Other(e.into()))?
            .filter_map(std::result::Result::ok)
        {
            let node_str = entry.to_string_lossy();
            match sscanf!(node_str.trim(), "/sys/devices/system/node/node{i32}") {
                Ok(id) => node_ids.push(NodeId(id)),
                Err(_) => {
                    return Err(Error::Other(anyhow::anyhow!(
                        "failed to parse node id from {node_str}"
                    )))
                }
            }
        }
        node_ids.sort();

        if node_ids.is_empty() {
            // Directory exists but holds no nodes; treat like a UMA host.
            return Self::detect_uma(allowed);
        }

        // Only nodes with CPUs in our affinity mask belong to the topology;
        // a restricted mask may exclude entire nodes.
        let mut node_cpus = Vec::with_capacity(node_ids.len());
        for &node in &node_ids {
            let cpulist_path = format!("{NODE_SYSFS_ROOT}/node{node}/cpulist");
            let cpulist = fs::read_to_string(&cpulist_path)
                .map_err(|source| Error::TopologyProbeFailed { node, source })?;
            let mut cpus: Vec<CpuId> = parse_cpulist(&cpulist)
                .map_err(|source| Error::TopologyProbeFailed { node, source })?
                .into_iter()
                .map(|id| CpuId(id as i32))
                .filter(|cpu| allowed.binary_search(cpu).is_ok())
                .collect();
            cpus.sort();
            if cpus.is_empty() {
                debug!("node {node} has no CPUs in the affinity mask, excluding it");
                continue;
            }
            node_cpus.push((node, cpus));
        }
        if node_cpus.is_empty() {
            return Err(Error::Other(anyhow::anyhow!(
                "no NUMA node has CPUs in the affinity mask"
            )));
        }

        // The distance file carries one entry per online node; keep only
        // the columns of the nodes we retained.
        let mut distances = Vec::with_capacity(node_cpus.len());
        for (node, _) in &node_cpus {
            let node = *node;
            let distance_path = format!("{NODE_SYSFS_ROOT}/node{node}/distance");
            let distance_row = fs::read_to_string(&distance_path)
                .map_err(|source| Error::TopologyProbeFailed { node, source })?;
            let full_row = parse_distance_row(&distance_row, node_ids.len())
                .map_err(|source| Error::TopologyProbeFailed { node, source })?;
            let mut row = Vec::with_capacity(node_cpus.len());
            for (other, _) in &node_cpus {
                let pos = node_ids
                    .binary_search(other)
                    .map_err(|_| Error::UnknownNode(*other))?;
                row.push(full_row[pos]);
            }
            distances.push(row);
        }

        Self::assemble(node_cpus, distances)
    }

    /// Single-node fallback: node 0 owns every allowed CPU and is its own
    /// closest neighbour.
    fn detect_uma(allowed: Vec<CpuId>) -> Result<Topology> {
        let node = NodeId(0);
        if allowed.is_empty() {
            return Err(Error::TopologyProbeFailed {
                node,
                source: io::Error::new(io::ErrorKind::InvalidData, "no usable CPUs"),
            });
        }
        Self::assemble(vec![(node, allowed)], vec![vec![LOCAL_DISTANCE]])
    }

    /// Build the lookup tables from per-node CPU lists (ascending by node)
    /// and the matching distance rows.
    fn assemble(
        node_cpus: Vec<(NodeId, Vec<CpuId>)>,
        distance_rows: Vec<Vec<usize>>,
    ) -> Result<Topology> {
        let nodes: Vec<NodeId> = node_cpus.iter().map(|(n, _)| *n).collect();
        let mut cpus: Vec<CpuId> = node_cpus
            .iter()
            .flat_map(|(_, cpus)| cpus.iter().copied())
            .collect();
        cpus.sort();
        cpus.dedup();

        let max_node = *nodes.last().ok_or_else(|| {
            Error::Other(anyhow::anyhow!("topology must contain at least one node"))
        })?;
        let max_cpu = *cpus.last().ok_or_else(|| {
            Error::Other(anyhow::anyhow!("topology must contain at least one CPU"))
        })?;

        let node_slots = max_node.index()? + 1;
        let cpu_slots = max_cpu.index()? + 1;

        let mut node_cpu_map = vec![Vec::new(); node_slots];
        let mut cpu_node_map = vec![NodeId(0); cpu_slots];
        for (node, node_cpu_list) in &node_cpus {
            for cpu in node_cpu_list {
                cpu_node_map[cpu.index()?] = *node;
            }
            node_cpu_map[node.index()?] = node_cpu_list.clone();
        }

        let mut distances = vec![vec![0usize; node_slots]; node_slots];
        for ((node, _), row) in node_cpus.iter().zip(&distance_rows) {
            for (other, dist) in nodes.iter().zip(row) {
                distances[node.index()?][other.index()?] = *dist;
            }
        }

        let mut nodes_by_distance = vec![Vec::new(); node_slots];
        for &node in &nodes {
            let node_idx = node.index()?;
            let mut tail: Vec<(usize, NodeId)> = Vec::with_capacity(nodes.len() - 1);
            for &other in &nodes {
                if other != node {
                    tail.push((distances[node_idx][other.index()?], other));
                }
            }
            tail.sort();
            let mut ranked = Vec::with_capacity(nodes.len());
            ranked.push(node);
            ranked.extend(tail.into_iter().map(|(_, other)| other));
            nodes_by_distance[node_idx] = ranked;
        }

        Ok(Topology {
            nodes,
            cpus,
            node_cpu_map,
            cpu_node_map,
            nodes_by_distance,
            distances,
            max_cpu,
            max_node,
        })
    }

    /// CPUs this process may use, ascending and deduplicated.
    pub fn allowed_cpus(&self) -> &[CpuId] {
        &self.cpus
    }

    /// Nodes this process may use, ascending and deduplicated.
    pub fn allowed_nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains_cpu(&self, cpu: CpuId) -> bool {
        self.cpus.binary_search(&cpu).is_ok()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    /// CPUs belonging to `node`, ascending.
    pub fn cpus_from_node(&self, node: NodeId) -> Result<&[CpuId]> {
        if !self.contains_node(node) {
            return Err(Error::UnknownNode(node));
        }
        Ok(&self.node_cpu_map[node.index()?])
    }

    /// The node backing `cpu`.
    pub fn node_from_cpu(&self, cpu: CpuId) -> Result<NodeId> {
        if !self.contains_cpu(cpu) {
            return Err(Error::UnknownCpu(cpu));
        }
        Ok(self.cpu_node_map[cpu.index()?])
    }

    /// All nodes ranked by distance from `node`: `node` itself first, then
    /// ascending distance, ties broken by ascending node id.
    pub fn nodes_by_distance(&self, node: NodeId) -> Result<&[NodeId]> {
        if !self.contains_node(node) {
            return Err(Error::UnknownNode(node));
        }
        Ok(&self.nodes_by_distance[node.index()?])
    }

    /// Kernel-reported distance between two nodes.
    pub fn distance(&self, from: NodeId, to: NodeId) -> Result<usize> {
        if !self.contains_node(from) {
            return Err(Error::UnknownNode(from));
        }
        if !self.contains_node(to) {
            return Err(Error::UnknownNode(to));
        }
        Ok(self.distances[from.index()?][to.index()?])
    }

    /// Largest legal CPU id the system may report; sizes the per-CPU index
    /// arrays.
    pub fn max_cpu(&self) -> CpuId {
        self.max_cpu
    }

    /// Largest legal node id the system may report.
    pub fn max_node(&self) -> NodeId {
        self.max_node
    }
}

/// CPUs the calling process is permitted to run on, from its affinity mask.
fn affinity_cpus() -> Result<Vec<CpuId>> {
    let set = sched_getaffinity(unistd::Pid::from_raw(0))
        .map_err(|e| Error::Other(anyhow::anyhow!("sched_getaffinity failed: {e}")))?;
    let mut cpus = Vec::new();
    for cpu in 0..CpuSet::count() {
        if set.is_set(cpu).unwrap_or(false) {
            cpus.push(CpuId(cpu as i32));
        }
    }
    Ok(cpus)
}

/// Parse the kernel cpulist format: "0-3,8,10-11".
fn parse_cpulist(cpulist: &str) -> io::Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    let mut cpu_ids = Vec::new();
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((lo, hi)) => (lo, hi),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(cpu) => (cpu, cpu),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("failed to parse cpulist group {:?}", group.trim()),
                    ));
                }
            },
        };
        for cpu in min..=max {
            cpu_ids.push(cpu);
        }
    }
    Ok(cpu_ids)
}

/// Parse a node's `distance` file: one space-separated value per node, in
/// ascending node-id order.
fn parse_distance_row(row: &str, nr_nodes: usize) -> io::Result<Vec<usize>> {
    let values: Vec<usize> = row
        .split_whitespace()
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if values.len() != nr_nodes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {nr_nodes} distances, found {}", values.len()),
        ));
    }
    Ok(values)
}
