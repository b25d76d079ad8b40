// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Snapshot engine tests against an in-memory process source.
//!
//! The stub source applies pinning calls to its own record set, so commit
//! round-trips can be checked end to end without touching /proc. The
//! randomized tests use seeded parameters so failures reproduce.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use numasnap::{
    CpuId, Error, NodeId, Pid, PinKind, ProcessRecord, ProcessSource, Snapshot, Topology,
};

#[derive(Debug, Clone, PartialEq)]
enum PinCall {
    Cpu(Pid, CpuId),
    Node(Pid, NodeId),
    Unpin(Pid),
}

/// In-memory `ProcessSource`. Pinning mutates the record set the way the
/// kernel would; `update` optionally swaps in the next planned record set.
struct StubSource {
    records: HashMap<Pid, ProcessRecord>,
    cpu_node: HashMap<CpuId, NodeId>,
    node_first_cpu: HashMap<NodeId, CpuId>,
    /// Record sets swapped in by successive `update` calls.
    plan: Vec<Vec<ProcessRecord>>,
    /// Log of pinning calls, shared with the test.
    pins: Rc<RefCell<Vec<PinCall>>>,
    /// PIDs whose next pin fails, shared with the test.
    fail_once: Rc<RefCell<HashSet<Pid>>>,
}

impl StubSource {
    fn new(topo: &Topology, records: Vec<ProcessRecord>) -> StubSource {
        let mut cpu_node = HashMap::new();
        let mut node_first_cpu = HashMap::new();
        for &node in topo.allowed_nodes() {
            let cpus = topo.cpus_from_node(node).unwrap();
            node_first_cpu.insert(node, cpus[0]);
            for &cpu in cpus {
                cpu_node.insert(cpu, node);
            }
        }
        StubSource {
            records: records.into_iter().map(|r| (r.tid, r)).collect(),
            cpu_node,
            node_first_cpu,
            plan: Vec::new(),
            pins: Rc::new(RefCell::new(Vec::new())),
            fail_once: Rc::new(RefCell::new(HashSet::new())),
        }
    }

    fn check_fail(&mut self, pid: Pid) -> io::Result<()> {
        if self.fail_once.borrow_mut().remove(&pid) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected pin failure",
            ));
        }
        Ok(())
    }

    fn place(&mut self, pid: Pid, cpu: CpuId) -> io::Result<()> {
        let node = *self
            .cpu_node
            .get(&cpu)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such cpu"))?;
        let record = self
            .records
            .get_mut(&pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such pid"))?;
        record.processor = cpu;
        record.numa_node = node;
        Ok(())
    }
}

impl ProcessSource for StubSource {
    fn update(&mut self) -> anyhow::Result<()> {
        if !self.plan.is_empty() {
            self.records = self
                .plan
                .remove(0)
                .into_iter()
                .map(|r| (r.tid, r))
                .collect();
        }
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &ProcessRecord> + '_> {
        Box::new(self.records.values())
    }

    fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    fn pin_to_cpu(&mut self, pid: Pid, cpu: CpuId) -> io::Result<()> {
        self.check_fail(pid)?;
        self.place(pid, cpu)?;
        self.pins.borrow_mut().push(PinCall::Cpu(pid, cpu));
        Ok(())
    }

    fn pin_to_node(&mut self, pid: Pid, node: NodeId) -> io::Result<()> {
        self.check_fail(pid)?;
        let cpu = *self
            .node_first_cpu
            .get(&node)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such node"))?;
        self.place(pid, cpu)?;
        self.pins.borrow_mut().push(PinCall::Node(pid, node));
        Ok(())
    }

    fn unpin(&mut self, pid: Pid) -> io::Result<()> {
        self.pins.borrow_mut().push(PinCall::Unpin(pid));
        Ok(())
    }

    fn unpin_all(&mut self) -> io::Result<()> {
        let pids: Vec<Pid> = self.records.keys().copied().collect();
        for pid in pids {
            self.unpin(pid)?;
        }
        Ok(())
    }
}

/// Two nodes with two CPUs each: 0,1 on node 0; 2,3 on node 1.
fn topo_2x2() -> Topology {
    Topology::synthetic(
        vec![
            (NodeId(0), vec![CpuId(0), CpuId(1)]),
            (NodeId(1), vec![CpuId(2), CpuId(3)]),
        ],
        None,
    )
    .unwrap()
}

fn rec(pid: i32, cpu: i32, node: i32, cpu_use: f32) -> ProcessRecord {
    ProcessRecord {
        pid: Pid(pid),
        tid: Pid(pid),
        processor: CpuId(cpu),
        numa_node: NodeId(node),
        cpu_use,
        cmdline: String::new(),
        children_and_tasks: Vec::new(),
    }
}

fn snapshot_2x2(records: Vec<ProcessRecord>) -> Snapshot<StubSource> {
    let topo = topo_2x2();
    let source = StubSource::new(&topo, records);
    Snapshot::with_source(topo, source, SmallRng::seed_from_u64(42)).unwrap()
}

fn pid_set(pids: &[i32]) -> HashSet<Pid> {
    pids.iter().map(|&p| Pid(p)).collect()
}

#[test]
fn single_migration_updates_staged_view_only() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0), rec(101, 0, 0, 30.0)]);

    snap.migrate_to_cpu(Pid(100), CpuId(3)).unwrap();

    assert!(snap.dirty());
    assert_eq!(snap.processor(Pid(100)).unwrap(), CpuId(3));
    assert_eq!(snap.numa_node(Pid(100)).unwrap(), NodeId(1));
    assert_eq!(*snap.pids_in_cpu(CpuId(0)).unwrap(), pid_set(&[101]));
    assert_eq!(*snap.pids_in_cpu(CpuId(3)).unwrap(), pid_set(&[100]));
    assert_eq!(*snap.pids_in_node(NodeId(1)).unwrap(), pid_set(&[100]));

    // The observed view is untouched.
    assert_eq!(snap.original_processor(Pid(100)).unwrap(), CpuId(0));
    assert_eq!(snap.original_numa_node(Pid(100)).unwrap(), NodeId(0));
    assert_eq!(
        *snap.original_pids_in_cpu(CpuId(0)).unwrap(),
        pid_set(&[100, 101])
    );
    assert!((snap.cpu_use(CpuId(0)).unwrap() - 50.0).abs() < f32::EPSILON);
}

#[test]
fn rollback_restores_the_observed_view() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0), rec(101, 0, 0, 30.0)]);
    let pins = snap.processes().pins.clone();

    snap.migrate_to_cpu(Pid(100), CpuId(3)).unwrap();
    snap.migrate_to_cpu(Pid(101), CpuId(2)).unwrap();
    snap.rollback();

    assert!(!snap.dirty());
    assert_eq!(snap.processor(Pid(100)).unwrap(), CpuId(0));
    assert_eq!(snap.processor(Pid(101)).unwrap(), CpuId(0));
    assert_eq!(
        *snap.pids_in_cpu(CpuId(0)).unwrap(),
        pid_set(&[100, 101])
    );
    assert!(snap.pids_in_cpu(CpuId(3)).unwrap().is_empty());
    assert_eq!(*snap.pids_in_node(NodeId(0)).unwrap(), pid_set(&[100, 101]));

    // Nothing is pending, so commit never reaches the kernel.
    snap.commit().unwrap();
    assert!(pins.borrow().is_empty());
}

#[test]
fn commit_pins_and_reobserves() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0), rec(101, 0, 0, 30.0)]);
    let pins = snap.processes().pins.clone();

    snap.migrate_to_cpu(Pid(100), CpuId(3)).unwrap();
    snap.commit().unwrap();

    assert_eq!(*pins.borrow(), vec![PinCall::Cpu(Pid(100), CpuId(3))]);
    assert!(!snap.dirty());

    // The re-observed clean state matches the committed target.
    assert_eq!(snap.original_processor(Pid(100)).unwrap(), CpuId(3));
    assert_eq!(snap.processor(Pid(100)).unwrap(), CpuId(3));
    assert!((snap.cpu_use(CpuId(3)).unwrap() - 20.0).abs() < f32::EPSILON);
    assert!((snap.cpu_use(CpuId(0)).unwrap() - 30.0).abs() < f32::EPSILON);
}

#[test]
fn migrate_to_node_commits_a_node_pin() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0)]);
    let pins = snap.processes().pins.clone();

    snap.migrate_to_node(Pid(100), NodeId(1)).unwrap();

    // Staged placement lands on one of the node's CPUs.
    let staged_cpu = snap.processor(Pid(100)).unwrap();
    assert!([CpuId(2), CpuId(3)].contains(&staged_cpu));
    assert_eq!(snap.numa_node(Pid(100)).unwrap(), NodeId(1));

    snap.commit().unwrap();

    // The kernel sees a node pin, not a CPU pin.
    assert_eq!(*pins.borrow(), vec![PinCall::Node(Pid(100), NodeId(1))]);
    assert_eq!(snap.original_numa_node(Pid(100)).unwrap(), NodeId(1));
}

#[test]
fn renewed_migration_overwrites_the_pending_target() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0)]);
    let pins = snap.processes().pins.clone();

    snap.migrate_to_cpu(Pid(100), CpuId(3)).unwrap();
    snap.migrate_to_node(Pid(100), NodeId(0)).unwrap();
    snap.migrate_to_cpu(Pid(100), CpuId(1)).unwrap();

    // Old placement is always read back from the staged view, so the
    // indices stay self-consistent across re-migrations.
    assert_eq!(snap.processor(Pid(100)).unwrap(), CpuId(1));
    assert_eq!(*snap.pids_in_cpu(CpuId(1)).unwrap(), pid_set(&[100]));
    assert!(snap.pids_in_cpu(CpuId(3)).unwrap().is_empty());
    assert_eq!(*snap.pids_in_node(NodeId(0)).unwrap(), pid_set(&[100]));
    assert!(snap.pids_in_node(NodeId(1)).unwrap().is_empty());

    snap.commit().unwrap();

    // Only the last target reaches the kernel.
    assert_eq!(*pins.borrow(), vec![PinCall::Cpu(Pid(100), CpuId(1))]);
}

#[test]
fn update_refuses_staged_snapshots() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0)]);

    snap.migrate_to_cpu(Pid(100), CpuId(2)).unwrap();
    assert!(matches!(snap.update(), Err(Error::DirtyUpdate)));

    snap.rollback();
    snap.update().unwrap();
}

#[test]
fn unknown_inputs_are_rejected() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0)]);

    assert!(matches!(
        snap.migrate_to_cpu(Pid(999), CpuId(0)),
        Err(Error::UnknownPid(Pid(999)))
    ));
    assert!(matches!(
        snap.migrate_to_cpu(Pid(100), CpuId(9)),
        Err(Error::UnknownCpu(CpuId(9)))
    ));
    assert!(matches!(
        snap.migrate_to_node(Pid(100), NodeId(5)),
        Err(Error::UnknownNode(NodeId(5)))
    ));
    assert!(matches!(
        snap.processor(Pid(1)),
        Err(Error::UnknownPid(Pid(1)))
    ));
    assert!(matches!(
        snap.pids_in_cpu(CpuId(-3)),
        Err(Error::UnknownCpu(CpuId(-3)))
    ));
    assert!(matches!(
        snap.load_of(Pid(7)),
        Err(Error::UnknownPid(Pid(7)))
    ));
}

#[test]
fn failed_commit_keeps_the_unapplied_tail() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 20.0), rec(101, 0, 0, 30.0)]);
    let pins = snap.processes().pins.clone();
    snap.processes().fail_once.borrow_mut().insert(Pid(100));

    snap.migrate_to_cpu(Pid(100), CpuId(2)).unwrap();
    snap.migrate_to_cpu(Pid(101), CpuId(3)).unwrap();

    // PID 100 is pinned first (ascending order) and fails; 101 is never
    // attempted.
    match snap.commit() {
        Err(Error::CommitFailed { pid, kind, .. }) => {
            assert_eq!(pid, Pid(100));
            assert_eq!(kind, PinKind::Cpu);
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert!(snap.dirty());
    assert!(pins.borrow().is_empty());

    // Retrying applies the remaining tail.
    snap.commit().unwrap();
    assert_eq!(
        *pins.borrow(),
        vec![
            PinCall::Cpu(Pid(100), CpuId(2)),
            PinCall::Cpu(Pid(101), CpuId(3))
        ]
    );
    assert_eq!(snap.original_processor(Pid(100)).unwrap(), CpuId(2));
    assert_eq!(snap.original_processor(Pid(101)).unwrap(), CpuId(3));
}

#[test]
fn loads_reflect_observed_state_until_rebuilt() {
    let mut snap = snapshot_2x2(vec![rec(100, 0, 0, 100.0)]);

    // Sole task saturating its CPU: free capacity 0, so the load reads
    // fully against the dominant consumer.
    assert!((snap.load_of(Pid(100)).unwrap() - 1.0).abs() < f32::EPSILON);

    // Staging a move does not recompute loads.
    snap.migrate_to_cpu(Pid(100), CpuId(3)).unwrap();
    assert!((snap.load_of(Pid(100)).unwrap() - 1.0).abs() < f32::EPSILON);
    assert!((snap.load_of_cpu(CpuId(0)).unwrap() - 1.0).abs() < f32::EPSILON);
    assert!((snap.load_system() - 1.0).abs() < f32::EPSILON);
}

#[test]
fn update_tracks_source_changes() {
    let topo = topo_2x2();
    let mut source = StubSource::new(&topo, vec![rec(100, 0, 0, 20.0)]);
    source.plan = vec![vec![rec(100, 2, 1, 40.0), rec(200, 1, 0, 10.0)]];
    let mut snap = Snapshot::with_source(topo, source, SmallRng::seed_from_u64(7)).unwrap();

    snap.update().unwrap();

    assert_eq!(snap.processor(Pid(100)).unwrap(), CpuId(2));
    assert_eq!(snap.original_processor(Pid(100)).unwrap(), CpuId(2));
    assert_eq!(snap.numa_node(Pid(100)).unwrap(), NodeId(1));
    assert_eq!(*snap.pids_in_cpu(CpuId(1)).unwrap(), pid_set(&[200]));
    assert!((snap.node_use(NodeId(1)).unwrap() - 40.0).abs() < f32::EPSILON);
    // The previous placement is gone from every index.
    assert!(snap.pids_in_cpu(CpuId(0)).unwrap().is_empty());
}

/// Rebuild round-trip and aggregate consistency over randomized record
/// sets: every observed task is found through both the CPU and node
/// indices, in both views, and the per-CPU use sums match the records.
#[test]
fn randomized_rebuild_keeps_indices_consistent() {
    let topo = Topology::synthetic(
        vec![
            (NodeId(0), vec![CpuId(0), CpuId(1), CpuId(2), CpuId(3)]),
            (NodeId(1), vec![CpuId(4), CpuId(5), CpuId(6), CpuId(7)]),
        ],
        None,
    )
    .unwrap();
    let mut rng = SmallRng::seed_from_u64(0xda7a);

    for _ in 0..20 {
        let nr_tasks = rng.gen_range(1..40);
        let records: Vec<ProcessRecord> = (0..nr_tasks)
            .map(|i| {
                let cpus = topo.allowed_cpus();
                let cpu = cpus[rng.gen_range(0..cpus.len())];
                let node = topo.node_from_cpu(cpu).unwrap();
                rec(100 + i, cpu.0, node.0, rng.gen_range(0.0f32..50.0))
            })
            .collect();

        let source = StubSource::new(&topo, records.clone());
        let snap =
            Snapshot::with_source(topo.clone(), source, SmallRng::seed_from_u64(1)).unwrap();

        for record in &records {
            let pid = record.tid;
            assert_eq!(snap.processor(pid).unwrap(), record.processor);
            assert_eq!(snap.original_processor(pid).unwrap(), record.processor);
            assert!(snap.pids_in_cpu(record.processor).unwrap().contains(&pid));
            assert!(snap
                .original_pids_in_cpu(record.processor)
                .unwrap()
                .contains(&pid));
            assert!(snap.pids_in_node(record.numa_node).unwrap().contains(&pid));
            assert!(snap
                .original_pids_in_node(record.numa_node)
                .unwrap()
                .contains(&pid));

            let load = snap.load_of(pid).unwrap();
            assert!((0.0..=1.0).contains(&load));
        }

        let total_use: f32 = records.iter().map(|r| r.cpu_use).sum();
        let indexed_use: f32 = topo
            .allowed_cpus()
            .iter()
            .map(|&cpu| snap.cpu_use(cpu).unwrap())
            .sum();
        assert!((total_use - indexed_use).abs() < 0.01);

        for &cpu in topo.allowed_cpus() {
            let nr_on_cpu = snap.original_pids_in_cpu(cpu).unwrap().len() as f32;
            assert!(snap.load_of_cpu(cpu).unwrap() <= nr_on_cpu);
        }
    }
}

/// Randomized stage/rollback sequences always return to the observed view.
#[test]
fn randomized_rollback_is_lossless() {
    let topo = topo_2x2();
    let mut rng = SmallRng::seed_from_u64(0xb0b);

    let records: Vec<ProcessRecord> = (0..12)
        .map(|i| {
            let cpus = topo.allowed_cpus();
            let cpu = cpus[rng.gen_range(0..cpus.len())];
            let node = topo.node_from_cpu(cpu).unwrap();
            rec(500 + i, cpu.0, node.0, rng.gen_range(0.0f32..30.0))
        })
        .collect();
    let source = StubSource::new(&topo, records.clone());
    let mut snap =
        Snapshot::with_source(topo.clone(), source, SmallRng::seed_from_u64(2)).unwrap();

    for _ in 0..50 {
        let record = &records[rng.gen_range(0..records.len())];
        if rng.gen_bool(0.5) {
            let cpus = topo.allowed_cpus();
            let cpu = cpus[rng.gen_range(0..cpus.len())];
            snap.migrate_to_cpu(record.tid, cpu).unwrap();
        } else {
            let nodes = topo.allowed_nodes();
            let node = nodes[rng.gen_range(0..nodes.len())];
            snap.migrate_to_node(record.tid, node).unwrap();
        }
    }

    snap.rollback();

    assert!(!snap.dirty());
    for record in &records {
        assert_eq!(snap.processor(record.tid).unwrap(), record.processor);
        assert_eq!(snap.numa_node(record.tid).unwrap(), record.numa_node);
        assert!(snap.pids_in_cpu(record.processor).unwrap().contains(&record.tid));
    }
}
