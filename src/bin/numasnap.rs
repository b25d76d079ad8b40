// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use numasnap::{ProcessSource, Snapshot};

/// numasnap: periodically snapshot the host's NUMA/CPU placement.
///
/// Every tick the snapshot is refreshed from /proc and the per-node and
/// per-CPU occupancy, CPU use, and estimated load are logged. With
/// --migrate, each tick also stages a migration of the busiest task onto a
/// random CPU and commits it, exercising the full stage/commit path.
#[derive(Debug, Parser)]
struct Opts {
    /// Refresh interval in seconds.
    #[clap(short = 's', long, default_value = "1.0")]
    interval: f64,

    /// Total runtime in seconds.
    #[clap(short, long, default_value = "30.0")]
    time: f64,

    /// Migrate the busiest task to a random CPU on every tick.
    #[clap(short, long)]
    migrate: bool,

    /// Seed for the migration RNG; random when omitted.
    #[clap(long)]
    seed: Option<u64>,

    /// Increase verbosity (-v: debug, -vv: trace).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn show_node_state(snap: &Snapshot) -> Result<()> {
    for &node in snap.topology().allowed_nodes() {
        let mut pids: Vec<_> = snap.pids_in_node(node)?.iter().copied().collect();
        pids.sort();
        info!(
            "node {node}: {} tasks -> {:.2}% use, load {:.2}",
            pids.len(),
            snap.node_use(node)?,
            snap.load_of_node(node)?,
        );
        debug!("  pids: {pids:?}");
    }
    Ok(())
}

fn show_cpu_state(snap: &Snapshot) -> Result<()> {
    for &cpu in snap.topology().allowed_cpus() {
        debug!(
            "cpu {cpu}: {} tasks -> {:.2}% use, load {:.2}",
            snap.pids_in_cpu(cpu)?.len(),
            snap.cpu_use(cpu)?,
            snap.load_of_cpu(cpu)?,
        );
    }
    Ok(())
}

/// Stage the busiest task onto a random CPU and commit.
fn migrate_busiest(snap: &mut Snapshot, rng: &mut SmallRng) -> Result<()> {
    let busiest = snap
        .processes()
        .iter()
        .max_by(|a, b| a.cpu_use.total_cmp(&b.cpu_use))
        .map(|record| record.tid);
    let Some(pid) = busiest else {
        return Ok(());
    };

    let cpus = snap.topology().allowed_cpus();
    let cpu = cpus[rng.gen_range(0..cpus.len())];

    info!("migrating PID {pid} to CPU {cpu}");
    snap.migrate_to_cpu(pid, cpu)?;
    snap.commit()?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let mut snap = Snapshot::new().context("failed to build snapshot")?;
    let mut rng = match opts.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };

    let topo = snap.topology();
    info!(
        "detected {} CPUs across {} nodes",
        topo.allowed_cpus().len(),
        topo.allowed_nodes().len()
    );

    let start = Instant::now();
    while start.elapsed().as_secs_f64() < opts.time {
        sleep(Duration::from_secs_f64(opts.interval));

        let tick = Instant::now();
        snap.update()?;
        debug!("snapshot update took {:?}", tick.elapsed());

        show_node_state(&snap)?;
        show_cpu_state(&snap)?;

        if opts.migrate {
            migrate_busiest(&mut snap, &mut rng)?;
        }
    }

    Ok(())
}
