// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-task load estimation.
//!
//! Every task on a CPU gets a load value in `[0, 1]` derived from its CPU
//! use percentage. Two interpretations are blended: use relative to the
//! CPU's free capacity, and use relative to the CPU's dominant consumer.
//! A sigmoid weight over the free capacity picks the mix, so the estimate
//! stays meaningful on both idle and saturated CPUs without a hard
//! threshold: an under-utilized CPU reads loads against its headroom, a
//! saturated one reads them against whoever is eating it.
//!
//! All math is `f32`, matching the percent granularity of the scraper.

use lazy_static::lazy_static;

use crate::types::Pid;

/// Sigmoid steepness.
const BETA: f32 = 3.0;

lazy_static! {
    /// weight(i / 100) for i in 0..=100, so the per-CPU blend factor is a
    /// table lookup on the rounded free-capacity percentage.
    static ref WEIGHT_TABLE: [f32; 101] = {
        let mut table = [0.0f32; 101];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = weight(i as f32 / 100.0);
        }
        table
    };
}

/// S-shaped weight on `[0, 1]`.
///
/// The epsilon guards are required: the power-of-ratio form diverges on the
/// exact endpoints.
pub fn weight(x: f32) -> f32 {
    if x < f32::EPSILON {
        return 0.0;
    }
    if x > 1.0 - f32::EPSILON {
        return 1.0;
    }
    1.0 / (1.0 + (x / (1.0 - x)).powf(-BETA))
}

/// `min(1, use / slice)`, with 0/0 = 0.
fn slice_load(cpu_use: f32, slice: f32) -> f32 {
    if cpu_use <= 0.0 {
        return 0.0;
    }
    (cpu_use / slice).min(1.0)
}

/// Estimate the load of every task on one CPU.
///
/// `usage` holds `(pid, cpu_use_percent)` pairs for the tasks currently on
/// the CPU; percentages are on the 0..=100 scale where 100 is one full CPU.
/// Returns the same pairs with the use replaced by a load in `[0, 1]`.
/// An empty slice yields an empty result (the dominant consumer is
/// undefined on an idle CPU).
pub fn task_loads(usage: &[(Pid, f32)]) -> Vec<(Pid, f32)> {
    if usage.is_empty() {
        return Vec::new();
    }

    let total: f32 = usage.iter().map(|(_, u)| u).sum();
    let free = (100.0 - total).clamp(0.0, 100.0);
    let max_use = usage.iter().map(|&(_, u)| u).fold(0.0f32, f32::max);

    let alpha = WEIGHT_TABLE[free.round() as usize];
    let beta = 1.0 - alpha;

    usage
        .iter()
        .map(|&(pid, u)| {
            let vs_free = slice_load(u, free);
            let vs_max = slice_load(u, max_use);
            (pid, (alpha * vs_free + beta * vs_max).clamp(0.0, 1.0))
        })
        .collect()
}
