// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers for domain identifiers.
//!
//! Newtypes for CPU ids, NUMA node ids, and PIDs prevent silent type
//! confusion between the three integer spaces this crate juggles. All three
//! wrap the kernel's signed representation; conversion to an array index is
//! checked once at the type boundary instead of being cast deep inside
//! callers.

use std::fmt;

use crate::error::Error;

/// Logical CPU identifier, as seen by the kernel's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub i32);

/// NUMA node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub i32);

/// Process or thread identifier. Processes and threads are treated
/// uniformly as schedulable tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl CpuId {
    /// Convert to an array index, rejecting negative ids.
    pub fn index(self) -> Result<usize, Error> {
        checked_index(self.0)
    }
}

impl NodeId {
    /// Convert to an array index, rejecting negative ids.
    pub fn index(self) -> Result<usize, Error> {
        checked_index(self.0)
    }
}

fn checked_index(id: i32) -> Result<usize, Error> {
    if id < 0 {
        return Err(Error::IndexOutOfRange(id));
    }
    Ok(id as usize)
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
