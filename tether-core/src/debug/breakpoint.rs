//! Breakpoint bookkeeping.
//!
//! The table never touches the target. Physical installation is done by the
//! [`StepCoordinator`](super::StepCoordinator) right before the core resumes.

use serde::{Deserialize, Serialize};

/// A breakpoint known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Address the breakpoint is set at.
    pub address: u64,
}

/// Insertion failed because the address already carries a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyPresent(pub u64);

/// Removal failed because the address carries no breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFound(pub u64);

impl From<AlreadyPresent> for crate::Error {
    fn from(AlreadyPresent(address): AlreadyPresent) -> Self {
        crate::Error::BreakpointAlreadySet(address)
    }
}

impl From<NotFound> for crate::Error {
    fn from(NotFound(address): NotFound) -> Self {
        crate::Error::BreakpointNotFound(address)
    }
}

/// Breakpoints ordered by address, at most one per address.
#[derive(Debug, Default, Clone)]
pub struct BreakpointTable {
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointTable {
    /// An empty table.
    pub fn new() -> Self {
        Self { breakpoints: Vec::new() }
    }

    /// Inserts a breakpoint, keeping the table sorted.
    pub fn insert(&mut self, address: u64) -> Result<&Breakpoint, AlreadyPresent> {
        let index = self
            .breakpoints
            .iter()
            .position(|bp| bp.address >= address)
            .unwrap_or(self.breakpoints.len());
        if self.breakpoints.get(index).is_some_and(|bp| bp.address == address) {
            return Err(AlreadyPresent(address));
        }
        self.breakpoints.insert(index, Breakpoint { address });
        Ok(&self.breakpoints[index])
    }

    /// Removes the breakpoint at `address`.
    pub fn remove(&mut self, address: u64) -> Result<(), NotFound> {
        let index = self
            .breakpoints
            .iter()
            .position(|bp| bp.address == address)
            .ok_or(NotFound(address))?;
        self.breakpoints.remove(index);
        Ok(())
    }

    /// The breakpoint at `address`, if any.
    pub fn find(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.address == address)
    }

    /// Breakpoint addresses in ascending order.
    pub fn list(&self) -> Vec<u64> {
        self.breakpoints.iter().map(|bp| bp.address).collect()
    }

    /// Breakpoints in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Number of breakpoints.
    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}
