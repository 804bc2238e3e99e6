//! The Core Control capability set.
//!
//! Every backend (the socket protocol [`Session`](crate::Session), the
//! in-process [`SimCore`](crate::sim::SimCore), the probe-rs hardware core)
//! and the [`StepCoordinator`](crate::StepCoordinator) wrapping them expose
//! the same operations through [`CoreControl`].

use crate::error::Result;
use crate::state::{Observer, ObserverHandle, TargetState};
use std::fmt;

/// Selects a subset of the fixed register set. Values travel in
/// least-significant-bit-first order among the set bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegisterMask(u32);

impl RegisterMask {
    /// A mask from raw bits.
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// A mask selecting register `index` only.
    pub const fn single(index: usize) -> Self {
        Self(1 << index)
    }

    /// A mask selecting every listed register.
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        Self(indices.into_iter().fold(0, |bits, index| bits | 1 << index))
    }

    /// The raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Number of selected registers.
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether register `index` is selected.
    pub const fn contains(self, index: usize) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    /// Indices of the selected registers, lowest first.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |&index| self.contains(index))
    }
}

impl fmt::LowerHex for RegisterMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Operations every target core backend provides.
///
/// All calls are synchronous: a request is issued and its outcome awaited
/// before the call returns.
pub trait CoreControl {
    /// Whether the backend can currently reach the core.
    fn is_connected(&self) -> bool;

    /// Connects if needed and brings the core under debug control.
    fn open(&mut self) -> Result<()>;

    /// Releases the core. Observers are not notified.
    fn close(&mut self) -> Result<()>;

    /// Fills `buf` from target memory at `address`.
    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` to target memory at `address`.
    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()>;

    /// Reads the registers selected by `mask`, lowest index first.
    fn reg_read(&mut self, mask: RegisterMask) -> Result<Vec<u64>>;

    /// Writes one value per register selected by `mask`, lowest index first.
    fn reg_write(&mut self, mask: RegisterMask, values: &[u64]) -> Result<()>;

    /// Reads a coprocessor register.
    fn cop_read(&mut self, coprocessor: u32, register: u32) -> Result<u64>;

    /// Writes a coprocessor register.
    fn cop_write(&mut self, coprocessor: u32, register: u32, value: u64) -> Result<()>;

    /// Sets a breakpoint at `address`.
    fn set_break(&mut self, address: u64) -> Result<()>;

    /// Removes the breakpoint at `address`.
    fn clear_break(&mut self, address: u64) -> Result<()>;

    /// Lets the core run.
    fn run(&mut self) -> Result<()>;

    /// Asks a running core to stop.
    fn halt(&mut self) -> Result<()>;

    /// Executes a single instruction.
    fn insn_step(&mut self) -> Result<()>;

    /// Backend-specific request; returns the reply words.
    fn io_ctl(&mut self, request: &[u64]) -> Result<Vec<u64>>;

    /// Polls the core and returns its state.
    fn get_status(&mut self) -> Result<TargetState>;

    /// Pushes an observer for state transitions.
    fn register_state_change_callback(&mut self, observer: Observer) -> ObserverHandle;

    /// Pops the observer registered as `handle`.
    fn unregister_state_change_callback(&mut self, handle: ObserverHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_order_is_lsb_first() {
        let mask = RegisterMask::from_indices([15, 0, 3]);
        assert_eq!(mask.bits(), 0x8009);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![0, 3, 15]);
        assert_eq!(mask.count(), 3);
        assert!(!mask.contains(40));
        assert_eq!(format!("{mask:#x}"), "0x8009");
    }
}
