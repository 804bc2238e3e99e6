//! ARM7TDMI step-over and halt classification using the EmbeddedICE units.
//!
//! First-generation EmbeddedICE reports a breakpoint hit and a debug request
//! the same way. The engine remembers whether it asked for a halt and checks
//! the known breakpoints first; when both apply the result is a guess.
//!
//! To leave a breakpointed address, one of the two comparator units is put
//! in mismatch mode on that address: the core halts on the first fetch from
//! anywhere else, i.e. after exactly one instruction.

use super::{BreakpointTable, HaltReason, StepOverPlan, StepOverStrategy};
use crate::control::CoreControl;
use crate::error::{Error, Result, StatusCode};

/// Number of EmbeddedICE comparator units.
pub const EICE_UNITS: usize = 2;

/// `[EICE_PROGRAM, unit, kind, address, address_mask, data_mask]`; kind is
/// 0 for a breakpoint, 1 for a watchpoint.
pub const EICE_PROGRAM: u64 = 0x4549_0001;
/// `[EICE_ARM_MISMATCH, unit, address]`
pub const EICE_ARM_MISMATCH: u64 = 0x4549_0002;
/// `[EICE_CLEAR, unit]`
pub const EICE_CLEAR: u64 = 0x4549_0003;

/// What an EmbeddedICE unit is programmed to catch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EiceKind {
    /// Instruction fetch.
    #[default]
    Breakpoint,
    /// Data access.
    Watchpoint,
}

/// Engine-side view of one EmbeddedICE comparator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EiceUnit {
    /// Claimed by a breakpoint, watchpoint or step-over.
    pub in_use: bool,
    /// What the unit catches.
    pub kind: EiceKind,
    /// Compared address.
    pub address: u64,
    /// Bits ignored in the address comparison.
    pub address_mask: u64,
    /// Bits ignored in the data comparison.
    pub data_mask: u64,
}

impl EiceUnit {
    fn matches(&self, address: u64) -> bool {
        address & !self.address_mask == self.address & !self.address_mask
    }
}

/// EmbeddedICE resource bookkeeping plus the step-over strategy built on it.
#[derive(Debug, Default)]
pub struct Arm7Eice {
    units: [EiceUnit; EICE_UNITS],
    /// A halt request is outstanding.
    debug_request: bool,
    /// Unit armed in mismatch mode for the step in flight.
    stepping_unit: Option<usize>,
}

impl Arm7Eice {
    /// Both units free.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unit assignments.
    pub fn units(&self) -> &[EiceUnit] {
        &self.units
    }

    fn free_unit(&self) -> Option<usize> {
        self.units.iter().position(|unit| !unit.in_use)
    }

    fn claim(&mut self, core: &mut dyn CoreControl, unit: EiceUnit) -> Result<usize> {
        let index = self
            .free_unit()
            .ok_or(Error::core("claim eice unit", Some(unit.address), StatusCode::CantSetHwBkpt))?;
        let kind = match unit.kind {
            EiceKind::Breakpoint => 0,
            EiceKind::Watchpoint => 1,
        };
        core.io_ctl(&[EICE_PROGRAM, index as u64, kind, unit.address, unit.address_mask, unit.data_mask])?;
        self.units[index] = EiceUnit { in_use: true, ..unit };
        log::debug!("eice unit {index} claimed: {:?} at {:#010x}", unit.kind, unit.address);
        Ok(index)
    }

    /// Programs a free unit as a hardware breakpoint.
    pub fn claim_breakpoint(&mut self, core: &mut dyn CoreControl, address: u64) -> Result<usize> {
        let unit = EiceUnit { kind: EiceKind::Breakpoint, address, ..EiceUnit::default() };
        self.claim(core, unit)
    }

    /// Programs a free unit as a data watchpoint.
    pub fn claim_watchpoint(
        &mut self,
        core: &mut dyn CoreControl,
        address: u64,
        address_mask: u64,
        data_mask: u64,
    ) -> Result<usize> {
        let unit = EiceUnit { kind: EiceKind::Watchpoint, address, address_mask, data_mask, in_use: false };
        self.claim(core, unit)
    }

    /// Frees unit `index`, also when the core cannot be told about it.
    pub fn release(&mut self, core: &mut dyn CoreControl, index: usize) -> Result<()> {
        self.units[index] = EiceUnit::default();
        core.io_ctl(&[EICE_CLEAR, index as u64])?;
        log::debug!("eice unit {index} released");
        Ok(())
    }
}

impl StepOverStrategy for Arm7Eice {
    fn name(&self) -> &'static str {
        "arm7-eice"
    }

    fn step_over(&mut self, core: &mut dyn CoreControl, pc: u64) -> Result<StepOverPlan> {
        let Some(index) = self.free_unit() else {
            log::debug!("no free eice unit, single-stepping off {pc:#010x}");
            return Ok(StepOverPlan::SingleStep);
        };
        core.io_ctl(&[EICE_ARM_MISMATCH, index as u64, pc])?;
        self.units[index] = EiceUnit { in_use: true, kind: EiceKind::Breakpoint, address: pc, ..EiceUnit::default() };
        self.stepping_unit = Some(index);
        Ok(StepOverPlan::RunArmed)
    }

    fn finish_step_over(&mut self, core: &mut dyn CoreControl) -> Result<()> {
        match self.stepping_unit.take() {
            Some(index) => self.release(core, index),
            None => Ok(()),
        }
    }

    fn note_halt_request(&mut self) {
        self.debug_request = true;
    }

    fn classify_halt(&mut self, pc: u64, table: &BreakpointTable, halt_requested: bool) -> HaltReason {
        let requested = std::mem::take(&mut self.debug_request) || halt_requested;
        let hardware_hit = self
            .units
            .iter()
            .any(|unit| unit.in_use && unit.kind == EiceKind::Breakpoint && unit.matches(pc));
        if table.find(pc).is_some() || hardware_hit {
            if requested {
                log::warn!("bad luck sensed: halt at breakpoint {pc:#010x} while a halt request was pending");
            }
            return HaltReason::Breakpoint;
        }
        if requested {
            return HaltReason::DebugRequest;
        }
        if self.units.iter().any(|unit| unit.in_use && unit.kind == EiceKind::Watchpoint) {
            return HaltReason::Watchpoint;
        }
        HaltReason::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TargetArch;
    use crate::sim::{EiceMode, SimCore};

    fn core() -> SimCore {
        let mut core = SimCore::new(TargetArch::Arm7);
        core.open().unwrap();
        core
    }

    #[test]
    fn test_units_are_claimed_and_released() {
        let mut core = core();
        let mut eice = Arm7Eice::new();
        let bp = eice.claim_breakpoint(&mut core, 0x100).unwrap();
        let wp = eice.claim_watchpoint(&mut core, 0x2000, 0x3, 0).unwrap();
        assert_eq!((bp, wp), (0, 1));
        assert_eq!(core.eice_unit(1).mode, EiceMode::Watchpoint);

        let err = eice.claim_breakpoint(&mut core, 0x200).unwrap_err();
        assert_eq!(err.status(), StatusCode::CantSetHwBkpt);

        eice.release(&mut core, bp).unwrap();
        assert_eq!(core.eice_unit(0).mode, EiceMode::Off);
        assert!(!eice.units()[0].in_use);
    }

    #[test]
    fn test_step_over_falls_back_without_free_unit() {
        let mut core = core();
        let mut eice = Arm7Eice::new();
        eice.claim_breakpoint(&mut core, 0x100).unwrap();
        eice.claim_breakpoint(&mut core, 0x200).unwrap();
        assert_eq!(eice.step_over(&mut core, 0x300).unwrap(), StepOverPlan::SingleStep);
    }

    #[test]
    fn test_step_over_unit_is_freed_when_the_core_is_gone() {
        let mut core = core();
        let mut eice = Arm7Eice::new();
        assert_eq!(eice.step_over(&mut core, 0x40).unwrap(), StepOverPlan::RunArmed);
        assert!(eice.units()[0].in_use);
        core.close().unwrap();
        assert!(eice.finish_step_over(&mut core).is_err());
        assert!(eice.units().iter().all(|unit| !unit.in_use));
    }

    #[test]
    fn test_breakpoint_wins_over_debug_request() {
        let mut table = BreakpointTable::new();
        table.insert(0x100).unwrap();
        let mut eice = Arm7Eice::new();

        eice.note_halt_request();
        assert_eq!(eice.classify_halt(0x100, &table, false), HaltReason::Breakpoint);
        // The request was consumed by the ambiguous halt.
        assert_eq!(eice.classify_halt(0x104, &table, false), HaltReason::Unknown);
        eice.note_halt_request();
        assert_eq!(eice.classify_halt(0x104, &table, false), HaltReason::DebugRequest);
    }

    #[test]
    fn test_watchpoint_classification() {
        let mut core = core();
        let mut eice = Arm7Eice::new();
        eice.claim_watchpoint(&mut core, 0x2000, 0, 0).unwrap();
        let table = BreakpointTable::new();
        assert_eq!(eice.classify_halt(0x180, &table, false), HaltReason::Watchpoint);
    }
}
