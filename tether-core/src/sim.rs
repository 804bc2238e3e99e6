//! In-process simulated target core.
//!
//! `SimCore` implements [`CoreControl`] on top of a flat memory array and a
//! toy instruction set per architecture family. It backs the daemon's mock
//! mode and most integration tests.
//!
//! Execution is lazy: `run` only marks the core running, instructions are
//! executed when the state is polled (or a halt is requested), at most
//! [`FUEL_PER_POLL`] per poll.
//!
//! x86 subset: `cc` (int3 trap), `90` nop, `eb` jmp rel8, `e9` jmp rel32,
//! `7x`/`0f 8x` jcc (only je/jne consult ZF), `e8` call rel32, `c3` ret,
//! `68` push imm32, `b8+r` mov r32, imm32. Any other byte executes as a one-byte
//! no-op.
//!
//! ARM7 subset: `0xe7ffdefe` (undefined, used as breakpoint), `b`/`bl`,
//! `mov rd, #imm`. Everything else advances the pc by four.

use crate::arch::TargetArch;
use crate::control::{CoreControl, RegisterMask};
use crate::debug::arm7::{EICE_ARM_MISMATCH, EICE_CLEAR, EICE_PROGRAM, EICE_UNITS};
use crate::error::{Error, Result, StatusCode};
use crate::state::{Observer, ObserverHandle, TargetState, TargetStateMachine};
use std::collections::{BTreeMap, HashMap};

/// Size of the simulated address space.
pub const SIM_MEMORY_SIZE: usize = 0x1_0000;

/// Instructions executed per state poll before the core reports it is
/// still running.
pub const FUEL_PER_POLL: usize = 10_000;

const X86_ZF: u64 = 1 << 6;

/// Only `je`/`jne` look at the flags; other conditions are never taken.
fn jcc_taken(condition: u8, zf: bool) -> bool {
    match condition {
        0x4 => zf,
        0x5 => !zf,
        _ => false,
    }
}

/// Why the simulated core last stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Fetched a software breakpoint pattern.
    Breakpoint,
    /// An EICE unit matched (breakpoint or mismatch mode).
    EiceUnit(usize),
    /// Halted on request while running.
    DebugRequest,
    /// A single step finished.
    StepComplete,
    /// The pc left the simulated address space.
    FetchFault,
}

/// Comparison an emulated EICE unit performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EiceMode {
    /// Disabled.
    #[default]
    Off,
    /// Halts on a fetch from a matching address.
    Breakpoint,
    /// Programmed for data accesses; never halts the simulation.
    Watchpoint,
    /// Halts on the first fetch from any address other than `address`.
    Mismatch,
}

/// One emulated EmbeddedICE comparator unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimEiceUnit {
    /// Comparison performed.
    pub mode: EiceMode,
    /// Compared address.
    pub address: u64,
    /// Bits set here are ignored in the address comparison.
    pub address_mask: u64,
    /// Bits ignored in the data comparison.
    pub data_mask: u64,
}

impl SimEiceUnit {
    fn stops_at(&self, pc: u64) -> bool {
        let matches = pc & !self.address_mask == self.address & !self.address_mask;
        match self.mode {
            EiceMode::Breakpoint => matches,
            EiceMode::Mismatch => !matches,
            EiceMode::Off | EiceMode::Watchpoint => false,
        }
    }
}

/// An in-process x86 or ARM7 core with a flat memory and a small
/// instruction subset.
pub struct SimCore {
    arch: TargetArch,
    connected: bool,
    memory: Vec<u8>,
    registers: Vec<u64>,
    coprocessors: HashMap<(u32, u32), u64>,
    machine: TargetStateMachine,
    /// Original bytes under every patched software breakpoint.
    saved: BTreeMap<u64, Vec<u8>>,
    eice: [SimEiceUnit; EICE_UNITS],
    pending_step: bool,
    read_fault_from: Option<u64>,
    break_fault_at: Option<u64>,
    last_stop: Option<StopCause>,
}

impl SimCore {
    /// A closed core of family `arch` with zeroed memory.
    pub fn new(arch: TargetArch) -> Self {
        let mut registers = vec![0; arch.register_count()];
        match arch {
            TargetArch::X86 => registers[4] = 0xe000,
            TargetArch::Arm7 => registers[13] = 0xe000,
        }
        Self {
            arch,
            connected: false,
            memory: vec![0; SIM_MEMORY_SIZE],
            registers,
            coprocessors: HashMap::new(),
            machine: TargetStateMachine::new(),
            saved: BTreeMap::new(),
            eice: [SimEiceUnit::default(); EICE_UNITS],
            pending_step: false,
            read_fault_from: None,
            break_fault_at: None,
            last_stop: None,
        }
    }

    /// Architecture family.
    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    /// Copies `bytes` into memory, bypassing the Core Control checks.
    ///
    /// # Panics
    /// If the range falls outside the simulated address space.
    pub fn load(&mut self, address: u64, bytes: &[u8]) {
        let start = address as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Like [`load`](Self::load), but refuses ranges outside the simulated
    /// address space.
    pub fn try_load(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let range = self.range("load", address, bytes.len())?;
        self.memory[range].copy_from_slice(bytes);
        Ok(())
    }

    /// `len` bytes of memory at `address`.
    pub fn memory(&self, address: u64, len: usize) -> &[u8] {
        let start = address as usize;
        &self.memory[start..start + len]
    }

    /// Current program counter.
    pub fn pc(&self) -> u64 {
        self.registers[self.arch.pc_register()]
    }

    /// Moves the program counter.
    pub fn set_pc(&mut self, pc: u64) {
        let index = self.arch.pc_register();
        self.registers[index] = pc;
    }

    /// Value of register `index`.
    pub fn register(&self, index: usize) -> u64 {
        self.registers[index]
    }

    /// Sets register `index`.
    pub fn set_register(&mut self, index: usize, value: u64) {
        self.registers[index] = value;
    }

    /// Makes every memory read touching `address` or above fail.
    pub fn inject_read_fault(&mut self, from: Option<u64>) {
        self.read_fault_from = from;
    }

    /// Makes setting or clearing a breakpoint at `address` fail with a
    /// target access error.
    pub fn inject_break_fault(&mut self, address: Option<u64>) {
        self.break_fault_at = address;
    }

    fn check_break_fault(&self, operation: &'static str, address: u64) -> Result<()> {
        if self.break_fault_at == Some(address) {
            return Err(Error::Core {
                operation,
                address: Some(address),
                status: StatusCode::TargetAccessError,
                hint: Some(format!("bus fault at {address:#x}")),
            });
        }
        Ok(())
    }

    /// Why the core last stopped, if it has since the last resume.
    pub fn last_stop(&self) -> Option<StopCause> {
        self.last_stop
    }

    /// Programming of EICE unit `index`.
    pub fn eice_unit(&self, index: usize) -> SimEiceUnit {
        self.eice[index]
    }

    /// Whether a software breakpoint is patched in at `address`.
    pub fn has_breakpoint(&self, address: u64) -> bool {
        self.saved.contains_key(&address)
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::dead(operation))
        }
    }

    fn ensure_halted(&self, operation: &'static str) -> Result<()> {
        if self.machine.state().is_running() {
            return Err(Error::core(operation, None, StatusCode::ResourceUnavailableWhileTargetRunning));
        }
        Ok(())
    }

    fn range(&self, operation: &'static str, address: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(address).unwrap_or(usize::MAX);
        match start.checked_add(len) {
            Some(end) if end <= self.memory.len() => Ok(start..end),
            _ => Err(Error::Core {
                operation,
                address: Some(address),
                status: StatusCode::TargetCtlMemReadError,
                hint: Some(format!("outside the {SIM_MEMORY_SIZE:#x}-byte address space")),
            }),
        }
    }

    fn fetch(&self, address: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(address).ok()?;
        self.memory.get(start..start.checked_add(len)?)
    }

    fn read_u32(&self, address: u64) -> Option<u32> {
        let bytes = self.fetch(address, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn at_trap(&self, pc: u64) -> bool {
        let pattern = self.arch.breakpoint_pattern();
        self.fetch(pc, pattern.len()) == Some(pattern)
    }

    /// Executes up to `budget` instructions; returns the cause if the core
    /// stopped.
    fn execute(&mut self, budget: usize) -> Option<StopCause> {
        for _ in 0..budget {
            let pc = self.pc();
            if let Some(unit) = self.eice.iter().position(|unit| unit.stops_at(pc)) {
                return Some(StopCause::EiceUnit(unit));
            }
            if self.at_trap(pc) {
                return Some(StopCause::Breakpoint);
            }
            let next = match self.arch {
                TargetArch::X86 => self.step_x86(pc),
                TargetArch::Arm7 => self.step_arm7(pc),
            };
            match next {
                Some(next) => self.set_pc(next),
                None => return Some(StopCause::FetchFault),
            }
        }
        None
    }

    fn step_x86(&mut self, pc: u64) -> Option<u64> {
        let rel8 = |core: &Self| core.fetch(pc + 1, 1).map(|b| b[0] as i8 as i64);
        let rel32 = |core: &Self, at: u64| core.read_u32(at).map(|v| v as i32 as i64);
        let zf = self.registers[9] & X86_ZF != 0;
        let opcode = self.fetch(pc, 1)?[0];
        let next = match opcode {
            0xeb => (pc as i64 + 2 + rel8(self)?) as u64,
            0xe9 => (pc as i64 + 5 + rel32(self, pc + 1)?) as u64,
            0x70..=0x7f => {
                let offset = if jcc_taken(opcode & 0x0f, zf) { rel8(self)? } else { 0 };
                (pc as i64 + 2 + offset) as u64
            }
            0x0f => match self.fetch(pc + 1, 1)?[0] {
                second @ 0x80..=0x8f => {
                    let offset = if jcc_taken(second & 0x0f, zf) { rel32(self, pc + 2)? } else { 0 };
                    (pc as i64 + 6 + offset) as u64
                }
                _ => pc + 2,
            },
            0x68 => {
                let value = self.read_u32(pc + 1)?;
                self.push32(value)?;
                pc + 5
            }
            0xe8 => {
                let target = (pc as i64 + 5 + rel32(self, pc + 1)?) as u64;
                self.push32((pc + 5) as u32)?;
                target
            }
            0xc3 => {
                let sp = self.registers[4];
                let target = u64::from(self.read_u32(sp)?);
                self.registers[4] = sp + 4;
                target
            }
            0xb8..=0xbf => {
                let value = self.read_u32(pc + 1)?;
                self.registers[usize::from(opcode - 0xb8)] = u64::from(value);
                pc + 5
            }
            _ => pc + 1,
        };
        Some(next)
    }

    fn push32(&mut self, value: u32) -> Option<()> {
        let sp = self.registers[4].wrapping_sub(4);
        let slot = self.range("push", sp, 4).ok()?;
        self.memory[slot].copy_from_slice(&value.to_le_bytes());
        self.registers[4] = sp;
        Some(())
    }

    fn step_arm7(&mut self, pc: u64) -> Option<u64> {
        let word = self.read_u32(pc)?;
        let next = match word & 0x0f00_0000 {
            0x0a00_0000 | 0x0b00_0000 if word >> 28 == 0xe => {
                let offset = ((word << 8) as i32 >> 6) as i64;
                if word & 0x0100_0000 != 0 {
                    self.registers[14] = pc + 4;
                }
                (pc as i64 + 8 + offset) as u64 & 0xffff_ffff
            }
            _ if word & 0x0fe0_0000 == 0x03a0_0000 => {
                let rd = ((word >> 12) & 0xf) as usize;
                let rotate = ((word >> 8) & 0xf) * 2;
                let value = (word & 0xff).rotate_right(rotate);
                if rd == 15 {
                    return Some(u64::from(value));
                }
                self.registers[rd] = u64::from(value);
                pc + 4
            }
            _ => pc + 4,
        };
        Some(next)
    }

    /// Advances a running core and records a stop.
    fn poll(&mut self) {
        if !self.machine.state().is_running() {
            return;
        }
        let stop = if self.pending_step {
            self.pending_step = false;
            Some(self.execute(1).unwrap_or(StopCause::StepComplete))
        } else {
            self.execute(FUEL_PER_POLL)
        };
        if let Some(cause) = stop {
            log::debug!("sim core stopped at {:#x}: {cause:?}", self.pc());
            self.last_stop = Some(cause);
            self.machine.set_silently(TargetState::Halted);
        }
    }

    fn program_eice(&mut self, words: &[u64]) -> Result<Vec<u64>> {
        let bad = || Error::core("io_ctl", None, StatusCode::TargetCtlBadParams);
        let unit = words.get(1).map(|&u| u as usize).filter(|&u| u < EICE_UNITS).ok_or_else(bad)?;
        match (words[0], words.len()) {
            (EICE_PROGRAM, 6) => {
                let mode = match words[2] {
                    0 => EiceMode::Breakpoint,
                    1 => EiceMode::Watchpoint,
                    _ => return Err(bad()),
                };
                self.eice[unit] =
                    SimEiceUnit { mode, address: words[3], address_mask: words[4], data_mask: words[5] };
            }
            (EICE_ARM_MISMATCH, 3) => {
                self.eice[unit] = SimEiceUnit { mode: EiceMode::Mismatch, address: words[2], ..Default::default() };
            }
            (EICE_CLEAR, 2) => self.eice[unit] = SimEiceUnit::default(),
            _ => return Err(bad()),
        }
        log::trace!("sim eice unit {unit}: {:?}", self.eice[unit]);
        Ok(Vec::new())
    }
}

impl CoreControl for SimCore {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn open(&mut self) -> Result<()> {
        self.connected = true;
        let state = if self.machine.state() == TargetState::Dead {
            TargetState::Halted
        } else {
            self.machine.state()
        };
        self.machine.transition(state);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.machine.set_silently(TargetState::Dead);
        Ok(())
    }

    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open("mem_read")?;
        let range = self.range("mem_read", address, buf.len())?;
        if let Some(fault) = self.read_fault_from {
            if address + buf.len() as u64 > fault {
                return Err(Error::Core {
                    operation: "mem_read",
                    address: Some(address),
                    status: StatusCode::TargetCtlMemReadError,
                    hint: Some(format!("bus fault at {fault:#x}")),
                });
            }
        }
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.ensure_open("mem_write")?;
        let range = self.range("mem_write", address, data.len())?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn reg_read(&mut self, mask: RegisterMask) -> Result<Vec<u64>> {
        self.ensure_open("reg_read")?;
        self.ensure_halted("reg_read")?;
        mask.indices()
            .map(|index| {
                self.registers
                    .get(index)
                    .copied()
                    .ok_or(Error::core("reg_read", None, StatusCode::TargetCtlBadParams))
            })
            .collect()
    }

    fn reg_write(&mut self, mask: RegisterMask, values: &[u64]) -> Result<()> {
        self.ensure_open("reg_write")?;
        self.ensure_halted("reg_write")?;
        if values.len() != mask.count() || mask.indices().any(|i| i >= self.registers.len()) {
            return Err(Error::core("reg_write", None, StatusCode::TargetCtlBadParams));
        }
        for (index, &value) in mask.indices().zip(values) {
            self.registers[index] = value;
        }
        Ok(())
    }

    fn cop_read(&mut self, coprocessor: u32, register: u32) -> Result<u64> {
        self.ensure_open("cop_read")?;
        Ok(self.coprocessors.get(&(coprocessor, register)).copied().unwrap_or(0))
    }

    fn cop_write(&mut self, coprocessor: u32, register: u32, value: u64) -> Result<()> {
        self.ensure_open("cop_write")?;
        self.coprocessors.insert((coprocessor, register), value);
        Ok(())
    }

    fn set_break(&mut self, address: u64) -> Result<()> {
        self.ensure_open("set_break")?;
        self.check_break_fault("set_break", address)?;
        if self.saved.contains_key(&address) {
            return Err(Error::core("set_break", Some(address), StatusCode::BkptAlreadySetAtAddr));
        }
        let pattern = self.arch.breakpoint_pattern();
        let range = self.range("set_break", address, pattern.len())?;
        self.saved.insert(address, self.memory[range.clone()].to_vec());
        self.memory[range].copy_from_slice(pattern);
        Ok(())
    }

    fn clear_break(&mut self, address: u64) -> Result<()> {
        self.ensure_open("clear_break")?;
        self.check_break_fault("clear_break", address)?;
        let original = self
            .saved
            .remove(&address)
            .ok_or(Error::core("clear_break", Some(address), StatusCode::TargetCtlBadParams))?;
        self.load(address, &original);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        self.ensure_open("run")?;
        self.last_stop = None;
        self.machine.transition(TargetState::Running);
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        self.ensure_open("halt")?;
        if self.machine.state().is_running() {
            self.poll();
        }
        if self.machine.state().is_running() {
            self.last_stop = Some(StopCause::DebugRequest);
        }
        self.machine.transition(TargetState::Halted);
        Ok(())
    }

    fn insn_step(&mut self) -> Result<()> {
        self.ensure_open("insn_step")?;
        self.ensure_halted("insn_step")?;
        self.pending_step = true;
        self.last_stop = None;
        self.machine.transition(TargetState::Running);
        Ok(())
    }

    fn io_ctl(&mut self, request: &[u64]) -> Result<Vec<u64>> {
        self.ensure_open("io_ctl")?;
        match (self.arch, request.first()) {
            (TargetArch::Arm7, Some(_)) => self.program_eice(request),
            _ => Err(Error::Core {
                operation: "io_ctl",
                address: None,
                status: StatusCode::TargetCtlBadParams,
                hint: Some(format!("no io_ctl commands on {}", self.arch)),
            }),
        }
    }

    fn get_status(&mut self) -> Result<TargetState> {
        self.ensure_open("get_status")?;
        self.poll();
        let state = self.machine.state();
        self.machine.transition(state);
        Ok(state)
    }

    fn register_state_change_callback(&mut self, observer: Observer) -> ObserverHandle {
        self.machine.register(observer)
    }

    fn unregister_state_change_callback(&mut self, handle: ObserverHandle) {
        self.machine.unregister(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(arch: TargetArch) -> SimCore {
        let mut core = SimCore::new(arch);
        core.open().unwrap();
        core
    }

    #[test]
    fn test_breakpoint_patch_round_trip() {
        let mut core = opened(TargetArch::X86);
        core.load(0x100, &[0x90, 0x90]);
        core.set_break(0x101).unwrap();
        assert_eq!(core.memory(0x100, 2), &[0x90, 0xcc]);
        assert_eq!(
            core.set_break(0x101).unwrap_err().status(),
            StatusCode::BkptAlreadySetAtAddr
        );
        core.clear_break(0x101).unwrap();
        assert_eq!(core.memory(0x100, 2), &[0x90, 0x90]);
        assert!(core.clear_break(0x101).is_err());
    }

    #[test]
    fn test_x86_run_stops_on_trap() {
        let mut core = opened(TargetArch::X86);
        // mov eax, 7; jmp +2; nop; nop; int3
        core.load(0, &[0xb8, 7, 0, 0, 0, 0xeb, 0x02, 0x90, 0x90, 0xcc]);
        core.run().unwrap();
        assert_eq!(core.get_status().unwrap(), TargetState::Halted);
        assert_eq!(core.pc(), 9);
        assert_eq!(core.register(0), 7);
        assert_eq!(core.last_stop(), Some(StopCause::Breakpoint));
    }

    #[test]
    fn test_x86_call_and_ret() {
        let mut core = opened(TargetArch::X86);
        // call 0x10; int3 ... 0x10: ret
        core.load(0, &[0xe8, 0x0b, 0, 0, 0, 0xcc]);
        core.load(0x10, &[0xc3]);
        core.run().unwrap();
        core.get_status().unwrap();
        assert_eq!(core.pc(), 5);
        assert_eq!(core.register(4), 0xe000);
    }

    #[test]
    fn test_step_executes_one_instruction() {
        let mut core = opened(TargetArch::X86);
        core.load(0, &[0x90, 0x90]);
        core.insn_step().unwrap();
        assert_eq!(core.reg_read(RegisterMask::single(8)).unwrap_err().status(),
            StatusCode::ResourceUnavailableWhileTargetRunning);
        assert_eq!(core.get_status().unwrap(), TargetState::Halted);
        assert_eq!(core.pc(), 1);
        assert_eq!(core.last_stop(), Some(StopCause::StepComplete));
    }

    #[test]
    fn test_free_running_until_halt() {
        let mut core = opened(TargetArch::X86);
        core.load(0x20, &[0xeb, 0xfe]);
        core.set_pc(0x20);
        core.run().unwrap();
        assert_eq!(core.get_status().unwrap(), TargetState::Running);
        core.halt().unwrap();
        assert_eq!(core.last_stop(), Some(StopCause::DebugRequest));
        assert_eq!(core.pc(), 0x20);
    }

    #[test]
    fn test_arm7_branch_and_mismatch_unit() {
        let mut core = opened(TargetArch::Arm7);
        // 0x100: b 0x200
        core.load(0x100, &0xea00_003eu32.to_le_bytes());
        core.load(0x200, &0xe3a0_0005u32.to_le_bytes());
        core.set_pc(0x100);
        core.io_ctl(&[EICE_ARM_MISMATCH, 1, 0x100]).unwrap();
        core.run().unwrap();
        core.get_status().unwrap();
        assert_eq!(core.pc(), 0x200);
        assert_eq!(core.last_stop(), Some(StopCause::EiceUnit(1)));

        core.io_ctl(&[EICE_CLEAR, 1]).unwrap();
        core.insn_step().unwrap();
        core.get_status().unwrap();
        assert_eq!(core.register(0), 5);
        assert_eq!(core.pc(), 0x204);
    }

    #[test]
    fn test_read_fault_injection() {
        let mut core = opened(TargetArch::X86);
        core.inject_read_fault(Some(0x80));
        let mut buf = [0u8; 0x40];
        core.mem_read(0x40, &mut buf).unwrap();
        assert_eq!(core.mem_read(0x60, &mut buf).unwrap_err().status(), StatusCode::TargetCtlMemReadError);
    }

    #[test]
    fn test_try_load_checks_the_address_space() {
        let mut core = SimCore::new(TargetArch::X86);
        core.try_load(0x10, &[1, 2]).unwrap();
        assert_eq!(core.memory(0x10, 2), &[1, 2]);
        let end = SIM_MEMORY_SIZE as u64;
        assert!(core.try_load(end - 1, &[1, 2]).is_err());
        assert!(core.try_load(u64::MAX, &[1]).is_err());
        assert!(core.try_load(end - 2, &[3, 4]).is_ok());
    }

    #[test]
    fn test_break_fault_injection() {
        let mut core = opened(TargetArch::X86);
        core.inject_break_fault(Some(0x20));
        let err = core.set_break(0x20).unwrap_err();
        assert_eq!(err.status(), StatusCode::TargetAccessError);
        assert!(!core.has_breakpoint(0x20));
        core.set_break(0x21).unwrap();
        core.inject_break_fault(None);
        core.set_break(0x20).unwrap();
    }

    #[test]
    fn test_closed_core_is_dead() {
        let mut core = SimCore::new(TargetArch::X86);
        assert_eq!(core.get_status().unwrap_err().status(), StatusCode::TargetCoreDead);
        core.open().unwrap();
        core.close().unwrap();
        assert!(core.run().is_err());
    }
}
