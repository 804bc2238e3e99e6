//! x86 step-over: execute a relocated copy of the breakpointed instruction.
//!
//! The original instruction is copied to a scratch area, followed by a
//! `jmp rel32` back to its real successor, and the pc is pointed at the copy.
//! Relative branches are re-encoded so they still reach their original
//! targets. The breakpoint byte itself is never fetched.

use super::{StepOverPlan, StepOverStrategy};
use crate::arch::TargetArch;
use crate::control::CoreControl;
use crate::disasm::DisassemblyManager;
use crate::error::Result;
use crate::memory::MemoryManager;

/// Capacity of a relocated instruction sequence.
pub const RELOCATION_CAPACITY: usize = 32;

/// Longest legal x86 instruction, plus one.
const FETCH_LEN: usize = 16;

const JMP_REL32: u8 = 0xe9;
const CALL_REL32: u8 = 0xe8;
const PUSH_IMM32: u8 = 0x68;

/// Segment, operand-size, address-size, lock and rep prefixes.
const LEGACY_PREFIXES: [u8; 11] = [0x26, 0x2e, 0x36, 0x3e, 0x64, 0x65, 0x66, 0x67, 0xf0, 0xf2, 0xf3];

/// A patched instruction followed by a jump back to its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedInstruction {
    bytes: [u8; RELOCATION_CAPACITY],
    len: usize,
}

impl RelocatedInstruction {
    fn new() -> Self {
        Self { bytes: [0; RELOCATION_CAPACITY], len: 0 }
    }

    fn push(&mut self, bytes: &[u8]) -> Option<()> {
        let end = self.len.checked_add(bytes.len()).filter(|&end| end <= RELOCATION_CAPACITY)?;
        self.bytes[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Some(())
    }

    /// Appends `opcode` followed by the rel32 that reaches `target` from the
    /// end of the emitted instruction.
    fn push_branch(&mut self, opcode: &[u8], base: u64, target: u64) -> Option<()> {
        let end = base + (self.len + opcode.len() + 4) as u64;
        let rel = i32::try_from(target as i64 - end as i64).ok()?;
        self.push(opcode)?;
        self.push(&rel.to_le_bytes())
    }

    /// The encoded sequence.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

fn is_relative_branch(opcode: &[u8]) -> bool {
    matches!(opcode, [0xeb | 0xe9 | 0xe8 | 0x70..=0x7f | 0xe0..=0xe3, ..] | [0x0f, 0x80..=0x8f, ..])
}

fn rel8(insn: &[u8], at: usize) -> Option<i64> {
    insn.get(at).map(|&b| b as i8 as i64)
}

fn rel32(insn: &[u8], at: usize) -> Option<i64> {
    let bytes = insn.get(at..at + 4)?;
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64)
}

/// Relocates the instruction `insn`, originally at `pc`, to run at
/// `scratch`. Returns `None` for instructions that cannot be moved (loops,
/// `jecxz`, prefixed branches, branches out of rel32 range).
pub fn relocate(insn: &[u8], pc: u64, scratch: u64) -> Option<RelocatedInstruction> {
    let prefixes = insn.iter().take_while(|&&b| LEGACY_PREFIXES.contains(&b)).count();
    if prefixes > 0 && is_relative_branch(&insn[prefixes..]) {
        // Hints and size overrides change how the displacement is encoded.
        return None;
    }
    let next = pc + insn.len() as u64;
    let target = |rel: i64| (next as i64 + rel) as u64;
    let mut out = RelocatedInstruction::new();

    match *insn.first()? {
        0xeb => out.push_branch(&[JMP_REL32], scratch, target(rel8(insn, 1)?))?,
        JMP_REL32 => out.push_branch(&[JMP_REL32], scratch, target(rel32(insn, 1)?))?,
        CALL_REL32 => {
            // push the real return address, then jump
            out.push(&[PUSH_IMM32])?;
            out.push(&u32::try_from(next).ok()?.to_le_bytes())?;
            out.push_branch(&[JMP_REL32], scratch, target(rel32(insn, 1)?))?;
        }
        cc @ 0x70..=0x7f => out.push_branch(&[0x0f, cc + 0x10], scratch, target(rel8(insn, 1)?))?,
        0x0f if matches!(insn.get(1), Some(0x80..=0x8f)) => {
            out.push_branch(&insn[..2], scratch, target(rel32(insn, 2)?))?
        }
        0xe0..=0xe3 => return None,
        _ => out.push(insn)?,
    }
    out.push_branch(&[JMP_REL32], scratch, next)?;
    Some(out)
}

/// Step-over by instruction relocation into a scratch area.
pub struct X86Relocation {
    scratch: u64,
    disasm: DisassemblyManager,
}

impl X86Relocation {
    /// Relocates into the scratch area at `scratch`.
    pub fn new(scratch: u64) -> Self {
        Self { scratch, disasm: DisassemblyManager::new() }
    }

    /// Address of the scratch area.
    pub fn scratch(&self) -> u64 {
        self.scratch
    }
}

impl StepOverStrategy for X86Relocation {
    fn name(&self) -> &'static str {
        "x86-relocation"
    }

    fn step_over(&mut self, core: &mut dyn CoreControl, pc: u64) -> Result<StepOverPlan> {
        let mut code = [0u8; FETCH_LEN];
        core.mem_read(pc, &mut code)?;
        let insn = match self.disasm.decode_one(TargetArch::X86, &code, pc) {
            Ok(insn) => insn,
            Err(e) => {
                log::warn!("{e:#}; single-stepping instead");
                return Ok(StepOverPlan::SingleStep);
            }
        };
        let Some(relocated) = relocate(&insn.bytes, pc, self.scratch) else {
            log::debug!("'{} {}' at {pc:#010x} cannot be relocated", insn.mnemonic, insn.op_str);
            return Ok(StepOverPlan::SingleStep);
        };
        log::trace!("relocated {:02x?} to {:#010x} as {:02x?}", insn.bytes, self.scratch, relocated.as_bytes());
        core.mem_write(self.scratch, relocated.as_bytes())?;
        MemoryManager::write_pc(core, TargetArch::X86, self.scratch)?;
        Ok(StepOverPlan::Relocated)
    }
}
