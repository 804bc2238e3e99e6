//! Disassembly module.
//!
//! Handles instruction decoding using Capstone. The x86 step-over strategy
//! relies on [`DisassemblyManager::decode_one`] to learn the length of the
//! instruction it relocates.

use crate::arch::TargetArch;
use anyhow::{anyhow, Result};
use capstone::prelude::*;

/// Manager for disassembly operations.
pub struct DisassemblyManager;

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct InstructionInfo {
    /// Address the instruction was decoded at.
    pub address: u64,
    /// Instruction mnemonic, e.g. `jmp`.
    pub mnemonic: String,
    /// Operands as text.
    pub op_str: String,
    /// Encoded instruction bytes.
    pub bytes: Vec<u8>,
}

impl From<&capstone::Insn<'_>> for InstructionInfo {
    fn from(insn: &capstone::Insn<'_>) -> Self {
        Self {
            address: insn.address(),
            mnemonic: insn.mnemonic().unwrap_or("???").to_string(),
            op_str: insn.op_str().unwrap_or("").to_string(),
            bytes: insn.bytes().to_vec(),
        }
    }
}

impl InstructionInfo {
    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the instruction decoded to no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl DisassemblyManager {
    /// Create a new disassembly manager.
    pub fn new() -> Self {
        Self
    }

    // Capstone handles are not Send, so one is built per call.
    fn capstone(target: TargetArch) -> Result<Capstone> {
        let cs = match target {
            TargetArch::X86 => Capstone::new().x86().mode(arch::x86::ArchMode::Mode32).build(),
            TargetArch::Arm7 => Capstone::new().arm().mode(arch::arm::ArchMode::Arm).build(),
        };
        cs.map_err(|e| anyhow!("Failed to create Capstone for {}: {}", target, e))
    }

    /// Disassemble a block of code.
    pub fn disassemble(
        &self,
        target: TargetArch,
        code: &[u8],
        address: u64,
    ) -> Result<Vec<InstructionInfo>> {
        let cs = Self::capstone(target)?;
        let instructions = cs
            .disasm_all(code, address)
            .map_err(|e| anyhow!("Failed to disassemble: {}", e))?;

        Ok(instructions.iter().map(InstructionInfo::from).collect())
    }

    /// Decode the first instruction of `code`.
    pub fn decode_one(&self, target: TargetArch, code: &[u8], address: u64) -> Result<InstructionInfo> {
        let cs = Self::capstone(target)?;
        let instructions = cs
            .disasm_count(code, address, 1)
            .map_err(|e| anyhow!("Failed to decode at {:#x}: {}", address, e))?;
        instructions
            .iter()
            .next()
            .map(InstructionInfo::from)
            .ok_or_else(|| anyhow!("No valid instruction at {:#x}", address))
    }
}

impl Default for DisassemblyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_x86() {
        let manager = DisassemblyManager::new();
        // nop; jmp short +2; int3
        let code = vec![0x90, 0xeb, 0x02, 0xcc];
        let insns = manager.disassemble(TargetArch::X86, &code, 0x1000).unwrap();

        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].mnemonic, "nop");
        assert_eq!(insns[1].address, 0x1001);
        assert_eq!(insns[1].mnemonic, "jmp");
        assert_eq!(insns[2].mnemonic, "int3");
    }

    #[test]
    fn test_decode_one_reports_length() {
        let manager = DisassemblyManager::new();
        // mov eax, 7 followed by garbage
        let insn = manager
            .decode_one(TargetArch::X86, &[0xb8, 7, 0, 0, 0, 0xff, 0xff], 0x40)
            .unwrap();
        assert_eq!(insn.len(), 5);
        assert_eq!(insn.mnemonic, "mov");
    }

    #[test]
    fn test_disassemble_arm() {
        let manager = DisassemblyManager::new();
        // mov r0, #5
        let insns = manager
            .disassemble(TargetArch::Arm7, &0xe3a0_0005u32.to_le_bytes(), 0x2000)
            .unwrap();

        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].mnemonic, "mov");
    }
}
