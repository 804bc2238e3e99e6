//! Target architecture families known to the engine.

use crate::control::RegisterMask;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Processor family of the attached core. Selects the register layout and
/// the step-over strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArch {
    /// 32-bit x86: eax ecx edx ebx esp ebp esi edi eip eflags.
    #[default]
    X86,
    /// ARM7TDMI: r0-r15, cpsr.
    Arm7,
}

impl TargetArch {
    /// Number of registers in the family's register set.
    pub const fn register_count(self) -> usize {
        match self {
            TargetArch::X86 => 10,
            TargetArch::Arm7 => 17,
        }
    }

    /// Index of the program counter in the register set.
    pub const fn pc_register(self) -> usize {
        match self {
            TargetArch::X86 => 8,
            TargetArch::Arm7 => 15,
        }
    }

    /// Mask selecting only the program counter.
    pub const fn pc_mask(self) -> RegisterMask {
        RegisterMask::single(self.pc_register())
    }

    /// Mask selecting every register of the family.
    pub const fn all_registers(self) -> RegisterMask {
        RegisterMask::new((1u32 << self.register_count()) - 1)
    }

    /// Bytes a software breakpoint writes over an instruction.
    pub const fn breakpoint_pattern(self) -> &'static [u8] {
        match self {
            // int3
            TargetArch::X86 => &[0xcc],
            // undefined instruction 0xe7ffdefe, little endian
            TargetArch::Arm7 => &[0xfe, 0xde, 0xff, 0xe7],
        }
    }

    /// Conventional name of register `index`, if the family has one.
    pub fn register_name(self, index: usize) -> Option<&'static str> {
        const X86: [&str; 10] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags"];
        const ARM7: [&str; 17] = [
            "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp",
            "lr", "pc", "cpsr",
        ];
        match self {
            TargetArch::X86 => X86.get(index).copied(),
            TargetArch::Arm7 => ARM7.get(index).copied(),
        }
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetArch::X86 => f.write_str("x86"),
            TargetArch::Arm7 => f.write_str("arm7"),
        }
    }
}

impl std::str::FromStr for TargetArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "i386" => Ok(TargetArch::X86),
            "arm7" | "arm7tdmi" => Ok(TargetArch::Arm7),
            other => Err(format!("unknown target architecture '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_layouts() {
        assert_eq!(TargetArch::X86.register_name(TargetArch::X86.pc_register()), Some("eip"));
        assert_eq!(TargetArch::Arm7.register_name(TargetArch::Arm7.pc_register()), Some("pc"));
        assert_eq!(TargetArch::Arm7.all_registers().count(), 17);
        assert_eq!(TargetArch::X86.register_name(10), None);
    }

    #[test]
    fn test_arch_parsing() {
        assert_eq!("ARM7TDMI".parse::<TargetArch>(), Ok(TargetArch::Arm7));
        assert!("mips".parse::<TargetArch>().is_err());
        let json = serde_json::to_string(&TargetArch::Arm7).unwrap();
        assert_eq!(json, "\"arm7\"");
    }
}
