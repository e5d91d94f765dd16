//! Instruction-set architecture of the instrumented process.

/// PE machine type constants, as reported by the OS for a process image.
pub const IMAGE_FILE_MACHINE_UNKNOWN: u16 = 0;
pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_ARM: u16 = 0x01c0;
pub const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;

/// The architecture the JIT emitted code for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// 32-bit x86
    X86,
    /// x86-64
    X64,
    /// 32-bit ARM (Thumb-2)
    Arm,
    /// AArch64
    Arm64,
}

impl Architecture {
    /// Map a PE machine type to an architecture.
    pub fn from_machine(machine: u16) -> Option<Self> {
        match machine {
            IMAGE_FILE_MACHINE_I386 => Some(Architecture::X86),
            IMAGE_FILE_MACHINE_AMD64 => Some(Architecture::X64),
            IMAGE_FILE_MACHINE_ARM | IMAGE_FILE_MACHINE_ARMNT => Some(Architecture::Arm),
            IMAGE_FILE_MACHINE_ARM64 => Some(Architecture::Arm64),
            _ => None,
        }
    }

    /// PE machine type for this architecture.
    pub fn machine(self) -> u16 {
        match self {
            Architecture::X86 => IMAGE_FILE_MACHINE_I386,
            Architecture::X64 => IMAGE_FILE_MACHINE_AMD64,
            Architecture::Arm => IMAGE_FILE_MACHINE_ARM,
            Architecture::Arm64 => IMAGE_FILE_MACHINE_ARM64,
        }
    }

    /// Architecture this binary was compiled for.
    pub fn native() -> Self {
        if cfg!(target_arch = "x86") {
            Architecture::X86
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Arm64
        } else if cfg!(target_arch = "arm") {
            Architecture::Arm
        } else {
            Architecture::X64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_codes() {
        for arch in [
            Architecture::X86,
            Architecture::X64,
            Architecture::Arm,
            Architecture::Arm64,
        ] {
            assert_eq!(Architecture::from_machine(arch.machine()), Some(arch));
        }

        assert_eq!(
            Architecture::from_machine(IMAGE_FILE_MACHINE_ARMNT),
            Some(Architecture::Arm)
        );
        assert_eq!(Architecture::from_machine(IMAGE_FILE_MACHINE_UNKNOWN), None);
    }
}
