//! Call-target extraction from captured native code.
//!
//! The buffer is decoded as a linear instruction stream. Every immediate
//! operand is a candidate absolute call/branch target; resolving it to a name
//! (or discarding it) is up to the caller.

use capstone::arch::ArchOperand;
use capstone::arch::arm64::Arm64OperandType;
use capstone::arch::x86::X86OperandType;
use capstone::prelude::*;
use jitcap_shared::Architecture;
use log::debug;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DisasmError {
    #[error("Capstone error: {0}")]
    Capstone(String),

    #[error("Disassembler panicked")]
    Panicked,
}

impl From<capstone::Error> for DisasmError {
    fn from(err: capstone::Error) -> Self {
        DisasmError::Capstone(err.to_string())
    }
}

/// Whether a destination reported once in a scan is reported again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetDedup {
    /// Each destination is reported at most once per scan.
    PerScan,
    /// Every immediate operand is reported.
    None,
}

impl TargetDedup {
    /// x86 scans dedup, ARM scans report every operand.
    pub fn for_architecture(arch: Architecture) -> Self {
        match arch {
            Architecture::X86 | Architecture::X64 => TargetDedup::PerScan,
            Architecture::Arm | Architecture::Arm64 => TargetDedup::None,
        }
    }
}

fn build_disassembler(arch: Architecture) -> Result<Capstone, DisasmError> {
    let cs = match arch {
        Architecture::X86 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(true)
            .build()?,
        Architecture::X64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(true)
            .build()?,
        // 32-bit ARM shares the AArch64 decoder.
        // TODO: give Arm its own Thumb-2 decoder once operand widths are handled.
        Architecture::Arm | Architecture::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .detail(true)
            .build()?,
    };
    Ok(cs)
}

/// Immediate operands of every instruction decoded from `code`, in order.
///
/// Decoding stops at the first undecodable instruction; what was decoded up
/// to that point is returned.
fn immediate_operands(code: &[u8], base: u64, arch: Architecture) -> Result<Vec<u64>, DisasmError> {
    if code.is_empty() {
        return Ok(Vec::new());
    }

    let cs = build_disassembler(arch)?;
    let insns = cs.disasm_all(code, base)?;
    let mut immediates = Vec::new();

    for insn in insns.iter() {
        let Ok(detail) = cs.insn_detail(insn) else {
            continue;
        };

        for operand in detail.arch_detail().operands() {
            let imm = match operand {
                ArchOperand::X86Operand(op) => match op.op_type {
                    X86OperandType::Imm(imm) => imm,
                    _ => continue,
                },
                ArchOperand::Arm64Operand(op) => match op.op_type {
                    Arm64OperandType::Imm(imm) => imm,
                    _ => continue,
                },
                _ => continue,
            };
            immediates.push(imm as u64);
        }
    }

    Ok(immediates)
}

/// Report every call-target candidate in `code`, loaded at `base`.
///
/// Any failure inside the decoder, including a panic, yields zero targets.
/// Returns the number of reported addresses.
pub fn extract_targets<F>(
    code: &[u8],
    base: u64,
    arch: Architecture,
    dedup: TargetDedup,
    mut report: F,
) -> usize
where
    F: FnMut(u64),
{
    let decoded = panic::catch_unwind(AssertUnwindSafe(|| immediate_operands(code, base, arch)))
        .unwrap_or(Err(DisasmError::Panicked));

    let candidates = match decoded {
        Ok(candidates) => candidates,
        Err(e) => {
            debug!(
                "disassembly of {} bytes at 0x{:X} failed: {}",
                code.len(),
                base,
                e
            );
            return 0;
        }
    };

    let mut seen = HashSet::new();
    let mut reported = 0;
    for target in candidates {
        if dedup == TargetDedup::PerScan && !seen.insert(target) {
            continue;
        }
        report(target);
        reported += 1;
    }

    reported
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `call rel32` at `at` targeting `target`.
    fn x86_call(at: u64, target: u64) -> [u8; 5] {
        let rel = (target as i64 - (at as i64 + 5)) as i32;
        let mut bytes = [0xE8, 0, 0, 0, 0];
        bytes[1..].copy_from_slice(&rel.to_le_bytes());
        bytes
    }

    /// `bl` at `at` targeting `target`.
    fn arm64_bl(at: u64, target: u64) -> [u8; 4] {
        let imm26 = (((target as i64 - at as i64) >> 2) as u32) & 0x03FF_FFFF;
        (0x9400_0000u32 | imm26).to_le_bytes()
    }

    fn collect(code: &[u8], base: u64, arch: Architecture, dedup: TargetDedup) -> Vec<u64> {
        let mut targets = Vec::new();
        let count = extract_targets(code, base, arch, dedup, |t| targets.push(t));
        assert_eq!(count, targets.len());
        targets
    }

    #[test]
    fn test_empty_buffer() {
        for arch in [Architecture::X86, Architecture::X64, Architecture::Arm64] {
            assert!(collect(&[], 0x1000, arch, TargetDedup::PerScan).is_empty());
        }
    }

    #[test]
    fn test_undecodable_buffer_yields_nothing() {
        // 0x06 (push es) does not exist in 64-bit mode.
        let code = [0x06, 0x06, 0x06, 0x06];
        assert!(collect(&code, 0x1000, Architecture::X64, TargetDedup::PerScan).is_empty());
    }

    #[test]
    fn test_x64_duplicate_calls_reported_once() {
        let mut code = Vec::new();
        code.extend_from_slice(&x86_call(0x1000, 0x2000));
        code.extend_from_slice(&x86_call(0x1005, 0x2000));
        code.extend_from_slice(&x86_call(0x100A, 0x3000));
        code.push(0xC3);

        let targets = collect(
            &code,
            0x1000,
            Architecture::X64,
            TargetDedup::for_architecture(Architecture::X64),
        );
        assert_eq!(targets, vec![0x2000, 0x3000]);
    }

    #[test]
    fn test_x86_call_target() {
        let mut code = Vec::new();
        code.extend_from_slice(&x86_call(0x40_1000, 0x40_2000));
        code.extend_from_slice(&x86_call(0x40_1005, 0x40_2000));

        let targets = collect(
            &code,
            0x40_1000,
            Architecture::X86,
            TargetDedup::for_architecture(Architecture::X86),
        );
        assert_eq!(targets, vec![0x40_2000]);
    }

    #[test]
    fn test_arm64_duplicate_calls_reported_twice() {
        let mut code = Vec::new();
        code.extend_from_slice(&arm64_bl(0x1000, 0x2000));
        code.extend_from_slice(&arm64_bl(0x1004, 0x2000));

        let targets = collect(
            &code,
            0x1000,
            Architecture::Arm64,
            TargetDedup::for_architecture(Architecture::Arm64),
        );
        assert_eq!(targets, vec![0x2000, 0x2000]);

        let deduped = collect(&code, 0x1000, Architecture::Arm64, TargetDedup::PerScan);
        assert_eq!(deduped, vec![0x2000]);
    }

    #[test]
    fn test_arm_routes_to_arm64_decoder() {
        let code = arm64_bl(0x1000, 0x1800);
        let targets = collect(
            &code,
            0x1000,
            Architecture::Arm,
            TargetDedup::for_architecture(Architecture::Arm),
        );
        assert_eq!(targets, vec![0x1800]);
    }

    #[test]
    fn test_trailing_garbage_keeps_earlier_targets() {
        let mut code = Vec::new();
        code.extend_from_slice(&x86_call(0x1000, 0x2000));
        code.extend_from_slice(&[0x06, 0x06]);
        code.extend_from_slice(&x86_call(0x1007, 0x9000));

        let targets = collect(&code, 0x1000, Architecture::X64, TargetDedup::PerScan);
        assert_eq!(targets, vec![0x2000]);
    }
}
